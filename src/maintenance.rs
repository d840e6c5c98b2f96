use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::admission::AdmissionController;
use crate::cache::CounterStore;
use crate::ledger::{Ledger, LedgerStore};

/// Background task bounding cache drift: stale pools every tick, all pools
/// every `full_every` ticks.
pub async fn run_resyncer<L: LedgerStore, C: CounterStore>(
    controller: Arc<AdmissionController<L, C>>,
    interval: Duration,
    full_every: u32,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut tick: u64 = 0;
    loop {
        ticker.tick().await;
        tick += 1;
        resync_tick(&controller, tick, full_every).await;
    }
}

/// One resyncer pass. Returns true when it was a full resync.
pub async fn resync_tick<L: LedgerStore, C: CounterStore>(
    controller: &AdmissionController<L, C>,
    tick: u64,
    full_every: u32,
) -> bool {
    if full_every > 0 && tick % full_every as u64 == 0 {
        if let Err(e) = controller.resync_all().await {
            warn!("periodic resync incomplete: {e}");
        }
        return true;
    }
    let stale = controller.stale_pools().len();
    if stale > 0 {
        let recovered = controller.resync_stale().await;
        info!("resynced {recovered}/{stale} stale pools");
    }
    false
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(ledger: Ledger, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        compact_if_due(&ledger, threshold).await;
    }
}

/// Returns the compacted event count, or `None` if not due or failed.
pub async fn compact_if_due(ledger: &Ledger, threshold: u64) -> Option<usize> {
    if ledger.appends_since_compact() < threshold {
        return None;
    }
    match ledger.compact().await {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::error!("compaction failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CapacityCache, MemoryCounters};
    use crate::pool::PoolModel;

    fn controller() -> (AdmissionController<Ledger, MemoryCounters>, MemoryCounters) {
        let model = PoolModel::builder()
            .pool("case_23", 41, [("case2", None), ("case3", None)])
            .independent("keynote", 2)
            .build()
            .unwrap();
        let counters = MemoryCounters::new();
        let ctl = AdmissionController::new(
            Arc::new(model),
            Ledger::in_memory(),
            CapacityCache::new(counters.clone(), "m"),
        );
        (ctl, counters)
    }

    #[tokio::test]
    async fn stale_pools_recover_on_plain_tick() {
        let (ctl, counters) = controller();
        ctl.register_user(1).await.unwrap();
        counters.set_available(false);
        ctl.request_claim(1, "keynote").await.unwrap();
        assert_eq!(ctl.stale_pools().len(), 1);

        assert!(!resync_tick(&ctl, 1, 10).await);
        assert_eq!(ctl.stale_pools().len(), 1);

        counters.set_available(true);
        assert!(!resync_tick(&ctl, 2, 10).await);
        assert!(ctl.stale_pools().is_empty());
        assert_eq!(ctl.get_remaining("keynote").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn full_tick_repairs_drift() {
        let (ctl, counters) = controller();
        counters.set("m:taken:case_23", 40).await.unwrap();
        assert_eq!(ctl.get_remaining("case_23").await.unwrap(), 1);
        assert!(resync_tick(&ctl, 10, 10).await);
        assert_eq!(ctl.get_remaining("case_23").await.unwrap(), 41);
        assert_eq!(ctl.get_remaining("keynote").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn compaction_waits_for_threshold() {
        let path = std::env::temp_dir().join(format!("slotgate-compact-{}.wal", ulid::Ulid::new()));
        let ledger = Ledger::open(&path).unwrap();
        for user in 0..5 {
            ledger.register_user(user).await.unwrap();
        }
        assert_eq!(compact_if_due(&ledger, 10).await, None);
        for user in 5..10 {
            ledger.register_user(user).await.unwrap();
        }
        assert_eq!(compact_if_due(&ledger, 10).await, Some(10));
        assert_eq!(ledger.appends_since_compact(), 0);
        let _ = std::fs::remove_file(&path);
    }
}
