use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CacheError, CounterStore};

/// In-process counters. Used when no cache server is configured, and in tests,
/// where `set_available(false)` simulates an outage.
#[derive(Clone, Default)]
pub struct MemoryCounters {
    counters: Arc<DashMap<String, i64>>,
    down: Arc<AtomicBool>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.down.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory counters marked down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryCounters {
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError> {
        self.check()?;
        Ok(self.counters.get(key).map(|v| *v.value()))
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), CacheError> {
        self.check()?;
        self.counters.insert(key.to_string(), value);
        Ok(())
    }

    async fn incrby(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.check()?;
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        *entry = entry.saturating_add(delta);
        Ok(*entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incrby_saturates() {
        let counters = MemoryCounters::new();
        counters.set("k", i64::MAX - 1).await.unwrap();
        assert_eq!(counters.incrby("k", 5).await.unwrap(), i64::MAX);
        assert_eq!(counters.incrby("fresh", -3).await.unwrap(), -3);
    }

    #[tokio::test]
    async fn unavailable_rejects_every_op() {
        let counters = MemoryCounters::new();
        counters.set_available(false);
        assert!(counters.get("k").await.is_err());
        assert!(counters.incrby("k", 1).await.is_err());
    }
}
