
use std::sync::Arc;
use std::time::Instant;

use dashmap::{DashMap, DashSet};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::{CacheError, CapacityCache, CounterStore};
use crate::ledger::{LedgerError, LedgerStore};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::*;
use crate::pool::{ConfigError, PoolModel};

#[derive(Debug)]
pub enum AdmissionError {
    UnknownResource(String),
    UnknownPool(String),
    Config(ConfigError),
    /// The ledger could not complete the attempt; no partial claim exists. Retryable.
    Ledger(LedgerError),
    /// Only from explicit resync: the request path never fails on the cache.
    Cache(CacheError),
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::UnknownResource(id) => write!(f, "not found: resource {id}"),
            AdmissionError::UnknownPool(id) => write!(f, "not found: pool {id}"),
            AdmissionError::Config(e) => write!(f, "{e}"),
            AdmissionError::Ledger(e) => write!(f, "{e}"),
            AdmissionError::Cache(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AdmissionError {}

impl From<ConfigError> for AdmissionError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::UnknownResource(id) => AdmissionError::UnknownResource(id),
            ConfigError::UnknownPool(id) => AdmissionError::UnknownPool(id),
            other => AdmissionError::Config(other),
        }
    }
}

impl From<LedgerError> for AdmissionError {
    fn from(e: LedgerError) -> Self {
        AdmissionError::Ledger(e)
    }
}

impl From<CacheError> for AdmissionError {
    fn from(e: CacheError) -> Self {
        AdmissionError::Cache(e)
    }
}

/// Decides claims against a `PoolModel`, using the cache as an advisory
/// pre-check and the ledger's conditional write as the only arbiter.
pub struct AdmissionController<L, C> {
    model: Arc<PoolModel>,
    ledger: L,
    cache: CapacityCache<C>,
    notify: Arc<NotifyHub>,
    /// Serializes count-then-set per pool so the last refresh reads the latest count.
    refresh_locks: DashMap<PoolId, Arc<Mutex<()>>>,
    /// Pools whose cache refresh failed after a commit; retried by the resyncer.
    stale: DashSet<PoolId>,
}

impl<L: LedgerStore, C: CounterStore> AdmissionController<L, C> {
    pub fn new(model: Arc<PoolModel>, ledger: L, cache: CapacityCache<C>) -> Self {
        Self {
            model,
            ledger,
            cache,
            notify: Arc::new(NotifyHub::new()),
            refresh_locks: DashMap::new(),
            stale: DashSet::new(),
        }
    }

    pub fn model(&self) -> &PoolModel {
        &self.model
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn cache(&self) -> &CapacityCache<C> {
        &self.cache
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    pub fn stale_pools(&self) -> Vec<PoolId> {
        self.stale.iter().map(|p| p.key().clone()).collect()
    }

    pub async fn register_user(&self, user_id: UserId) -> Result<bool, AdmissionError> {
        Ok(self.ledger.register_user(user_id).await?)
    }

    pub async fn request_claim(
        &self,
        user_id: UserId,
        resource_id: &str,
    ) -> Result<Outcome, AdmissionError> {
        let started = Instant::now();
        let result = self.admit(user_id, resource_id).await;
        metrics::histogram!(CLAIM_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if let Ok(outcome) = &result {
            metrics::counter!(CLAIMS_TOTAL, "outcome" => outcome.label()).increment(1);
            debug!("claim user={user_id} resource={resource_id}: {outcome}");
        }
        result
    }

    async fn admit(&self, user_id: UserId, resource_id: &str) -> Result<Outcome, AdmissionError> {
        let resource = self.model.resource(resource_id)?;
        let pool = self.model.pool(&resource.pool_id)?;

        if !self.ledger.user_exists(user_id).await? {
            return Ok(Outcome::UserNotFound);
        }

        // Advisory only: a miss or an error means "don't know", never "room".
        let advertised = match self.cache.remaining(&pool.id, pool.capacity).await {
            Ok(remaining) => remaining,
            Err(e) => {
                warn!("cache read for pool {} failed, skipping fast path: {e}", pool.id);
                metrics::counter!(CACHE_ERRORS_TOTAL, "op" => "get").increment(1);
                None
            }
        };

        let current = self.ledger.get_active_claim(user_id, &pool.id).await?;
        if current.as_ref().is_some_and(|c| c.resource_id == resource_id) {
            return Ok(Outcome::AlreadyRegisteredThis);
        }

        if advertised == Some(0) {
            metrics::counter!(FAST_REJECTIONS_TOTAL).increment(1);
            return Ok(Outcome::GroupFull);
        }

        let result = self
            .ledger
            .transactional_claim(ClaimRequest {
                user_id,
                resource_id: resource.id.clone(),
                pool_id: pool.id.clone(),
                per_resource_capacity: resource.capacity,
                pool_capacity: pool.capacity,
            })
            .await?;

        if !result.applied {
            if advertised.is_some_and(|n| n > 0) {
                // The cache promised room the ledger did not have.
                debug!("pool {} cache advertised room but was full, resyncing", pool.id);
                self.refresh_after_commit(&pool.id).await;
            }
            return Ok(Outcome::GroupFull);
        }

        let outcome = match result.previous_resource_id {
            None => {
                self.notify.send(
                    &pool.id,
                    ClaimEvent::Claimed {
                        user_id,
                        resource_id: resource.id.clone(),
                    },
                );
                Outcome::Success
            }
            // A concurrent duplicate request committed first.
            Some(prev) if prev == resource.id => return Ok(Outcome::AlreadyRegisteredThis),
            Some(prev) => {
                self.notify.send(
                    &pool.id,
                    ClaimEvent::Switched {
                        user_id,
                        from: prev,
                        to: resource.id.clone(),
                    },
                );
                Outcome::Switched
            }
        };
        self.refresh_after_commit(&pool.id).await;
        Ok(outcome)
    }

    /// Delete the user's claim in `pool_id`. Returns whether one existed.
    pub async fn release_claim(&self, user_id: UserId, pool_id: &str) -> Result<bool, AdmissionError> {
        self.model.pool(pool_id)?;
        let removed = self.ledger.delete_claim(user_id, pool_id).await?;
        metrics::counter!(RELEASES_TOTAL, "released" => if removed.is_some() { "true" } else { "false" })
            .increment(1);
        let Some(claim) = removed else {
            return Ok(false);
        };
        self.notify.send(
            pool_id,
            ClaimEvent::Released {
                user_id,
                resource_id: claim.resource_id,
            },
        );
        self.refresh_after_commit(pool_id).await;
        Ok(true)
    }

    /// Informational, cache-backed. Unknown or unreachable reads as 0.
    pub async fn get_remaining(&self, pool_id: &str) -> Result<u32, AdmissionError> {
        let pool = self.model.pool(pool_id)?;
        Ok(self.cache.get_remaining(&pool.id, pool.capacity).await)
    }

    /// Rebuild one pool's cached count from the ledger. Returns the count.
    pub async fn resync(&self, pool_id: &str) -> Result<u32, AdmissionError> {
        self.model.pool(pool_id)?;
        let count = self.refresh(pool_id).await?;
        metrics::counter!(RESYNCS_TOTAL).increment(1);
        Ok(count)
    }

    /// Resync every pool. Attempts all of them; reports the first failure.
    pub async fn resync_all(&self) -> Result<(), AdmissionError> {
        let mut first_err = None;
        for pool_id in self.model.pool_ids() {
            if let Err(e) = self.resync(pool_id).await {
                warn!("resync {pool_id} failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resync only pools whose post-commit refresh failed. Returns how many recovered.
    pub async fn resync_stale(&self) -> usize {
        let mut recovered = 0;
        for pool_id in self.stale_pools() {
            if self.resync(&pool_id).await.is_ok() {
                recovered += 1;
            }
        }
        recovered
    }

    async fn refresh(&self, pool_id: &str) -> Result<u32, AdmissionError> {
        let lock = self
            .refresh_locks
            .entry(pool_id.to_string())
            .or_default()
            .value()
            .clone();
        let _guard = lock.lock().await;

        let outcome = async {
            let count = self.ledger.count_active(CountScope::Pool(pool_id)).await?;
            self.cache.resync(pool_id, count).await?;
            Ok::<u32, AdmissionError>(count)
        }
        .await;
        match &outcome {
            Ok(_) => {
                self.stale.remove(pool_id);
            }
            Err(_) => {
                self.stale.insert(pool_id.to_string());
            }
        }
        outcome
    }

    /// The ledger already committed; a failed refresh leaves the pool stale, not the call failed.
    async fn refresh_after_commit(&self, pool_id: &str) {
        if let Err(e) = self.refresh(pool_id).await {
            warn!("cache refresh for pool {pool_id} failed, marked stale: {e}");
            metrics::counter!(CACHE_ERRORS_TOTAL, "op" => "refresh").increment(1);
        }
    }
}
