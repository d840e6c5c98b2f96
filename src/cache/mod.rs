mod memory;
mod resp;

pub use memory::MemoryCounters;
pub use resp::{Reply, RespCodec, RespCounters};

use async_trait::async_trait;

#[derive(Debug)]
pub enum CacheError {
    /// Backend unreachable or timed out. Never means "zero claims".
    Unavailable(String),
    /// Backend answered with something we cannot use.
    Protocol(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Unavailable(e) => write!(f, "cache unavailable: {e}"),
            CacheError::Protocol(e) => write!(f, "cache protocol error: {e}"),
        }
    }
}

impl std::error::Error for CacheError {}

/// String-keyed integer counters (GET / SET / INCRBY).
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// `Ok(None)` when the key has never been written.
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError>;
    async fn set(&self, key: &str, value: i64) -> Result<(), CacheError>;
    async fn incrby(&self, key: &str, delta: i64) -> Result<i64, CacheError>;
}

#[async_trait]
impl<T: CounterStore> CounterStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), CacheError> {
        (**self).set(key, value).await
    }

    async fn incrby(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        (**self).incrby(key, delta).await
    }
}

/// The counter backend chosen at startup.
pub enum Counters {
    Memory(MemoryCounters),
    Resp(RespCounters),
}

#[async_trait]
impl CounterStore for Counters {
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError> {
        match self {
            Counters::Memory(c) => c.get(key).await,
            Counters::Resp(c) => c.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), CacheError> {
        match self {
            Counters::Memory(c) => c.set(key, value).await,
            Counters::Resp(c) => c.set(key, value).await,
        }
    }

    async fn incrby(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        match self {
            Counters::Memory(c) => c.incrby(key, delta).await,
            Counters::Resp(c) => c.incrby(key, delta).await,
        }
    }
}

/// Best-effort view of claims taken per pool. Never decides admission.
pub struct CapacityCache<C> {
    store: C,
    prefix: String,
}

impl<C: CounterStore> CapacityCache<C> {
    pub fn new(store: C, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    fn key(&self, pool_id: &str) -> String {
        format!("{}:taken:{pool_id}", self.prefix)
    }

    /// Cached claim count, `None` on a miss. Negative counts from lost updates read as 0.
    pub async fn cached_count(&self, pool_id: &str) -> Result<Option<u32>, CacheError> {
        let value = self.store.get(&self.key(pool_id)).await?;
        Ok(value.map(|v| v.clamp(0, u32::MAX as i64) as u32))
    }

    /// Remaining room as far as the cache believes; `None` when it does not know.
    pub async fn remaining(&self, pool_id: &str, capacity: u32) -> Result<Option<u32>, CacheError> {
        Ok(self
            .cached_count(pool_id)
            .await?
            .map(|taken| capacity.saturating_sub(taken)))
    }

    /// `max(0, capacity - cached_count)`. Unknown or unreachable reads as no room.
    pub async fn get_remaining(&self, pool_id: &str, capacity: u32) -> u32 {
        match self.remaining(pool_id, capacity).await {
            Ok(Some(n)) => n,
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!("get_remaining({pool_id}): {e}");
                0
            }
        }
    }

    pub async fn increment(&self, pool_id: &str, delta: i64) -> Result<i64, CacheError> {
        self.store.incrby(&self.key(pool_id), delta).await
    }

    /// Overwrite the cached count with the ledger's. Idempotent.
    pub async fn resync(&self, pool_id: &str, authoritative_count: u32) -> Result<(), CacheError> {
        self.store
            .set(&self.key(pool_id), authoritative_count as i64)
            .await
    }
}
