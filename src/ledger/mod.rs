mod book;
mod writer;

pub use book::PoolBook;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use book::{Decision, decide};
use writer::WalCommand;

#[derive(Debug)]
pub enum LedgerError {
    /// The mutation could not be made durable. Nothing was applied.
    Wal(String),
    /// The transaction task died before reporting back.
    Aborted(String),
    LimitExceeded(&'static str),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Wal(e) => write!(f, "WAL error: {e}"),
            LedgerError::Aborted(e) => write!(f, "ledger transaction aborted: {e}"),
            LedgerError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for LedgerError {}

/// Authoritative claim store. Implementations must make `transactional_claim`
/// atomic: the capacity re-count and the write commit together or not at all.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    async fn user_exists(&self, user_id: UserId) -> Result<bool, LedgerError>;

    /// Add a user to the registry. Returns false if already present.
    async fn register_user(&self, user_id: UserId) -> Result<bool, LedgerError>;

    async fn get_active_claim(
        &self,
        user_id: UserId,
        pool_id: &str,
    ) -> Result<Option<Claim>, LedgerError>;

    async fn count_active(&self, scope: CountScope<'_>) -> Result<u32, LedgerError>;

    async fn transactional_claim(&self, request: ClaimRequest) -> Result<ClaimResult, LedgerError>;

    /// Delete the user's claim in the pool, returning it if one existed.
    async fn delete_claim(&self, user_id: UserId, pool_id: &str)
    -> Result<Option<Claim>, LedgerError>;

    async fn claims_of(&self, user_id: UserId) -> Result<Vec<Claim>, LedgerError>;

    async fn holders(&self, pool_id: &str) -> Result<Vec<Claim>, LedgerError>;
}

type SharedPoolBook = Arc<RwLock<PoolBook>>;

struct Inner {
    pools: DashMap<PoolId, SharedPoolBook>,
    /// resource → pool, learned from placed claims.
    resource_pool: DashMap<ResourceId, PoolId>,
    users: DashSet<UserId>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    appends_since_compact: AtomicU64,
    /// Mutations hold it shared; compaction holds it exclusively while it snapshots.
    gate: RwLock<()>,
}

/// The reference `LedgerStore`: one `RwLock` per pool is the transaction boundary.
///
/// `Ledger::in_memory()` is volatile and meant for tests. `Ledger::open(path)`
/// replays the WAL at `path` and makes every mutation durable before applying
/// it, through a background group-commit writer.
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<Inner>,
}

impl Ledger {
    pub fn in_memory() -> Self {
        Self::with_wal(None)
    }

    /// Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::recover(path)?;
        let wal = Wal::open(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer::run(wal, rx));

        let ledger = Self::with_wal(Some(tx));
        for event in &events {
            ledger.inner.replay(event);
        }
        ledger
            .inner
            .appends_since_compact
            .store(events.len() as u64, Ordering::Relaxed);
        info!(
            "ledger replayed {} events from {} ({} users)",
            events.len(),
            path.display(),
            ledger.inner.users.len()
        );
        Ok(ledger)
    }

    fn with_wal(wal_tx: Option<mpsc::Sender<WalCommand>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pools: DashMap::new(),
                resource_pool: DashMap::new(),
                users: DashSet::new(),
                wal_tx,
                appends_since_compact: AtomicU64::new(0),
                gate: RwLock::new(()),
            }),
        }
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.inner.appends_since_compact.load(Ordering::Relaxed)
    }

    /// Rewrite the WAL as the minimal event set for the current state.
    pub async fn compact(&self) -> Result<usize, LedgerError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.compact().await })
            .await
            .map_err(|e| LedgerError::Aborted(e.to_string()))?
    }
}

impl Inner {
    fn book(&self, pool_id: &str) -> Option<SharedPoolBook> {
        self.pools.get(pool_id).map(|e| e.value().clone())
    }

    fn book_or_create(&self, pool_id: &str) -> SharedPoolBook {
        if let Some(book) = self.book(pool_id) {
            return book;
        }
        self.pools.entry(pool_id.to_string()).or_default().value().clone()
    }

    async fn persist(&self, event: &Event) -> Result<(), LedgerError> {
        let Some(tx) = &self.wal_tx else {
            return Ok(());
        };
        let (ack, done) = oneshot::channel();
        tx.send(WalCommand::Append {
            event: event.clone(),
            response: ack,
        })
        .await
        .map_err(|_| LedgerError::Wal("WAL writer shut down".into()))?;
        done.await
            .map_err(|_| LedgerError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::Wal(e.to_string()))?;
        self.appends_since_compact.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn apply(&self, book: &mut PoolBook, event: &Event) {
        match event {
            Event::ClaimPlaced { claim } => {
                self.resource_pool
                    .insert(claim.resource_id.clone(), claim.pool_id.clone());
                book.insert(claim.clone());
            }
            Event::ClaimReleased { user_id, .. } => {
                book.remove(*user_id);
            }
            Event::UserRegistered { .. } => {}
        }
    }

    /// Startup only: we are the sole owner, so locks are uncontended.
    fn replay(&self, event: &Event) {
        let pool_id = match event {
            Event::UserRegistered { user_id } => {
                self.users.insert(*user_id);
                return;
            }
            Event::ClaimPlaced { claim } => &claim.pool_id,
            Event::ClaimReleased { pool_id, .. } => pool_id,
        };
        let book = self.book_or_create(pool_id);
        let Ok(mut guard) = book.try_write() else {
            tracing::error!("replay: pool {pool_id} unexpectedly locked");
            return;
        };
        self.apply(&mut guard, event);
    }

    async fn register_user(&self, user_id: UserId) -> Result<bool, LedgerError> {
        let _gate = self.gate.read().await;
        if self.users.contains(&user_id) {
            return Ok(false);
        }
        if self.users.len() >= MAX_USERS {
            return Err(LedgerError::LimitExceeded("too many users"));
        }
        self.persist(&Event::UserRegistered { user_id }).await?;
        Ok(self.users.insert(user_id))
    }

    async fn claim(&self, request: ClaimRequest) -> Result<ClaimResult, LedgerError> {
        let _gate = self.gate.read().await;
        let book = self.book_or_create(&request.pool_id);
        let mut guard = book.write().await;

        let previous = match decide(&guard, &request) {
            Decision::AlreadyHeld => {
                return Ok(ClaimResult {
                    applied: true,
                    previous_resource_id: Some(request.resource_id),
                });
            }
            Decision::Full => {
                return Ok(ClaimResult {
                    applied: false,
                    previous_resource_id: guard
                        .claim_of(request.user_id)
                        .map(|c| c.resource_id.clone()),
                });
            }
            Decision::Admit { previous } => previous,
        };

        let event = Event::ClaimPlaced {
            claim: Claim {
                id: Ulid::new(),
                user_id: request.user_id,
                resource_id: request.resource_id,
                pool_id: request.pool_id,
                claimed_at: now_ms(),
            },
        };
        self.persist(&event).await?;
        self.apply(&mut guard, &event);
        Ok(ClaimResult {
            applied: true,
            previous_resource_id: previous,
        })
    }

    async fn release(&self, user_id: UserId, pool_id: PoolId) -> Result<Option<Claim>, LedgerError> {
        let _gate = self.gate.read().await;
        let Some(book) = self.book(&pool_id) else {
            return Ok(None);
        };
        let mut guard = book.write().await;
        let Some(existing) = guard.claim_of(user_id).cloned() else {
            return Ok(None);
        };
        let event = Event::ClaimReleased { user_id, pool_id };
        self.persist(&event).await?;
        self.apply(&mut guard, &event);
        Ok(Some(existing))
    }

    async fn compact(&self) -> Result<usize, LedgerError> {
        let _gate = self.gate.write().await;
        let Some(tx) = &self.wal_tx else {
            return Ok(0);
        };

        let mut events: Vec<Event> = self
            .users
            .iter()
            .map(|u| Event::UserRegistered { user_id: *u })
            .collect();
        let books: Vec<SharedPoolBook> = self.pools.iter().map(|e| e.value().clone()).collect();
        for book in books {
            let guard = book.read().await;
            events.extend(guard.claims().map(|c| Event::ClaimPlaced { claim: c.clone() }));
        }

        let count = events.len();
        let (ack, done) = oneshot::channel();
        tx.send(WalCommand::Rewrite {
            events,
            response: ack,
        })
        .await
        .map_err(|_| LedgerError::Wal("WAL writer shut down".into()))?;
        done.await
            .map_err(|_| LedgerError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::Wal(e.to_string()))?;
        self.appends_since_compact.store(0, Ordering::Relaxed);
        info!("ledger compacted to {count} events");
        Ok(count)
    }
}

fn join_err(e: tokio::task::JoinError) -> LedgerError {
    LedgerError::Aborted(e.to_string())
}

// Mutations run on their own task: once the WAL append is issued, dropping the
// caller's future cannot leave the event durable but unapplied.
#[async_trait]
impl LedgerStore for Ledger {
    async fn user_exists(&self, user_id: UserId) -> Result<bool, LedgerError> {
        Ok(self.inner.users.contains(&user_id))
    }

    async fn register_user(&self, user_id: UserId) -> Result<bool, LedgerError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.register_user(user_id).await })
            .await
            .map_err(join_err)?
    }

    async fn get_active_claim(
        &self,
        user_id: UserId,
        pool_id: &str,
    ) -> Result<Option<Claim>, LedgerError> {
        let Some(book) = self.inner.book(pool_id) else {
            return Ok(None);
        };
        let guard = book.read().await;
        Ok(guard.claim_of(user_id).cloned())
    }

    async fn count_active(&self, scope: CountScope<'_>) -> Result<u32, LedgerError> {
        match scope {
            CountScope::Pool(pool_id) => match self.inner.book(pool_id) {
                Some(book) => Ok(book.read().await.active()),
                None => Ok(0),
            },
            CountScope::Resource(resource_id) => {
                let Some(pool_id) = self
                    .inner
                    .resource_pool
                    .get(resource_id)
                    .map(|e| e.value().clone())
                else {
                    return Ok(0);
                };
                match self.inner.book(&pool_id) {
                    Some(book) => Ok(book.read().await.resource_count(resource_id)),
                    None => Ok(0),
                }
            }
        }
    }

    async fn transactional_claim(&self, request: ClaimRequest) -> Result<ClaimResult, LedgerError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.claim(request).await })
            .await
            .map_err(join_err)?
    }

    async fn delete_claim(
        &self,
        user_id: UserId,
        pool_id: &str,
    ) -> Result<Option<Claim>, LedgerError> {
        let inner = self.inner.clone();
        let pool_id = pool_id.to_string();
        tokio::spawn(async move { inner.release(user_id, pool_id).await })
            .await
            .map_err(join_err)?
    }

    async fn claims_of(&self, user_id: UserId) -> Result<Vec<Claim>, LedgerError> {
        let books: Vec<SharedPoolBook> =
            self.inner.pools.iter().map(|e| e.value().clone()).collect();
        let mut claims = Vec::new();
        for book in books {
            if let Some(claim) = book.read().await.claim_of(user_id) {
                claims.push(claim.clone());
            }
        }
        claims.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        Ok(claims)
    }

    async fn holders(&self, pool_id: &str) -> Result<Vec<Claim>, LedgerError> {
        let Some(book) = self.inner.book(pool_id) else {
            return Ok(Vec::new());
        };
        let guard = book.read().await;
        let mut claims: Vec<Claim> = guard.claims().cloned().collect();
        claims.sort_by_key(|c| (c.claimed_at, c.id));
        Ok(claims)
    }
}
