use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

/// Chat-platform user id.
pub type UserId = i64;

pub type ResourceId = String;

pub type PoolId = String;

/// One user's hold on one resource within one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: Ulid,
    pub user_id: UserId,
    pub resource_id: ResourceId,
    pub pool_id: PoolId,
    pub claimed_at: Ms,
}

/// Terminal result of a claim request. Capacity rejections live here, not in errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Switched,
    AlreadyRegisteredThis,
    GroupFull,
    UserNotFound,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Switched => "switched",
            Outcome::AlreadyRegisteredThis => "already_registered_this",
            Outcome::GroupFull => "group_full",
            Outcome::UserNotFound => "user_not_found",
        }
    }

    /// True when the user holds the requested resource after the call.
    pub fn is_held(&self) -> bool {
        matches!(
            self,
            Outcome::Success | Outcome::Switched | Outcome::AlreadyRegisteredThis
        )
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Input to the ledger's conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub user_id: UserId,
    pub resource_id: ResourceId,
    pub pool_id: PoolId,
    /// `None` means capacity is governed purely at the pool level.
    pub per_resource_capacity: Option<u32>,
    pub pool_capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimResult {
    pub applied: bool,
    /// Resource the user held in the pool before the write. Equal to the
    /// requested resource when the write was an idempotent no-op.
    pub previous_resource_id: Option<ResourceId>,
}

/// What `count_active` counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountScope<'a> {
    Resource(&'a str),
    Pool(&'a str),
}

/// Ledger WAL record. Flat, one variant per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        user_id: UserId,
    },
    /// Inserts the claim, replacing whatever the user held in the same pool.
    ClaimPlaced {
        claim: Claim,
    },
    ClaimReleased {
        user_id: UserId,
        pool_id: PoolId,
    },
}

/// Change notification published after a committed ledger mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimEvent {
    Claimed {
        user_id: UserId,
        resource_id: ResourceId,
    },
    Switched {
        user_id: UserId,
        from: ResourceId,
        to: ResourceId,
    },
    Released {
        user_id: UserId,
        resource_id: ResourceId,
    },
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}
