use std::collections::HashMap;

use crate::model::*;

/// Authoritative claim state for one pool. Guarded by the pool's lock in `Ledger`.
#[derive(Debug, Default, Clone)]
pub struct PoolBook {
    claims: HashMap<UserId, Claim>,
    per_resource: HashMap<ResourceId, u32>,
}

impl PoolBook {
    pub fn active(&self) -> u32 {
        self.claims.len() as u32
    }

    pub fn resource_count(&self, resource_id: &str) -> u32 {
        self.per_resource.get(resource_id).copied().unwrap_or(0)
    }

    pub fn claim_of(&self, user_id: UserId) -> Option<&Claim> {
        self.claims.get(&user_id)
    }

    pub fn claims(&self) -> impl Iterator<Item = &Claim> {
        self.claims.values()
    }

    /// Insert `claim`, replacing the user's previous claim in this pool.
    pub fn insert(&mut self, claim: Claim) -> Option<Claim> {
        *self.per_resource.entry(claim.resource_id.clone()).or_default() += 1;
        let previous = self.claims.insert(claim.user_id, claim);
        if let Some(prev) = &previous {
            self.decrement(&prev.resource_id);
        }
        previous
    }

    pub fn remove(&mut self, user_id: UserId) -> Option<Claim> {
        let removed = self.claims.remove(&user_id);
        if let Some(claim) = &removed {
            self.decrement(&claim.resource_id);
        }
        removed
    }

    fn decrement(&mut self, resource_id: &str) {
        if let Some(n) = self.per_resource.get_mut(resource_id) {
            *n -= 1;
            if *n == 0 {
                self.per_resource.remove(resource_id);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decision {
    /// The user already holds exactly this resource.
    AlreadyHeld,
    Full,
    Admit { previous: Option<ResourceId> },
}

/// Capacity check for a claim. The user's claim on another resource in the
/// pool still counts: a switch needs headroom like any other claim.
pub(crate) fn decide(book: &PoolBook, request: &ClaimRequest) -> Decision {
    let previous = book.claim_of(request.user_id).map(|c| c.resource_id.clone());
    if previous.as_deref() == Some(request.resource_id.as_str()) {
        return Decision::AlreadyHeld;
    }
    if book.active() >= request.pool_capacity {
        return Decision::Full;
    }
    if let Some(cap) = request.per_resource_capacity
        && book.resource_count(&request.resource_id) >= cap
    {
        return Decision::Full;
    }
    Decision::Admit { previous }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn claim(user_id: UserId, resource: &str) -> Claim {
        Claim {
            id: Ulid::new(),
            user_id,
            resource_id: resource.into(),
            pool_id: "p".into(),
            claimed_at: 0,
        }
    }

    fn request(user_id: UserId, resource: &str, per_resource: Option<u32>, pool: u32) -> ClaimRequest {
        ClaimRequest {
            user_id,
            resource_id: resource.into(),
            pool_id: "p".into(),
            per_resource_capacity: per_resource,
            pool_capacity: pool,
        }
    }

    #[test]
    fn insert_replaces_and_recounts() {
        let mut book = PoolBook::default();
        assert!(book.insert(claim(1, "a")).is_none());
        assert_eq!(book.resource_count("a"), 1);

        let prev = book.insert(claim(1, "b")).unwrap();
        assert_eq!(prev.resource_id, "a");
        assert_eq!(book.resource_count("a"), 0);
        assert_eq!(book.resource_count("b"), 1);
        assert_eq!(book.active(), 1);
    }

    #[test]
    fn remove_decrements() {
        let mut book = PoolBook::default();
        book.insert(claim(1, "a"));
        book.insert(claim(2, "a"));
        assert_eq!(book.resource_count("a"), 2);
        assert!(book.remove(1).is_some());
        assert!(book.remove(1).is_none());
        assert_eq!(book.resource_count("a"), 1);
        assert_eq!(book.active(), 1);
    }

    #[test]
    fn decide_pool_full() {
        let mut book = PoolBook::default();
        book.insert(claim(1, "a"));
        book.insert(claim(2, "b"));
        assert_eq!(decide(&book, &request(3, "a", None, 2)), Decision::Full);
        assert_eq!(
            decide(&book, &request(3, "a", None, 3)),
            Decision::Admit { previous: None }
        );
    }

    #[test]
    fn decide_resource_full() {
        let mut book = PoolBook::default();
        book.insert(claim(1, "a"));
        assert_eq!(decide(&book, &request(2, "a", Some(1), 10)), Decision::Full);
        assert_eq!(
            decide(&book, &request(2, "b", Some(1), 10)),
            Decision::Admit { previous: None }
        );
    }

    #[test]
    fn decide_same_resource_is_already_held() {
        let mut book = PoolBook::default();
        book.insert(claim(1, "a"));
        // Even a saturated pool reports the holder as already registered.
        assert_eq!(decide(&book, &request(1, "a", Some(1), 1)), Decision::AlreadyHeld);
    }

    #[test]
    fn decide_switch_reports_previous() {
        let mut book = PoolBook::default();
        book.insert(claim(1, "a"));
        assert_eq!(
            decide(&book, &request(1, "b", None, 5)),
            Decision::Admit { previous: Some("a".into()) }
        );
        // No headroom: a switch is refused like a fresh claim.
        assert_eq!(decide(&book, &request(1, "b", None, 1)), Decision::Full);
    }
}
