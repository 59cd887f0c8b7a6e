//! Bidirectional request id <-> execution token mapping.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier a running unit of work uses to address itself.
///
/// Minted on the worker thread once the run has actually started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionToken(Uuid);

impl ExecutionToken {
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ExecutionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Default)]
struct Maps {
    by_request: HashMap<Uuid, ExecutionToken>,
    by_token: HashMap<ExecutionToken, Uuid>,
}

/// Both maps live behind one lock and are always updated together.
#[derive(Default)]
pub struct IdentityCorrelator {
    maps: Mutex<Maps>,
}

impl IdentityCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `request_id` to `token`, dropping any stale pair on either side.
    pub fn register(&self, request_id: Uuid, token: ExecutionToken) {
        let mut maps = self.lock();
        if let Some(old_token) = maps.by_request.insert(request_id, token) {
            maps.by_token.remove(&old_token);
        }
        if let Some(old_request) = maps.by_token.insert(token, request_id) {
            if old_request != request_id {
                maps.by_request.remove(&old_request);
            }
        }
    }

    /// Remove the pair for `request_id`. Returns the token that was bound.
    pub fn unregister(&self, request_id: Uuid) -> Option<ExecutionToken> {
        let mut maps = self.lock();
        let token = maps.by_request.remove(&request_id)?;
        maps.by_token.remove(&token);
        Some(token)
    }

    pub fn lookup(&self, token: ExecutionToken) -> Option<Uuid> {
        self.lock().by_token.get(&token).copied()
    }

    pub fn token_for(&self, request_id: Uuid) -> Option<ExecutionToken> {
        self.lock().by_request.get(&request_id).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().by_request.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn register_lookup_unregister() {
        let c = IdentityCorrelator::new();
        let id = Uuid::new_v4();
        let token = ExecutionToken::mint();

        assert!(c.lookup(token).is_none());
        c.register(id, token);
        assert_eq!(c.lookup(token), Some(id));
        assert_eq!(c.token_for(id), Some(token));

        assert_eq!(c.unregister(id), Some(token));
        assert!(c.lookup(token).is_none());
        assert!(c.token_for(id).is_none());
        assert!(c.is_empty());
    }

    #[test]
    fn reregister_replaces_stale_pairs() {
        let c = IdentityCorrelator::new();
        let id = Uuid::new_v4();
        let first = ExecutionToken::mint();
        let second = ExecutionToken::mint();

        c.register(id, first);
        c.register(id, second);
        assert!(c.lookup(first).is_none());
        assert_eq!(c.lookup(second), Some(id));
        assert_eq!(c.len(), 1);

        // Same token moved to another request: the old request loses it.
        let other = Uuid::new_v4();
        c.register(other, second);
        assert!(c.token_for(id).is_none());
        assert_eq!(c.lookup(second), Some(other));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let c = IdentityCorrelator::new();
        assert!(c.unregister(Uuid::new_v4()).is_none());
    }

    #[test]
    fn mapping_stays_exclusive_under_threads() {
        let c = Arc::new(IdentityCorrelator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let id = Uuid::new_v4();
                        let token = ExecutionToken::mint();
                        c.register(id, token);
                        assert_eq!(c.lookup(token), Some(id));
                        assert_eq!(c.token_for(id), Some(token));
                        c.unregister(id);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(c.is_empty());
    }
}
