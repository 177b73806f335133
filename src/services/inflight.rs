//! Per-payment mutual exclusion for filing and cancellation requests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Set of payment ids with an operation currently in flight. Acquisition is
/// all-or-nothing; a second request for the same payment is rejected rather
/// than queued.
#[derive(Debug, Default)]
pub struct InflightSet {
    active: Mutex<HashSet<String>>,
}

impl InflightSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Try to claim `key`. Returns a guard that releases on drop, or `None`
    /// when the key is already claimed.
    pub fn try_acquire(self: &Arc<Self>, key: &str) -> Option<InflightGuard> {
        let mut active = self.active.lock().expect("inflight lock poisoned");
        if active.insert(key.to_string()) {
            Some(InflightGuard {
                set: Arc::clone(self),
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.active.lock().expect("inflight lock poisoned").contains(key)
    }
}

pub struct InflightGuard {
    set: Arc<InflightSet>,
    key: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.set
            .active
            .lock()
            .expect("inflight lock poisoned")
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected_until_release() {
        let set = InflightSet::new();
        let guard = set.try_acquire("p1").expect("first acquire");
        assert!(set.try_acquire("p1").is_none());
        assert!(set.try_acquire("p2").is_some());
        drop(guard);
        assert!(set.try_acquire("p1").is_some());
    }

    #[test]
    fn guard_releases_on_drop_even_mid_scope() {
        let set = InflightSet::new();
        {
            let _guard = set.try_acquire("p1").unwrap();
            assert!(set.contains("p1"));
        }
        assert!(!set.contains("p1"));
    }
}
