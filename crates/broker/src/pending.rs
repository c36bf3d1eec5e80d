//! In-flight calls awaiting a shard response

use crate::connection::Connection;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Pending calls keyed by correlation id.
///
/// There is no expiry: an entry lives until its response is delivered, even
/// if the caller connection has gone away in the meantime.
#[derive(Default)]
pub struct PendingCalls {
    waiters: Mutex<HashMap<String, Arc<Connection>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the caller waiting on `correlation_id`
    pub fn insert(&self, correlation_id: String, caller: Arc<Connection>) {
        self.waiters.lock().insert(correlation_id, caller);
    }

    /// Remove and return the caller waiting on `correlation_id`
    pub fn take(&self, correlation_id: &str) -> Option<Arc<Connection>> {
        self.waiters.lock().remove(correlation_id)
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.waiters.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_is_exactly_once() {
        let pending = PendingCalls::new();
        let (caller, _rx) = Connection::new(None);

        pending.insert("abc".to_string(), caller.clone());
        assert!(pending.contains("abc"));

        let taken = pending.take("abc").unwrap();
        assert_eq!(taken.id(), caller.id());
        assert!(pending.take("abc").is_none());
        assert!(pending.is_empty());
    }
}
