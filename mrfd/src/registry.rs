use crate::limiter::CallLimiter;
use crate::metrics::Metrics;
use crate::session::{Direction, Session};
use bytesstr::BytesStr;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe Call-ID to session map with admission control.
///
/// Inbound sessions pass through the call limiter under the write lock;
/// the concurrent-sessions gauge tracks insert/delete.
pub struct SessionRegistry {
    map: RwLock<HashMap<BytesStr, Arc<Session>>>,
    limiter: Arc<CallLimiter>,
    metrics: Metrics,
}

impl SessionRegistry {
    pub fn new(limiter: Arc<CallLimiter>, metrics: Metrics) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            limiter,
            metrics,
        }
    }

    /// Store a session. Returns false when an inbound session was
    /// refused by the rate limiter; the session is stored regardless so
    /// the reject path can run inside the dialog.
    pub fn store(&self, session: Arc<Session>) -> bool {
        let mut map = self.map.write();

        let admitted =
            session.direction != Direction::Inbound || self.limiter.accept_new_call();

        map.insert(session.call_id.clone(), session);
        self.metrics.concurrent_sessions.inc();

        admitted
    }

    pub fn delete(&self, call_id: &BytesStr) {
        let mut map = self.map.write();

        if map.remove(call_id).is_some() {
            self.metrics.concurrent_sessions.dec();
        }
    }

    pub fn load(&self, call_id: &BytesStr) -> Option<Arc<Session>> {
        self.map.read().get(call_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.map.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn registry(rate: i64) -> SessionRegistry {
        SessionRegistry::new(CallLimiter::new(rate), Metrics::new("test_registry"))
    }

    #[test]
    fn store_load_delete() {
        let registry = registry(-1);
        let session = Session::new(Direction::Inbound, "cid-1".into());

        assert!(registry.store(session.clone()));
        assert_eq!(registry.len(), 1);

        let loaded = registry.load(&"cid-1".into()).unwrap();
        assert_eq!(loaded.call_id, session.call_id);

        registry.delete(&"cid-1".into());
        assert!(registry.is_empty());
    }

    #[test]
    fn admission_control_applies_to_inbound_only() {
        let registry = registry(1);

        assert!(registry.store(Session::new(Direction::Inbound, "in-1".into())));
        assert!(!registry.store(Session::new(Direction::Inbound, "in-2".into())));
        assert!(registry.store(Session::new(Direction::Outbound, "out-1".into())));
    }
}
