//! Request correlation: mapping in-flight request ids to pending waiters.
//!
//! The table is the single shared mutable resource between the dispatch path
//! (responses arriving from the host) and the timeout path (deadline expiry,
//! connection teardown). Every operation takes the one lock, never holds it
//! across an await, and completes each entry at most once: whichever of
//! resolve / expire / cancel removes the entry first gets to send on the
//! one-shot channel, and the id is gone for everyone else.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use log::warn;
use serde_json::Value;
use tokio::sync::oneshot;

/// Bridge-level failures. Returned to the submitting controller as typed
/// errors, never dressed up as `status: error` envelopes, because no host ever
/// produced a response for these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("no notebook host connected")]
    NoHostConnected,

    #[error("request timed out waiting for the notebook host")]
    RequestTimeout,

    #[error("notebook host disconnected while the request was pending")]
    HostDisconnected,

    #[error("connection closed while the request was pending")]
    ConnectionClosed,

    #[error("request id already in flight: {0}")]
    DuplicateRequestId(String),

    #[error("invalid command envelope: {0}")]
    Protocol(String),
}

/// Outcome delivered to a pending waiter.
pub type Completion = Result<Value, RelayError>;

struct Pending {
    reply: oneshot::Sender<Completion>,
    issued_at: Instant,
    deadline: Instant,
    /// Connection that issued the request; used to discard entries when a
    /// controller goes away. Owner 0 is reserved for in-process callers.
    owner: u64,
    /// Host connection generation the command was forwarded to; a host
    /// disconnect only cancels the entries that were in flight to it.
    host_generation: u64,
}

/// The pending-request table.
#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<String, Pending>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request and hand back the receiver the caller
    /// suspends on. Rejects an id that is already in flight.
    pub fn register(
        &self,
        id: &str,
        owner: u64,
        host_generation: u64,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Completion>, RelayError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| RelayError::Protocol("correlation table lock poisoned".to_string()))?;
        if entries.contains_key(id) {
            return Err(RelayError::DuplicateRequestId(id.to_string()));
        }
        let (reply, rx) = oneshot::channel();
        entries.insert(
            id.to_string(),
            Pending {
                reply,
                issued_at: Instant::now(),
                deadline,
                owner,
                host_generation,
            },
        );
        Ok(rx)
    }

    /// Resolve the entry for `id` with a response envelope. Returns whether
    /// an entry existed; an unknown id (already resolved, timed out, or from
    /// a superseded host) is the caller's cue to discard the response.
    pub fn resolve(&self, id: &str, response: Value) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        match entries.remove(id) {
            Some(pending) => {
                // A dropped receiver just means the waiter gave up first;
                // the entry is consumed either way.
                let _ = pending.reply.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Remove an entry without signaling it (waiter handles its own error).
    /// Returns whether an entry existed.
    pub fn discard(&self, id: &str) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        entries.remove(id).is_some()
    }

    /// Expire every entry whose deadline has passed, signaling each waiter
    /// with `RequestTimeout`. Returns the number of entries expired.
    pub fn expire_older_than(&self, now: Instant) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(pending) = entries.remove(id) {
                warn!(
                    "[correlation] request {} expired after {:?}",
                    id,
                    pending.issued_at.elapsed()
                );
                let _ = pending.reply.send(Err(RelayError::RequestTimeout));
            }
        }
        expired.len()
    }

    /// Cancel every entry that was forwarded to the given host generation,
    /// signaling `HostDisconnected`. Entries in flight to other generations
    /// are untouched. Returns the number of entries cancelled.
    pub fn cancel_generation(&self, host_generation: u64) -> usize {
        self.take_matching(|p| p.host_generation == host_generation, |_| {
            Err(RelayError::HostDisconnected)
        })
    }

    /// Discard every entry owned by the given connection, without signaling;
    /// the owning controller is gone and nobody is waiting.
    pub fn discard_owner(&self, owner: u64) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, p| p.owner != owner);
        before - entries.len()
    }

    /// Cancel every entry with the given reason. Used on teardown of the
    /// owning connection or server.
    pub fn cancel_all(&self, reason: RelayError) -> usize {
        self.take_matching(|_| true, |_| Err(reason.clone()))
    }

    /// Number of entries currently pending.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_matching(
        &self,
        matches: impl Fn(&Pending) -> bool,
        completion: impl Fn(&Pending) -> Completion,
    ) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let ids: Vec<String> = entries
            .iter()
            .filter(|(_, p)| matches(p))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(pending) = entries.remove(id) {
                let outcome = completion(&pending);
                let _ = pending.reply.send(outcome);
            }
        }
        ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_resolve_delivers_exactly_once() {
        let table = CorrelationTable::new();
        let mut rx = table.register("req-1", 1, 1, far_deadline()).unwrap();

        assert!(table.resolve("req-1", serde_json::json!({"status": "success"})));
        let value = rx.try_recv().unwrap().unwrap();
        assert_eq!(value["status"], "success");

        // A duplicate response for the same id finds nothing.
        assert!(!table.resolve("req-1", serde_json::json!({"status": "success"})));
        assert!(table.is_empty());
    }

    #[test]
    fn test_resolve_unknown_id_is_a_noop() {
        let table = CorrelationTable::new();
        assert!(!table.resolve("never-registered", Value::Null));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let table = CorrelationTable::new();
        let _rx = table.register("req-1", 1, 1, far_deadline()).unwrap();
        match table.register("req-1", 2, 1, far_deadline()) {
            Err(RelayError::DuplicateRequestId(id)) => assert_eq!(id, "req-1"),
            other => panic!("expected duplicate rejection, got {:?}", other.is_ok()),
        }
        // The original entry is still there.
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_expire_only_past_deadlines() {
        let table = CorrelationTable::new();
        let mut expired_rx = table
            .register("old", 1, 1, Instant::now() - Duration::from_secs(1))
            .unwrap();
        let mut live_rx = table.register("new", 1, 1, far_deadline()).unwrap();

        assert_eq!(table.expire_older_than(Instant::now()), 1);
        assert_eq!(
            expired_rx.try_recv().unwrap().unwrap_err(),
            RelayError::RequestTimeout
        );
        assert!(live_rx.try_recv().is_err());
        assert_eq!(table.len(), 1);

        // A late response for the expired id is discarded.
        assert!(!table.resolve("old", Value::Null));
    }

    #[tokio::test]
    async fn test_cancel_generation_spares_other_generations() {
        let table = CorrelationTable::new();
        let mut old_rx = table.register("to-old-host", 1, 1, far_deadline()).unwrap();
        let mut new_rx = table.register("to-new-host", 1, 2, far_deadline()).unwrap();

        assert_eq!(table.cancel_generation(1), 1);
        assert_eq!(
            old_rx.try_recv().unwrap().unwrap_err(),
            RelayError::HostDisconnected
        );
        assert!(new_rx.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_discard_owner_removes_silently() {
        let table = CorrelationTable::new();
        let _a = table.register("a", 7, 1, far_deadline()).unwrap();
        let _b = table.register("b", 7, 1, far_deadline()).unwrap();
        let _c = table.register("c", 8, 1, far_deadline()).unwrap();

        assert_eq!(table.discard_owner(7), 2);
        assert_eq!(table.len(), 1);
        assert!(table.resolve("c", Value::Null));
    }

    #[tokio::test]
    async fn test_cancel_all_signals_reason() {
        let table = CorrelationTable::new();
        let mut rx1 = table.register("a", 1, 1, far_deadline()).unwrap();
        let mut rx2 = table.register("b", 2, 1, far_deadline()).unwrap();

        assert_eq!(table.cancel_all(RelayError::ConnectionClosed), 2);
        assert_eq!(
            rx1.try_recv().unwrap().unwrap_err(),
            RelayError::ConnectionClosed
        );
        assert_eq!(
            rx2.try_recv().unwrap().unwrap_err(),
            RelayError::ConnectionClosed
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_discard_removes_without_signal() {
        let table = CorrelationTable::new();
        let mut rx = table.register("a", 1, 1, far_deadline()).unwrap();
        assert!(table.discard("a"));
        assert!(!table.discard("a"));
        // Sender dropped without a completion.
        assert!(rx.try_recv().is_err());
    }
}
