use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::protocol::CorrelationId;
use crate::{Result, RpcError};

/// Caller-visible outcome of a single request: the response envelope's
/// result value, or the error it resolved to.
pub(super) type Outcome = Result<serde_json::Value>;

/// Tracks in-flight requests awaiting responses.
///
/// Maps correlation IDs to oneshot senders. Entry presence is the single
/// source of truth for "not yet resolved": whichever of response delivery,
/// timeout, or transport failure removes the entry first wins, and the
/// losing path sees an absent entry and backs off.
///
/// Owned by exactly one client instance; never shared across clients.
pub(super) struct PendingRequests {
    // ---
    entries: HashMap<CorrelationId, oneshot::Sender<Outcome>>,
}

impl PendingRequests {
    // ---

    pub fn new() -> Self {
        // ---
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a new in-flight request.
    ///
    /// Returns a receiver that resolves when the request completes. A
    /// caller-supplied ID colliding with a live entry is a precondition
    /// violation and is rejected with `RpcError::Protocol`.
    pub fn register(&mut self, correlation_id: CorrelationId) -> Result<oneshot::Receiver<Outcome>> {
        // ---
        if self.entries.contains_key(&correlation_id) {
            return Err(RpcError::Protocol(format!(
                "correlation id {correlation_id} is already in flight"
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.entries.insert(correlation_id, tx);
        Ok(rx)
    }

    /// Complete an in-flight request with its outcome.
    ///
    /// Removes the entry and delivers in one step, so an absent entry always
    /// means the outcome has already been delivered (or given up on).
    /// Returns false for late or duplicate completions, which are dropped.
    pub fn complete(&mut self, correlation_id: &CorrelationId, outcome: Outcome) -> bool {
        // ---
        if let Some(tx) = self.entries.remove(correlation_id) {
            // Send failure means the caller abandoned the request; nothing to do.
            let _ = tx.send(outcome);
            true
        } else {
            false
        }
    }

    /// Remove an entry without delivering an outcome.
    ///
    /// Used by the timeout and publish-failure paths. Returns whether the
    /// entry was still present.
    pub fn remove(&mut self, correlation_id: &CorrelationId) -> bool {
        // ---
        self.entries.remove(correlation_id).is_some()
    }

    /// Fail every in-flight request with a connection error.
    ///
    /// Invoked when the reply consumer stops, so no caller is left hanging
    /// on a channel that can never deliver.
    pub fn fail_all(&mut self, reason: &str) {
        // ---
        for (_, tx) in self.entries.drain() {
            let _ = tx.send(Err(RpcError::Connection(reason.to_string())));
        }
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        // ---
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_and_complete() {
        // ---
        let mut pending = PendingRequests::new();
        let id = CorrelationId::generate();

        let mut rx = pending.register(id.clone()).unwrap();
        assert_eq!(pending.len(), 1);

        assert!(pending.complete(&id, Ok(json!(832040))));
        assert_eq!(pending.len(), 0);

        let outcome = rx.try_recv().unwrap();
        assert_eq!(outcome.unwrap(), json!(832040));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        // ---
        let mut pending = PendingRequests::new();
        let id = CorrelationId::from("caller-chosen");

        let _rx = pending.register(id.clone()).unwrap();
        assert!(matches!(
            pending.register(id.clone()),
            Err(RpcError::Protocol(_))
        ));

        // The live entry is untouched by the rejected registration.
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_id_reusable_after_resolution() {
        // ---
        let mut pending = PendingRequests::new();
        let id = CorrelationId::from("caller-chosen");

        let _rx = pending.register(id.clone()).unwrap();
        assert!(pending.remove(&id));

        // Once the entry is gone the ID may go back in flight.
        assert!(pending.register(id).is_ok());
    }

    #[test]
    fn test_late_completion_is_dropped() {
        // ---
        let mut pending = PendingRequests::new();
        let id = CorrelationId::generate();

        let _rx = pending.register(id.clone()).unwrap();
        assert!(pending.remove(&id));

        // Second resolution attempt finds no entry.
        assert!(!pending.complete(&id, Ok(json!(1))));
        assert!(!pending.remove(&id));
    }

    #[test]
    fn test_fail_all_reaches_every_waiter() {
        // ---
        let mut pending = PendingRequests::new();
        let mut receivers = Vec::new();

        for _ in 0..3 {
            receivers.push(pending.register(CorrelationId::generate()).unwrap());
        }

        pending.fail_all("connection lost");
        assert_eq!(pending.len(), 0);

        for mut rx in receivers {
            let outcome = rx.try_recv().unwrap();
            assert!(matches!(outcome, Err(RpcError::Connection(_))));
        }
    }
}
