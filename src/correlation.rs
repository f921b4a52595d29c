//! Correlation table - tracks outstanding outbound calls.
//!
//! Each pending call is keyed by the `CALL` envelope's id and resolved at most
//! once: either the receiver loop delivers a correlated `RESPONSE`, or the
//! call facade expires it on deadline, or shutdown fails it wholesale. The
//! single mutex is held only for the duration of a table operation, never
//! across an await.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

/// Error surfaced to a caller of the call facade.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("no response from {target} after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    /// The responder answered with `status=failed`.
    #[error("remote capability failed: {message}")]
    Remote { message: String },

    #[error("failed to parse response payload: {0}")]
    InvalidResponse(String),

    #[error("connection closed")]
    ConnectionClosed,

    /// Should not occur given unique id generation; fatal to the one call.
    #[error("correlation id already registered: {0}")]
    DuplicateCorrelation(String),
}

/// Delivered result: the raw response payload, or the call-level error.
pub type CallReply = Result<String, CallError>;

struct PendingCall {
    waiter: oneshot::Sender<CallReply>,
    target: String,
    timeout: Duration,
    deadline: Instant,
}

/// Outstanding outbound calls, keyed by correlation id.
#[derive(Default)]
pub struct CorrelationTable {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_calls(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("correlation table mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Create a pending call and hand back its waiter.
    ///
    /// Must happen-before the call envelope is enqueued, so a response can
    /// never arrive ahead of the waiter.
    pub fn register(
        &self,
        correlation_id: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<CallReply>, CallError> {
        let (tx, rx) = oneshot::channel();
        let mut calls = self.lock_calls();
        if calls.contains_key(correlation_id) {
            return Err(CallError::DuplicateCorrelation(correlation_id.to_string()));
        }
        calls.insert(
            correlation_id.to_string(),
            PendingCall {
                waiter: tx,
                target: target.to_string(),
                timeout,
                deadline: Instant::now() + timeout,
            },
        );
        Ok(rx)
    }

    /// Deliver a reply to the matching waiter and remove the entry.
    ///
    /// An unmatched id is not an error: the call may have timed out already,
    /// or this is a duplicate response. Returns whether a waiter was found.
    pub fn resolve(&self, correlation_id: &str, reply: CallReply) -> bool {
        let entry = self.lock_calls().remove(correlation_id);
        match entry {
            Some(pending) => {
                // Waiter may have given up between timeout and expire; a
                // failed send is fine, the entry is gone either way.
                let _ = pending.waiter.send(reply);
                true
            }
            None => {
                tracing::debug!(correlation_id, "discarding response with no pending call");
                false
            }
        }
    }

    /// Remove a pending call on deadline, delivering a timeout error if it is
    /// still registered.
    pub fn expire(&self, correlation_id: &str) {
        let entry = self.lock_calls().remove(correlation_id);
        if let Some(pending) = entry {
            tracing::debug!(
                correlation_id,
                target = %pending.target,
                overdue = ?pending.deadline.elapsed(),
                "expiring pending call"
            );
            let _ = pending.waiter.send(Err(CallError::Timeout {
                target: pending.target,
                timeout: pending.timeout,
            }));
        }
    }

    /// Shutdown path: resolve every still-pending call with a
    /// connection-closed error so no caller can hang past the connection.
    pub fn fail_all(&self) {
        let drained: Vec<_> = {
            let mut calls = self.lock_calls();
            calls.drain().collect()
        };
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "failing pending calls on shutdown");
        }
        for (_, pending) in drained {
            let _ = pending.waiter.send(Err(CallError::ConnectionClosed));
        }
    }

    pub fn len(&self) -> usize {
        self.lock_calls().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_calls().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn resolve_delivers_to_waiter_and_removes() {
        let table = CorrelationTable::new();
        let rx = table.register("c1", "w2", TIMEOUT).unwrap();
        assert_eq!(table.len(), 1);

        assert!(table.resolve("c1", Ok(r#"{"result":42}"#.to_string())));
        assert!(table.is_empty());
        assert_eq!(rx.await.unwrap().unwrap(), r#"{"result":42}"#);
    }

    #[tokio::test]
    async fn unmatched_response_is_discarded() {
        let table = CorrelationTable::new();
        let rx = table.register("c1", "w2", TIMEOUT).unwrap();

        assert!(!table.resolve("unknown", Ok("{}".to_string())));
        // The unrelated pending call is unaffected.
        assert_eq!(table.len(), 1);
        table.resolve("c1", Ok("{}".to_string()));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn second_resolve_finds_no_entry() {
        let table = CorrelationTable::new();
        let _rx = table.register("c1", "w2", TIMEOUT).unwrap();
        assert!(table.resolve("c1", Ok("{}".to_string())));
        assert!(!table.resolve("c1", Ok("{}".to_string())));
    }

    #[tokio::test]
    async fn expire_delivers_timeout() {
        let table = CorrelationTable::new();
        let rx = table.register("c1", "w2", TIMEOUT).unwrap();
        table.expire("c1");
        assert!(table.is_empty());
        match rx.await.unwrap() {
            Err(CallError::Timeout { target, .. }) => assert_eq!(target, "w2"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_correlation_is_rejected() {
        let table = CorrelationTable::new();
        let _rx = table.register("c1", "w2", TIMEOUT).unwrap();
        let err = table.register("c1", "w3", TIMEOUT).unwrap_err();
        assert!(matches!(err, CallError::DuplicateCorrelation(id) if id == "c1"));
        // The original entry survives.
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn fail_all_resolves_everything_with_connection_closed() {
        let table = CorrelationTable::new();
        let rx1 = table.register("c1", "w2", TIMEOUT).unwrap();
        let rx2 = table.register("c2", "w3", TIMEOUT).unwrap();

        table.fail_all();
        assert!(table.is_empty());
        assert!(matches!(rx1.await.unwrap(), Err(CallError::ConnectionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(CallError::ConnectionClosed)));
    }
}
