//! Call facade - how a handler invokes capabilities on other workers.
//!
//! A [`PeerClient`] is handed to every handler invocation. Calling through it
//! suspends only the handler's own task; the receiver loop keeps dispatching
//! unrelated traffic while the reply round-trips through the hub.

use std::sync::Arc;
use std::time::Duration;

use crate::correlation::{CallError, CorrelationTable};
use crate::envelope::Envelope;
use crate::outbound::OutboundQueue;

/// Default deadline for [`PeerClient::call_default`], matching the original
/// worker SDKs.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Cheaply cloneable handle for worker-to-worker calls.
#[derive(Clone)]
pub struct PeerClient {
    worker_id: Arc<str>,
    outbound: OutboundQueue,
    table: Arc<CorrelationTable>,
}

impl PeerClient {
    pub(crate) fn new(
        worker_id: Arc<str>,
        outbound: OutboundQueue,
        table: Arc<CorrelationTable>,
    ) -> Self {
        Self {
            worker_id,
            outbound,
            table,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Call `capability` on `target` through the hub, waiting up to `timeout`
    /// for the correlated response.
    ///
    /// The pending call is registered before the envelope is enqueued, so a
    /// response can never arrive ahead of its waiter. On timeout the entry is
    /// expired; a response arriving later finds no entry and is discarded.
    pub async fn call(
        &self,
        target: &str,
        capability: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, CallError> {
        let correlation_id = Envelope::fresh_id();
        let waiter = self.table.register(&correlation_id, target, timeout)?;

        tracing::debug!(
            peer = %target,
            capability = %capability,
            correlation_id = %correlation_id,
            "calling peer capability"
        );

        let envelope = Envelope::call(
            correlation_id.clone(),
            &self.worker_id,
            target,
            capability,
            params.to_string(),
        );
        if let Err(err) = self.outbound.enqueue(envelope) {
            // Never sent; drop the entry so nothing leaks.
            self.table.resolve(&correlation_id, Err(err.clone()));
            return Err(err);
        }

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(Ok(payload))) => parse_reply(&payload),
            Ok(Ok(Err(err))) => Err(err),
            // Waiter dropped without delivery: table torn down on shutdown.
            Ok(Err(_)) => Err(CallError::ConnectionClosed),
            Err(_) => {
                self.table.expire(&correlation_id);
                Err(CallError::Timeout {
                    target: target.to_string(),
                    timeout,
                })
            }
        }
    }

    /// [`call`](Self::call) with the SDK default timeout.
    pub async fn call_default(
        &self,
        target: &str,
        capability: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CallError> {
        self.call(target, capability, params, DEFAULT_CALL_TIMEOUT)
            .await
    }

    /// Fire-and-forget notification to a peer; no correlated reply.
    pub fn send_direct(
        &self,
        target: &str,
        capability: &str,
        params: serde_json::Value,
    ) -> Result<(), CallError> {
        self.outbound.enqueue(Envelope::direct(
            &self.worker_id,
            target,
            capability,
            params.to_string(),
        ))
    }
}

fn parse_reply(payload: &str) -> Result<serde_json::Value, CallError> {
    if payload.is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(payload).map_err(|e| CallError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;
    use crate::outbound::OutboundItem;
    use serde_json::json;

    fn client() -> (PeerClient, tokio::sync::mpsc::UnboundedReceiver<OutboundItem>) {
        let (outbound, rx) = OutboundQueue::channel();
        let table = Arc::new(CorrelationTable::new());
        (PeerClient::new(Arc::from("w1"), outbound, table), rx)
    }

    fn sent_envelope(item: Option<OutboundItem>) -> Envelope {
        match item {
            Some(OutboundItem::Deliver(env)) => env,
            _ => panic!("expected an enqueued envelope"),
        }
    }

    #[tokio::test]
    async fn call_resolves_with_correlated_reply() {
        let (client, mut rx) = client();
        let table = Arc::clone(&client.table);

        let call = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .call("w2", "double", json!({"n": 21}), Duration::from_secs(5))
                    .await
            }
        });

        let env = sent_envelope(rx.recv().await);
        assert_eq!(env.kind, EnvelopeKind::Call);
        assert_eq!(env.recipient, "w2");
        assert_eq!(env.payload, r#"{"n":21}"#);

        table.resolve(&env.id, Ok(r#"{"result":42}"#.to_string()));
        assert_eq!(call.await.unwrap().unwrap(), json!({"result": 42}));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn timeout_expires_the_entry() {
        let (client, mut rx) = client();
        let err = client
            .call("w2", "slow", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout { ref target, .. } if target == "w2"));
        assert!(client.table.is_empty());

        // A reply after timeout finds no entry and is discarded.
        let env = sent_envelope(rx.recv().await);
        assert!(!client.table.resolve(&env.id, Ok("{}".to_string())));
    }

    #[tokio::test]
    async fn concurrent_calls_use_distinct_correlation_ids() {
        let (client, mut rx) = client();
        let table = Arc::clone(&client.table);

        let a = tokio::spawn({
            let client = client.clone();
            async move { client.call("w2", "a", json!({}), Duration::from_secs(5)).await }
        });
        let b = tokio::spawn({
            let client = client.clone();
            async move { client.call("w3", "b", json!({}), Duration::from_secs(5)).await }
        });

        let first = sent_envelope(rx.recv().await);
        let second = sent_envelope(rx.recv().await);
        assert_ne!(first.id, second.id);

        // Answer out of order; each waiter gets its own payload.
        table.resolve(&second.id, Ok(r#"{"who":"second"}"#.to_string()));
        table.resolve(&first.id, Ok(r#"{"who":"first"}"#.to_string()));

        let (result_a, result_b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        let results = [result_a, result_b];
        assert!(results.contains(&json!({"who":"first"})));
        assert!(results.contains(&json!({"who":"second"})));
    }

    #[tokio::test]
    async fn call_on_closed_queue_leaves_no_entry() {
        let (outbound, _rx) = OutboundQueue::channel();
        outbound.close();
        let table = Arc::new(CorrelationTable::new());
        let client = PeerClient::new(Arc::from("w1"), outbound, Arc::clone(&table));

        let err = client
            .call("w2", "x", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::ConnectionClosed));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn remote_failure_surfaces_as_error() {
        let (client, mut rx) = client();
        let table = Arc::clone(&client.table);

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("w2", "x", json!({}), Duration::from_secs(5)).await }
        });

        let env = sent_envelope(rx.recv().await);
        table.resolve(
            &env.id,
            Err(CallError::Remote {
                message: "division by zero".to_string(),
            }),
        );
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CallError::Remote { ref message } if message == "division by zero"));
    }

    #[tokio::test]
    async fn empty_reply_payload_parses_as_empty_object() {
        assert_eq!(parse_reply("").unwrap(), json!({}));
        assert!(matches!(
            parse_reply("not json"),
            Err(CallError::InvalidResponse(_))
        ));
    }
}
