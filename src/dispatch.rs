//! Inbound dispatcher - single receiver loop routing envelopes by kind.
//!
//! Responses go to the correlation table; requests and calls dispatch to
//! registered handlers, each invocation on its own task so one slow handler
//! cannot delay subsequent inbound traffic; DIRECT notifications go to the
//! out-of-band listener if one is registered. Malformed frames are logged and
//! skipped; only stream-level failure exits the loop.

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use crate::codec::EnvelopeCodec;
use crate::correlation::{CallError, CorrelationTable};
use crate::envelope::{Envelope, EnvelopeKind, STATUS_FAILED, STATUS_SUCCESS, failure_payload};
use crate::outbound::OutboundQueue;
use crate::peers::PeerClient;
use crate::registry::{CapabilityHandler, CapabilityRegistry};

/// Shared state the receiver loop needs to route one envelope.
pub(crate) struct DispatchContext {
    pub worker_id: Arc<str>,
    pub registry: Arc<CapabilityRegistry>,
    pub table: Arc<CorrelationTable>,
    pub outbound: OutboundQueue,
    pub peers: PeerClient,
    pub direct_tx: Option<mpsc::UnboundedSender<Envelope>>,
}

/// Receiver loop: reads envelopes until the channel closes or fails.
///
/// Returns `Ok(())` on clean end-of-stream; an I/O error other than a
/// malformed frame is fatal and triggers connection shutdown in the caller.
pub(crate) async fn run_receiver<R>(
    mut reader: FramedRead<R, EnvelopeCodec>,
    ctx: Arc<DispatchContext>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(envelope) => dispatch_envelope(envelope, &ctx),
            // Only a parse failure is skippable: the codec has already
            // consumed the frame, so the stream stays in sync. Any other
            // read error is channel-level and fatal.
            Err(e)
                if e.kind() == io::ErrorKind::InvalidData
                    && e.get_ref().is_some_and(|r| r.is::<serde_json::Error>()) =>
            {
                tracing::warn!(error = %e, "dropping malformed envelope");
            }
            Err(e) => return Err(e),
        }
    }
    tracing::debug!("hub channel closed");
    Ok(())
}

pub(crate) fn dispatch_envelope(envelope: Envelope, ctx: &Arc<DispatchContext>) {
    tracing::trace!(
        id = %envelope.id,
        kind = ?envelope.kind,
        sender = %envelope.sender,
        capability = %envelope.capability,
        "inbound envelope"
    );
    match envelope.kind {
        EnvelopeKind::Response => handle_response(envelope, ctx),
        EnvelopeKind::Request | EnvelopeKind::Call => handle_invocation(envelope, ctx),
        EnvelopeKind::Direct => match &ctx.direct_tx {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    tracing::debug!("direct listener gone, dropping notification");
                }
            }
            None => tracing::trace!("no direct listener, dropping notification"),
        },
        EnvelopeKind::Register => {
            tracing::warn!(id = %envelope.id, "unexpected inbound REGISTER, dropping");
        }
    }
}

fn handle_response(envelope: Envelope, ctx: &Arc<DispatchContext>) {
    let Some(request_id) = envelope.request_id() else {
        tracing::warn!(id = %envelope.id, "response without request_id, dropping");
        return;
    };
    let reply = if envelope.is_failed() {
        Err(CallError::Remote {
            message: extract_error(&envelope.payload),
        })
    } else {
        Ok(envelope.payload.clone())
    };
    ctx.table.resolve(request_id, reply);
}

/// Pull the `error` field out of a failed response payload, falling back to
/// the raw payload when it is not the structured shape.
fn extract_error(payload: &str) -> String {
    serde_json::from_str::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| payload.to_string())
}

fn handle_invocation(envelope: Envelope, ctx: &Arc<DispatchContext>) {
    let Some(handler) = ctx.registry.lookup(&envelope.capability) else {
        tracing::warn!(capability = %envelope.capability, "request for unknown capability");
        let payload = failure_payload(&format!("unknown capability: {}", envelope.capability));
        enqueue_response(ctx, &envelope, payload, STATUS_FAILED);
        return;
    };

    // Independent unit of work: a handler awaiting a peer call must not
    // block dispatch of the messages it is waiting for.
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let (payload, status) = invoke_handler(handler, &envelope, &ctx).await;
        enqueue_response(&ctx, &envelope, payload, status);
    });
}

async fn invoke_handler(
    handler: Arc<dyn CapabilityHandler>,
    envelope: &Envelope,
    ctx: &Arc<DispatchContext>,
) -> (String, &'static str) {
    let params = if envelope.payload.is_empty() {
        serde_json::json!({})
    } else {
        match serde_json::from_str(&envelope.payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    id = %envelope.id,
                    capability = %envelope.capability,
                    error = %e,
                    "unparseable request payload"
                );
                return (failure_payload(&format!("invalid payload: {e}")), STATUS_FAILED);
            }
        }
    };

    let invocation = handler.handle(params, ctx.peers.clone());
    match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(Ok(result)) => (result.to_string(), STATUS_SUCCESS),
        Ok(Err(err)) => {
            tracing::warn!(
                capability = %envelope.capability,
                error = %err,
                "handler returned error"
            );
            (failure_payload(err.message()), STATUS_FAILED)
        }
        Err(panic) => {
            let message = panic_message(panic);
            tracing::error!(capability = %envelope.capability, %message, "handler panicked");
            (
                failure_payload(&format!("handler panicked: {message}")),
                STATUS_FAILED,
            )
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn enqueue_response(ctx: &DispatchContext, inbound: &Envelope, payload: String, status: &str) {
    let response = Envelope::response(
        &ctx.worker_id,
        &inbound.sender,
        &inbound.capability,
        payload,
        &inbound.id,
        status,
    );
    if let Err(e) = ctx.outbound.enqueue(response) {
        tracing::warn!(request_id = %inbound.id, error = %e, "could not enqueue response");
    }
}
