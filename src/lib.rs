//! hublink: worker-side runtime for hub-relayed capability messaging.
//!
//! A worker holds one long-lived, bidirectional channel to a central relay
//! (the hub), advertises its capabilities on connect, serves inbound
//! invocation requests by dispatching to registered handlers, and lets those
//! handlers call capabilities on other workers through the same channel.
//!
//! ```no_run
//! use hublink::{CapabilityDescriptor, HandlerError, Worker, handler_fn};
//! use serde_json::json;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut worker = Worker::new("w1", "rust");
//! worker.register(
//!     CapabilityDescriptor::new("echo").description("echoes a message"),
//!     handler_fn(|params, _peers| async move {
//!         let message = params["message"].as_str().unwrap_or_default();
//!         Ok(json!({ "echo": message, "length": message.len() }))
//!     }),
//! )?;
//! let handle = worker.connect("127.0.0.1:50051").await?;
//! handle.join().await?;
//! # Ok(())
//! # }
//! ```

mod codec;
mod connection;
mod correlation;
mod dispatch;
mod envelope;
mod outbound;
mod peers;
mod registry;

pub use codec::EnvelopeCodec;
pub use connection::{ConnectionState, TransportError, Worker, WorkerConfig, WorkerHandle};
pub use correlation::{CallError, CallReply, CorrelationTable};
pub use envelope::{
    CAPABILITY_KEY, CapabilityDescriptor, Envelope, EnvelopeKind, HUB_RECIPIENT,
    REGISTRATION_CAPABILITY, REQUEST_ID_KEY, RegistrationPayload, STATUS_FAILED, STATUS_KEY,
    STATUS_SUCCESS, failure_payload,
};
pub use outbound::OutboundQueue;
pub use peers::{DEFAULT_CALL_TIMEOUT, PeerClient};
pub use registry::{
    CapabilityHandler, CapabilityRegistry, HandlerError, RegistryError, handler_fn,
};
