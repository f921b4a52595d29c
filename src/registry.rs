//! Capability registry - maps capability names to handlers and descriptors.
//!
//! Populated through the [`Worker`](crate::connection::Worker) builder before
//! the connection starts streaming, then consumed into an `Arc`. There is no
//! mutation after startup, so concurrent lookups need no lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::CapabilityDescriptor;
use crate::peers::PeerClient;

/// Error raised by a capability handler.
///
/// Caught at the dispatch boundary and converted into a `status=failed`
/// response; never propagated past the invocation task.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Business logic behind one capability.
///
/// `peers` is the handle back into the runtime: a handler may call other
/// workers through it while its own task is suspended, without blocking
/// inbound dispatch.
#[async_trait]
pub trait CapabilityHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        params: serde_json::Value,
        peers: PeerClient,
    ) -> Result<serde_json::Value, HandlerError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> CapabilityHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, PeerClient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        params: serde_json::Value,
        peers: PeerClient,
    ) -> Result<serde_json::Value, HandlerError> {
        (self.f)(params, peers).await
    }
}

/// Adapt a plain async function into a [`CapabilityHandler`].
pub fn handler_fn<F, Fut>(f: F) -> impl CapabilityHandler
where
    F: Fn(serde_json::Value, PeerClient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Registration must be unambiguous; silent overwrite is rejected.
    #[error("capability already registered: {0}")]
    DuplicateCapability(String),
}

struct CapabilityEntry {
    descriptor: CapabilityDescriptor,
    handler: Arc<dyn CapabilityHandler>,
}

/// Immutable-after-startup capability table.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: HashMap<String, CapabilityEntry>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        descriptor: CapabilityDescriptor,
        handler: impl CapabilityHandler,
    ) -> Result<(), RegistryError> {
        let name = descriptor.name.clone();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::DuplicateCapability(name));
        }
        tracing::debug!(capability = %name, "registered capability");
        self.entries.insert(
            name,
            CapabilityEntry {
                descriptor,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn CapabilityHandler>> {
        self.entries.get(name).map(|e| Arc::clone(&e.handler))
    }

    /// Descriptors for the registration envelope, in name order so the
    /// advertised list is stable across runs.
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        let mut descriptors: Vec<_> = self
            .entries
            .values()
            .map(|e| e.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
