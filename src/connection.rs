//! Connection lifecycle - owns the hub channel's open/close state.
//!
//! A [`Worker`] is built and populated up front, then consumed by
//! [`connect`](Worker::connect) or [`serve`](Worker::serve) into a
//! [`WorkerHandle`]. A supervisor task enqueues the registration envelope,
//! spawns the sender and receiver loops, and on stop or fatal transport error
//! walks the shutdown path: refuse new outbound enqueues, drain the queue,
//! resolve every pending call with a connection-closed error, release the
//! channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::EnvelopeCodec;
use crate::correlation::CorrelationTable;
use crate::dispatch::{self, DispatchContext};
use crate::envelope::{CapabilityDescriptor, Envelope, RegistrationPayload};
use crate::outbound::{self, OutboundItem, OutboundQueue};
use crate::peers::PeerClient;
use crate::registry::{CapabilityHandler, CapabilityRegistry, RegistryError};

/// How long the closing path waits for queued envelopes to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Channel-level failure; fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to reach hub: {0}")]
    Connect(#[source] std::io::Error),

    #[error("no connection to hub after {0:?}")]
    ConnectTimeout(Duration),

    #[error("channel read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("channel write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to encode registration: {0}")]
    Registration(#[from] serde_json::Error),

    #[error("connection task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Closing,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bounded wait for the hub channel to come up.
    pub connect_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Builder for a worker runtime: identity, capabilities, listeners.
///
/// The registry is populated here, before the connection exists; once the
/// worker is serving there is no way to mutate it.
pub struct Worker {
    worker_id: String,
    worker_type: String,
    metadata: HashMap<String, String>,
    registry: CapabilityRegistry,
    direct_tx: Option<mpsc::UnboundedSender<Envelope>>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(worker_id: impl Into<String>, worker_type: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            worker_type: worker_type.into(),
            metadata: HashMap::new(),
            registry: CapabilityRegistry::new(),
            direct_tx: None,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a capability. Fails on a duplicate name; no silent overwrite.
    pub fn register(
        &mut self,
        descriptor: CapabilityDescriptor,
        handler: impl CapabilityHandler,
    ) -> Result<(), RegistryError> {
        self.registry.register(descriptor, handler)
    }

    /// Extra entries for the registration payload's metadata map.
    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Receive out-of-band `DIRECT` notifications. Without a listener they
    /// are dropped.
    pub fn direct_listener(&mut self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.direct_tx = Some(tx);
        rx
    }

    /// Connect to the hub over TCP, failing fast if the channel cannot be
    /// established within the configured timeout.
    pub async fn connect(self, addr: impl ToSocketAddrs) -> Result<WorkerHandle, TransportError> {
        let connect_timeout = self.config.connect_timeout;
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout(connect_timeout))?
            .map_err(TransportError::Connect)?;
        Ok(self.serve(stream))
    }

    /// Run the worker over an already-established duplex channel.
    ///
    /// Generic over the stream so tests can play the hub through an
    /// in-memory duplex.
    pub fn serve<S>(self, stream: S) -> WorkerHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let shutdown = Arc::new(Notify::new());
        let (outbound, outbound_rx) = OutboundQueue::channel();
        let table = Arc::new(CorrelationTable::new());

        let worker_id: Arc<str> = Arc::from(self.worker_id.as_str());
        let peers = PeerClient::new(Arc::clone(&worker_id), outbound.clone(), Arc::clone(&table));

        let registration = RegistrationPayload::new(
            &self.worker_id,
            &self.worker_type,
            self.registry.descriptors(),
            self.metadata,
        );

        let ctx = Arc::new(DispatchContext {
            worker_id,
            registry: Arc::new(self.registry),
            table,
            outbound,
            peers: peers.clone(),
            direct_tx: self.direct_tx,
        });

        let task = tokio::spawn(run_connection(
            stream,
            registration,
            Arc::clone(&ctx),
            outbound_rx,
            state_tx,
            Arc::clone(&shutdown),
        ));

        WorkerHandle {
            peers,
            state_rx,
            shutdown,
            task,
        }
    }
}

/// Handle to a running connection.
pub struct WorkerHandle {
    peers: PeerClient,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown: Arc<Notify>,
    task: JoinHandle<Result<(), TransportError>>,
}

impl WorkerHandle {
    /// Call facade handle, also usable outside handler context.
    pub fn peers(&self) -> PeerClient {
        self.peers.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Request a graceful stop. Idempotent.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// Wait until the connection has fully released the channel.
    pub async fn wait_disconnected(&mut self) {
        while *self.state_rx.borrow() != ConnectionState::Disconnected {
            if self.state_rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Wait for the connection to finish and surface its outcome.
    pub async fn join(self) -> Result<(), TransportError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(TransportError::TaskFailed(e.to_string())),
        }
    }
}

async fn run_connection<S>(
    stream: S,
    registration: RegistrationPayload,
    ctx: Arc<DispatchContext>,
    outbound_rx: mpsc::UnboundedReceiver<OutboundItem>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: Arc<Notify>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = FramedRead::new(read_half, EnvelopeCodec::new());
    let writer = FramedWrite::new(write_half, EnvelopeCodec::new());

    // Enqueued before the sender loop starts: registration is guaranteed to
    // be the first frame on the wire.
    let payload = serde_json::to_string(&registration)?;
    let capability_count = registration.capabilities.len();
    let register = Envelope::register(&ctx.worker_id, payload);
    if ctx.outbound.enqueue(register).is_err() {
        return Err(TransportError::TaskFailed(
            "outbound queue closed before startup".to_string(),
        ));
    }

    // Streaming from here on: once any frame can be observed on the wire,
    // the state is already published.
    let _ = state_tx.send(ConnectionState::Streaming);
    tracing::info!(
        worker_id = %ctx.worker_id,
        capabilities = capability_count,
        "streaming with hub"
    );

    let mut send_task = tokio::spawn(outbound::run_sender(outbound_rx, writer));
    let mut recv_task = tokio::spawn(dispatch::run_receiver(reader, Arc::clone(&ctx)));

    let mut sender_finished = false;
    let result: Result<(), TransportError> = tokio::select! {
        res = &mut send_task => {
            sender_finished = true;
            match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(TransportError::Write(e)),
                Err(e) => Err(TransportError::TaskFailed(e.to_string())),
            }
        }
        res = &mut recv_task => match res {
            // Clean end-of-stream: the hub went away.
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Read(e)),
            Err(e) => Err(TransportError::TaskFailed(e.to_string())),
        },
        _ = shutdown.notified() => Ok(()),
    };

    let _ = state_tx.send(ConnectionState::Closing);
    match &result {
        Ok(()) => tracing::info!(worker_id = %ctx.worker_id, "connection closing"),
        Err(e) => tracing::error!(worker_id = %ctx.worker_id, error = %e, "connection failed, shutting down"),
    }

    // Refuse new enqueues, then let whatever is already queued drain.
    ctx.outbound.close();
    recv_task.abort();
    if !sender_finished {
        match tokio::time::timeout(DRAIN_TIMEOUT, &mut send_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "write failed while draining"),
            Ok(Err(e)) => tracing::warn!(error = %e, "sender task failed while draining"),
            Err(_) => {
                tracing::warn!("sender did not drain in time, aborting");
                send_task.abort();
            }
        }
    }

    // No caller of the call facade may hang past this point.
    ctx.table.fail_all();

    let _ = state_tx.send(ConnectionState::Disconnected);
    tracing::info!(worker_id = %ctx.worker_id, "disconnected from hub");
    result
}
