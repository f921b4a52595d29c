//! Outbound multiplexer - single sender loop serializing all outbound
//! envelopes onto the channel.
//!
//! Producers (call facade, invocation tasks, lifecycle) share one unbounded
//! queue; the loop drains it in FIFO order with no reordering or priority.
//! The registration envelope is enqueued before the loop starts, so it is
//! always the first frame on the wire.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;

use crate::codec::EnvelopeCodec;
use crate::correlation::CallError;
use crate::envelope::Envelope;

pub(crate) enum OutboundItem {
    Deliver(Envelope),
    /// Sentinel pushed through the queue on shutdown: everything enqueued
    /// ahead of it still drains, then the loop exits.
    Stop,
}

/// Cloneable producer handle onto the outbound queue.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<OutboundItem>,
    closed: Arc<AtomicBool>,
}

impl OutboundQueue {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Submit an envelope for sending. Fails once the connection is closing.
    pub fn enqueue(&self, envelope: Envelope) -> Result<(), CallError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CallError::ConnectionClosed);
        }
        self.tx
            .send(OutboundItem::Deliver(envelope))
            .map_err(|_| CallError::ConnectionClosed)
    }

    /// Stop accepting new enqueues and let the sender drain what is queued.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.tx.send(OutboundItem::Stop);
    }
}

/// Sender loop: drains the queue in submission order until it observes the
/// stop sentinel or a channel write fails.
pub(crate) async fn run_sender<W>(
    mut rx: mpsc::UnboundedReceiver<OutboundItem>,
    mut writer: FramedWrite<W, EnvelopeCodec>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = rx.recv().await {
        match item {
            OutboundItem::Deliver(envelope) => {
                tracing::trace!(
                    id = %envelope.id,
                    kind = ?envelope.kind,
                    recipient = %envelope.recipient,
                    "sending envelope"
                );
                writer.send(envelope).await?;
            }
            OutboundItem::Stop => break,
        }
    }
    let _ = writer.close().await;
    tracing::debug!("sender loop exited");
    Ok(())
}
