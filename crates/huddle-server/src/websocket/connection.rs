//! Per-connection handle shared between the transport and the registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use huddle_core::{ConnectionId, OutboundMessage};
use tokio::sync::mpsc;

/// One open WebSocket client.
///
/// The registry and router only hold `Arc`s to this; the socket itself and
/// the receiving end of the outbound queue stay with the session task.
pub struct ClientConnection {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<OutboundMessage>>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<OutboundMessage>>) -> Self {
        Self {
            id,
            tx,
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Fresh connection with a bounded outbound queue of `capacity`.
    pub fn with_queue(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<OutboundMessage>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Self::new(ConnectionId::new(), tx)), rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Enqueue without waiting.
    ///
    /// Returns `false` if the queue is full or the writer has gone away, and
    /// increments the dropped message counter.
    pub fn send(&self, message: Arc<OutboundMessage>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}
