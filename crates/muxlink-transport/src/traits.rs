use std::sync::mpsc;

use bytes::Bytes;

use crate::error::{Result, TransportError};

/// Index of a transport within its owning event loop.
pub type TransportId = usize;

/// Everything a transport reports back to its owner.
///
/// Events are pushed into a single channel shared by all transports of one
/// event loop, tagged with the originating [`TransportId`].
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection is established and ready to carry frames.
    Activated,
    /// Bytes arrived from the remote end. May contain partial frames.
    Received(Bytes),
    /// The previously queued write has been fully flushed.
    SendComplete,
    /// A producer thread queued outbound frames; the event loop should
    /// drain the send queue. Pushed by the protocol layer, not by
    /// transports, so that every write happens on the event thread.
    SendReady,
    /// The connection is gone. `None` means an orderly close.
    Deactivated(Option<TransportError>),
}

/// Sender half for one transport's events, tagged with its id.
#[derive(Clone)]
pub struct EventSink {
    id: TransportId,
    tx: mpsc::Sender<(TransportId, TransportEvent)>,
}

impl EventSink {
    pub fn new(id: TransportId, tx: mpsc::Sender<(TransportId, TransportEvent)>) -> Self {
        Self { id, tx }
    }

    /// The transport id this sink tags events with.
    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Push an event. Silently drops it if the receiving loop is gone.
    pub fn push(&self, event: TransportEvent) {
        let _ = self.tx.send((self.id, event));
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink").field("id", &self.id).finish()
    }
}

/// One physical connection carrying framed bytes.
///
/// `send` queues exactly one frame's worth of bytes; completion is reported
/// as [`TransportEvent::SendComplete`]. The caller must not queue another
/// frame until that event arrives — the protocol driver enforces this with
/// its in-flight flag.
pub trait Transport: Send + Sync {
    /// Queue one frame for transmission.
    fn send(&self, frame: Bytes) -> Result<()>;

    /// Begin teardown. A `Deactivated` event follows exactly once.
    fn close(&self);
}
