//! In-process duplex transport pair.
//!
//! Bytes sent on one side arrive as `Received` events on the other side's
//! sink; the sender gets a `SendComplete` immediately after. Used by tests
//! and demos where a real socket would only add noise.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use crate::error::{Result, TransportError};
use crate::traits::{EventSink, Transport, TransportEvent};

pub struct MemoryTransport {
    sink: EventSink,
    peer_sink: EventSink,
    peer: Mutex<Weak<MemoryTransport>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Create a connected pair. Each side reports into its own sink.
    ///
    /// Both sides receive an `Activated` event immediately.
    pub fn pair(a: EventSink, b: EventSink) -> (Arc<Self>, Arc<Self>) {
        let left = Arc::new(Self {
            sink: a.clone(),
            peer_sink: b.clone(),
            peer: Mutex::new(Weak::new()),
            closed: AtomicBool::new(false),
        });
        let right = Arc::new(Self {
            sink: b.clone(),
            peer_sink: a.clone(),
            peer: Mutex::new(Weak::new()),
            closed: AtomicBool::new(false),
        });
        *left.peer.lock().expect("peer lock") = Arc::downgrade(&right);
        *right.peer.lock().expect("peer lock") = Arc::downgrade(&left);

        a.push(TransportEvent::Activated);
        b.push(TransportEvent::Activated);
        (left, right)
    }

    fn deactivate(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.sink.push(TransportEvent::Deactivated(None));
        }
    }
}

impl Transport for MemoryTransport {
    fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.peer_sink.push(TransportEvent::Received(frame));
        self.sink.push(TransportEvent::SendComplete);
        Ok(())
    }

    fn close(&self) {
        self.deactivate();
        let peer = self.peer.lock().expect("peer lock").upgrade();
        if let Some(peer) = peer {
            peer.deactivate();
        }
    }
}
