//! Byte-stream transport abstraction for the muxlink protocol driver.
//!
//! A transport owns one physical connection and reports everything that
//! happens on it — activation, received bytes, write completion, teardown —
//! as [`TransportEvent`]s pushed into the owning event loop. Two
//! implementations ship here:
//!
//! - [`memory`] — an in-process duplex pair, used by tests and demos
//! - [`uds`] — Unix domain sockets with a background reader thread

pub mod error;
pub mod memory;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use memory::MemoryTransport;
pub use traits::{EventSink, Transport, TransportEvent, TransportId};

#[cfg(unix)]
pub use uds::{UdsListener, UdsTransport};
