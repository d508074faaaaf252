//! Per-connection protocol driver.
//!
//! A [`ProtoDriver`] orchestrates one physical connection: it decodes the
//! inbound byte stream into frames, runs the Query/Allow/Deny handshake for
//! every channel, dispatches data to the services bound to confirmed
//! channels, and drains the outbound queues one frame at a time with
//! control priority.
//!
//! Shared state lives in [`NetRuntime`]: the process-wide packet-id counter
//! and the immutable [`ServiceRegistry`], threaded through driver
//! construction rather than hidden in globals.

pub mod channel;
pub mod driver;
pub mod error;
pub mod queue;
pub mod registry;
pub mod runtime;

pub use channel::{Channel, ChannelState};
pub use driver::{ChannelBinding, ChannelRef, DriverConfig, ProtoDriver};
pub use error::{DriverError, Result};
pub use queue::{Outbound, Packet, SendQueue};
pub use registry::{Role, ServiceEntry, ServiceListener, ServiceRegistry, ServiceRegistryBuilder};
pub use runtime::NetRuntime;
