//! Multi-transport routing and lifecycle.
//!
//! A [`NetDriver`] owns one [`ProtoDriver`] per configured transport,
//! drains all their events on a single event-loop thread, and routes
//! service sends by transport name. Configuration is declarative
//! ([`NetConfig`], JSON-serializable) and validated atomically before it
//! is applied.
//!
//! [`ProtoDriver`]: muxlink_driver::ProtoDriver

pub mod config;
pub mod error;
pub mod net;

pub use config::{BindingConfig, NetConfig, TransportConfig, TransportRole};
pub use error::{NetError, Result};
pub use net::{NetDriver, TransportConnector};
#[cfg(unix)]
pub use net::UdsConnector;
