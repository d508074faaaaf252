//! Channel-multiplexed network protocol driver.
//!
//! muxlink lets many independent logical services share one physical
//! connection safely and in order: per-channel handshakes, control-priority
//! send multiplexing, global packet ids, and opaque versioned payloads.
//!
//! # Crate Structure
//!
//! - [`transport`] — Transport abstraction (in-memory pair, Unix sockets)
//! - [`proto`] — Wire framing and the incremental decoder
//! - [`cache`] — Asset-cache payload format (behind `cache` feature)
//! - [`driver`] — Per-connection driver: channels, handshake, send queue
//! - [`net`] — Multi-transport routing, configuration, lifecycle

/// Re-export transport types.
pub mod transport {
    pub use muxlink_transport::*;
}

/// Re-export wire protocol types.
pub mod proto {
    pub use muxlink_proto::*;
}

/// Re-export the cache payload format (requires `cache` feature).
#[cfg(feature = "cache")]
pub mod cache {
    pub use muxlink_cache::*;
}

/// Re-export per-connection driver types.
pub mod driver {
    pub use muxlink_driver::*;
}

/// Re-export routing and configuration types.
pub mod net {
    pub use muxlink_net::*;
}
