/// Errors surfaced by configuration and routing.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Configuration text failed to parse.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// Two transports share a name; routing by name would be ambiguous.
    #[error("duplicate transport name {name:?}")]
    DuplicateTransport { name: String },

    /// One transport binds the same channel id twice.
    #[error("transport {name:?} binds channel {channel} more than once")]
    DuplicateChannel { name: String, channel: u32 },

    /// A send or lookup named a transport the configuration does not have.
    #[error("unknown transport {name:?}")]
    UnknownTransport { name: String },

    /// The driver has not been started yet.
    #[error("driver is not started")]
    NotStarted,

    /// Failure opening a configured transport.
    #[error("opening transport {name:?}: {source}")]
    Open {
        name: String,
        source: muxlink_transport::TransportError,
    },

    /// Per-connection driver failure, passed through from routing.
    #[error(transparent)]
    Driver(#[from] muxlink_driver::DriverError),
}

pub type Result<T> = std::result::Result<T, NetError>;
