use muxlink_proto::ChannelId;

/// Errors surfaced by driver operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// `send_data` was called on a channel that is not active. Callers are
    /// expected to check channel state before sending; this is a violated
    /// precondition, not a transient condition to retry.
    #[error("channel {channel} is not active")]
    ChannelNotActive { channel: ChannelId },

    /// The channel id is not known to this connection.
    #[error("unknown channel {channel}")]
    UnknownChannel { channel: ChannelId },

    /// The connection has been torn down; every queued packet is gone.
    #[error("connection is down")]
    Disconnected,

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] muxlink_transport::TransportError),
}

pub type Result<T> = std::result::Result<T, DriverError>;
