/// Protocol errors surfaced by the decoder.
///
/// None of these are connection-fatal: the offending frame is discarded and
/// decoding continues. Only the transport layer can kill a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x4D 0x58 \"MX\")")]
    InvalidMagic,

    /// The frame header carries an unsupported protocol version.
    #[error("unsupported protocol version {found} (expected {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },

    /// The frame kind byte does not name a known frame kind.
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    /// A data frame's payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, ProtoError>;
