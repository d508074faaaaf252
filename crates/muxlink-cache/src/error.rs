/// Errors that can occur decoding a cache packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The header id does not match `0xACCA`.
    #[error("invalid cache packet header id {found:#06x} (expected {expected:#06x})")]
    InvalidHeaderId { found: u16, expected: u16 },

    /// The header version is not the supported one.
    #[error("unsupported cache packet version {found} (expected {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },

    /// The type tag does not name a known packet type.
    #[error("unknown cache packet type {0}")]
    UnknownPacketType(u8),

    /// The body ended before the type-specific fields were complete.
    #[error("truncated cache packet ({needed} bytes needed, {available} available)")]
    Truncated { needed: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, CacheError>;
