//! Wire framing and incremental decoding for the muxlink protocol.
//!
//! Every frame carries a fixed 12-byte header:
//! - A 2-byte magic number ("MX") for stream synchronization
//! - A 1-byte protocol version
//! - A 1-byte frame kind (Data, Query, Allow, Deny, Ack)
//! - A 4-byte little-endian channel id
//! - A 4-byte little-endian argument (packet id, service id, or zero)
//!
//! Data frames append a 4-byte length and an opaque payload owned by the
//! service bound to the channel. Control frames are header-only.

pub mod decoder;
pub mod error;
pub mod frame;

pub use decoder::{DecodeItem, ProtoDecoder};
pub use error::{ProtoError, Result};
pub use frame::{
    encode_control, encode_data, ControlFrame, FrameKind, ChannelId, PacketId, ServiceId,
    DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC, PROTO_VERSION,
};
