//! Asset-cache service payload format.
//!
//! This is the worked example of a payload riding opaquely inside muxlink
//! data frames: self-describing, explicitly versioned, dispatched by a type
//! tag rather than inferred from content. The driver never looks inside it;
//! only the cache service bound to the channel does.

pub mod error;
pub mod packet;

pub use error::{CacheError, Result};
pub use packet::{
    decode_packet, encode_packet, CachePacket, CACHE_HEADER_ID, CACHE_VERSION, KEY_LEN,
};
