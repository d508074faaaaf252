use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CacheError, Result};

/// Cache packet header id, on the wire as little-endian `0xACCA`.
pub const CACHE_HEADER_ID: u16 = 0xACCA;

/// Supported cache packet format version.
pub const CACHE_VERSION: u8 = 2;

/// Cache keys are fixed-size content digests.
pub const KEY_LEN: usize = 20;

/// Header: id (2) + version (1) + type (1).
const HEADER_LEN: usize = 4;

const TYPE_GET_REQUEST: u8 = 1;
const TYPE_GET_RESPONSE: u8 = 2;
const TYPE_ADD_REQUEST: u8 = 3;
const TYPE_REMOVE_REQUEST: u8 = 4;
const TYPE_WARMUP_REQUEST: u8 = 5;
const TYPE_CLEAR_REQUEST: u8 = 6;
const TYPE_CLEAR_RESPONSE: u8 = 7;

/// One cache protocol message.
///
/// Every variant shares the `{id, version, type}` header; bodies are
/// type-specific. Requests flow client→server, responses flow back on the
/// same channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachePacket {
    /// Look up a cache entry by key.
    GetRequest { key: [u8; KEY_LEN] },
    /// Answer to a lookup. `value` is `None` on a miss.
    GetResponse {
        key: [u8; KEY_LEN],
        value: Option<Bytes>,
    },
    /// Insert (or overwrite) an entry.
    AddRequest { key: [u8; KEY_LEN], value: Bytes },
    /// Remove an entry.
    RemoveRequest { key: [u8; KEY_LEN] },
    /// Hint that an entry will be needed soon.
    WarmupRequest { key: [u8; KEY_LEN] },
    /// Drop the whole cache.
    ClearRequest,
    /// Whether the clear was carried out.
    ClearResponse { cleared: bool },
}

impl CachePacket {
    fn type_tag(&self) -> u8 {
        match self {
            Self::GetRequest { .. } => TYPE_GET_REQUEST,
            Self::GetResponse { .. } => TYPE_GET_RESPONSE,
            Self::AddRequest { .. } => TYPE_ADD_REQUEST,
            Self::RemoveRequest { .. } => TYPE_REMOVE_REQUEST,
            Self::WarmupRequest { .. } => TYPE_WARMUP_REQUEST,
            Self::ClearRequest => TYPE_CLEAR_REQUEST,
            Self::ClearResponse { .. } => TYPE_CLEAR_RESPONSE,
        }
    }
}

/// Encode a cache packet into `dst`.
pub fn encode_packet(packet: &CachePacket, dst: &mut BytesMut) {
    dst.put_u16_le(CACHE_HEADER_ID);
    dst.put_u8(CACHE_VERSION);
    dst.put_u8(packet.type_tag());

    match packet {
        CachePacket::GetRequest { key }
        | CachePacket::RemoveRequest { key }
        | CachePacket::WarmupRequest { key } => {
            dst.put_slice(key);
        }
        CachePacket::GetResponse { key, value } => {
            dst.put_slice(key);
            match value {
                Some(value) => {
                    dst.put_u8(1);
                    dst.put_u32_le(value.len() as u32);
                    dst.put_slice(value);
                }
                None => dst.put_u8(0),
            }
        }
        CachePacket::AddRequest { key, value } => {
            dst.put_slice(key);
            dst.put_u32_le(value.len() as u32);
            dst.put_slice(value);
        }
        CachePacket::ClearRequest => {}
        CachePacket::ClearResponse { cleared } => {
            dst.put_u8(u8::from(*cleared));
        }
    }
}

/// Decode one cache packet from `input`.
///
/// The header is validated before any body field is parsed: a mismatched
/// id or version constructs no packet at all.
pub fn decode_packet(input: &[u8]) -> Result<CachePacket> {
    let mut buf = input;
    need(buf.len(), HEADER_LEN)?;

    let header_id = buf.get_u16_le();
    if header_id != CACHE_HEADER_ID {
        return Err(CacheError::InvalidHeaderId {
            found: header_id,
            expected: CACHE_HEADER_ID,
        });
    }
    let version = buf.get_u8();
    if version != CACHE_VERSION {
        return Err(CacheError::UnsupportedVersion {
            found: version,
            expected: CACHE_VERSION,
        });
    }
    let type_tag = buf.get_u8();

    match type_tag {
        TYPE_GET_REQUEST => Ok(CachePacket::GetRequest {
            key: read_key(&mut buf)?,
        }),
        TYPE_GET_RESPONSE => {
            let key = read_key(&mut buf)?;
            need(buf.len(), 1)?;
            let value = if buf.get_u8() != 0 {
                Some(read_value(&mut buf)?)
            } else {
                None
            };
            Ok(CachePacket::GetResponse { key, value })
        }
        TYPE_ADD_REQUEST => {
            let key = read_key(&mut buf)?;
            let value = read_value(&mut buf)?;
            Ok(CachePacket::AddRequest { key, value })
        }
        TYPE_REMOVE_REQUEST => Ok(CachePacket::RemoveRequest {
            key: read_key(&mut buf)?,
        }),
        TYPE_WARMUP_REQUEST => Ok(CachePacket::WarmupRequest {
            key: read_key(&mut buf)?,
        }),
        TYPE_CLEAR_REQUEST => Ok(CachePacket::ClearRequest),
        TYPE_CLEAR_RESPONSE => {
            need(buf.len(), 1)?;
            Ok(CachePacket::ClearResponse {
                cleared: buf.get_u8() != 0,
            })
        }
        other => Err(CacheError::UnknownPacketType(other)),
    }
}

fn need(available: usize, needed: usize) -> Result<()> {
    if available < needed {
        Err(CacheError::Truncated { needed, available })
    } else {
        Ok(())
    }
}

fn read_key(buf: &mut &[u8]) -> Result<[u8; KEY_LEN]> {
    need(buf.len(), KEY_LEN)?;
    let mut key = [0u8; KEY_LEN];
    buf.copy_to_slice(&mut key);
    Ok(key)
}

fn read_value(buf: &mut &[u8]) -> Result<Bytes> {
    need(buf.len(), 4)?;
    let len = buf.get_u32_le() as usize;
    need(buf.len(), len)?;
    let value = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(value)
}
