use bytes::{Buf, Bytes, BytesMut};
use tracing::warn;

use crate::error::ProtoError;
use crate::frame::{
    ChannelId, ControlFrame, FrameKind, PacketId, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC,
    PROTO_VERSION,
};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// One decoded unit produced by [`ProtoDecoder::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeItem {
    /// Opaque service payload addressed to a channel.
    Data {
        channel: ChannelId,
        packet: PacketId,
        payload: Bytes,
    },
    /// A handshake or ack frame.
    Control(ControlFrame),
    /// A malformed frame. The caller logs and moves on; the connection
    /// stays up.
    Error(ProtoError),
}

/// Incrementally parses an inbound byte stream into discrete frames.
///
/// Feed it whatever the transport hands over — any trailing partial frame
/// is buffered internally for the next call. Never blocks, never fails:
/// malformed input surfaces as [`DecodeItem::Error`] and decoding resumes
/// at the next recognizable frame boundary.
pub struct ProtoDecoder {
    buf: BytesMut,
    max_payload: usize,
    /// Bytes of an oversized payload still to be discarded.
    skip: usize,
    /// Set while scanning for the next magic after a corrupt header, so a
    /// run of garbage produces one error rather than one per byte.
    resyncing: bool,
}

impl Default for ProtoDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl ProtoDecoder {
    /// Create a decoder with an explicit payload size limit.
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            max_payload,
            skip: 0,
            resyncing: false,
        }
    }

    /// Number of buffered bytes awaiting the rest of a frame.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Consume `input` and return every complete frame it yields.
    pub fn decode(&mut self, input: &[u8]) -> Vec<DecodeItem> {
        self.buf.extend_from_slice(input);
        let mut items = Vec::new();

        loop {
            if self.skip > 0 {
                let n = self.skip.min(self.buf.len());
                self.buf.advance(n);
                self.skip -= n;
                if self.skip > 0 {
                    break;
                }
            }

            if self.buf.len() < HEADER_SIZE {
                break;
            }

            if self.buf[0..2] != MAGIC {
                if !self.resyncing {
                    self.resyncing = true;
                    warn!("bad frame magic, resynchronizing");
                    items.push(DecodeItem::Error(ProtoError::InvalidMagic));
                }
                self.buf.advance(1);
                continue;
            }
            self.resyncing = false;

            let version = self.buf[2];
            if version != PROTO_VERSION {
                items.push(DecodeItem::Error(ProtoError::UnsupportedVersion {
                    found: version,
                    expected: PROTO_VERSION,
                }));
                self.buf.advance(HEADER_SIZE);
                continue;
            }

            let Some(kind) = FrameKind::from_byte(self.buf[3]) else {
                // No way to know a body length for an unknown kind; drop the
                // header and let magic resync recover if it carried one.
                items.push(DecodeItem::Error(ProtoError::UnknownKind(self.buf[3])));
                self.buf.advance(HEADER_SIZE);
                continue;
            };

            let channel = read_u32(&self.buf[4..8]);
            let arg = read_u32(&self.buf[8..12]);

            match kind {
                FrameKind::Data => {
                    if self.buf.len() < HEADER_SIZE + 4 {
                        break;
                    }
                    let len = read_u32(&self.buf[HEADER_SIZE..HEADER_SIZE + 4]) as usize;
                    if len > self.max_payload {
                        items.push(DecodeItem::Error(ProtoError::PayloadTooLarge {
                            size: len,
                            max: self.max_payload,
                        }));
                        self.buf.advance(HEADER_SIZE + 4);
                        self.skip = len;
                        continue;
                    }
                    if self.buf.len() < HEADER_SIZE + 4 + len {
                        break;
                    }
                    self.buf.advance(HEADER_SIZE + 4);
                    let payload = self.buf.split_to(len).freeze();
                    items.push(DecodeItem::Data {
                        channel,
                        packet: arg,
                        payload,
                    });
                }
                FrameKind::Query => {
                    self.buf.advance(HEADER_SIZE);
                    items.push(DecodeItem::Control(ControlFrame::Query {
                        channel,
                        service: arg,
                    }));
                }
                FrameKind::Allow => {
                    self.buf.advance(HEADER_SIZE);
                    items.push(DecodeItem::Control(ControlFrame::Allow { channel }));
                }
                FrameKind::Deny => {
                    self.buf.advance(HEADER_SIZE);
                    items.push(DecodeItem::Control(ControlFrame::Deny { channel }));
                }
                FrameKind::Ack => {
                    self.buf.advance(HEADER_SIZE);
                    items.push(DecodeItem::Control(ControlFrame::Ack {
                        channel,
                        packet: arg,
                    }));
                }
            }
        }

        items
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes.try_into().expect("slice is 4 bytes"))
}
