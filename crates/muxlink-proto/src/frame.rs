use bytes::{BufMut, BytesMut};

/// Identifier of one logical stream within one connection.
pub type ChannelId = u32;

/// Stable identifier of a service, registered once at process start.
pub type ServiceId = u32;

/// Globally monotonic id of one driver-level send request.
pub type PacketId = u32;

/// Frame header: magic (2) + version (1) + kind (1) + channel (4) + arg (4).
pub const HEADER_SIZE: usize = 12;

/// Magic bytes: "MX" (0x4D 0x58).
pub const MAGIC: [u8; 2] = [0x4D, 0x58];

/// Current protocol version carried in every frame header.
pub const PROTO_VERSION: u8 = 1;

/// Default maximum data payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Kinds of frame carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Opaque service payload on an active channel.
    Data = 0,
    /// Handshake: ask the remote to bind a service to a channel.
    Query = 1,
    /// Handshake: the queried channel is accepted and usable.
    Allow = 2,
    /// Handshake: the queried channel is refused, permanently.
    Deny = 3,
    /// Advisory delivery confirmation for one data packet.
    Ack = 4,
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Data),
            1 => Some(Self::Query),
            2 => Some(Self::Allow),
            3 => Some(Self::Deny),
            4 => Some(Self::Ack),
            _ => None,
        }
    }
}

/// A handshake or ack frame. Created and consumed entirely inside the
/// driver; services never see these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    Query {
        channel: ChannelId,
        service: ServiceId,
    },
    Allow {
        channel: ChannelId,
    },
    Deny {
        channel: ChannelId,
    },
    Ack {
        channel: ChannelId,
        packet: PacketId,
    },
}

impl ControlFrame {
    pub fn channel(&self) -> ChannelId {
        match *self {
            Self::Query { channel, .. }
            | Self::Allow { channel }
            | Self::Deny { channel }
            | Self::Ack { channel, .. } => channel,
        }
    }
}

fn put_header(dst: &mut BytesMut, kind: FrameKind, channel: ChannelId, arg: u32) {
    dst.put_slice(&MAGIC);
    dst.put_u8(PROTO_VERSION);
    dst.put_u8(kind as u8);
    dst.put_u32_le(channel);
    dst.put_u32_le(arg);
}

/// Encode a data frame: header + length + payload.
pub fn encode_data(channel: ChannelId, packet: PacketId, payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(HEADER_SIZE + 4 + payload.len());
    put_header(dst, FrameKind::Data, channel, packet);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
}

/// Encode a control frame. The header argument carries the service id for
/// Query, the packet id for Ack, and zero otherwise.
pub fn encode_control(frame: &ControlFrame, dst: &mut BytesMut) {
    dst.reserve(HEADER_SIZE);
    match *frame {
        ControlFrame::Query { channel, service } => {
            put_header(dst, FrameKind::Query, channel, service)
        }
        ControlFrame::Allow { channel } => put_header(dst, FrameKind::Allow, channel, 0),
        ControlFrame::Deny { channel } => put_header(dst, FrameKind::Deny, channel, 0),
        ControlFrame::Ack { channel, packet } => put_header(dst, FrameKind::Ack, channel, packet),
    }
}
