//! Framed packet protocol used by the active-info stream
//!
//! Every control packet is an 8-byte little-endian header followed by the
//! payload:
//!
//! ```text
//! [msg_id: i32][size: u32][payload: size bytes]
//! ```
//!
//! Sample batches on data channels do not use this framing; they are raw
//! arrays of fixed-size records (see [`crate::core::event`]).

pub mod circle_buffer;
pub mod net_packet;
pub mod stream_buffer;

pub use circle_buffer::CircleStreamBuffer;
pub use net_packet::NetPacket;
pub use stream_buffer::{BufferStatus, StreamBuffer};

/// Size of the encoded [`PackHead`]
pub const PACK_HEAD_SIZE: usize = 8;
/// Largest payload accepted in one packet
pub const MAX_PACKET_BUF_SIZE: usize = 256;
/// Capacity of a single packet's staging buffer
pub const MAX_STREAM_BUF_SIZE: usize = 256;
/// Packets handled per readiness notification
pub const ONCE_PROCESS_NETPACKET_LIMIT: usize = 100;

/// Packet type carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageId {
    Invalid = 0,
    ClientInfo = 1,
    ActiveInfo = 2,
}

impl MessageId {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => MessageId::ClientInfo,
            2 => MessageId::ActiveInfo,
            _ => MessageId::Invalid,
        }
    }
}

/// Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackHead {
    pub msg_id: i32,
    pub size: u32,
}

impl PackHead {
    pub fn encode(&self) -> [u8; PACK_HEAD_SIZE] {
        let mut out = [0u8; PACK_HEAD_SIZE];
        out[0..4].copy_from_slice(&self.msg_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    /// Returns `None` if fewer than [`PACK_HEAD_SIZE`] bytes are available
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let head = bytes.get(..PACK_HEAD_SIZE)?;
        let msg_id = i32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        let size = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        Some(Self { msg_id, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_head_layout() {
        let head = PackHead {
            msg_id: MessageId::ActiveInfo as i32,
            size: 32,
        };
        let bytes = head.encode();
        assert_eq!(bytes, [2, 0, 0, 0, 32, 0, 0, 0]);
        assert_eq!(PackHead::decode(&bytes), Some(head));
    }

    #[test]
    fn test_pack_head_short_input() {
        assert_eq!(PackHead::decode(&[1, 0, 0, 0, 4]), None);
    }

    #[test]
    fn test_unknown_message_id() {
        assert_eq!(MessageId::from_i32(77), MessageId::Invalid);
        assert_eq!(MessageId::from_i32(1), MessageId::ClientInfo);
    }
}
