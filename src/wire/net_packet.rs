//! In-memory staging buffer for one framed packet

use super::{MAX_PACKET_BUF_SIZE, MessageId, PACK_HEAD_SIZE, PackHead, StreamBuffer};
use crate::error::{Error, Result};
use std::ops::{Deref, DerefMut};

/// One packet: a message id plus a bounded payload stream
#[derive(Debug, Clone)]
pub struct NetPacket {
    msg_id: i32,
    stream: StreamBuffer,
}

impl NetPacket {
    pub fn new(msg_id: MessageId) -> Self {
        Self::with_raw_id(msg_id as i32)
    }

    pub(crate) fn with_raw_id(msg_id: i32) -> Self {
        Self {
            msg_id,
            stream: StreamBuffer::with_capacity(MAX_PACKET_BUF_SIZE),
        }
    }

    /// Packet whose payload is `payload`
    pub fn from_payload(msg_id: MessageId, payload: &[u8]) -> Result<Self> {
        let mut pkt = Self::new(msg_id);
        if !payload.is_empty() {
            pkt.write(payload)?;
        }
        Ok(pkt)
    }

    pub fn msg_id(&self) -> MessageId {
        MessageId::from_i32(self.msg_id)
    }

    pub fn raw_msg_id(&self) -> i32 {
        self.msg_id
    }

    pub fn payload(&self) -> &[u8] {
        self.stream.data()
    }

    /// Header plus payload
    pub fn packet_len(&self) -> usize {
        PACK_HEAD_SIZE + self.stream.size()
    }

    /// Serialize header and payload for the wire
    pub fn make_data(&self) -> Result<Vec<u8>> {
        let size = self.stream.size();
        if size > MAX_PACKET_BUF_SIZE {
            return Err(Error::InvalidParameter(format!("packet payload {} too large", size)));
        }
        let head = PackHead {
            msg_id: self.msg_id,
            size: size as u32,
        };
        let mut out = Vec::with_capacity(self.packet_len());
        out.extend_from_slice(&head.encode());
        out.extend_from_slice(self.stream.data());
        Ok(out)
    }
}

impl Deref for NetPacket {
    type Target = StreamBuffer;

    fn deref(&self) -> &StreamBuffer {
        &self.stream
    }
}

impl DerefMut for NetPacket {
    fn deref_mut(&mut self) -> &mut StreamBuffer {
        &mut self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_data() {
        let mut pkt = NetPacket::new(MessageId::ClientInfo);
        pkt.write_i32(42).unwrap();
        let data = pkt.make_data().unwrap();
        assert_eq!(data.len(), PACK_HEAD_SIZE + 4);
        assert_eq!(&data[..8], &[1, 0, 0, 0, 4, 0, 0, 0]);
        assert_eq!(&data[8..], &42i32.to_le_bytes());
        assert_eq!(pkt.packet_len(), data.len());
    }

    #[test]
    fn test_payload_capped() {
        let mut pkt = NetPacket::new(MessageId::ActiveInfo);
        assert!(pkt.write(&[0u8; MAX_PACKET_BUF_SIZE]).is_ok());
        assert!(pkt.write(&[0u8]).is_err());
    }

    #[test]
    fn test_reading_through_deref() {
        let mut pkt = NetPacket::from_payload(MessageId::ActiveInfo, &7i64.to_le_bytes()).unwrap();
        assert_eq!(pkt.read_i64().unwrap(), 7);
        assert!(pkt.is_empty());
    }
}
