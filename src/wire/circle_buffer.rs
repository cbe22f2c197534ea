//! Receive-side ring buffer that frames packets out of a byte stream

use super::{
    MAX_PACKET_BUF_SIZE, NetPacket, ONCE_PROCESS_NETPACKET_LIMIT, PACK_HEAD_SIZE, PackHead,
    StreamBuffer,
};
use crate::error::Result;

/// Room for two maximum-size frames
pub const CIRCLE_BUF_SIZE: usize = 2 * (PACK_HEAD_SIZE + MAX_PACKET_BUF_SIZE);

pub struct CircleStreamBuffer {
    stream: StreamBuffer,
}

impl CircleStreamBuffer {
    pub fn new() -> Self {
        Self::with_capacity(CIRCLE_BUF_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            stream: StreamBuffer::with_capacity(capacity),
        }
    }

    /// Append received bytes, compacting consumed space first if needed
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.stream.available() < data.len() {
            self.stream.copy_data_to_begin();
        }
        self.stream.write(data)
    }

    pub fn unread_size(&self) -> usize {
        self.stream.unread_size()
    }

    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }

    pub fn reset(&mut self) {
        self.stream.reset();
    }

    /// Frame and dispatch complete packets
    ///
    /// Handles at most [`ONCE_PROCESS_NETPACKET_LIMIT`] packets per call.
    /// A header declaring more than [`MAX_PACKET_BUF_SIZE`] bytes means the
    /// stream is out of sync; the whole buffer is discarded. A truncated
    /// packet is left in place until more bytes arrive.
    ///
    /// Returns the number of packets dispatched.
    pub fn on_read_packets<F>(&mut self, mut callback: F) -> usize
    where
        F: FnMut(NetPacket),
    {
        let mut processed = 0;
        for _ in 0..ONCE_PROCESS_NETPACKET_LIMIT {
            let Some(head) = PackHead::decode(self.stream.unread()) else {
                break;
            };
            let size = head.size as usize;
            if size > MAX_PACKET_BUF_SIZE {
                log::error!(
                    "Wire: packet size {} exceeds {}, resetting buffer ({} unread)",
                    size,
                    MAX_PACKET_BUF_SIZE,
                    self.stream.unread_size()
                );
                self.stream.reset();
                break;
            }
            if size > self.stream.unread_size() - PACK_HEAD_SIZE {
                break;
            }

            let mut pkt = NetPacket::with_raw_id(head.msg_id);
            if size > 0 {
                let payload = &self.stream.unread()[PACK_HEAD_SIZE..PACK_HEAD_SIZE + size];
                if let Err(e) = pkt.write(payload) {
                    log::warn!("Wire: failed to stage packet {}: {}", head.msg_id, e);
                    break;
                }
            }
            if !self.stream.seek_read_pos(pkt.packet_len()) {
                log::error!("Wire: cannot advance past packet {}, resetting buffer", head.msg_id);
                self.stream.reset();
                break;
            }

            callback(pkt);
            processed += 1;

            if self.stream.is_empty() {
                self.stream.reset();
                break;
            }
        }
        processed
    }
}

impl Default for CircleStreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}
