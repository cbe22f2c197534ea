//! Bounded byte buffer with independent read and write cursors

use super::MAX_STREAM_BUF_SIZE;
use crate::error::{Error, Result};

/// Sticky error state, cleared only by [`StreamBuffer::reset`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    Ok,
    ReadError,
    WriteError,
}

/// Linear buffer: bytes are appended at the write cursor and consumed from
/// the read cursor. Writes never grow it past its capacity.
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    buf: Vec<u8>,
    capacity: usize,
    r_pos: usize,
    status: BufferStatus,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_STREAM_BUF_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            r_pos: 0,
            status: BufferStatus::Ok,
        }
    }

    /// Append bytes; empty writes and writes past capacity are rejected
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            self.status = BufferStatus::WriteError;
            return Err(Error::InvalidParameter("empty stream write".into()));
        }
        if self.buf.len() + data.len() > self.capacity {
            self.status = BufferStatus::WriteError;
            return Err(Error::InvalidParameter(format!(
                "stream write of {} bytes at {} exceeds {}",
                data.len(),
                self.buf.len(),
                self.capacity
            )));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Fill `out` from the read cursor
    pub fn read(&mut self, out: &mut [u8]) -> Result<()> {
        if out.is_empty() || out.len() > self.unread_size() {
            self.status = BufferStatus::ReadError;
            return Err(Error::Decode(format!(
                "stream read of {} bytes with {} unread",
                out.len(),
                self.unread_size()
            )));
        }
        let end = self.r_pos + out.len();
        out.copy_from_slice(&self.buf[self.r_pos..end]);
        self.r_pos = end;
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write(&value.to_le_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write(&value.to_le_bytes())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let mut raw = [0u8; 4];
        self.read(&mut raw)?;
        Ok(i32::from_le_bytes(raw))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut raw = [0u8; 8];
        self.read(&mut raw)?;
        Ok(i64::from_le_bytes(raw))
    }

    /// Bytes between the read and write cursors
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.r_pos..]
    }

    /// Everything written so far
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn unread_size(&self) -> usize {
        self.buf.len() - self.r_pos
    }

    pub fn available(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.unread_size() == 0
    }

    pub fn status(&self) -> BufferStatus {
        self.status
    }

    /// Advance the read cursor; fails without moving if `n` exceeds unread bytes
    pub fn seek_read_pos(&mut self, n: usize) -> bool {
        if n > self.unread_size() {
            return false;
        }
        self.r_pos += n;
        true
    }

    /// Drop consumed bytes so unread data starts at offset zero
    pub fn copy_data_to_begin(&mut self) {
        if self.r_pos > 0 {
            self.buf.drain(..self.r_pos);
            self.r_pos = 0;
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.r_pos = 0;
        self.status = BufferStatus::Ok;
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut buf = StreamBuffer::new();
        buf.write_i32(-7).unwrap();
        buf.write_i64(1 << 40).unwrap();
        assert_eq!(buf.size(), 12);
        assert_eq!(buf.read_i32().unwrap(), -7);
        assert_eq!(buf.read_i64().unwrap(), 1 << 40);
        assert!(buf.is_empty());
        assert_eq!(buf.status(), BufferStatus::Ok);
    }

    #[test]
    fn test_rejects_empty_and_overflow() {
        let mut buf = StreamBuffer::with_capacity(8);
        assert!(buf.write(&[]).is_err());
        assert_eq!(buf.status(), BufferStatus::WriteError);
        buf.reset();
        buf.write(&[0u8; 8]).unwrap();
        assert!(buf.write(&[1]).is_err());
        assert_eq!(buf.size(), 8);
    }

    #[test]
    fn test_read_past_end() {
        let mut buf = StreamBuffer::new();
        buf.write(&[1, 2]).unwrap();
        assert!(buf.read_i32().is_err());
        assert_eq!(buf.status(), BufferStatus::ReadError);
        // Cursor untouched by the failed read
        assert_eq!(buf.unread(), &[1, 2]);
    }

    #[test]
    fn test_copy_data_to_begin() {
        let mut buf = StreamBuffer::with_capacity(4);
        buf.write(&[1, 2, 3, 4]).unwrap();
        assert!(buf.seek_read_pos(3));
        assert!(!buf.seek_read_pos(2));
        buf.copy_data_to_begin();
        assert_eq!(buf.available(), 3);
        buf.write(&[5, 6]).unwrap();
        assert_eq!(buf.unread(), &[4, 5, 6]);
    }
}
