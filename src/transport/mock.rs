//! Mock transport for testing

use super::Transport;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

/// Fake descriptors start well above anything a test process holds open
static NEXT_FAKE_FD: AtomicI32 = AtomicI32::new(10_000);

/// Mock transport for unit testing
///
/// Clones share state, so a test can keep a handle while the hub owns
/// another. Each `write` is recorded as one message.
#[derive(Clone)]
pub struct MockTransport {
    fd: i32,
    inner: Arc<Mutex<MockTransportInner>>,
}

struct MockTransportInner {
    read_buffer: VecDeque<u8>,
    messages: Vec<Vec<u8>>,
    /// Upcoming writes that fail with `WouldBlock`
    blocked_writes: usize,
    /// Fail every write with `BrokenPipe`
    broken: bool,
    write_attempts: usize,
    closed: bool,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        MockTransport {
            fd: NEXT_FAKE_FD.fetch_add(1, Ordering::Relaxed),
            inner: Arc::new(Mutex::new(MockTransportInner {
                read_buffer: VecDeque::new(),
                messages: Vec::new(),
                blocked_writes: 0,
                broken: false,
                write_attempts: 0,
                closed: false,
            })),
        }
    }

    /// Inject data to be read
    pub fn inject_read(&self, data: &[u8]) {
        self.inner.lock().read_buffer.extend(data);
    }

    /// All successfully written messages, in order
    pub fn get_messages(&self) -> Vec<Vec<u8>> {
        self.inner.lock().messages.clone()
    }

    /// All written bytes concatenated
    pub fn get_written(&self) -> Vec<u8> {
        self.inner.lock().messages.concat()
    }

    /// Clear written data
    pub fn clear_written(&self) {
        self.inner.lock().messages.clear();
    }

    /// Make the next `count` writes fail as if the socket were full
    pub fn block_writes(&self, count: usize) {
        self.inner.lock().blocked_writes = count;
    }

    /// Make every write fail permanently (or recover)
    pub fn set_broken(&self, broken: bool) {
        self.inner.lock().broken = broken;
    }

    /// Number of write calls, successful or not
    pub fn write_attempts(&self) -> usize {
        self.inner.lock().write_attempts
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let available = inner.read_buffer.len().min(buffer.len());
        for (slot, byte) in buffer.iter_mut().zip(inner.read_buffer.drain(..available)) {
            *slot = byte;
        }
        Ok(available)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.write_attempts += 1;
        if inner.closed || inner.broken {
            return Err(Error::Io(io::ErrorKind::BrokenPipe.into()));
        }
        if inner.blocked_writes > 0 {
            inner.blocked_writes -= 1;
            return Err(Error::Io(io::ErrorKind::WouldBlock.into()));
        }
        inner.messages.push(data.to_vec());
        Ok(data.len())
    }

    fn raw_fd(&self) -> Option<i32> {
        if self.inner.lock().closed {
            None
        } else {
            Some(self.fd)
        }
    }

    fn close(&mut self) {
        self.inner.lock().closed = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut transport = MockTransport::new();
        let handle = transport.clone();

        handle.inject_read(&[1, 2, 3]);
        let mut buf = [0u8; 2];
        assert_eq!(transport.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);

        transport.write(&[9]).unwrap();
        transport.write(&[8, 7]).unwrap();
        assert_eq!(handle.get_messages(), vec![vec![9], vec![8, 7]]);
        assert_eq!(handle.get_written(), vec![9, 8, 7]);
    }

    #[test]
    fn test_blocked_writes() {
        let mut transport = MockTransport::new();
        transport.block_writes(2);
        assert!(transport.write(&[1]).is_err());
        assert!(transport.write(&[1]).is_err());
        assert!(transport.write(&[1]).is_ok());
        assert_eq!(transport.write_attempts(), 3);
    }
}
