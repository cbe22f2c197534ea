//! One client's active-info socket

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::transport::{Transport, is_transient};
use crate::wire::{BufferStatus, MAX_PACKET_BUF_SIZE, NetPacket};
use log::{error, warn};
use parking_lot::Mutex;
use std::fmt;
use std::thread;
use std::time::Duration;

/// Server side of a client's framed packet stream
pub struct StreamSession {
    pid: i32,
    uid: i32,
    native: bool,
    transport: Mutex<Box<dyn Transport>>,
    retry_limit: u32,
    retry_sleep: Duration,
}

impl StreamSession {
    pub fn new(
        pid: i32,
        uid: i32,
        native: bool,
        transport: Box<dyn Transport>,
        config: &TransportConfig,
    ) -> Self {
        Self {
            pid,
            uid,
            native,
            transport: Mutex::new(transport),
            retry_limit: config.send_retry_limit.max(1),
            retry_sleep: Duration::from_micros(config.send_retry_sleep_us),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn uid(&self) -> i32 {
        self.uid
    }

    pub fn is_native(&self) -> bool {
        self.native
    }

    /// Descriptor of the socket, `None` once closed
    pub fn fd(&self) -> Option<i32> {
        self.transport.lock().raw_fd()
    }

    pub fn is_closed(&self) -> bool {
        self.fd().is_none()
    }

    /// Send raw bytes, retrying partial writes and a full socket
    ///
    /// Every write attempt (successful or not) consumes one retry; the
    /// message fails if bytes remain once the budget is spent.
    pub fn send_msg(&self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() || buf.len() > MAX_PACKET_BUF_SIZE {
            return Err(Error::InvalidParameter(format!(
                "message size {} out of range",
                buf.len()
            )));
        }
        let mut transport = self.transport.lock();
        if transport.raw_fd().is_none() {
            return Err(Error::Channel(format!("session for pid {} closed", self.pid)));
        }

        let mut sent = 0;
        let mut attempts = 0;
        while sent < buf.len() && attempts < self.retry_limit {
            attempts += 1;
            match transport.write(&buf[sent..]) {
                Ok(n) => {
                    sent += n;
                    if sent < buf.len() {
                        thread::sleep(self.retry_sleep);
                    }
                }
                Err(e) if is_transient(&e) => {
                    warn!("ActiveInfo: send to pid {} would block, retrying", self.pid);
                    thread::sleep(self.retry_sleep);
                }
                Err(e) => {
                    error!("ActiveInfo: send to pid {} failed: {}", self.pid, e);
                    return Err(Error::Channel(e.to_string()));
                }
            }
        }
        if sent != buf.len() {
            error!(
                "ActiveInfo: gave up after {}/{} attempts, {}/{} bytes to pid {}",
                attempts,
                self.retry_limit,
                sent,
                buf.len(),
                self.pid
            );
            return Err(Error::Channel(format!(
                "incomplete send to pid {}: {}/{} bytes",
                self.pid,
                sent,
                buf.len()
            )));
        }
        Ok(())
    }

    /// Frame and send a packet
    pub fn send_packet(&self, pkt: &NetPacket) -> Result<()> {
        if pkt.status() != BufferStatus::Ok {
            return Err(Error::InvalidParameter(format!(
                "packet in {:?} state",
                pkt.status()
            )));
        }
        self.send_msg(&pkt.make_data()?)
    }

    pub fn close(&self) {
        self.transport.lock().close();
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("pid", &self.pid)
            .field("uid", &self.uid)
            .field("native", &self.native)
            .field("fd", &self.fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use crate::wire::MessageId;

    fn config() -> TransportConfig {
        TransportConfig {
            send_retry_limit: 4,
            send_retry_sleep_us: 10,
            ..TransportConfig::default()
        }
    }

    fn session(mock: &MockTransport) -> StreamSession {
        StreamSession::new(10, 1000, false, Box::new(mock.clone()), &config())
    }

    #[test]
    fn test_send_packet_frames_header() {
        let mock = MockTransport::new();
        let sess = session(&mock);
        let pkt = NetPacket::from_payload(MessageId::ActiveInfo, &[9, 8, 7]).unwrap();
        sess.send_packet(&pkt).unwrap();
        let written = mock.get_written();
        assert_eq!(&written[0..4], &2i32.to_le_bytes());
        assert_eq!(&written[4..8], &3u32.to_le_bytes());
        assert_eq!(&written[8..], &[9, 8, 7]);
    }

    #[test]
    fn test_retries_while_blocked() {
        let mock = MockTransport::new();
        mock.block_writes(2);
        let sess = session(&mock);
        sess.send_msg(&[1, 2, 3]).unwrap();
        assert_eq!(mock.write_attempts(), 3);
    }

    #[test]
    fn test_gives_up_after_retry_budget() {
        let mock = MockTransport::new();
        mock.block_writes(100);
        let sess = session(&mock);
        assert!(matches!(sess.send_msg(&[1]), Err(Error::Channel(_))));
        assert_eq!(mock.write_attempts(), 4);
    }

    #[test]
    fn test_rejects_bad_sizes_and_closed() {
        let mock = MockTransport::new();
        let sess = session(&mock);
        assert!(sess.send_msg(&[]).is_err());
        assert!(sess.send_msg(&[0u8; MAX_PACKET_BUF_SIZE + 1]).is_err());
        sess.close();
        assert!(sess.is_closed());
        assert!(matches!(sess.send_msg(&[1]), Err(Error::Channel(_))));
    }
}
