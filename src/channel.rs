//! Per-process outbound data channel
//!
//! The hub owns the [`DataChannel`] side of a `SOCK_SEQPACKET` pair; the
//! client gets the [`ClientChannel`] side. Each send carries one batch of
//! fixed-size sample records.

use crate::config::TransportConfig;
use crate::core::event::{SENSOR_RECORD_SIZE, SensorEvent};
use crate::core::types::SensorDescriptor;
use crate::error::{Error, Result};
use crate::transport::{SocketKind, Transport, is_transient, socket_pair};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Hub side of a client's sample stream
pub struct DataChannel {
    id: u64,
    pid: i32,
    transport: Mutex<Box<dyn Transport>>,
    /// Last undelivered sample per sensor
    failed_cache: Mutex<HashMap<SensorDescriptor, SensorEvent>>,
    retry_limit: u32,
    retry_sleep: Duration,
    closed: AtomicBool,
}

impl DataChannel {
    pub fn new(pid: i32, transport: Box<dyn Transport>, config: &TransportConfig) -> Self {
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            pid,
            transport: Mutex::new(transport),
            failed_cache: Mutex::new(HashMap::new()),
            retry_limit: config.channel_send_retry_limit.max(1),
            retry_sleep: Duration::from_micros(config.channel_send_retry_sleep_us),
            closed: AtomicBool::new(false),
        }
    }

    /// Socket-backed channel plus the end handed to the client
    pub fn pair(
        pid: i32,
        buf_size: usize,
        config: &TransportConfig,
    ) -> Result<(Arc<DataChannel>, ClientChannel)> {
        let (server, client) = socket_pair(SocketKind::SeqPacket, buf_size)?;
        let channel = Arc::new(DataChannel::new(pid, Box::new(server), config));
        Ok((channel, ClientChannel::new(pid, Box::new(client))))
    }

    /// Unique for the lifetime of the process
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one message, retrying while the socket is full
    pub fn send_data(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Channel(format!("channel {} closed", self.id)));
        }
        let mut transport = self.transport.lock();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match transport.write(data) {
                Ok(n) if n == data.len() => return Ok(()),
                Ok(n) => {
                    return Err(Error::Channel(format!(
                        "short write {}/{} on channel {}",
                        n,
                        data.len(),
                        self.id
                    )));
                }
                Err(e) if is_transient(&e) && attempt < self.retry_limit => {
                    thread::sleep(self.retry_sleep);
                }
                Err(e) => {
                    return Err(Error::Channel(format!(
                        "send on channel {} (pid {}) failed after {} attempts: {}",
                        self.id, self.pid, attempt, e
                    )));
                }
            }
        }
    }

    /// Send samples as one batch of records
    pub fn send_events(&self, events: &[SensorEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.send_data(&SensorEvent::encode_batch(events))
    }

    pub fn has_cached_event(&self, desc: &SensorDescriptor) -> bool {
        self.failed_cache.lock().contains_key(desc)
    }

    pub fn cached_event(&self, desc: &SensorDescriptor) -> Option<SensorEvent> {
        self.failed_cache.lock().get(desc).cloned()
    }

    /// Replace the pending sample for `desc`
    pub fn cache_event(&self, event: SensorEvent) {
        self.failed_cache.lock().insert(event.desc, event);
    }

    pub fn erase_cached_event(&self, desc: &SensorDescriptor) {
        self.failed_cache.lock().remove(desc);
    }

    /// Stop accepting sends and release the socket
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.transport.lock().close();
            self.failed_cache.lock().clear();
            log::debug!("Channel {} (pid {}) closed", self.id, self.pid);
        }
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Client side of a data channel
pub struct ClientChannel {
    pid: i32,
    transport: Box<dyn Transport>,
    buf: Vec<u8>,
}

/// Largest batch a client can receive in one read
const CLIENT_RECV_BUF_SIZE: usize = SENSOR_RECORD_SIZE * 1024;

impl ClientChannel {
    pub fn new(pid: i32, transport: Box<dyn Transport>) -> Self {
        Self {
            pid,
            transport,
            buf: vec![0u8; CLIENT_RECV_BUF_SIZE],
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Next pending batch, or empty if nothing has arrived
    pub fn recv_batch(&mut self) -> Result<Vec<SensorEvent>> {
        let n = self.transport.read(&mut self.buf)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        SensorEvent::decode_batch(&self.buf[..n])
    }

    /// Drain every pending batch
    pub fn recv_all(&mut self) -> Result<Vec<Vec<SensorEvent>>> {
        let mut batches = Vec::new();
        loop {
            let batch = self.recv_batch()?;
            if batch.is_empty() {
                return Ok(batches);
            }
            batches.push(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SensorMode;
    use crate::transport::MockTransport;

    fn desc() -> SensorDescriptor {
        SensorDescriptor::new(1, 1, 0, 1)
    }

    fn event(ts: i64) -> SensorEvent {
        SensorEvent::from_values(desc(), ts, SensorMode::Realtime, &[ts as f32])
    }

    fn fast_config() -> TransportConfig {
        TransportConfig {
            channel_send_retry_sleep_us: 1,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn test_send_events() {
        let mock = MockTransport::new();
        let channel = DataChannel::new(10, Box::new(mock.clone()), &fast_config());
        channel.send_events(&[event(1), event(2)]).unwrap();

        let messages = mock.get_messages();
        assert_eq!(messages.len(), 1);
        let decoded = SensorEvent::decode_batch(&messages[0]).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].timestamp_ns, 2);
    }

    #[test]
    fn test_send_retries_until_limit() {
        let mock = MockTransport::new();
        let channel = DataChannel::new(10, Box::new(mock.clone()), &fast_config());

        mock.block_writes(4);
        assert!(channel.send_events(&[event(1)]).is_ok());
        assert_eq!(mock.write_attempts(), 5);

        mock.block_writes(5);
        assert!(channel.send_events(&[event(2)]).is_err());
        assert_eq!(mock.write_attempts(), 10);
    }

    #[test]
    fn test_broken_transport_fails_fast() {
        let mock = MockTransport::new();
        let channel = DataChannel::new(10, Box::new(mock.clone()), &fast_config());
        mock.set_broken(true);
        assert!(channel.send_events(&[event(1)]).is_err());
        assert_eq!(mock.write_attempts(), 1);
    }

    #[test]
    fn test_failed_cache_replaces() {
        let channel = DataChannel::new(10, Box::new(MockTransport::new()), &fast_config());
        assert!(!channel.has_cached_event(&desc()));
        channel.cache_event(event(1));
        channel.cache_event(event(2));
        assert_eq!(channel.cached_event(&desc()).unwrap().timestamp_ns, 2);
        channel.erase_cached_event(&desc());
        assert!(channel.cached_event(&desc()).is_none());
    }

    #[test]
    fn test_close_rejects_sends() {
        let mock = MockTransport::new();
        let channel = DataChannel::new(10, Box::new(mock.clone()), &fast_config());
        channel.close();
        assert!(channel.is_closed());
        assert!(mock.is_closed());
        assert!(channel.send_events(&[event(1)]).is_err());
    }

    #[test]
    fn test_socket_pair_round_trip() {
        let (channel, mut client) = DataChannel::pair(42, 64 * 1024, &fast_config()).unwrap();
        assert_ne!(channel.id(), 0);
        channel.send_events(&[event(5)]).unwrap();
        channel.send_events(&[event(6), event(7)]).unwrap();

        let batches = client.recv_all().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].len(), 2);
        assert_eq!(batches[0][0].values(), vec![5.0]);
    }
}
