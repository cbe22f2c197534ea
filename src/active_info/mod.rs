//! Out-of-band "who samples what" notifications
//!
//! Each registered pid gets one `SOCK_STREAM` socket pair. The hub keeps the
//! server end in a [`StreamSession`]; the client reads framed
//! [`MessageId::ActiveInfo`] packets from its end, e.g. with
//! [`ActiveInfoReceiver`].

mod session;

pub use session::StreamSession;

use crate::config::TransportConfig;
use crate::core::types::ActiveInfo;
use crate::error::{Error, Result};
use crate::transport::{SocketEnd, SocketKind, Transport, socket_pair_sized};
use crate::wire::{CircleStreamBuffer, MessageId, NetPacket};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Sessions beyond this count are refused
pub const MAX_SESSION_ALARM: usize = 100;

/// Build the packet announcing `info`
pub fn active_info_packet(info: &ActiveInfo) -> Result<NetPacket> {
    let mut payload = Vec::with_capacity(ActiveInfo::ENCODED_LEN);
    info.encode_into(&mut payload);
    NetPacket::from_payload(MessageId::ActiveInfo, &payload)
}

/// Registry of active-info sessions keyed by pid
pub struct StreamServer {
    sessions: Mutex<BTreeMap<i32, Arc<StreamSession>>>,
    config: TransportConfig,
}

impl StreamServer {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            config: config.clone(),
        }
    }

    /// Create a socket pair for `pid` and return the client end
    ///
    /// Native callers get the larger client-side buffer. An existing session
    /// for the pid is closed and replaced.
    pub fn add_socket_pair(&self, uid: i32, pid: i32, native: bool) -> Result<SocketEnd> {
        let client_buf = if native {
            self.config.native_socket_buf_size
        } else {
            self.config.socket_buf_size
        };
        let (server, client) =
            socket_pair_sized(SocketKind::Stream, self.config.socket_buf_size, client_buf)?;
        let session = StreamSession::new(pid, uid, native, Box::new(server), &self.config);
        self.add_session(Arc::new(session))?;
        Ok(client)
    }

    pub fn add_session(&self, session: Arc<StreamSession>) -> Result<()> {
        let pid = session.pid();
        if pid <= 0 {
            return Err(Error::InvalidParameter(format!("invalid pid {}", pid)));
        }
        if session.is_closed() {
            return Err(Error::Channel(format!("session for pid {} already closed", pid)));
        }
        let mut sessions = self.sessions.lock();
        if sessions.len() >= MAX_SESSION_ALARM && !sessions.contains_key(&pid) {
            error!(
                "ActiveInfo: Too many sessions ({}), refusing pid {}",
                sessions.len(),
                pid
            );
            return Err(Error::Other(format!("session limit reached for pid {}", pid)));
        }
        if let Some(old) = sessions.insert(pid, session) {
            old.close();
        }
        debug!("ActiveInfo: Session added for pid {}", pid);
        Ok(())
    }

    /// Close and forget the pid's session
    pub fn del_session(&self, pid: i32) -> bool {
        match self.sessions.lock().remove(&pid) {
            Some(session) => {
                session.close();
                debug!("ActiveInfo: Session removed for pid {}", pid);
                true
            }
            None => false,
        }
    }

    pub fn get_session_by_pid(&self, pid: i32) -> Option<Arc<StreamSession>> {
        self.sessions.lock().get(&pid).cloned()
    }

    pub fn get_client_fd(&self, pid: i32) -> Option<i32> {
        self.get_session_by_pid(pid).and_then(|s| s.fd())
    }

    pub fn get_client_pid(&self, fd: i32) -> Option<i32> {
        self.sessions
            .lock()
            .values()
            .find(|s| s.fd() == Some(fd))
            .map(|s| s.pid())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn send_msg(&self, pid: i32, pkt: &NetPacket) -> Result<()> {
        let session = self
            .get_session_by_pid(pid)
            .ok_or_else(|| Error::NotFound(format!("active-info session for pid {}", pid)))?;
        session.send_packet(pkt)
    }

    /// Send `pkt` to every pid in `pids`; failures are logged and skipped
    ///
    /// Returns the number of sessions that received the packet.
    pub fn multicast(&self, pids: &[i32], pkt: &NetPacket) -> usize {
        let mut delivered = 0;
        for &pid in pids {
            match self.send_msg(pid, pkt) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("ActiveInfo: Multicast to pid {} failed: {}", pid, e),
            }
        }
        delivered
    }

    pub fn close_all(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock());
        for session in sessions.values() {
            session.close();
        }
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Client end of an active-info stream
pub struct ActiveInfoReceiver {
    transport: Box<dyn Transport>,
    ring: CircleStreamBuffer,
}

impl ActiveInfoReceiver {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            ring: CircleStreamBuffer::new(),
        }
    }

    /// Read whatever is pending and decode complete notifications
    ///
    /// Packets of other types and undecodable payloads are skipped.
    pub fn poll(&mut self) -> Result<Vec<ActiveInfo>> {
        let mut infos = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = self.transport.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.ring.write(&buf[..n])?;
            self.ring.on_read_packets(|pkt| {
                if pkt.msg_id() != MessageId::ActiveInfo {
                    return;
                }
                match ActiveInfo::decode(pkt.payload()) {
                    Some(info) => infos.push(info),
                    None => warn!("ActiveInfo: Short payload ({} bytes)", pkt.payload().len()),
                }
            });
        }
        Ok(infos)
    }
}
