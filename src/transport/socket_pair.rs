//! Unix-domain socket pairs
//!
//! Data channels use `SOCK_SEQPACKET` so each sample batch arrives as one
//! message; active-info sessions use `SOCK_STREAM` and rely on packet framing.

use super::Transport;
use crate::error::{Error, Result};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    SeqPacket,
    Stream,
}

impl SocketKind {
    fn as_raw(self) -> libc::c_int {
        match self {
            SocketKind::SeqPacket => libc::SOCK_SEQPACKET,
            SocketKind::Stream => libc::SOCK_STREAM,
        }
    }
}

/// One end of a non-blocking socket pair
#[derive(Debug)]
pub struct SocketEnd {
    fd: Option<OwnedFd>,
}

/// Create a connected, non-blocking pair with both buffers set to `buf_size`
///
/// Returns `(server, client)`; the hub keeps the server end.
pub fn socket_pair(kind: SocketKind, buf_size: usize) -> Result<(SocketEnd, SocketEnd)> {
    socket_pair_sized(kind, buf_size, buf_size)
}

/// Like [`socket_pair`], with separate buffer sizes for each end
pub fn socket_pair_sized(
    kind: SocketKind,
    server_buf_size: usize,
    client_buf_size: usize,
) -> Result<(SocketEnd, SocketEnd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    // SAFETY: fds is a valid two-element array for socketpair to fill
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            kind.as_raw() | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    // SAFETY: socketpair succeeded, both descriptors are open and owned by us
    let (server, client) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    for (fd, buf_size) in [
        (server.as_raw_fd(), server_buf_size),
        (client.as_raw_fd(), client_buf_size),
    ] {
        set_buf_size(fd, libc::SO_SNDBUF, buf_size)?;
        set_buf_size(fd, libc::SO_RCVBUF, buf_size)?;
        set_nonblocking(fd)?;
    }

    Ok((SocketEnd { fd: Some(server) }, SocketEnd { fd: Some(client) }))
}

fn set_buf_size(fd: RawFd, option: libc::c_int, size: usize) -> Result<()> {
    let value = size as libc::c_int;
    // SAFETY: value outlives the call and the length matches its type
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on an open descriptor
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    // SAFETY: as above
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

impl SocketEnd {
    fn fd(&self) -> Result<RawFd> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| Error::Channel("socket closed".into()))
    }
}

impl Transport for SocketEnd {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let fd = self.fd()?;
        // SAFETY: buffer is valid for writes of buffer.len() bytes
        let n = unsafe {
            libc::recv(
                fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(Error::Io(err));
        }
        Ok(n as usize)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let fd = self.fd()?;
        // SAFETY: data is valid for reads of data.len() bytes
        let n = unsafe {
            libc::send(
                fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(n as usize)
    }

    fn raw_fd(&self) -> Option<i32> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    fn close(&mut self) {
        self.fd = None;
    }
}
