//! Transport layer for client-facing sockets

use crate::error::{Error, Result};
use std::io;

pub mod mock;
mod socket_pair;

pub use mock::MockTransport;
pub use socket_pair::{SocketEnd, SocketKind, socket_pair, socket_pair_sized};

/// Byte transport carrying sample batches or framed packets to a client
pub trait Transport: Send {
    /// Read data into buffer, returns number of bytes read (0 if nothing is pending)
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write data from buffer, returns number of bytes written
    ///
    /// A full socket surfaces as an I/O error of kind `WouldBlock`; see
    /// [`is_transient`].
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Underlying file descriptor, if any
    fn raw_fd(&self) -> Option<i32> {
        None
    }

    /// Release the underlying resource; later writes fail
    fn close(&mut self) {}
}

/// True for errors worth retrying after a short sleep
pub fn is_transient(err: &Error) -> bool {
    match err {
        Error::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        ),
        _ => false,
    }
}
