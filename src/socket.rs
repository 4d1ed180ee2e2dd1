//! Datagram transport boundary (south interface).
//!
//! The transport core depends only on [`Socket`]; a `std::net::UdpSocket`
//! backed implementation is provided for convenience, grounded on the
//! blocking `SocketBinding` wrapper this crate used for its earlier
//! QUIC-based transport.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by a [`Socket`] implementation.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Minimal send/receive boundary the transport core drives.
pub trait Socket: std::fmt::Debug {
    /// Send `buf` to `addr`.
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, SocketError>;

    /// Receive a single datagram, blocking up to the configured read timeout.
    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError>;

    /// The address this socket is bound to.
    fn local_addr(&self) -> Result<SocketAddr, SocketError>;
}

/// UDP-backed [`Socket`] implementation.
#[derive(Debug, Clone)]
pub struct UdpSocketBinding {
    socket: Arc<UdpSocket>,
}

impl UdpSocketBinding {
    /// Bind to the provided address.
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Set the blocking read timeout (`None` blocks forever).
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SocketError> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Toggle non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), SocketError> {
        self.socket.set_nonblocking(nonblocking)?;
        Ok(())
    }
}

impl Socket for UdpSocketBinding {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.socket.send_to(buf, addr)?)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        Ok(self.socket.recv_from(buf)?)
    }

    fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.socket.local_addr()?)
    }
}
