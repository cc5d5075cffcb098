//! UDP socket wrapper for bonded links
//!
//! Builds UDP sockets through socket2 so they can be pinned to one network
//! interface; every bonded path sends through its own pinned socket.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use thiserror::Error;

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,

    #[error("Socket option not supported on this platform")]
    UnsupportedOption,
}

impl SocketError {
    /// True for the non-fatal "nothing to read yet" outcomes
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SocketError::Io(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut
        )
    }
}

/// UDP socket for one link or one receive port
pub struct LinkSocket {
    inner: UdpSocket,
}

impl LinkSocket {
    fn raw(addr: SocketAddr) -> Result<Socket, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        Ok(socket)
    }

    /// Bind a socket to the given address
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let socket = Self::raw(addr)?;
        socket.bind(&addr.into())?;
        Ok(LinkSocket {
            inner: socket.into(),
        })
    }

    /// Bind a socket whose traffic leaves through `interface`
    ///
    /// Pinning needs `SO_BINDTODEVICE`, which is Linux-only and usually
    /// requires `CAP_NET_RAW`.
    pub fn bind_to_interface(addr: SocketAddr, interface: &str) -> Result<Self, SocketError> {
        let socket = Self::raw(addr)?;
        Self::pin(&socket, interface)?;
        socket.bind(&addr.into())?;
        Ok(LinkSocket {
            inner: socket.into(),
        })
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn pin(socket: &Socket, interface: &str) -> Result<(), SocketError> {
        socket.bind_device(Some(interface.as_bytes()))?;
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn pin(_socket: &Socket, _interface: &str) -> Result<(), SocketError> {
        Err(SocketError::UnsupportedOption)
    }

    /// Set the read timeout used by blocking receives
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SocketError> {
        self.inner.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Set non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), SocketError> {
        self.inner.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Set the receive buffer size
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        socket2::SockRef::from(&self.inner).set_recv_buffer_size(size)?;
        Ok(())
    }

    /// Get the local address this socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.inner.local_addr()?)
    }

    /// Send data to the given address
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, target)?)
    }

    /// Receive one datagram
    ///
    /// Returns a timeout error (see [`SocketError::is_timeout`]) when the
    /// read timeout elapses without data.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        Ok(self.inner.recv_from(buf)?)
    }

    /// Try to clone the socket
    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(LinkSocket {
            inner: self.inner.try_clone()?,
        })
    }
}
