//! UDP endpoints for the control and stream channels
//!
//! The worker talks to the network only through [`DatagramSource`] and
//! [`CommandSink`], so a recorded capture or a scripted test double can stand
//! in for the camera.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use crate::error::SessionError;
use crate::protocol::Command;

/// Outcome of one non-blocking receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A datagram of this many bytes was written to the buffer
    Datagram(usize),
    /// Nothing pending
    WouldBlock,
    /// Zero-length read: the peer is gone
    Closed,
    /// The source has no more data and never will (recorded captures)
    Exhausted,
}

/// Something the worker can poll for datagrams
pub trait DatagramSource: Send {
    /// Poll for one datagram without blocking
    ///
    /// # Errors
    ///
    /// Any error is treated as transient by the worker and the poll retried.
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Received>;
}

/// Something the worker can send control commands to
pub trait CommandSink: Send {
    /// Send one command; no reply is expected
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error. The device never acknowledges, so the
    /// worker logs send failures and carries on.
    fn send_command(&mut self, command: Command) -> io::Result<()>;
}

/// Connected datagram socket to the camera's command port
#[derive(Debug)]
pub struct ControlChannel {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl ControlChannel {
    /// Open an ephemeral socket and connect it to `peer`
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ControlSocket`] if the socket cannot be created
    /// or connected.
    pub fn open(peer: SocketAddr) -> Result<Self, SessionError> {
        let map_err = |source| SessionError::ControlSocket {
            peer: peer.to_string(),
            source,
        };

        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).map_err(map_err)?;
        socket.connect(peer).map_err(map_err)?;

        log::info!("Control channel connected to {}", peer);
        Ok(Self { socket, peer })
    }

    /// Peer this channel sends to
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl CommandSink for ControlChannel {
    fn send_command(&mut self, command: Command) -> io::Result<()> {
        self.socket.send(&command.to_bytes()).map(|_| ())
    }
}

/// Sink for sessions without a camera (replay); commands are only logged
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

impl CommandSink for DiscardSink {
    fn send_command(&mut self, command: Command) -> io::Result<()> {
        log::trace!("Discarding {:?}", command);
        Ok(())
    }
}

/// Non-blocking datagram socket receiving the video stream
#[derive(Debug)]
pub struct StreamSocket {
    socket: UdpSocket,
}

impl StreamSocket {
    /// Bind to `port` on all IPv4 interfaces
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::StreamSocket`] if the bind fails or the socket
    /// cannot be made non-blocking.
    pub fn bind(port: u16) -> Result<Self, SessionError> {
        Self::bind_addr((Ipv4Addr::UNSPECIFIED, port).into())
    }

    /// Bind to an explicit local address
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::StreamSocket`] if the bind fails or the socket
    /// cannot be made non-blocking.
    pub fn bind_addr(addr: SocketAddr) -> Result<Self, SessionError> {
        let map_err = |source| SessionError::StreamSocket {
            port: addr.port(),
            source,
        };

        let socket = UdpSocket::bind(addr).map_err(map_err)?;
        socket.set_nonblocking(true).map_err(map_err)?;

        Ok(Self { socket })
    }

    /// Address actually bound (useful with port 0)
    ///
    /// # Errors
    ///
    /// Returns the OS error if the address cannot be queried.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl DatagramSource for StreamSocket {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Received> {
        match self.socket.recv(buf) {
            Ok(0) => Ok(Received::Closed),
            Ok(len) => Ok(Received::Datagram(len)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Received::WouldBlock),
            Err(e) => Err(e),
        }
    }
}
