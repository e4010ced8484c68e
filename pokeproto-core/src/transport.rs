//! Datagram transport: a thin send/receive over an unreliable, single local
//! endpoint. Grounded on the bind/timeout shape of
//! `original_source/network/udp_transport.py`'s `UDPTransport.open`, wired
//! onto `std::net::UdpSocket` the way the teacher wires raw sockets in
//! `SleepingPills-bushhammer/t51core/src/net/endpoint.rs`.

use crate::model::PeerAddr;
use slog::{warn, Logger};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Maximum UDP datagram this transport will accept, per spec.md §4.1 (the
/// theoretical IPv4 UDP payload ceiling).
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// The bounded wait `receive` uses; this is the scheduling tick the
/// reliability layer's `tick` rides on.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Abstraction over "send bytes to an address" / "receive bytes from
/// whoever sent them", so the protocol engine can run against a real UDP
/// socket or an in-memory test double identically.
pub trait Transport: Send + Sync {
    /// Send `bytes` to `addr`. Returns `false` (never panics) on any
    /// failure — the reliability layer treats this identically to packet
    /// loss.
    fn send(&self, bytes: &[u8], addr: &PeerAddr) -> bool;

    /// Receive the next datagram, waiting up to [`RECEIVE_TIMEOUT`].
    /// Returns `None` on timeout or any recoverable error.
    fn receive(&self) -> Option<(Vec<u8>, PeerAddr)>;
}

/// A `std::net::UdpSocket`-backed [`Transport`].
pub struct UdpTransport {
    socket: UdpSocket,
    logger: Logger,
}

impl UdpTransport {
    pub fn bind(host: &str, port: u16, logger: Logger) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((host, port))?;
        socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
        Ok(UdpTransport { socket, logger })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn send(&self, bytes: &[u8], addr: &PeerAddr) -> bool {
        let target = format!("{}:{}", addr.ip, addr.port);
        match self.socket.send_to(bytes, &target) {
            Ok(_) => true,
            Err(err) => {
                warn!(self.logger, "datagram send failed"; "dest" => %addr, "error" => %err);
                false
            }
        }
    }

    fn receive(&self) -> Option<(Vec<u8>, PeerAddr)> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        match self.socket.recv_from(&mut buf) {
            Ok((n, from)) => Some((buf[..n].to_vec(), PeerAddr::from(from))),
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {
                None
            }
            Err(err) => {
                warn!(self.logger, "datagram receive failed"; "error" => %err);
                None
            }
        }
    }
}
