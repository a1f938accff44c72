//! UDP socket setup
//!
//! `socket2` is used for the options std does not expose before bind:
//! address reuse, receive buffer size and multicast membership.

use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use crate::error::NetworkError;

/// Options shared by every socket the receiver opens
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    /// Local interface; `0.0.0.0` lets the OS choose
    pub interface: Ipv4Addr,
    pub ttl: u32,
    pub read_timeout: Duration,
    pub recv_buffer_bytes: usize,
}

fn new_socket() -> Result<Socket, NetworkError> {
    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))
}

fn opt<T>(result: std::io::Result<T>, what: &str) -> Result<T, NetworkError> {
    result.map_err(|e| NetworkError::SocketOption(format!("{}: {}", what, e)))
}

/// Create a socket bound to the group's port and joined to the group
pub fn create_multicast_socket(
    group: SocketAddrV4,
    options: &SocketOptions,
) -> Result<UdpSocket, NetworkError> {
    let socket = new_socket()?;

    opt(socket.set_reuse_address(true), "SO_REUSEADDR")?;
    #[cfg(unix)]
    opt(socket.set_reuse_port(true), "SO_REUSEPORT")?;
    if let Err(e) = socket.set_recv_buffer_size(options.recv_buffer_bytes) {
        tracing::debug!("Could not resize receive buffer: {}", e);
    }

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
    socket
        .bind(&SockAddr::from(bind_addr))
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", bind_addr, e)))?;

    socket
        .join_multicast_v4(group.ip(), &options.interface)
        .map_err(|e| NetworkError::JoinFailed(format!("{} on {}: {}", group, options.interface, e)))?;

    opt(socket.set_multicast_ttl_v4(options.ttl), "IP_MULTICAST_TTL")?;
    opt(socket.set_multicast_loop_v4(true), "IP_MULTICAST_LOOP")?;
    if !options.interface.is_unspecified() {
        opt(socket.set_multicast_if_v4(&options.interface), "IP_MULTICAST_IF")?;
    }
    opt(socket.set_read_timeout(Some(options.read_timeout)), "SO_RCVTIMEO")?;

    Ok(socket.into())
}

/// Create a socket on the interface with an ephemeral port
pub fn create_unicast_socket(options: &SocketOptions) -> Result<UdpSocket, NetworkError> {
    let socket = new_socket()?;

    if let Err(e) = socket.set_recv_buffer_size(options.recv_buffer_bytes) {
        tracing::debug!("Could not resize receive buffer: {}", e);
    }

    let bind_addr = SocketAddrV4::new(options.interface, 0);
    socket
        .bind(&SockAddr::from(bind_addr))
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", bind_addr, e)))?;

    opt(socket.set_ttl(options.ttl), "IP_TTL")?;
    opt(socket.set_read_timeout(Some(options.read_timeout)), "SO_RCVTIMEO")?;

    Ok(socket.into())
}

/// Receive one datagram
///
/// Timeouts and transient errors yield `None`; the caller simply loops.
pub fn recv_datagram(socket: &UdpSocket, buf: &mut [u8]) -> Option<(Bytes, SocketAddr)> {
    match socket.recv_from(buf) {
        Ok((len, from)) => Some((Bytes::copy_from_slice(&buf[..len]), from)),
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => None,
        Err(e) => {
            tracing::trace!("Ignoring receive error: {}", e);
            None
        }
    }
}

/// Send one datagram, logging instead of failing
pub fn send_datagram(socket: &UdpSocket, datagram: &[u8], to: SocketAddrV4) -> bool {
    match socket.send_to(datagram, to) {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("Send to {} failed: {}", to, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_options() -> SocketOptions {
        SocketOptions {
            interface: Ipv4Addr::LOCALHOST,
            ttl: 1,
            read_timeout: Duration::from_millis(20),
            recv_buffer_bytes: 64 * 1024,
        }
    }

    #[test]
    fn test_unicast_socket_round_trip() {
        let a = create_unicast_socket(&loopback_options()).unwrap();
        let b = create_unicast_socket(&loopback_options()).unwrap();
        let b_addr = match b.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            other => panic!("unexpected {}", other),
        };

        assert!(send_datagram(&a, b"hello", b_addr));

        let mut buf = [0u8; 64];
        let (data, from) = recv_datagram(&b, &mut buf).unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn test_recv_times_out() {
        let socket = create_unicast_socket(&loopback_options()).unwrap();
        let mut buf = [0u8; 64];
        assert!(recv_datagram(&socket, &mut buf).is_none());
    }
}
