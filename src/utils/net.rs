//! Networking helpers for binding the relay's UDP sockets.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;

use nix::sys::socket::{
    self, sockopt, AddressFamily, SockFlag, SockProtocol, SockType, SockaddrIn, SockaddrIn6,
};

use crate::error::{RelayError, Result};

fn socket_addr_family(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

fn bind_raw(addr: SocketAddr) -> io::Result<UdpSocket> {
    let fd = socket::socket(
        socket_addr_family(&addr),
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Udp,
    )
    .map_err(io::Error::from)?;

    match addr {
        SocketAddr::V4(v4) => {
            socket::bind(fd.as_raw_fd(), &SockaddrIn::from(v4)).map_err(io::Error::from)?;
        }
        SocketAddr::V6(v6) => {
            socket::setsockopt(&fd, sockopt::Ipv6V6Only, &true).map_err(io::Error::from)?;
            socket::bind(fd.as_raw_fd(), &SockaddrIn6::from(v6)).map_err(io::Error::from)?;
        }
    }

    let socket = UdpSocket::from(fd);
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Bind a non-blocking UDP socket, IPv6-only for IPv6 addresses.
///
/// The port is held exclusively: a second bind to an address in use
/// fails instead of sharing its traffic. Port 0 asks the kernel for an
/// ephemeral port; read it back with `local_addr()`.
pub fn bind_udp_socket(addr: SocketAddr) -> Result<UdpSocket> {
    bind_raw(addr).map_err(|source| RelayError::Bind { addr, source })
}
