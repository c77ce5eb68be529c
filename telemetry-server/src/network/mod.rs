use socket2::{Domain, Protocol, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;

// this will be common for all our sockets
pub fn new_socket(domain: Domain) -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    // tokio requires non-blocking sockets
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;

    Ok(socket)
}

/// Bind a UDP socket that receives datagrams on `addr`.
///
/// Broadcast is enabled so a server bound to the wildcard address also
/// receives discovery broadcasts.
pub fn create_udp_listen(addr: &SocketAddr) -> io::Result<UdpSocket> {
    let socket = new_socket(Domain::for_address(*addr))?;
    if addr.is_ipv4() {
        let _ = socket.set_broadcast(true);
    }

    socket.bind(&socket2::SockAddr::from(*addr))?;
    log::trace!("Binding socket to {}", addr);

    UdpSocket::from_std(socket.into())
}

/// Bind an ephemeral IPv4 socket that may send to the broadcast address.
pub fn create_udp_broadcast() -> io::Result<UdpSocket> {
    let socket = new_socket(Domain::IPV4)?;
    socket.set_broadcast(true)?;

    let socketaddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    socket.bind(&socket2::SockAddr::from(socketaddr))?;
    log::trace!("Binding broadcast socket to {}", socketaddr);

    UdpSocket::from_std(socket.into())
}

/// Bind an ephemeral socket for sending to `target`.
pub fn create_udp_send(target: &SocketAddr) -> io::Result<UdpSocket> {
    let unspecified = match target {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    };
    let socket = new_socket(Domain::for_address(*target))?;
    socket.bind(&socket2::SockAddr::from(SocketAddr::new(unspecified, 0)))?;

    UdpSocket::from_std(socket.into())
}

/// Broadcast destination for discovery on `port`
pub fn broadcast_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port)
}
