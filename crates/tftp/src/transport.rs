//! Datagram Endpoints
//!
//! The transfer drivers talk to their peer through the [`Transport`] trait so
//! the state machines can be exercised without sockets. Two UDP
//! implementations exist:
//!
//! - [`PeerSocket`] - a server-side endpoint connected to one client. The
//!   kernel discards datagrams from any other source.
//! - [`ClientSocket`] - a client-side endpoint that sends its request to the
//!   server's well-known port and then locks onto whichever port answers.
//!
//! The server's rendezvous endpoint reads each datagram together with the
//! local address it was sent to ([`recv_with_destination`]), so a transfer
//! endpoint answers from the address the client addressed even when the
//! rendezvous is bound to the wildcard address.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{UdpSocket, lookup_host};

use crate::protocol::{MAX_PACKET_SIZE, Message, Packet, TftpErrorCode, encode};

/// One end of a transfer
#[async_trait]
pub trait Transport: Send {
    /// Send one datagram to the peer
    async fn send(&mut self, datagram: &[u8]) -> io::Result<()>;

    /// Receive one datagram from the peer, returning its length
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// The transfer ID of the peer, once known
    fn peer(&self) -> Option<SocketAddr>;
}

/// Resolve `host` and `port` to the first address the resolver returns.
///
/// An empty host means the unspecified address when `passive` is set (an
/// address to bind to) and the loopback address otherwise.
pub async fn resolve(host: &str, port: u16, passive: bool) -> io::Result<SocketAddr> {
    if host.is_empty() {
        let ip = if passive {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        };
        return Ok(SocketAddr::new(ip, port));
    }

    lookup_host((host, port)).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {}", host),
        )
    })
}

/// Open a UDP endpoint bound to `local`.
///
/// The socket has `SO_REUSEADDR` set, and for IPv6 addresses `IPV6_V6ONLY`
/// follows `v6only`. Must be called from within a Tokio runtime.
pub fn open_endpoint(local: SocketAddr, v6only: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if local.is_ipv6() {
        socket.set_only_v6(v6only)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;

    UdpSocket::from_std(socket.into())
}

/// The unspecified address of the same family as `addr`, port 0
pub fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// A datagram that reached a rendezvous endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    pub len: usize,
    pub source: SocketAddr,
    /// Local address the datagram was sent to, with port 0, if the platform reports it
    pub destination: Option<SocketAddr>,
}

/// Ask the kernel to report the destination address of every datagram
/// received on `socket` (`IPV6_RECVPKTINFO` or `IP_PKTINFO`)
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn enable_destination_info(socket: &UdpSocket) -> io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    match socket.local_addr()? {
        SocketAddr::V6(_) => setsockopt(socket, sockopt::Ipv6RecvPacketInfo, &true)?,
        SocketAddr::V4(_) => setsockopt(socket, sockopt::Ipv4PacketInfo, &true)?,
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn enable_destination_info(_socket: &UdpSocket) -> io::Result<()> {
    Ok(())
}

/// Receive one datagram along with its destination address.
///
/// [`enable_destination_info`] must have been called on `socket`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub async fn recv_with_destination(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Arrival> {
    use std::io::IoSliceMut;
    use std::os::fd::AsRawFd;

    use nix::libc::{in_pktinfo, in6_pktinfo};
    use nix::sys::socket::{MsgFlags, SockaddrStorage, recvmsg};
    use tokio::io::Interest;

    let fd = socket.as_raw_fd();
    socket
        .async_io(Interest::READABLE, || {
            let mut iov = [IoSliceMut::new(&mut *buf)];
            let mut control = nix::cmsg_space!(in6_pktinfo, in_pktinfo);
            let message = recvmsg::<SockaddrStorage>(fd, &mut iov, Some(&mut control), MsgFlags::empty())?;

            let source = message
                .address
                .as_ref()
                .and_then(pktinfo::socket_addr)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "datagram without source address"))?;
            let destination = message
                .cmsgs()
                .ok()
                .and_then(|mut cmsgs| cmsgs.find_map(pktinfo::destination));

            Ok(Arrival {
                len: message.bytes,
                source,
                destination,
            })
        })
        .await
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub async fn recv_with_destination(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Arrival> {
    let (len, source) = socket.recv_from(buf).await?;
    Ok(Arrival {
        len,
        source,
        destination: None,
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod pktinfo {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

    use nix::sys::socket::{ControlMessageOwned, SockaddrStorage};

    pub(super) fn socket_addr(storage: &SockaddrStorage) -> Option<SocketAddr> {
        if let Some(v4) = storage.as_sockaddr_in() {
            return Some(SocketAddr::V4(SocketAddrV4::from(*v4)));
        }
        storage.as_sockaddr_in6().map(|v6| SocketAddr::V6(SocketAddrV6::from(*v6)))
    }

    /// The destination carried by a packet-info control message. Link-local
    /// destinations keep the receiving interface as their scope.
    pub(super) fn destination(message: ControlMessageOwned) -> Option<SocketAddr> {
        match message {
            ControlMessageOwned::Ipv6PacketInfo(info) => {
                let ip = Ipv6Addr::from(info.ipi6_addr.s6_addr);
                let scope_id = if needs_scope(&ip) {
                    u32::try_from(info.ipi6_ifindex).unwrap_or(0)
                } else {
                    0
                };
                Some(SocketAddr::V6(SocketAddrV6::new(ip, 0, 0, scope_id)))
            }
            ControlMessageOwned::Ipv4PacketInfo(info) => {
                let ip = Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr));
                Some(SocketAddr::V4(SocketAddrV4::new(ip, 0)))
            }
            _ => None,
        }
    }

    /// Unicast and multicast link-local addresses
    fn needs_scope(ip: &Ipv6Addr) -> bool {
        let first = ip.segments()[0];
        first & 0xffc0 == 0xfe80 || first & 0xff0f == 0xff02
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_link_local_needs_scope() {
            assert!(needs_scope(&"fe80::1".parse().unwrap()));
            assert!(needs_scope(&"ff02::1".parse().unwrap()));
            assert!(!needs_scope(&"2001:db8::1".parse().unwrap()));
            assert!(!needs_scope(&Ipv6Addr::LOCALHOST));
        }
    }
}

/// Server-side endpoint dedicated to one client
#[derive(Debug)]
pub struct PeerSocket {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl PeerSocket {
    /// Bind a fresh endpoint on `local` and connect it to `peer`
    pub async fn accept(local: SocketAddr, peer: SocketAddr, v6only: bool) -> io::Result<Self> {
        let socket = open_endpoint(local, v6only)?;
        socket.connect(peer).await?;
        tracing::debug!("Transfer socket {} connected to {}", socket.local_addr()?, peer);
        Ok(Self { socket, peer })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl Transport for PeerSocket {
    async fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send(datagram).await.map(|_| ())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }

    fn peer(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

/// Client-side endpoint
///
/// Until the server answers, datagrams go to its well-known address. The
/// first datagram arriving from the server's IP fixes the transfer peer;
/// datagrams from any other source are answered with
/// [`TftpErrorCode::UnknownTransferId`] and otherwise ignored.
#[derive(Debug)]
pub struct ClientSocket {
    socket: UdpSocket,
    server: SocketAddr,
    peer: Option<SocketAddr>,
}

impl ClientSocket {
    pub fn new(socket: UdpSocket, server: SocketAddr) -> Self {
        Self {
            socket,
            server,
            peer: None,
        }
    }

    /// Open an endpoint on an ephemeral port of the server's address family
    pub fn open(server: SocketAddr, v6only: bool) -> io::Result<Self> {
        let socket = open_endpoint(unspecified_for(server), v6only)?;
        Ok(Self::new(socket, server))
    }

    async fn reject_stranger(&self, source: SocketAddr) {
        let mut packet: Packet = [0; MAX_PACKET_SIZE];
        let reply = Message::error_with_default_message(TftpErrorCode::UnknownTransferId);
        if let Ok(len) = encode(&reply, &mut packet)
            && let Err(e) = self.socket.send_to(&packet[..len], source).await
        {
            tracing::debug!("Failed to reject stray datagram from {}: {}", source, e);
        }
    }
}

#[async_trait]
impl Transport for ClientSocket {
    async fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        let target = self.peer.unwrap_or(self.server);
        self.socket.send_to(datagram, target).await.map(|_| ())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let (len, source) = self.socket.recv_from(buf).await?;
            match self.peer {
                Some(peer) if peer == source => return Ok(len),
                None if source.ip() == self.server.ip() => {
                    tracing::debug!("Transfer peer is {}", source);
                    self.peer = Some(source);
                    return Ok(len);
                }
                _ => {
                    tracing::debug!("Ignoring datagram from unknown transfer ID {}", source);
                    self.reject_stranger(source).await;
                }
            }
        }
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}
