//! UDP socket setup, datagram sink and multicast membership.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::config::{MulticastInterface, ProtocolFamily, ServerOptions};
use crate::error::NetError;
use crate::flow::outbound::WriteSink;

/// Resolve the bind address against the configured protocol family.
pub(crate) fn resolve_bind_addr(options: &ServerOptions) -> Result<SocketAddr, NetError> {
    let bind_err = |message: String| NetError::Bind {
        address: options.bind_address.clone(),
        source: io::Error::new(io::ErrorKind::InvalidInput, message),
    };

    let addr = options.socket_addr().map_err(|e| bind_err(e.to_string()))?;
    match (options.protocol_family, addr.ip()) {
        (ProtocolFamily::Default, _)
        | (ProtocolFamily::Ipv4, IpAddr::V4(_))
        | (ProtocolFamily::Ipv6, IpAddr::V6(_)) => Ok(addr),
        (ProtocolFamily::Ipv4, ip) if ip.is_unspecified() => {
            Ok(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), addr.port()))
        }
        (ProtocolFamily::Ipv6, ip) if ip.is_unspecified() => {
            Ok(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), addr.port()))
        }
        (family, _) => Err(bind_err(format!(
            "address family does not match protocol family {family:?}"
        ))),
    }
}

/// Bind a UDP socket on the current runtime.
pub(crate) fn bind(options: &ServerOptions) -> Result<UdpSocket, NetError> {
    let addr = resolve_bind_addr(options)?;
    let bind_err = |source: io::Error| NetError::Bind {
        address: addr.to_string(),
        source,
    };

    let socket = std::net::UdpSocket::bind(addr).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    let socket = UdpSocket::from_std(socket).map_err(bind_err)?;
    tracing::info!(address = %addr, "UDP socket bound");
    Ok(socket)
}

/// Join a multicast group on `socket`.
pub(crate) fn join(
    socket: &UdpSocket,
    group: IpAddr,
    interface: Option<MulticastInterface>,
) -> Result<(), NetError> {
    match group {
        IpAddr::V4(group) => socket.join_multicast_v4(group, v4_interface(interface)?)?,
        IpAddr::V6(group) => socket.join_multicast_v6(&group, v6_interface(interface)?)?,
    }
    Ok(())
}

/// Leave a multicast group on `socket`.
pub(crate) fn leave(
    socket: &UdpSocket,
    group: IpAddr,
    interface: Option<MulticastInterface>,
) -> Result<(), NetError> {
    match group {
        IpAddr::V4(group) => socket.leave_multicast_v4(group, v4_interface(interface)?)?,
        IpAddr::V6(group) => socket.leave_multicast_v6(&group, v6_interface(interface)?)?,
    }
    Ok(())
}

fn v4_interface(interface: Option<MulticastInterface>) -> io::Result<Ipv4Addr> {
    match interface {
        None => Ok(Ipv4Addr::UNSPECIFIED),
        Some(MulticastInterface::Address(addr)) => Ok(addr),
        Some(MulticastInterface::Index(_)) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "IPv4 multicast needs an interface address",
        )),
    }
}

fn v6_interface(interface: Option<MulticastInterface>) -> io::Result<u32> {
    match interface {
        None => Ok(0),
        Some(MulticastInterface::Index(index)) => Ok(index),
        Some(MulticastInterface::Address(_)) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "IPv6 multicast needs an interface index",
        )),
    }
}

/// Writes every chunk as one datagram to a fixed peer.
#[derive(Debug)]
pub(crate) struct DatagramSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl DatagramSink {
    pub(crate) fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

impl WriteSink for DatagramSink {
    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        self.socket.send_to(&chunk, self.peer).await.map(|_| ())
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}
