//! Socket primitives: UDP unicast/multicast receive sockets and the TCP
//! connect helper used by the RTSP client.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

use crate::error::{Result, SatipError};

/// Open a non-blocking UDP receive socket on `port` (0 = ephemeral).
///
/// `rcvbuf` overrides the kernel receive buffer when non-zero.
pub fn udp_socket(bind_addr: Ipv4Addr, port: u16, rcvbuf: usize) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if rcvbuf > 0 {
        socket.set_recv_buffer_size(rcvbuf)?;
    }
    socket.bind(&SocketAddrV4::new(bind_addr, port).into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Open a UDP socket joined to a multicast group.
///
/// With a `source` address the join is source-specific (SSM); the interface
/// is selected by `bind_addr` (unspecified = default route).
pub fn multicast_socket(
    group: Ipv4Addr,
    port: u16,
    source: Option<Ipv4Addr>,
    bind_addr: Ipv4Addr,
    rcvbuf: usize,
) -> Result<UdpSocket> {
    if !group.is_multicast() {
        return Err(SatipError::ConfigInvalid(format!(
            "{group} is not a multicast group"
        )));
    }
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if rcvbuf > 0 {
        socket.set_recv_buffer_size(rcvbuf)?;
    }
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    match source {
        Some(source) => socket.join_ssm_v4(&source, &group, &bind_addr)?,
        None => socket.join_multicast_v4(&group, &bind_addr)?,
    }
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// TCP connect with an optional source interface bind and a deadline.
pub async fn tcp_connect(
    addr: SocketAddr,
    bind: Option<IpAddr>,
    deadline: Duration,
) -> Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    if let Some(bind) = bind {
        socket.bind(SocketAddr::new(bind, 0))?;
    }
    let stream = tokio::time::timeout(deadline, socket.connect(addr))
        .await
        .map_err(|_| SatipError::ConnectTimeout)??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_socket_binds_ephemeral() {
        let socket = udp_socket(Ipv4Addr::LOCALHOST, 0, 0).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn multicast_rejects_unicast_group() {
        assert!(multicast_socket(
            Ipv4Addr::new(10, 0, 0, 1),
            5004,
            None,
            Ipv4Addr::UNSPECIFIED,
            0
        )
        .is_err());
    }
}
