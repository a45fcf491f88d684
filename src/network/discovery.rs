//! Server discovery over UDP broadcast
//!
//! The probe `DISCOVER_VOLUMIZE` goes to the broadcast address; a server
//! answers `SERVER:<port>` and its address is the reply's source IP.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::config::DiscoveryConfig;
use crate::constants::{DISCOVERY_MESSAGE, DISCOVERY_REPLY_PREFIX};
use crate::error::NetworkError;
use crate::protocol::{parse_port, ServerAddress};

/// Broadcast a probe on the configured port and wait for the first valid reply
pub async fn discover_server(config: &DiscoveryConfig) -> Result<ServerAddress, NetworkError> {
    let target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, config.broadcast_port));
    discover_at(target, config.timeout()).await
}

/// Probe `target` (broadcast or unicast) and wait up to `timeout` for a reply
pub async fn discover_at(target: SocketAddr, timeout: Duration) -> Result<ServerAddress, NetworkError> {
    let socket = create_broadcast_socket().map_err(|e| NetworkError::Discovery(e.to_string()))?;

    socket
        .send_to(DISCOVERY_MESSAGE.as_bytes(), target)
        .await
        .map_err(|e| NetworkError::Discovery(e.to_string()))?;
    tracing::debug!("Sent discovery probe to {}", target);

    let mut buf = [0u8; 64];
    let replies = async {
        loop {
            let (len, source) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => return Err(NetworkError::Discovery(e.to_string())),
            };
            match parse_reply(&buf[..len], source.ip()) {
                Ok(address) => return Ok(address),
                Err(e) => tracing::warn!("Ignoring discovery reply from {}: {}", source, e),
            }
        }
    };

    match tokio::time::timeout(timeout, replies).await {
        Ok(result) => {
            if let Ok(address) = &result {
                tracing::info!("Discovered server at {}", address);
            }
            result
        }
        Err(_) => Err(NetworkError::Discovery(format!(
            "no reply within {:?}",
            timeout
        ))),
    }
}

/// Interpret a `SERVER:<port>` reply received from `source`
pub fn parse_reply(reply: &[u8], source: IpAddr) -> Result<ServerAddress, NetworkError> {
    let text = std::str::from_utf8(reply)
        .map_err(|_| NetworkError::Discovery("reply is not UTF-8".into()))?
        .trim();
    let port = text
        .strip_prefix(DISCOVERY_REPLY_PREFIX)
        .ok_or_else(|| NetworkError::Discovery(format!("unexpected reply {:?}", text)))?;
    let port = parse_port(port).map_err(|e| NetworkError::Discovery(e.to_string()))?;

    ServerAddress::new(source.to_string(), port as i64)
        .map_err(|e| NetworkError::Discovery(e.to_string()))
}

fn create_broadcast_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket.bind(&SockAddr::from(bind_addr))?;
    UdpSocket::from_std(socket.into())
}
