use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use strum_macros;
use strum_macros::EnumString;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

#[derive(
    strum_macros::Display,
    EnumString,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Clone,
    Copy,
    Deserialize,
    Serialize,
)]
#[strum(ascii_case_insensitive)]
pub enum TransportType {
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "tls")]
    Tls,
    #[strum(serialize = "ws")]
    Ws,
    #[strum(serialize = "wss")]
    Wss,
}

impl Default for TransportType {
    fn default() -> Self {
        TransportType::Udp
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport {0} not supported")]
    Unsupported(TransportType),
    #[error("write to {addr} failed: {source}")]
    Write {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// One operation set over both wire flavors: a UDP pseudo-connection (shared
/// socket plus the peer address) and a pooled TCP connection. Everything
/// above the transport drivers talks to this and nothing else.
#[derive(Clone)]
pub enum Conn {
    Udp {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
    Tcp {
        writer: Arc<Mutex<OwnedWriteHalf>>,
        peer: SocketAddr,
    },
}

impl Conn {
    pub fn udp(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Conn::Udp { socket, peer }
    }

    pub fn tcp(writer: Arc<Mutex<OwnedWriteHalf>>, peer: SocketAddr) -> Self {
        Conn::Tcp { writer, peer }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        match self {
            Conn::Udp { peer, .. } => *peer,
            Conn::Tcp { peer, .. } => *peer,
        }
    }

    pub fn transport(&self) -> TransportType {
        match self {
            Conn::Udp { .. } => TransportType::Udp,
            Conn::Tcp { .. } => TransportType::Tcp,
        }
    }

    pub async fn send(&self, buf: &[u8]) -> Result<(), TransportError> {
        match self {
            Conn::Udp { socket, peer } => {
                socket
                    .send_to(buf, peer)
                    .await
                    .map_err(|source| TransportError::Write {
                        addr: *peer,
                        source,
                    })?;
            }
            Conn::Tcp { writer, peer } => {
                let mut writer = writer.lock().await;
                let write = async {
                    writer.write_all(buf).await?;
                    writer.flush().await
                };
                write.await.map_err(|source| TransportError::Write {
                    addr: *peer,
                    source,
                })?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("transport", &self.transport())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn transport_tokens() {
        assert_eq!(TransportType::Udp, TransportType::from_str("udp").unwrap());
        assert_eq!(TransportType::Tcp, TransportType::from_str("TCP").unwrap());
        assert_eq!("udp", TransportType::Udp.to_string());
        assert!(TransportType::from_str("sctp").is_err());
    }
}
