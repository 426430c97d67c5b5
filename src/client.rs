//! Provider and consumer handshakes against a relay broker.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::name::ServiceName;
use crate::protocol::{self, Command, Reply};
use crate::stream::{PeerInfo, RelayStream, TransportKind};
use crate::ws;

/// Where a broker can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerAddr {
    /// Raw TCP, `host:port`.
    Tcp(String),
    /// WebSocket URL, `ws://host:port/path`.
    WebSocket(String),
}

impl FromStr for BrokerAddr {
    type Err = Error;

    /// `ws://` URLs select WebSocket; anything else is a TCP `host:port`,
    /// optionally prefixed with `tcp://`. `wss://` is refused: this crate
    /// is built without TLS.
    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with("wss://") {
            return Err(Error::InvalidAddress(s.to_string(), "TLS is not supported"));
        }
        if s.starts_with("ws://") {
            return Ok(Self::WebSocket(s.to_string()));
        }
        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        if addr.is_empty() || addr.contains("://") {
            return Err(Error::InvalidAddress(
                s.to_string(),
                "expected host:port or ws:// URL",
            ));
        }
        Ok(Self::Tcp(addr.to_string()))
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::WebSocket(url) => f.write_str(url),
        }
    }
}

/// Connects to one broker and performs the identification exchange.
///
/// ```no_run
/// # async fn example() -> service_relay::Result<()> {
/// use service_relay::{RelayClient, ServiceName};
///
/// let client = RelayClient::new("127.0.0.1:8888".parse().unwrap());
/// let name = ServiceName::new("vnc_service_a").unwrap();
/// let stream = client.request(&name).await?;
/// // `stream` now carries the provider's bytes.
/// # drop(stream);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RelayClient {
    broker: BrokerAddr,
    reply_timeout: Duration,
}

impl RelayClient {
    /// Client for `broker`, waiting up to 30 seconds for replies.
    pub fn new(broker: BrokerAddr) -> Self {
        Self {
            broker,
            reply_timeout: Duration::from_secs(30),
        }
    }

    /// Change how long to wait for the broker's reply line.
    pub fn with_reply_timeout(mut self, d: Duration) -> Self {
        self.reply_timeout = d;
        self
    }

    /// The broker this client talks to.
    pub fn broker(&self) -> &BrokerAddr {
        &self.broker
    }

    /// Open a connection to the broker without identifying.
    pub async fn connect(&self) -> Result<RelayStream> {
        match &self.broker {
            BrokerAddr::Tcp(addr) => {
                let socket = TcpStream::connect(addr)
                    .await
                    .map_err(|e| Error::connect(addr.as_str(), e))?;
                socket.set_nodelay(true)?;
                let peer = PeerInfo::new(socket.peer_addr().ok(), TransportKind::Tcp);
                Ok(RelayStream::new(socket, peer))
            }
            BrokerAddr::WebSocket(url) => ws::connect(url).await,
        }
    }

    /// Register as the provider of `name`.
    ///
    /// The returned stream stays idle until a consumer claims the name; from
    /// then on it carries that consumer's bytes.
    pub async fn register(&self, name: &ServiceName) -> Result<RelayStream> {
        self.handshake(Command::Register(name.clone())).await
    }

    /// Ask to be bridged to the provider of `name`.
    pub async fn request(&self, name: &ServiceName) -> Result<RelayStream> {
        self.handshake(Command::Request(name.clone())).await
    }

    async fn handshake(&self, command: Command) -> Result<RelayStream> {
        let mut stream = self.connect().await?;
        debug!(broker = %self.broker, line = %command.to_line().trim_end(), "identifying");

        stream.write_all(command.to_line().as_bytes()).await?;
        stream.flush().await?;

        let line = tokio::time::timeout(
            self.reply_timeout,
            protocol::read_line(&mut stream, protocol::DEFAULT_MAX_LINE_LEN),
        )
        .await
        .map_err(|_| Error::Timeout("broker reply"))??;

        match Reply::parse(&line)? {
            Reply::Ok(text) => {
                info!(broker = %self.broker, service = %command.name(), "{text}");
                Ok(stream)
            }
            Reply::Error(text) if text == protocol::SERVICE_NOT_FOUND => {
                Err(Error::NotFound(command.name().clone()))
            }
            Reply::Error(text) => Err(Error::Rejected(text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_broker_addresses() {
        assert_eq!(
            "127.0.0.1:8888".parse::<BrokerAddr>().unwrap(),
            BrokerAddr::Tcp("127.0.0.1:8888".into())
        );
        assert_eq!(
            "tcp://relay:8888".parse::<BrokerAddr>().unwrap(),
            BrokerAddr::Tcp("relay:8888".into())
        );
        assert_eq!(
            "ws://relay:8888/ws".parse::<BrokerAddr>().unwrap(),
            BrokerAddr::WebSocket("ws://relay:8888/ws".into())
        );
        assert_eq!(
            BrokerAddr::Tcp("relay:8888".into()).to_string(),
            "tcp://relay:8888"
        );
    }

    #[test]
    fn refuses_addresses_it_cannot_dial() {
        for addr in ["wss://relay:443/ws", "http://relay:8888", ""] {
            let err = addr.parse::<BrokerAddr>().unwrap_err();
            assert!(matches!(err, Error::InvalidAddress(..)), "{addr}: {err:?}");
            assert!(!err.is_transient());
        }
    }

    #[tokio::test]
    async fn unreachable_broker_is_connect_error() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = RelayClient::new(BrokerAddr::Tcp(format!("127.0.0.1:{port}")));
        let err = client
            .request(&ServiceName::new("cam1").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connect { .. }), "got {err:?}");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn error_reply_maps_to_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = RelayStream::new(socket, PeerInfo::new(None, TransportKind::Tcp));
            let _ = protocol::read_line(&mut conn, 1024).await.unwrap();
            conn.write_all(b"ERROR:Access denied\n").await.unwrap();
        });

        let client = RelayClient::new(BrokerAddr::Tcp(addr.to_string()));
        let err = client
            .register(&ServiceName::new("cam1").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected(ref text) if text == "Access denied"));
        assert!(!err.is_transient());
    }
}
