//! Listener loops: accept connections and run one session per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::auth::{AllowAll, Authorizer};
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::session::{SessionEnd, SessionHandler};
use crate::stream::{PeerInfo, RelayStream, TransportKind};
use crate::ws;

// Pause after a failed accept (e.g. out of file descriptors) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Builder for a broker listening on TCP and/or WebSocket endpoints.
///
/// ```no_run
/// use service_relay::{BrokerBuilder, BrokerConfig};
///
/// # async fn run() -> service_relay::Result<()> {
/// let broker = BrokerBuilder::new(BrokerConfig::default())
///     .tcp("0.0.0.0:8888")
///     .websocket("0.0.0.0:8889")
///     .spawn()
///     .await?;
/// // ... later
/// broker.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct BrokerBuilder {
    config: BrokerConfig,
    authorizer: Arc<dyn Authorizer>,
    registry: Option<Arc<Registry>>,
    listeners: Vec<(String, TransportKind)>,
}

impl BrokerBuilder {
    /// Create a builder with no listeners and an allow-all authorizer.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            authorizer: Arc::new(AllowAll),
            registry: None,
            listeners: Vec::new(),
        }
    }

    /// Install an authorization hook.
    pub fn authorizer<A: Authorizer>(mut self, authorizer: A) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    /// Use an existing registry instead of a fresh one.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Listen for raw TCP sessions on `addr`.
    pub fn tcp(mut self, addr: impl Into<String>) -> Self {
        self.listeners.push((addr.into(), TransportKind::Tcp));
        self
    }

    /// Listen for WebSocket sessions on `addr`.
    pub fn websocket(mut self, addr: impl Into<String>) -> Self {
        self.listeners.push((addr.into(), TransportKind::WebSocket));
        self
    }

    /// Bind every listener and start accepting.
    ///
    /// Fails with [`Error::Bind`] if any address cannot be bound; nothing
    /// is left running in that case.
    pub async fn spawn(self) -> Result<BrokerGuard> {
        if self.listeners.is_empty() {
            return Err(Error::Bind {
                addr: String::new(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "no listen address configured",
                ),
            });
        }

        let mut bound = Vec::with_capacity(self.listeners.len());
        for (addr, kind) in self.listeners {
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|source| Error::Bind {
                    addr: addr.clone(),
                    source,
                })?;
            let local = listener.local_addr()?;
            info!(%local, %kind, "relay broker listening");
            bound.push((listener, local, kind));
        }

        let registry = self.registry.unwrap_or_default();
        let handler = SessionHandler::new(Arc::clone(&registry), self.config, self.authorizer);
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut driver = JoinSet::new();
        let mut endpoints = Vec::with_capacity(bound.len());
        for (listener, local, kind) in bound {
            endpoints.push((local, kind));
            driver.spawn(accept_loop(
                listener,
                kind,
                handler.clone(),
                shutdown_tx.subscribe(),
            ));
        }

        let driver_handle = tokio::spawn(async move {
            while let Some(res) = driver.join_next().await {
                if let Err(e) = res {
                    warn!("listener task failed: {e}");
                }
            }
        });

        Ok(BrokerGuard {
            endpoints,
            registry,
            shutdown_tx,
            driver: driver_handle,
        })
    }
}

/// Guard for a running broker.
pub struct BrokerGuard {
    endpoints: Vec<(SocketAddr, TransportKind)>,
    registry: Arc<Registry>,
    shutdown_tx: broadcast::Sender<()>,
    driver: tokio::task::JoinHandle<()>,
}

impl BrokerGuard {
    /// Bound addresses with their transport kind.
    pub fn endpoints(&self) -> &[(SocketAddr, TransportKind)] {
        &self.endpoints
    }

    /// First bound TCP address, if any.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.addr_of(TransportKind::Tcp)
    }

    /// First bound WebSocket address, if any.
    pub fn websocket_addr(&self) -> Option<SocketAddr> {
        self.addr_of(TransportKind::WebSocket)
    }

    fn addr_of(&self, kind: TransportKind) -> Option<SocketAddr> {
        self.endpoints
            .iter()
            .find(|(_, k)| *k == kind)
            .map(|(addr, _)| *addr)
    }

    /// The broker's registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Stop accepting and abort every in-flight session.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.driver.await {
            warn!("broker driver failed: {e}");
        }
        info!("relay broker stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    kind: TransportKind,
    handler: SessionHandler,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    debug!(%addr, %kind, "accepted connection");
                    sessions.spawn(serve_connection(socket, addr, kind, handler.clone()));
                }
                Err(e) => {
                    warn!(%kind, "accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(res) = sessions.join_next() => {
                if let Err(e) = res {
                    warn!("session task failed: {e}");
                }
            }
        }
    }
    debug!(%kind, active = sessions.len(), "listener shutting down");
    sessions.shutdown().await;
}

async fn serve_connection(
    socket: TcpStream,
    addr: SocketAddr,
    kind: TransportKind,
    handler: SessionHandler,
) {
    if let Err(e) = socket.set_nodelay(true) {
        debug!(%addr, "failed to set TCP_NODELAY: {e}");
    }

    let stream = match kind {
        TransportKind::WebSocket => match ws::accept(socket, addr).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(%addr, "websocket handshake failed: {e}");
                return;
            }
        },
        _ => RelayStream::new(socket, PeerInfo::new(Some(addr), TransportKind::Tcp)),
    };

    match handler.run(stream).await {
        Ok(SessionEnd::Bridged(stats)) => {
            if let Some(e) = stats.first_error {
                debug!(%addr, "bridge ended with I/O error: {e}");
            }
        }
        Ok(end) => debug!(%addr, ?end, "session ended"),
        Err(e @ Error::Protocol(_)) => info!(%addr, "session rejected: {e}"),
        Err(e) => debug!(%addr, "session ended: {e}"),
    }
}
