//! Per-connection session: identify the peer, then act as provider or
//! consumer.
//!
//! ```text
//! AwaitingIdentification ─ REGISTER ─▶ ProviderFlow ─┐
//!                        └ REQUEST ──▶ ConsumerFlow ─┴▶ Closed
//! ```

use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::auth::{AccessRequest, Authorizer, Role};
use crate::bridge::{Bridge, BridgeStats};
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::name::ServiceName;
use crate::protocol::{self, Command, Reply};
use crate::registry::{LeaseEvent, ProviderHandle, Registry};
use crate::stream::RelayStream;

/// How a session ended, when it ended without error.
#[derive(Debug)]
pub enum SessionEnd {
    /// The provider disconnected before any consumer claimed it.
    ProviderLeft,
    /// The provider stayed silent for too many keep-alive intervals.
    ProviderTimedOut,
    /// A newer registration for the same name replaced this provider.
    ProviderEvicted,
    /// The provider connection was handed to a consumer session.
    ProviderClaimed,
    /// The consumer was bridged to a provider until either side ended.
    Bridged(BridgeStats),
}

/// Runs the rendezvous protocol for accepted connections.
///
/// Cheap to clone; every clone shares the same registry.
#[derive(Clone)]
pub struct SessionHandler {
    registry: Arc<Registry>,
    authorizer: Arc<dyn Authorizer>,
    config: Arc<BrokerConfig>,
    bridge: Bridge,
}

impl SessionHandler {
    /// Create a handler over a shared registry.
    pub fn new(
        registry: Arc<Registry>,
        config: BrokerConfig,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            registry,
            authorizer,
            bridge: Bridge::new(config.buffer_size),
            config: Arc::new(config),
        }
    }

    /// The registry this handler mutates.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Drive one connection to completion.
    ///
    /// Errors are local to the session: the connection has been answered
    /// (when possible) and closed by the time this returns.
    pub async fn run(&self, mut stream: RelayStream) -> Result<SessionEnd> {
        let peer = stream.peer().clone();

        let line = match timeout(
            self.config.identification_timeout,
            protocol::read_line(&mut stream, self.config.max_line_len),
        )
        .await
        {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                reject(stream, Reply::error(protocol::INVALID_PROTOCOL)).await;
                return Err(e);
            }
            Err(_) => {
                reject(stream, Reply::error(protocol::INVALID_PROTOCOL)).await;
                return Err(Error::protocol("no identification line before deadline"));
            }
        };
        debug!(%peer, %line, "received identification");

        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                reject(stream, e.reply()).await;
                return Err(Error::protocol(format!("{e}: {line:?}")));
            }
        };

        let role = match command {
            Command::Register(_) => Role::Provider,
            Command::Request(_) => Role::Consumer,
        };
        let request = AccessRequest {
            role,
            name: command.name(),
            peer: &peer,
        };
        if let Err(denied) = self.authorizer.authorize(&request) {
            warn!(%peer, %role, service = %command.name(), "access denied: {denied}");
            reject(stream, Reply::error(protocol::ACCESS_DENIED)).await;
            return Err(Error::AccessDenied(denied.reason));
        }

        match command {
            Command::Register(name) => self.provide(name, stream).await,
            Command::Request(name) => self.consume(name, stream).await,
        }
    }

    async fn provide(&self, name: ServiceName, mut stream: RelayStream) -> Result<SessionEnd> {
        let peer = stream.peer().clone();
        let (handle, mut lease) = ProviderHandle::new(name.clone(), peer.clone());

        if let Some(previous) = self.registry.register(handle.clone()) {
            info!(service = %name, old = %previous.peer(), new = %peer, "closing replaced provider");
            previous.close();
        }

        if let Err(e) = send_reply(&mut stream, &Reply::ok(protocol::SERVICE_REGISTERED)).await {
            self.registry.unregister_if_current(&name, &handle);
            return Err(e);
        }
        info!(service = %name, %peer, "service registered");

        enum Step {
            Lease(LeaseEvent),
            Idle,
            Read(std::io::Result<usize>),
        }

        let max_missed = self.config.max_missed_keepalives.max(1);
        let mut missed = 0u32;
        loop {
            let step = tokio::select! {
                biased;
                event = lease.next_event() => Step::Lease(event),
                res = timeout(
                    self.config.keepalive_interval,
                    stream.fill_pending(self.config.buffer_size),
                ) => match res {
                    Ok(read) => Step::Read(read),
                    Err(_) => Step::Idle,
                },
            };

            match step {
                Step::Lease(LeaseEvent::Claimed(claim)) => {
                    debug!(service = %name, pending = stream.pending_len(), "handing provider to consumer");
                    if let Err(mut stream) = claim.hand_over(stream) {
                        debug!(service = %name, "claiming consumer went away");
                        let _ = stream.shutdown().await;
                    }
                    return Ok(SessionEnd::ProviderClaimed);
                }
                Step::Lease(LeaseEvent::Closed) => {
                    self.registry.unregister_if_current(&name, &handle);
                    let _ = stream.shutdown().await;
                    info!(service = %name, %peer, "provider replaced");
                    return Ok(SessionEnd::ProviderEvicted);
                }
                Step::Idle => {
                    missed += 1;
                    if missed >= max_missed {
                        info!(service = %name, %peer, missed, "provider unresponsive, dropping");
                        self.registry.unregister_if_current(&name, &handle);
                        // A dead peer may never drain a close.
                        let _ = timeout(self.config.keepalive_interval, stream.shutdown()).await;
                        return Ok(SessionEnd::ProviderTimedOut);
                    }
                    trace!(service = %name, missed, "provider idle");
                }
                Step::Read(Ok(0)) => {
                    info!(service = %name, %peer, "provider disconnected");
                    break;
                }
                Step::Read(Ok(n)) => {
                    missed = 0;
                    if stream.pending_len() > self.config.max_pending_bytes {
                        warn!(
                            service = %name,
                            pending = stream.pending_len(),
                            "provider sent too much before being claimed"
                        );
                        let _ = stream.shutdown().await;
                        break;
                    }
                    trace!(service = %name, bytes = n, "holding early provider bytes");
                }
                Step::Read(Err(e)) => {
                    debug!(service = %name, %peer, "provider read failed: {e}");
                    break;
                }
            }
        }

        self.registry.unregister_if_current(&name, &handle);
        Ok(SessionEnd::ProviderLeft)
    }

    async fn consume(&self, name: ServiceName, mut stream: RelayStream) -> Result<SessionEnd> {
        let peer = stream.peer().clone();

        let handle = match self.registry.claim_for_consumer(&name) {
            Ok(handle) => handle,
            Err(e) => {
                info!(service = %name, %peer, "requested unknown service");
                reject(stream, Reply::error(protocol::SERVICE_NOT_FOUND)).await;
                return Err(e);
            }
        };

        let provider = match timeout(self.config.identification_timeout, handle.take_stream()).await
        {
            Ok(Some(provider)) => provider,
            Ok(None) | Err(_) => {
                handle.close();
                info!(service = %name, %peer, "provider vanished during claim");
                reject(stream, Reply::error(protocol::SERVICE_NOT_FOUND)).await;
                return Err(Error::NotFound(name));
            }
        };

        // Dropping `provider` on failure closes it; the provider reconnects.
        send_reply(&mut stream, &Reply::ok(protocol::CONNECTED_TO_SERVICE)).await?;

        info!(service = %name, consumer = %peer, provider = %provider.peer(), "bridging");
        let stats = self.bridge.run(stream, provider).await;
        info!(
            service = %name,
            consumer_to_provider = stats.a_to_b,
            provider_to_consumer = stats.b_to_a,
            "bridge closed"
        );
        Ok(SessionEnd::Bridged(stats))
    }
}

async fn send_reply(stream: &mut RelayStream, reply: &Reply) -> Result<()> {
    stream.write_all(reply.to_line().as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

// Best effort: the peer may already be gone.
async fn reject(mut stream: RelayStream, reply: Reply) {
    if let Err(e) = send_reply(&mut stream, &reply).await {
        debug!(peer = %stream.peer(), "failed to send {reply}: {e}");
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessDenied, AllowAll};
    use crate::stream::{PeerInfo, TransportKind};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream};

    fn handler(config: BrokerConfig) -> SessionHandler {
        SessionHandler::new(Arc::new(Registry::new()), config, Arc::new(AllowAll))
    }

    fn connect(
        handler: &SessionHandler,
    ) -> (DuplexStream, tokio::task::JoinHandle<Result<SessionEnd>>) {
        let (near, far) = duplex(4096);
        let stream = RelayStream::new(near, PeerInfo::new(None, TransportKind::Memory));
        let handler = handler.clone();
        (far, tokio::spawn(async move { handler.run(stream).await }))
    }

    async fn read_reply(conn: &mut DuplexStream) -> String {
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            conn.read_exact(&mut byte).await.unwrap();
            line.push(byte[0]);
            if byte[0] == b'\n' {
                return String::from_utf8(line).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let h = handler(BrokerConfig::default());
        let (mut conn, session) = connect(&h);
        conn.write_all(b"HELLO\n").await.unwrap();

        let mut reply = String::new();
        BufReader::new(&mut conn).read_line(&mut reply).await.unwrap();
        assert_eq!(reply, "ERROR:Invalid protocol\n");
        assert!(matches!(session.await.unwrap(), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let h = handler(BrokerConfig::default());
        let (mut conn, session) = connect(&h);
        conn.write_all(b"REGISTER:\n").await.unwrap();

        assert_eq!(read_reply(&mut conn).await, "ERROR:Invalid service name\n");
        assert!(session.await.unwrap().is_err());
        assert!(h.registry().is_empty());
    }

    #[tokio::test]
    async fn missing_identification_times_out() {
        let h = handler(
            BrokerConfig::default().with_identification_timeout(Duration::from_millis(50)),
        );
        let (mut conn, session) = connect(&h);

        let res = tokio::time::timeout(Duration::from_secs(1), session)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(Error::Protocol(_))));
        assert_eq!(read_reply(&mut conn).await, "ERROR:Invalid protocol\n");
    }

    #[tokio::test]
    async fn provider_disconnect_unregisters() {
        let h = handler(BrokerConfig::default());
        let (mut conn, session) = connect(&h);
        conn.write_all(b"REGISTER:cam1\n").await.unwrap();
        assert_eq!(read_reply(&mut conn).await, "OK:Service registered\n");
        assert!(h.registry().contains("cam1"));

        drop(conn);
        let end = session.await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::ProviderLeft));
        assert!(!h.registry().contains("cam1"));
    }

    #[tokio::test]
    async fn quiet_provider_survives_keepalive_deadline() {
        let h = handler(
            BrokerConfig::default()
                .with_keepalive_interval(Duration::from_millis(10))
                .with_max_missed_keepalives(100),
        );
        let (mut conn, _session) = connect(&h);
        conn.write_all(b"REGISTER:cam1\n").await.unwrap();
        assert_eq!(read_reply(&mut conn).await, "OK:Service registered\n");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.registry().contains("cam1"));
    }

    #[tokio::test]
    async fn unresponsive_provider_is_dropped() {
        let h = handler(
            BrokerConfig::default()
                .with_keepalive_interval(Duration::from_millis(20))
                .with_max_missed_keepalives(3),
        );
        // The peer keeps its end open but never sends anything again.
        let (mut conn, session) = connect(&h);
        conn.write_all(b"REGISTER:cam1\n").await.unwrap();
        assert_eq!(read_reply(&mut conn).await, "OK:Service registered\n");

        let end = tokio::time::timeout(Duration::from_secs(1), session)
            .await
            .expect("silent provider should be dropped")
            .unwrap()
            .unwrap();
        assert!(matches!(end, SessionEnd::ProviderTimedOut));
        assert!(!h.registry().contains("cam1"));
    }

    #[tokio::test]
    async fn provider_traffic_resets_missed_keepalives() {
        let h = handler(
            BrokerConfig::default()
                .with_keepalive_interval(Duration::from_millis(30))
                .with_max_missed_keepalives(2),
        );
        let (mut conn, session) = connect(&h);
        conn.write_all(b"REGISTER:cam1\n").await.unwrap();
        assert_eq!(read_reply(&mut conn).await, "OK:Service registered\n");

        // Spans well over two intervals, but no interval passes in silence.
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            conn.write_all(b".").await.unwrap();
        }
        assert!(h.registry().contains("cam1"));
        assert!(!session.is_finished());
    }

    #[tokio::test]
    async fn early_provider_bytes_reach_consumer() {
        let h = handler(BrokerConfig::default());
        let (mut provider, _p) = connect(&h);
        provider.write_all(b"REGISTER:vnc\n").await.unwrap();
        assert_eq!(read_reply(&mut provider).await, "OK:Service registered\n");
        // A server-first protocol greets before anyone is connected.
        provider.write_all(b"RFB 003.008\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (mut consumer, consumer_session) = connect(&h);
        consumer.write_all(b"REQUEST:vnc\n").await.unwrap();
        assert_eq!(read_reply(&mut consumer).await, "OK:Connected to service\n");

        let mut greeting = [0u8; 12];
        consumer.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"RFB 003.008\n");

        drop(consumer);
        let end = consumer_session.await.unwrap().unwrap();
        match end {
            SessionEnd::Bridged(stats) => assert_eq!(stats.b_to_a, 12),
            other => panic!("expected bridged session, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn provider_flood_before_claim_is_dropped() {
        let h = handler(BrokerConfig::default().with_max_pending_bytes(8));
        let (mut conn, session) = connect(&h);
        conn.write_all(b"REGISTER:cam1\n").await.unwrap();
        assert_eq!(read_reply(&mut conn).await, "OK:Service registered\n");
        conn.write_all(&[0u8; 64]).await.unwrap();

        let end = session.await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::ProviderLeft));
        assert!(h.registry().is_empty());
    }

    #[tokio::test]
    async fn provider_gone_before_hand_off_is_not_found() {
        let h = handler(BrokerConfig::default());
        // Registered, but its session has already exited.
        let (handle, lease) = ProviderHandle::new(
            ServiceName::new("cam1").unwrap(),
            PeerInfo::new(None, TransportKind::Memory),
        );
        h.registry().register(handle.clone());
        drop(lease);

        let (mut conn, session) = connect(&h);
        conn.write_all(b"REQUEST:cam1\n").await.unwrap();

        assert_eq!(read_reply(&mut conn).await, "ERROR:Service not found\n");
        assert!(matches!(
            session.await.unwrap(),
            Err(Error::NotFound(name)) if name.as_str() == "cam1"
        ));
        assert!(handle.is_closed());
        assert!(h.registry().is_empty());
    }

    #[tokio::test]
    async fn authorizer_can_refuse() {
        fn deny_all(_: &AccessRequest<'_>) -> std::result::Result<(), AccessDenied> {
            Err(AccessDenied::new("closed for maintenance"))
        }
        let h = SessionHandler::new(
            Arc::new(Registry::new()),
            BrokerConfig::default(),
            Arc::new(deny_all),
        );
        let (mut conn, session) = connect(&h);
        conn.write_all(b"REGISTER:cam1\n").await.unwrap();

        assert_eq!(read_reply(&mut conn).await, "ERROR:Access denied\n");
        assert!(matches!(
            session.await.unwrap(),
            Err(Error::AccessDenied(reason)) if reason == "closed for maintenance"
        ));
        assert!(h.registry().is_empty());
    }
}
