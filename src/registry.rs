//! Service registry: service name → the one live provider connection.
//!
//! The registry only does bookkeeping. It never touches a socket while its
//! lock is held; evicted handles are returned so the caller can close them
//! afterwards.
//!
//! A provider's connection stays owned by the provider's session task while
//! it waits. The registry stores a [`ProviderHandle`], which can ask that
//! task (through its [`ProviderLease`]) to hand the connection over once a
//! consumer claims the name.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::name::ServiceName;
use crate::stream::{PeerInfo, RelayStream};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

struct ClaimRequest {
    reply: oneshot::Sender<RelayStream>,
}

struct HandleInner {
    id: u64,
    name: ServiceName,
    peer: PeerInfo,
    registered_at: Instant,
    closed: CancellationToken,
    claim_tx: Mutex<Option<oneshot::Sender<ClaimRequest>>>,
}

/// Reference to a registered provider connection.
///
/// Cheap to clone; all clones refer to the same registration and compare
/// equal. [`close`](Self::close) is idempotent and may be called from any
/// number of cleanup paths concurrently.
#[derive(Clone)]
pub struct ProviderHandle {
    inner: Arc<HandleInner>,
}

impl ProviderHandle {
    /// Create a handle for a provider connection, plus the lease its session
    /// task holds while it keeps the connection.
    pub fn new(name: ServiceName, peer: PeerInfo) -> (Self, ProviderLease) {
        let (claim_tx, claim_rx) = oneshot::channel();
        let handle = Self {
            inner: Arc::new(HandleInner {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                name,
                peer,
                registered_at: Instant::now(),
                closed: CancellationToken::new(),
                claim_tx: Mutex::new(Some(claim_tx)),
            }),
        };
        let lease = ProviderLease {
            handle: handle.clone(),
            claim_rx,
        };
        (handle, lease)
    }

    /// Unique id of this registration.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Service name the provider registered under.
    pub fn name(&self) -> &ServiceName {
        &self.inner.name
    }

    /// Provider peer information.
    pub fn peer(&self) -> &PeerInfo {
        &self.inner.peer
    }

    /// When the handle was created.
    pub fn registered_at(&self) -> Instant {
        self.inner.registered_at
    }

    /// Ask the provider session to shut its connection down.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Take the provider connection away from its session.
    ///
    /// Succeeds at most once per registration. Returns `None` when the
    /// connection is already gone: taken before, closed, or its provider
    /// disconnected before the hand-off completed.
    pub async fn take_stream(&self) -> Option<RelayStream> {
        if self.is_closed() {
            return None;
        }
        let claim_tx = self.inner.claim_tx.lock().take()?;
        let (reply, reply_rx) = oneshot::channel();
        claim_tx.send(ClaimRequest { reply }).ok()?;
        reply_rx.await.ok()
    }
}

impl PartialEq for ProviderHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ProviderHandle {}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// What happened to a registration while its provider was waiting.
pub enum LeaseEvent {
    /// A consumer claimed the name and wants the connection.
    Claimed(Claim),
    /// The handle was closed (evicted) or the claim was abandoned.
    Closed,
}

/// Provider-session side of a [`ProviderHandle`].
pub struct ProviderLease {
    handle: ProviderHandle,
    claim_rx: oneshot::Receiver<ClaimRequest>,
}

impl ProviderLease {
    /// The handle this lease belongs to.
    pub fn handle(&self) -> &ProviderHandle {
        &self.handle
    }

    /// Wait until the registration is claimed or closed.
    ///
    /// Cancel safe, so it can sit in a `select!` next to the keep-alive read.
    pub async fn next_event(&mut self) -> LeaseEvent {
        tokio::select! {
            biased;
            _ = self.handle.inner.closed.cancelled() => LeaseEvent::Closed,
            request = &mut self.claim_rx => match request {
                Ok(request) => LeaseEvent::Claimed(Claim { reply: request.reply }),
                Err(_) => LeaseEvent::Closed,
            },
        }
    }
}

/// A pending hand-off of the provider connection to a consumer.
pub struct Claim {
    reply: oneshot::Sender<RelayStream>,
}

impl Claim {
    /// Give the connection to the claiming consumer. Returns it back if the
    /// consumer went away in the meantime.
    pub fn hand_over(self, stream: RelayStream) -> std::result::Result<(), RelayStream> {
        self.reply.send(stream)
    }
}

/// Thread-safe mapping from service name to its live provider.
///
/// All operations run under one lock, are O(1) (except [`names`](Self::names))
/// and do no I/O.
#[derive(Default)]
pub struct Registry {
    services: Mutex<HashMap<ServiceName, ProviderHandle>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` as the provider for its name.
    ///
    /// Last registration wins: a previous handle for the same name is
    /// removed and returned so the caller can close it outside the lock.
    pub fn register(&self, handle: ProviderHandle) -> Option<ProviderHandle> {
        let name = handle.name().clone();
        let id = handle.id();
        let previous = self.services.lock().insert(name.clone(), handle);
        match &previous {
            Some(old) => debug!(service = %name, id, evicted = old.id(), "replaced provider"),
            None => debug!(service = %name, id, "registered provider"),
        }
        previous
    }

    /// Remove and return the provider registered under `name`.
    ///
    /// A registration serves exactly one consumer; a second claim of the same
    /// name fails with [`Error::NotFound`] until the provider registers again.
    pub fn claim_for_consumer(&self, name: &ServiceName) -> Result<ProviderHandle> {
        let claimed = self.services.lock().remove(name.as_str());
        match claimed {
            Some(handle) => {
                debug!(service = %name, id = handle.id(), "claimed provider");
                Ok(handle)
            }
            None => Err(Error::NotFound(name.clone())),
        }
    }

    /// Remove the registration for `name` only if it is still `handle`.
    ///
    /// Returns `false` when the name was already re-registered, claimed, or
    /// never registered.
    pub fn unregister_if_current(&self, name: &ServiceName, handle: &ProviderHandle) -> bool {
        let mut services = self.services.lock();
        match services.get(name.as_str()) {
            Some(current) if current == handle => {
                services.remove(name.as_str());
                drop(services);
                debug!(service = %name, id = handle.id(), "unregistered provider");
                true
            }
            _ => false,
        }
    }

    /// Whether a provider is currently registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.services.lock().contains_key(name)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.services.lock().len()
    }

    /// Whether no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.services.lock().is_empty()
    }

    /// Snapshot of the registered names, sorted.
    pub fn names(&self) -> Vec<ServiceName> {
        let mut names: Vec<_> = self.services.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("services", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::TransportKind;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn name(s: &str) -> ServiceName {
        ServiceName::new(s).unwrap()
    }

    fn handle(s: &str) -> (ProviderHandle, ProviderLease) {
        ProviderHandle::new(name(s), PeerInfo::new(None, TransportKind::Memory))
    }

    #[test]
    fn register_evicts_previous_and_claim_returns_latest() {
        let registry = Registry::new();
        let (h1, _l1) = handle("cam1");
        let (h2, _l2) = handle("cam1");

        assert!(registry.register(h1.clone()).is_none());
        let evicted = registry.register(h2.clone()).expect("h1 should be evicted");
        assert_eq!(evicted, h1);
        assert_ne!(evicted, h2);

        let claimed = registry.claim_for_consumer(&name("cam1")).unwrap();
        assert_eq!(claimed, h2);
    }

    #[test]
    fn claim_unknown_is_not_found() {
        let registry = Registry::new();
        match registry.claim_for_consumer(&name("nope")) {
            Err(Error::NotFound(n)) => assert_eq!(n.as_str(), "nope"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn claim_is_single_use() {
        let registry = Registry::new();
        let (h, _lease) = handle("cam1");
        registry.register(h);

        assert!(registry.claim_for_consumer(&name("cam1")).is_ok());
        assert!(matches!(
            registry.claim_for_consumer(&name("cam1")),
            Err(Error::NotFound(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_only_removes_current() {
        let registry = Registry::new();
        let (h1, _l1) = handle("cam1");
        let (h2, _l2) = handle("cam1");
        let cam1 = name("cam1");

        registry.register(h1.clone());
        registry.register(h2.clone());
        assert!(!registry.unregister_if_current(&cam1, &h1));
        assert!(registry.contains("cam1"));

        assert!(registry.unregister_if_current(&cam1, &h2));
        assert!(!registry.contains("cam1"));
        assert!(!registry.unregister_if_current(&cam1, &h2));

        let (h3, _l3) = handle("cam1");
        registry.register(h3.clone());
        registry.claim_for_consumer(&cam1).unwrap();
        assert!(!registry.unregister_if_current(&cam1, &h3));
    }

    #[test]
    fn names_snapshot() {
        let registry = Registry::new();
        let (b, _lb) = handle("b");
        let (a, _la) = handle("a");
        registry.register(b);
        registry.register(a);
        assert_eq!(registry.len(), 2);
        let names: Vec<_> = registry.names().iter().map(|n| n.to_string()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn close_is_idempotent() {
        let (h, _lease) = handle("cam1");
        let other = h.clone();
        h.close();
        other.close();
        assert!(h.is_closed());
    }

    #[tokio::test]
    async fn concurrent_register_keeps_exactly_one() {
        let registry = Arc::new(Registry::new());
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.spawn(async move {
                let (h, lease) = handle("cam1");
                if let Some(old) = registry.register(h) {
                    old.close();
                }
                lease
            });
        }
        let mut leases = Vec::new();
        while let Some(lease) = tasks.join_next().await {
            leases.push(lease.unwrap());
        }

        assert_eq!(registry.len(), 1);
        let open: Vec<_> = leases
            .iter()
            .filter(|l| !l.handle().is_closed())
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(
            registry.claim_for_consumer(&name("cam1")).unwrap(),
            *open[0].handle()
        );
    }

    #[tokio::test]
    async fn take_stream_hands_over_connection() {
        let (h, mut lease) = handle("cam1");
        let (near, mut far) = tokio::io::duplex(64);
        let stream = RelayStream::new(near, PeerInfo::new(None, TransportKind::Memory));

        let provider = tokio::spawn(async move {
            match lease.next_event().await {
                LeaseEvent::Claimed(claim) => assert!(claim.hand_over(stream).is_ok()),
                LeaseEvent::Closed => panic!("lease closed unexpectedly"),
            }
        });

        let mut taken = tokio::time::timeout(Duration::from_secs(1), h.take_stream())
            .await
            .unwrap()
            .expect("stream should be handed over");
        provider.await.unwrap();

        taken.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(h.take_stream().await.is_none());
    }

    #[tokio::test]
    async fn take_stream_fails_once_closed_or_provider_gone() {
        let (h, mut lease) = handle("cam1");
        h.close();
        assert!(matches!(lease.next_event().await, LeaseEvent::Closed));
        assert!(h.take_stream().await.is_none());

        let (h, lease) = handle("cam2");
        drop(lease);
        assert!(h.take_stream().await.is_none());
    }
}
