//! Authorization hook consulted before a session touches the registry.
//!
//! The broker ships no policy; embedders plug one in through [`Authorizer`].

use std::fmt;

use crate::name::ServiceName;
use crate::stream::PeerInfo;

/// Which side of a rendezvous a session wants to act as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Registers a service.
    Provider,
    /// Requests a service.
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provider => f.write_str("provider"),
            Self::Consumer => f.write_str("consumer"),
        }
    }
}

/// Everything an [`Authorizer`] gets to decide on.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    /// Requested role.
    pub role: Role,
    /// Service name from the control line.
    pub name: &'a ServiceName,
    /// Connection the request arrived on.
    pub peer: &'a PeerInfo,
}

/// Refusal returned by an [`Authorizer`]. The reason is logged, never sent
/// to the peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct AccessDenied {
    /// Why access was refused.
    pub reason: String,
}

impl AccessDenied {
    /// Create a refusal.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Policy hook deciding whether a peer may register or request a name.
///
/// Called once per session, after the control line is parsed and before
/// the registry is touched. Must not block.
pub trait Authorizer: Send + Sync + 'static {
    /// Allow or refuse the request.
    fn authorize(&self, request: &AccessRequest<'_>) -> Result<(), AccessDenied>;
}

/// Accepts every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _request: &AccessRequest<'_>) -> Result<(), AccessDenied> {
        Ok(())
    }
}

impl<F> Authorizer for F
where
    F: Fn(&AccessRequest<'_>) -> Result<(), AccessDenied> + Send + Sync + 'static,
{
    fn authorize(&self, request: &AccessRequest<'_>) -> Result<(), AccessDenied> {
        self(request)
    }
}
