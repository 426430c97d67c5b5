//! Named-service relay broker.
//!
//! A provider registers a byte-stream service under a name; a consumer asks
//! for that name and is bridged to the provider's connection without ever
//! learning where the provider lives. Sessions arrive over raw TCP or
//! WebSocket and are handled identically once adapted to a byte stream.

#![deny(missing_docs)]

pub mod agent;
pub mod auth;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod name;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod stream;
pub mod ws;

// Re-export key types
pub use agent::{Backoff, LocalForwarder, ProviderAgent};
pub use auth::{AccessDenied, AccessRequest, AllowAll, Authorizer, Role};
pub use bridge::{Bridge, BridgeStats};
pub use client::{BrokerAddr, RelayClient};
pub use config::BrokerConfig;
pub use error::{Error, Result};
pub use name::ServiceName;
pub use registry::{ProviderHandle, Registry};
pub use server::{BrokerBuilder, BrokerGuard};
pub use session::{SessionEnd, SessionHandler};
pub use stream::{PeerInfo, RelayStream, Transport, TransportKind};
pub use ws::WsStream;

pub use tokio_util::sync::CancellationToken;
