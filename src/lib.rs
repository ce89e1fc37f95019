//! htpool - bounded session pool for a Hypertable-style RPC service
//!
//! Units of work check a [`RemoteSession`] out of a shared [`ConnectionPool`]
//! through a [`SessionScope`], open namespaces on it, and hand it back with an
//! [`Outcome`] telling the pool whether the transport can be trusted again.

pub mod cli;
pub mod config;
pub mod core;
pub mod pool;
pub mod session;
pub mod transport;

pub use crate::config::Config;
pub use crate::core::Core;
pub use pool::{ConnectionPool, Outcome, PoolConfig, PoolError, PoolStats, PooledSession, SessionKind, SessionScope};
pub use session::{NamespaceRegistry, RemoteSession, SessionError, SessionId};
pub use transport::{Connector, NamespaceId, Transport, TransportError};
