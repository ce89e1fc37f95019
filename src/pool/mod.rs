//! Session pooling and per-unit-of-work scoping
//!
//! This module provides:
//! - A bounded pool with overflow allowance and FIFO waiters
//! - Tagging of overflow sessions so accounting stays exact
//! - A checkout guard that never recycles a session of unknown health
//! - Scopes binding at most one session to a unit of work

pub mod connection;
pub mod guard;
pub mod scope;

pub use connection::{ConnectionPool, PoolConfig, PoolError, PoolStats, SessionKind};
pub use guard::PooledSession;
pub use scope::{Outcome, SessionScope};
