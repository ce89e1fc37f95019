use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::Config;
use crate::pool::{ConnectionPool, PoolStats, SessionScope};
use crate::transport::{Connector, TcpConnector};

/// Application object shared by every unit of work
///
/// Holds the configuration and the one pool for the process. Clones share the
/// same pool, so handing a clone to each task is how units of work get at it.
#[derive(Clone, Debug)]
pub struct Core {
    pub config: Arc<Config>,
    pool: ConnectionPool,
}

impl Core {
    /// Build a core that talks to the configured TCP endpoint
    pub fn new(config: Config) -> Result<Self> {
        let connector = TcpConnector::new(config.remote.host.clone(), config.remote.port);
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let target = connector.target();

        let pool = ConnectionPool::new(config.pool_config(), connector)
            .context("Failed to create connection pool")?;

        tracing::info!(
            target_addr = %target,
            pool_size = config.pool.pool_size,
            max_overflow = config.pool.max_overflow,
            "Connection pool ready"
        );

        Ok(Self {
            config: Arc::new(config),
            pool,
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Scope for one unit of work
    pub fn scope(&self) -> SessionScope {
        self.pool.scope()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close idle sessions and refuse further checkouts
    pub async fn shutdown(&self) -> Result<()> {
        self.pool
            .shutdown()
            .await
            .context("Connection pool shutdown reported errors")?;
        tracing::info!("Core shut down");
        Ok(())
    }
}
