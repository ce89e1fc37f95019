//! CLI module for htpool
//!
//! Operational commands for the session pool:
//!
//! ```bash
//! # Open 4 sessions against the configured service and report pool stats
//! htpool --host ht-master --port 38080 check --sessions 4
//!
//! # Exercise the pool against an in-process service with fault injection
//! htpool simulate --workers 16 --units 1000 --fault-rate 0.05 --namespace logs
//!
//! # Show the effective configuration
//! htpool --config htpool.yaml config
//! ```

pub mod commands;

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging: `RUST_LOG` wins, otherwise `level`
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow::anyhow!("Invalid log level {:?}: {}", level, e))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    Ok(())
}
