use anyhow::Result;
use clap::{Parser, Subcommand};

use htpool::cli::{self, commands};
use htpool::{config, Core};

#[derive(Parser)]
#[command(name = "htpool")]
#[command(version, about = "Bounded session pool for a Hypertable-style RPC service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (environment variables are used when absent)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Override the remote host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Override the remote port
    #[arg(long, global = true)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open sessions against the remote service and report pool stats
    Check {
        /// Sessions to hold at once
        #[arg(long, default_value = "1")]
        sessions: usize,
    },

    /// Run concurrent units of work against an in-process service
    Simulate {
        /// Concurrent workers
        #[arg(long, default_value = "8")]
        workers: usize,

        /// Units of work to run in total
        #[arg(long, default_value = "1000")]
        units: usize,

        /// Probability that a unit ends with a transport fault
        #[arg(long, default_value = "0.05")]
        fault_rate: f64,

        /// Namespace each unit opens (repeatable)
        #[arg(long = "namespace")]
        namespaces: Vec<String>,

        /// Seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    cli::init_logging(&cli.log_level)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Load configuration, then apply command-line overrides
    let mut config = config::load_config(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.remote.host = host;
    }
    if let Some(port) = cli.port {
        config.remote.port = port;
    }
    config.validate()?;

    match cli.command {
        Commands::Check { sessions } => {
            let core = Core::new(config)?;
            commands::cmd_check(&core, sessions).await?;
        }
        Commands::Simulate {
            workers,
            units,
            fault_rate,
            namespaces,
            seed,
        } => {
            let cmd = commands::CmdSimulate::new(workers, units, fault_rate, namespaces, seed)?;
            commands::cmd_simulate(&config, cmd).await?;
        }
        Commands::Config => {
            commands::cmd_config(&config)?;
        }
    }

    Ok(())
}
