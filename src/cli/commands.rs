use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::core::Core;
use crate::pool::{Outcome, PoolStats, SessionScope};
use crate::session::SessionError;
use crate::transport::{MemoryService, ServiceStats, TransportError};

/// Simulate command - drive the pool with concurrent units of work
#[derive(Debug, Clone)]
pub struct CmdSimulate {
    pub workers: usize,
    pub units: usize,
    pub fault_rate: f64,
    pub namespaces: Vec<String>,
    pub seed: Option<u64>,
}

impl CmdSimulate {
    pub fn new(
        workers: usize,
        units: usize,
        fault_rate: f64,
        namespaces: Vec<String>,
        seed: Option<u64>,
    ) -> Result<Self> {
        if workers == 0 {
            anyhow::bail!("--workers must be at least 1");
        }
        if !(0.0..=1.0).contains(&fault_rate) {
            anyhow::bail!("--fault-rate must be between 0 and 1, got {}", fault_rate);
        }
        let namespaces = if namespaces.is_empty() {
            vec!["default".to_string()]
        } else {
            namespaces
        };
        Ok(Self {
            workers,
            units,
            fault_rate,
            namespaces,
            seed,
        })
    }
}

/// What a simulation run did
#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    pub completed: usize,
    pub faulted: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub pool: PoolStats,
    pub service: ServiceStats,
}

/// Open `sessions` sessions concurrently against the configured endpoint,
/// hand them back, and print what the pool did.
pub async fn cmd_check(core: &Core, sessions: usize) -> Result<()> {
    let pool_config = core.pool().config();
    let limit = pool_config.capacity + pool_config.overflow_limit;
    if sessions == 0 || sessions > limit {
        anyhow::bail!(
            "--sessions must be between 1 and {} (pool_size + max_overflow)",
            limit
        );
    }

    let start = Instant::now();
    let mut tasks = JoinSet::new();
    for _ in 0..sessions {
        let pool = core.pool().clone();
        tasks.spawn(async move { pool.get().await });
    }

    let mut checked_out = Vec::with_capacity(sessions);
    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.context("Check task panicked")? {
            Ok(session) => checked_out.push(session),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to open session");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }

    println!(
        "Opened {}/{} sessions to {} in {:.2?}",
        checked_out.len(),
        sessions,
        core.config.address(),
        start.elapsed()
    );

    for session in checked_out {
        session.release(Outcome::Normal).await?;
    }

    print_pool_stats(&core.stats());
    core.shutdown().await?;

    match first_err {
        Some(e) => Err(anyhow::Error::new(e).context(format!("Could not reach {}", core.config.address()))),
        None => Ok(()),
    }
}

/// Run units of work against an in-memory service and check nothing leaks
pub async fn cmd_simulate(config: &Config, cmd: CmdSimulate) -> Result<()> {
    let report = run_simulation(config, &cmd).await?;

    println!(
        "Ran {} units on {} workers in {:.2?}: {} completed, {} transport faults, {} failed",
        cmd.units,
        cmd.workers,
        report.elapsed,
        report.completed,
        report.faulted,
        report.failed
    );
    print_pool_stats(&report.pool);
    print_service_stats(&report.service);

    let limit = config.pool.pool_size + config.pool.max_overflow;
    if report.service.connects > report.pool.total_created {
        anyhow::bail!("Service saw more connects than the pool created");
    }
    if report.pool.live() > limit || report.service.peak_connections > limit {
        anyhow::bail!("Pool exceeded its limit of {} sessions", limit);
    }

    println!("No sessions or namespaces leaked");
    Ok(())
}

/// Drive the simulation and shut the pool down, failing on any leak
pub async fn run_simulation(config: &Config, cmd: &CmdSimulate) -> Result<SimulationReport> {
    let service = MemoryService::new();
    let core = Core::with_connector(config.clone(), Arc::new(service.clone()))?;

    let remaining = Arc::new(AtomicUsize::new(cmd.units));
    let namespaces = Arc::new(cmd.namespaces.clone());
    let start = Instant::now();

    let mut workers = JoinSet::new();
    for worker in 0..cmd.workers {
        let core = core.clone();
        let remaining = Arc::clone(&remaining);
        let namespaces = Arc::clone(&namespaces);
        let fault_rate = cmd.fault_rate;
        let mut rng = match cmd.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(worker as u64)),
            None => StdRng::from_entropy(),
        };

        workers.spawn(async move {
            let mut tally = SimulationReport::default();
            while take_unit(&remaining) {
                let inject_fault = rng.gen_bool(fault_rate);
                let hold = Duration::from_micros(rng.gen_range(0..500));

                let mut scope = core.scope();
                let result = run_unit(&mut scope, &namespaces, hold, inject_fault).await;
                let outcome = match &result {
                    Ok(()) => Outcome::Normal,
                    Err(e) => Outcome::from_error(e.as_ref()),
                };

                match (&result, outcome) {
                    (Ok(()), _) => tally.completed += 1,
                    (Err(_), Outcome::TransportFault) => tally.faulted += 1,
                    (Err(e), Outcome::Normal) => {
                        tracing::warn!(worker, error = %e, "Unit of work failed");
                        tally.failed += 1;
                    }
                }

                if let Err(e) = scope.release(outcome).await {
                    tracing::warn!(worker, error = %e, "Release failed");
                    tally.failed += 1;
                }
            }
            tally
        });
    }

    let mut report = SimulationReport::default();
    while let Some(joined) = workers.join_next().await {
        let tally = joined.context("Simulation worker panicked")?;
        report.completed += tally.completed;
        report.faulted += tally.faulted;
        report.failed += tally.failed;
    }
    report.elapsed = start.elapsed();

    core.shutdown().await?;
    report.pool = core.stats();
    report.service = service.stats();

    if service.live_connections() != 0 {
        anyhow::bail!(
            "{} connections still open after shutdown",
            service.live_connections()
        );
    }
    let leaked = service.open_namespaces();
    if !leaked.is_empty() {
        anyhow::bail!("Namespaces still open after shutdown: {:?}", leaked);
    }

    Ok(report)
}

fn take_unit(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

async fn run_unit(
    scope: &mut SessionScope,
    namespaces: &[String],
    hold: Duration,
    inject_fault: bool,
) -> Result<()> {
    let session = scope.acquire().await?;
    for name in namespaces {
        session.open_namespace(name).await?;
    }

    tokio::time::sleep(hold).await;

    if inject_fault {
        let err = SessionError::from(TransportError::Fault("injected fault".to_string()));
        return Err(err).context("Unit of work interrupted");
    }
    Ok(())
}

/// Print the effective configuration as YAML
pub fn cmd_config(config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    print!("{}", yaml);
    Ok(())
}

fn print_pool_stats(stats: &PoolStats) {
    println!("Pool:");
    println!("  capacity:        {} (+{} overflow)", stats.capacity, stats.overflow_limit);
    println!("  idle:            {}", stats.idle);
    println!("  live:            {} pooled, {} overflow", stats.pooled, stats.overflow);
    println!("  checked out:     {}", stats.checked_out);
    println!("  created:         {}", stats.total_created);
    println!("  reused:          {}", stats.total_reused);
    println!("  discarded:       {}", stats.total_discarded);
    println!("  failed connects: {}", stats.failed_connects);
    println!("  closed:          {}", stats.closed);
}

fn print_service_stats(stats: &ServiceStats) {
    println!("Service:");
    println!("  connects:        {}", stats.connects);
    println!("  disconnects:     {}", stats.disconnects);
    println!("  peak live:       {}", stats.peak_connections);
    println!("  namespace opens: {}", stats.namespace_opens);
    println!(
        "  namespace closes: {} ({} failed)",
        stats.namespace_close_attempts, stats.namespace_close_failures
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pool_size: usize, max_overflow: usize) -> Config {
        let mut config = Config::default();
        config.pool.pool_size = pool_size;
        config.pool.max_overflow = max_overflow;
        config
    }

    #[test]
    fn test_simulate_args() {
        assert!(CmdSimulate::new(0, 10, 0.1, vec![], None).is_err());
        assert!(CmdSimulate::new(2, 10, 1.5, vec![], None).is_err());

        let cmd = CmdSimulate::new(2, 10, 0.0, vec![], None).unwrap();
        assert_eq!(cmd.namespaces, vec!["default".to_string()]);
    }

    #[test]
    fn test_take_unit() {
        let remaining = AtomicUsize::new(2);
        assert!(take_unit(&remaining));
        assert!(take_unit(&remaining));
        assert!(!take_unit(&remaining));
        assert_eq!(remaining.load(Ordering::Acquire), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_simulation_without_faults_reuses_sessions() {
        let cmd = CmdSimulate::new(8, 200, 0.0, vec!["logs".into(), "metrics".into()], Some(7)).unwrap();
        let report = run_simulation(&config(2, 2), &cmd).await.unwrap();

        assert_eq!(report.completed, 200);
        assert_eq!(report.faulted, 0);
        assert_eq!(report.failed, 0);
        assert!(report.pool.total_created <= 200);
        assert!(report.pool.total_reused > 0);
        assert!(report.pool.closed);
        assert_eq!(report.service.connects, report.service.disconnects);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_simulation_with_every_unit_faulting() {
        let cmd = CmdSimulate::new(4, 40, 1.0, vec![], Some(1)).unwrap();
        let report = run_simulation(&config(2, 1), &cmd).await.unwrap();

        assert_eq!(report.faulted, 40);
        // Faulted sessions are never recycled
        assert_eq!(report.pool.total_reused, 0);
        assert_eq!(report.pool.total_created, 40);
        assert_eq!(report.pool.total_discarded, 40);
    }

    #[test]
    fn test_config_prints() {
        assert!(cmd_config(&Config::default()).is_ok());
    }
}
