//! # Run Controller
//!
//! Orchestrates one load test from resolved configuration to final snapshot.
//!
//! ## Key Components
//!
//! - **RunConfig**: Resolved, validated run parameters
//! - **StopSignal**: Run-wide cooperative cancellation flag
//! - **BatchPacer**: Admission gate that starts clients in timed batches
//! - **BenchmarkRunner**: Spawns the virtual clients, waits for all of them and
//!   finalizes the metrics
//!
//! ## Run Lifecycle
//!
//! 1. **Validation**: `RunConfig::validate` rejects bad parameters before any
//!    client starts
//! 2. **Admission**: clients are spawned in batches of `connection_rate`, with
//!    a `batch_interval` pause between batches (rate 0 spawns all at once)
//! 3. **Execution**: every client runs independently on the tokio runtime
//! 4. **Join**: the runner waits for every client task to end, then consumes
//!    the aggregator to produce the snapshot
//!
//! Stopping is cooperative. Once the stop signal fires no further batches are
//! admitted and every running client exits at its next check.

use crate::{
    cli::{Args, Protocol},
    connection::{ActiveConnections, ConnectionManager, RetryPolicy},
    driver::{ExitReason, VirtualClient},
    metrics::{MetricsAggregator, MetricsSnapshot},
    transport::{Connector, ConnectorFactory},
    utils,
    workload::WorkloadMix,
};
use anyhow::{anyhow, bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A helper struct to provide a consistent, single source of truth for displaying
/// the run configuration.
struct RunConfigDisplay<'a> {
    config: &'a RunConfig,
    endpoint: &'a str,
}

impl<'a> std::fmt::Display for RunConfigDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.config;
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting Load Test for: {}", config.protocol)?;
        writeln!(f, "  Target:             {}", self.endpoint)?;
        writeln!(f, "  Virtual Clients:    {}", config.clients)?;
        if config.operations > 0 {
            writeln!(f, "  Operations/Client:  {}", config.operations)?;
        } else {
            writeln!(f, "  Operations/Client:  unlimited")?;
        }
        if let Some(duration) = config.duration {
            writeln!(f, "  Test Duration:      {:?}", duration)?;
        }
        writeln!(f, "  Payload Size:       {} bytes", config.payload_size)?;
        if config.protocol == Protocol::Redis {
            writeln!(
                f,
                "  Operation Mix:      GET {:.0}% / SET {:.0}% / DEL {:.0}%",
                config.mix.weight(crate::protocol::OperationKind::Read) * 100.0,
                config.mix.weight(crate::protocol::OperationKind::Write) * 100.0,
                config.mix.weight(crate::protocol::OperationKind::Delete) * 100.0
            )?;
            writeln!(
                f,
                "  Key Pool:           {} keys/client ({} seeded)",
                config.key_pool_size, config.seed_writes
            )?;
        }
        if !config.interval.is_zero() {
            writeln!(f, "  Send Interval:      {:?}", config.interval)?;
        }
        if config.connection_rate > 0 {
            writeln!(
                f,
                "  Connection Rate:    {} per {:?}",
                config.connection_rate, config.batch_interval
            )?;
        } else {
            writeln!(f, "  Connection Rate:    unlimited")?;
        }
        writeln!(
            f,
            "  Connect Timeout:    {:?} ({} retries, {:?} backoff step)",
            config.retry.connect_timeout, config.retry.max_retries, config.retry.backoff_base
        )?;
        writeln!(f, "  Operation Timeout:  {:?}", config.op_timeout)?;
        if let Some(seed) = config.seed {
            writeln!(f, "  Random Seed:        {}", seed)?;
        }
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Configuration for one load-test run
///
/// Resolved from the command line by [`RunConfig::from_args`], with the
/// protocol-specific defaults filled in. Zero for `operations` means "no
/// count limit"; `None` for `duration` means "no time limit".
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub protocol: Protocol,

    /// `host:port` for RESP, `ws://host:port[/path]` for WebSocket
    pub target: String,

    /// Number of virtual clients
    pub clients: usize,

    /// Operations per client; 0 runs until the duration elapses or the run is stopped
    pub operations: usize,

    /// Wall-clock bound per client
    pub duration: Option<Duration>,

    /// Size of SET values and broadcast payloads in bytes
    pub payload_size: usize,

    /// Operation category bands (key-value workload only)
    pub mix: WorkloadMix,

    /// Pause between consecutive operations of one client
    pub interval: Duration,

    /// Clients started per batch; 0 starts all clients at once
    pub connection_rate: usize,

    /// Pause between connection batches
    pub batch_interval: Duration,

    pub retry: RetryPolicy,

    /// Per-operation reply deadline
    pub op_timeout: Duration,

    /// Keys per client in the key-value workload
    pub key_pool_size: usize,

    /// SETs issued by each key-value client before its main loop
    pub seed_writes: usize,

    /// Base seed for the per-client random sources
    pub seed: Option<u64>,

    /// Percentiles to report (0.0 - 100.0)
    pub percentiles: Vec<f64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::for_protocol(Protocol::Redis)
    }
}

impl RunConfig {
    /// Defaults for `protocol`
    pub fn for_protocol(protocol: Protocol) -> Self {
        let (target, clients, operations, connection_rate) = match protocol {
            Protocol::Redis => (
                crate::defaults::REDIS_TARGET,
                crate::defaults::REDIS_CLIENTS,
                crate::defaults::REDIS_OPERATIONS,
                0,
            ),
            Protocol::WebSocket => (
                crate::defaults::WEBSOCKET_TARGET,
                crate::defaults::WEBSOCKET_CLIENTS,
                crate::defaults::WEBSOCKET_MESSAGES,
                crate::defaults::WEBSOCKET_CONNECTION_RATE,
            ),
        };
        Self {
            protocol,
            target: target.to_string(),
            clients,
            operations,
            duration: None,
            payload_size: crate::defaults::PAYLOAD_SIZE,
            mix: match protocol {
                Protocol::Redis => WorkloadMix::default(),
                Protocol::WebSocket => WorkloadMix::broadcast(),
            },
            interval: Duration::ZERO,
            connection_rate,
            batch_interval: crate::defaults::BATCH_INTERVAL,
            retry: RetryPolicy::default(),
            op_timeout: crate::defaults::OPERATION_TIMEOUT,
            key_pool_size: crate::defaults::KEY_POOL_SIZE,
            seed_writes: crate::defaults::SEED_WRITES,
            seed: None,
            percentiles: crate::defaults::PERCENTILES.to_vec(),
        }
    }

    /// Create run configuration from CLI arguments
    ///
    /// Options left unset on the command line take the protocol's defaults.
    /// The result is validated before it is returned.
    pub fn from_args(args: &Args) -> Result<Self> {
        let defaults = Self::for_protocol(args.protocol);

        let mix = match args.protocol {
            Protocol::Redis => WorkloadMix::key_value(args.read_ratio, args.write_ratio)
                .context("Invalid operation mix")?,
            Protocol::WebSocket => WorkloadMix::broadcast(),
        };

        let config = Self {
            protocol: args.protocol,
            target: args.target.clone().unwrap_or(defaults.target),
            clients: args.clients.unwrap_or(defaults.clients),
            operations: args.operations.unwrap_or(defaults.operations),
            // Zero keeps the historical meaning of "no time limit"
            duration: args.duration.filter(|d| !d.is_zero()),
            payload_size: args.payload_size,
            mix,
            interval: args.interval,
            connection_rate: args.connection_rate.unwrap_or(defaults.connection_rate),
            batch_interval: args.batch_interval,
            retry: RetryPolicy {
                connect_timeout: args.connect_timeout,
                max_retries: args.retries,
                backoff_base: args.retry_backoff,
            },
            op_timeout: args.op_timeout,
            key_pool_size: args.key_pool_size,
            seed_writes: args.seed_writes,
            seed: args.seed,
            percentiles: args.percentiles.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<()> {
        if self.clients == 0 {
            bail!("At least one virtual client is required");
        }
        utils::validate_payload_size(self.payload_size)?;
        utils::validate_timeout("Connect timeout", self.retry.connect_timeout)?;
        utils::validate_timeout("Operation timeout", self.op_timeout)?;
        utils::validate_percentiles(&self.percentiles)?;
        if self.protocol == Protocol::Redis {
            if self.key_pool_size == 0 {
                bail!("Key pool size must be greater than 0");
            }
            if self.seed_writes > self.key_pool_size {
                bail!(
                    "Seed writes ({}) cannot exceed the key pool size ({})",
                    self.seed_writes,
                    self.key_pool_size
                );
            }
        }
        if self.connection_rate > 0 && self.batch_interval.is_zero() {
            bail!("Batch interval must be greater than 0 when the connection rate is limited");
        }
        Ok(())
    }

    /// Neither an operation count nor a duration bounds the run
    pub fn is_unbounded(&self) -> bool {
        self.operations == 0 && self.duration.is_none()
    }
}

/// Run-wide stop flag.
///
/// Cloning shares the flag. Once triggered it stays set.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Resolve once the signal has been triggered
    pub async fn stopped(&self) {
        loop {
            // Register before checking the flag so a trigger in between is not missed
            let notified = self.inner.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless stopped first. Returns `false` if stopped.
    pub async fn sleep_or_stop(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_stopped(),
            _ = self.stopped() => false,
        }
    }
}

/// Admission gate for connection batches
pub struct BatchPacer {
    rate: usize,
    interval: Duration,
    admitted_in_batch: usize,
    batches: usize,
}

impl BatchPacer {
    pub fn new(rate: usize, interval: Duration) -> Self {
        Self {
            rate,
            interval,
            admitted_in_batch: 0,
            batches: 0,
        }
    }

    /// Wait until one more client may start. Returns `false` if the run was
    /// stopped while waiting.
    pub async fn admit(&mut self, stop: &StopSignal) -> bool {
        if self.rate == 0 {
            return !stop.is_stopped();
        }
        if self.admitted_in_batch == self.rate {
            self.batches += 1;
            debug!(
                "Connection batch {} started ({} clients), pausing {:?}",
                self.batches, self.rate, self.interval
            );
            if !stop.sleep_or_stop(self.interval).await {
                return false;
            }
            self.admitted_in_batch = 0;
        }
        self.admitted_in_batch += 1;
        true
    }
}

/// Interval between progress log lines while a run is in flight
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Load-test runner that coordinates the virtual clients of one run
///
/// ## Usage Pattern
///
/// ```rust,no_run
/// # use netbox_stress::benchmark::{BenchmarkRunner, RunConfig, StopSignal};
/// # use netbox_stress::cli::Protocol;
/// #
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let config = RunConfig {
///     clients: 20,
///     operations: 500,
///     ..RunConfig::for_protocol(Protocol::Redis)
/// };
/// let runner = BenchmarkRunner::new(config, StopSignal::new())?;
/// let snapshot = runner.run().await?;
/// println!("{} operations succeeded", snapshot.operations.succeeded);
/// # Ok(())
/// # }
/// ```
pub struct BenchmarkRunner {
    config: Arc<RunConfig>,
    connector: Arc<dyn Connector>,
    stop: StopSignal,
}

impl BenchmarkRunner {
    /// Create a runner for `config`, connecting through the protocol's connector
    pub fn new(config: RunConfig, stop: StopSignal) -> Result<Self> {
        let connector = ConnectorFactory::create(config.protocol, &config.target)
            .with_context(|| format!("Invalid target {:?}", config.target))?;
        Self::with_connector(config, connector, stop)
    }

    /// Create a runner using a caller-supplied connector
    pub fn with_connector(
        config: RunConfig,
        connector: Arc<dyn Connector>,
        stop: StopSignal,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            connector,
            stop,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run every virtual client to completion and return the final snapshot
    ///
    /// Per-client failures never abort the run; they end up in the snapshot.
    /// The only errors returned here are internal ones.
    pub async fn run(&self) -> Result<MetricsSnapshot> {
        info!(
            "{}",
            RunConfigDisplay {
                config: &self.config,
                endpoint: self.connector.endpoint(),
            }
        );
        if self.config.is_unbounded() {
            warn!("Neither an operation count nor a duration is set; running until interrupted");
        }

        let metrics = Arc::new(MetricsAggregator::new(self.config.percentiles.clone()));
        let active = ActiveConnections::default();
        let manager = Arc::new(ConnectionManager::new(
            Arc::clone(&self.connector),
            self.config.retry.clone(),
            Arc::clone(&metrics),
            active.clone(),
        ));

        let started = Instant::now();
        let progress = tokio::spawn(report_progress(Arc::clone(&metrics), active.clone()));

        let mut tasks = JoinSet::new();
        let mut pacer = BatchPacer::new(self.config.connection_rate, self.config.batch_interval);
        for client_id in 0..self.config.clients {
            if !pacer.admit(&self.stop).await {
                warn!(
                    "Stop requested; {} of {} clients were started",
                    client_id, self.config.clients
                );
                break;
            }
            let client = VirtualClient::new(
                client_id,
                Arc::clone(&self.config),
                Arc::clone(&manager),
                Arc::clone(&metrics),
                self.stop.clone(),
            );
            tasks.spawn(client.run());
        }
        info!("All {} client tasks started", tasks.len());

        let mut connect_failures = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(summary) => {
                    if summary.exit == ExitReason::ConnectFailed {
                        connect_failures += 1;
                    }
                }
                Err(e) => {
                    error!("Client task failed: {}", e);
                    metrics.record_error(format!("client task failed: {}", e));
                }
            }
        }
        let elapsed = started.elapsed();

        progress.abort();
        let _ = progress.await;
        drop(manager);

        if connect_failures > 0 {
            warn!("{} client(s) could not connect", connect_failures);
        }
        info!(
            "Load test completed in {} (peak {} concurrent connections)",
            utils::format_duration(elapsed),
            active.peak()
        );

        let metrics = Arc::try_unwrap(metrics)
            .map_err(|_| anyhow!("metrics still shared after every client finished"))?;
        let mut snapshot = metrics.finalize(elapsed)?;
        snapshot.connections.peak_active = active.peak();
        Ok(snapshot)
    }
}

async fn report_progress(metrics: Arc<MetricsAggregator>, active: ActiveConnections) {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let progress = metrics.progress();
        info!(
            "Progress: {} operations ({} failed), {} active connections",
            progress.operations,
            progress.failures,
            active.current()
        );
    }
}
