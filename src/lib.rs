//! # NetBox Stress Library
//!
//! A concurrent load-testing harness for network services, implemented in Rust.
//! It drives many independent virtual clients against a target service and
//! reports connection and operation outcomes, latency distributions and
//! throughput.
//!
//! ## Supported Protocols
//!
//! - **RESP key-value (redis)**: array-of-bulk-strings requests over TCP with a
//!   configurable GET / SET / DEL mix over a small per-client key pool
//! - **WebSocket broadcast (websocket)**: one JSON frame document per message,
//!   each followed by the next frame the server sends back
//!
//! ## Architecture Overview
//!
//! - `protocol`: wire codecs (RESP framing and reply decoding, frame documents)
//! - `transport`: `Connection` / `Connector` traits and their TCP and WebSocket implementations
//! - `connection`: connect timeout, linear-backoff retries and the active connection count
//! - `workload`: weighted operation selection and payload synthesis
//! - `driver`: the per-client run loop
//! - `metrics`: the shared aggregator and the final snapshot
//! - `benchmark`: run configuration, connection batching, stop handling
//! - `results`: JSON output and the console summary
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use netbox_stress::{BenchmarkRunner, Protocol, RunConfig, StopSignal};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RunConfig {
//!         target: "127.0.0.1:6380".to_string(),
//!         clients: 10,
//!         operations: 1000,
//!         ..RunConfig::for_protocol(Protocol::Redis)
//!     };
//!
//!     let runner = BenchmarkRunner::new(config, StopSignal::new())?;
//!     let snapshot = runner.run().await?;
//!
//!     println!("p99 latency: {:?}", snapshot.latency.map(|l| l.p99_ms));
//!     Ok(())
//! }
//! ```

/// Run controller
///
/// `RunConfig`, `BenchmarkRunner`, connection batching and the run-wide stop signal.
pub mod benchmark;

/// Command-line interface and configuration
///
/// Argument parsing with clap, including human-readable durations
/// (e.g., "10s", "500ms") and protocol selection.
pub mod cli;

pub mod connection;
pub mod driver;
pub mod error;
pub mod logging;

/// Concurrency-safe metrics aggregation and the finalized snapshot
pub mod metrics;

/// Wire codecs for the supported protocols
pub mod protocol;

/// JSON results and console summary
pub mod results;

/// Transport abstraction (`Connection`, `Connector`) and implementations
pub mod transport;

pub mod utils;
pub mod workload;

// Re-export key types for convenient library usage
pub use benchmark::{BenchmarkRunner, RunConfig, StopSignal};
pub use cli::{Args, Protocol};
pub use error::{ErrorKind, HarnessError};
pub use metrics::{LatencyStats, MetricsAggregator, MetricsSnapshot, ThroughputMetrics};
pub use protocol::{Operation, OperationKind, Reply};
pub use results::{ResultsManager, RunResults};

/// The current version of the harness
///
/// Populated from Cargo.toml and written into every JSON result.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default RESP target
    pub const REDIS_TARGET: &str = "127.0.0.1:6380";

    /// Default WebSocket target
    pub const WEBSOCKET_TARGET: &str = "ws://127.0.0.1:8001";

    pub const REDIS_CLIENTS: usize = 50;
    pub const WEBSOCKET_CLIENTS: usize = 100;

    /// Operations per RESP client
    pub const REDIS_OPERATIONS: usize = 1000;

    /// Messages per WebSocket client
    pub const WEBSOCKET_MESSAGES: usize = 100;

    /// WebSocket clients connect in batches of this size; RESP clients are not batched
    pub const WEBSOCKET_CONNECTION_RATE: usize = 10;

    /// Pause between connection batches
    pub const BATCH_INTERVAL: Duration = Duration::from_secs(1);

    /// Size of SET values and broadcast payloads in bytes
    pub const PAYLOAD_SIZE: usize = 100;

    /// Share of GET operations in the key-value mix
    pub const READ_RATIO: f64 = 0.70;

    /// Share of SET operations; DEL gets the remainder
    pub const WRITE_RATIO: f64 = 0.25;

    /// Keys per client
    ///
    /// Small on purpose: clients keep hitting the same keys, so reads find
    /// data and writes and deletes contend.
    pub const KEY_POOL_SIZE: usize = 100;

    /// SETs issued before the measured loop so early GETs find data
    pub const SEED_WRITES: usize = 10;

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_RETRIES: u32 = 3;

    /// Linear backoff step between connection attempts
    pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);

    /// Per-operation reply deadline
    pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

    pub const PERCENTILES: [f64; 4] = [50.0, 95.0, 99.0, 99.9];

    /// Error strings shown in the console summary
    pub const ERROR_SAMPLE: usize = 10;
}
