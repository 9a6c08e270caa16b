use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// NetBox Stress - concurrent load tester for RESP key-value and WebSocket broadcast servers
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Protocol spoken by the target service
    #[clap(short = 'p', long, value_enum, default_value_t = Protocol::Redis, help_heading = "Core Options")]
    pub protocol: Protocol,

    /// Target endpoint: host:port for redis, ws://host:port[/path] for websocket
    /// [default: 127.0.0.1:6380 | ws://127.0.0.1:8001]
    #[clap(long, help_heading = "Core Options")]
    pub target: Option<String>,

    /// Number of concurrent virtual clients [default: 50 | 100]
    #[clap(short = 'c', long, help_heading = "Core Options")]
    pub clients: Option<usize>,

    /// Operations per client, 0 for no limit [default: 1000 | 100]
    #[clap(short = 'n', long, help_heading = "Core Options")]
    pub operations: Option<usize>,

    /// Test duration per client (e.g. 30s, 5m), 0 for no limit
    #[clap(short = 'd', long, value_parser = parse_duration, help_heading = "Core Options")]
    pub duration: Option<Duration>,

    /// Size of SET values and broadcast payloads in bytes
    #[clap(short = 's', long, default_value_t = crate::defaults::PAYLOAD_SIZE, help_heading = "Workload")]
    pub payload_size: usize,

    /// Fraction of GET operations (redis)
    #[clap(long, default_value_t = crate::defaults::READ_RATIO, help_heading = "Workload")]
    pub read_ratio: f64,

    /// Fraction of SET operations (redis); DEL takes the remainder
    #[clap(long, default_value_t = crate::defaults::WRITE_RATIO, help_heading = "Workload")]
    pub write_ratio: f64,

    /// Pause between consecutive operations of one client
    #[clap(short = 'i', long, value_parser = parse_duration, default_value = "0ms", help_heading = "Workload")]
    pub interval: Duration,

    /// Keys per client (redis)
    #[clap(long, default_value_t = crate::defaults::KEY_POOL_SIZE, help_heading = "Workload")]
    pub key_pool_size: usize,

    /// SETs issued per client before the measured loop (redis)
    #[clap(long, default_value_t = crate::defaults::SEED_WRITES, help_heading = "Workload")]
    pub seed_writes: usize,

    /// Seed for reproducible operation sequences
    #[clap(long, help_heading = "Workload")]
    pub seed: Option<u64>,

    /// Connections opened per batch, 0 for no limit [default: 0 | 10]
    #[clap(short = 'r', long, help_heading = "Connections")]
    pub connection_rate: Option<usize>,

    /// Pause between connection batches
    #[clap(long, value_parser = parse_duration, default_value = "1s", help_heading = "Connections")]
    pub batch_interval: Duration,

    /// Timeout for a single connection attempt
    #[clap(short = 't', long, value_parser = parse_duration, default_value = "10s", help_heading = "Connections")]
    pub connect_timeout: Duration,

    /// Connection retries after the first attempt
    #[clap(long, default_value_t = crate::defaults::MAX_RETRIES, help_heading = "Connections")]
    pub retries: u32,

    /// Backoff step; retry n waits n times this long
    #[clap(long, value_parser = parse_duration, default_value = "2s", help_heading = "Connections")]
    pub retry_backoff: Duration,

    /// Deadline for each reply
    #[clap(long, value_parser = parse_duration, default_value = "5s", help_heading = "Connections")]
    pub op_timeout: Duration,

    /// Percentiles to calculate for latency metrics
    #[clap(long, value_delimiter = ',', default_values_t = crate::defaults::PERCENTILES.to_vec(), help_heading = "Output")]
    pub percentiles: Vec<f64>,

    /// Output file for results (JSON format)
    #[clap(short = 'o', long, help_heading = "Output")]
    pub output_file: Option<PathBuf>,

    /// Number of error messages shown in the summary
    #[clap(long, default_value_t = crate::defaults::ERROR_SAMPLE, help_heading = "Output")]
    pub error_sample: usize,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count, help_heading = "Logging")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, conflicts_with = "verbose", help_heading = "Logging")]
    pub quiet: bool,

    /// Also write logs to this file
    #[clap(long, help_heading = "Logging")]
    pub log_file: Option<PathBuf>,
}

/// Protocol families the harness can drive
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// RESP key-value server over TCP
    #[clap(name = "redis")]
    Redis,

    /// WebSocket broadcast server
    #[clap(name = "websocket", alias = "ws")]
    WebSocket,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Redis => write!(f, "RESP (key-value)"),
            Protocol::WebSocket => write!(f, "WebSocket (broadcast)"),
        }
    }
}

/// Parse duration from string (e.g., "10s", "500ms", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let seconds = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(seconds).map_err(|e| format!("Invalid duration {}: {}", s, e))
}
