use crate::{
    benchmark::RunConfig,
    cli::Protocol,
    metrics::{LatencyStats, MetricsSnapshot},
    utils,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

/// Complete results of one load-test run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResults {
    pub metadata: RunMetadata,
    pub test_config: TestConfiguration,
    pub metrics: MetricsSnapshot,
}

/// Run identification for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub system_info: SystemInfo,
}

/// Test configuration used for the run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfiguration {
    pub protocol: Protocol,
    pub target: String,
    pub clients: usize,
    pub operations_per_client: usize,
    pub duration_secs: Option<f64>,
    pub payload_size: usize,
    pub read_ratio: f64,
    pub write_ratio: f64,
    pub delete_ratio: f64,
    pub interval_ms: f64,
    pub connection_rate: usize,
    pub connect_timeout_secs: f64,
    pub operation_timeout_secs: f64,
    pub max_retries: u32,
    pub seed: Option<u64>,
    pub percentiles: Vec<f64>,
}

impl From<&RunConfig> for TestConfiguration {
    fn from(config: &RunConfig) -> Self {
        use crate::protocol::OperationKind;
        Self {
            protocol: config.protocol,
            target: config.target.clone(),
            clients: config.clients,
            operations_per_client: config.operations,
            duration_secs: config.duration.map(|d| d.as_secs_f64()),
            payload_size: config.payload_size,
            read_ratio: config.mix.weight(OperationKind::Read),
            write_ratio: config.mix.weight(OperationKind::Write),
            delete_ratio: config.mix.weight(OperationKind::Delete),
            interval_ms: config.interval.as_secs_f64() * 1000.0,
            connection_rate: config.connection_rate,
            connect_timeout_secs: config.retry.connect_timeout.as_secs_f64(),
            operation_timeout_secs: config.op_timeout.as_secs_f64(),
            max_retries: config.retry.max_retries,
            seed: config.seed,
            percentiles: config.percentiles.clone(),
        }
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub rust_version: String,
    pub harness_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: utils::get_cpu_cores(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            harness_version: crate::VERSION.to_string(),
        }
    }
}

impl RunResults {
    pub fn new(config: &RunConfig, metrics: MetricsSnapshot) -> Self {
        Self {
            metadata: RunMetadata {
                run_id: utils::generate_test_id(),
                version: crate::VERSION.to_string(),
                timestamp: chrono::Utc::now(),
                system_info: SystemInfo::default(),
            },
            test_config: TestConfiguration::from(config),
            metrics,
        }
    }
}

/// Results manager for handling output
pub struct ResultsManager {
    output_file: Option<PathBuf>,
    error_sample: usize,
}

impl ResultsManager {
    pub fn new(output_file: Option<&Path>, error_sample: usize) -> Self {
        Self {
            output_file: output_file.map(Path::to_path_buf),
            error_sample,
        }
    }

    /// Print the summary and write the JSON file, if one was requested
    pub fn finalize(&self, results: &RunResults) -> Result<()> {
        println!("{}", render_summary(results, self.error_sample));

        if let Some(path) = &self.output_file {
            self.write_json(path, results)?;
            info!("Results written to: {:?}", path);
        }
        Ok(())
    }

    fn write_json(&self, path: &Path, results: &RunResults) -> Result<()> {
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write results to {:?}", path))?;
        Ok(())
    }
}

fn write_latency(out: &mut String, title: &str, stats: &Option<LatencyStats>) -> std::fmt::Result {
    let Some(stats) = stats else {
        return writeln!(out, "{}: no samples", title);
    };
    writeln!(out, "{} ({} samples):", title, stats.samples)?;
    writeln!(out, "  Mean:    {}", utils::format_latency_ms(stats.mean_ms))?;
    writeln!(out, "  Median:  {}", utils::format_latency_ms(stats.median_ms))?;
    writeln!(out, "  Min:     {}", utils::format_latency_ms(stats.min_ms))?;
    writeln!(out, "  Max:     {}", utils::format_latency_ms(stats.max_ms))?;
    match stats.std_dev_ms {
        Some(sd) => writeln!(out, "  Std Dev: {}", utils::format_latency_ms(sd))?,
        None => writeln!(out, "  Std Dev: n/a")?,
    }
    writeln!(out, "  P95:     {}", utils::format_latency_ms(stats.p95_ms))?;
    writeln!(out, "  P99:     {}", utils::format_latency_ms(stats.p99_ms))?;
    for p in &stats.percentiles {
        writeln!(
            out,
            "  P{:<6} {}",
            format!("{}:", p.percentile),
            utils::format_latency_ms(p.value_ms)
        )?;
    }
    Ok(())
}

/// Render the console summary.
///
/// Connection failures and operation failures are reported separately; only
/// the first `error_sample` error strings are listed.
pub fn render_summary(results: &RunResults, error_sample: usize) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail
    let _ = render_into(&mut out, results, error_sample);
    out
}

fn render_into(out: &mut String, results: &RunResults, error_sample: usize) -> std::fmt::Result {
    let m = &results.metrics;
    let cfg = &results.test_config;
    let line = "=================================================================";

    writeln!(out, "{}", line)?;
    writeln!(out, "Load Test Results: {} @ {}", cfg.protocol, cfg.target)?;
    writeln!(out, "Run ID: {}", results.metadata.run_id)?;
    writeln!(out, "{}", line)?;
    writeln!(
        out,
        "Elapsed: {}",
        utils::format_duration(std::time::Duration::from_secs_f64(m.elapsed_secs.max(0.0)))
    )?;

    writeln!(out)?;
    writeln!(out, "Connections:")?;
    writeln!(out, "  Total:       {}", m.connections.total)?;
    writeln!(
        out,
        "  Succeeded:   {} ({:.2}%)",
        m.connections.succeeded, m.connections.success_rate
    )?;
    writeln!(out, "  Failed:      {}", m.connections.failed)?;
    writeln!(out, "  Attempts:    {}", m.connections.attempts)?;
    writeln!(out, "  Peak Active: {}", m.connections.peak_active)?;

    writeln!(out)?;
    writeln!(out, "Operations:")?;
    writeln!(out, "  Total:       {}", m.operations.total)?;
    writeln!(
        out,
        "  Succeeded:   {} ({:.2}%)",
        m.operations.succeeded, m.operations.success_rate
    )?;
    writeln!(out, "  Failed:      {}", m.operations.failed)?;
    for (category, counts) in &m.operations.by_category {
        writeln!(
            out,
            "  {:<8}     {} ok / {} failed",
            category, counts.succeeded, counts.failed
        )?;
    }
    if !m.failures_by_kind.is_empty() {
        writeln!(out, "  Failures by kind:")?;
        for (kind, count) in &m.failures_by_kind {
            writeln!(out, "    {}: {}", kind, count)?;
        }
    }

    writeln!(out)?;
    writeln!(out, "Throughput:")?;
    writeln!(
        out,
        "  Operations:  {}",
        utils::format_operation_rate(m.throughput.operations_per_second)
    )?;
    writeln!(
        out,
        "  Sent:        {} ({})",
        utils::format_bytes(m.throughput.total_bytes_sent),
        utils::format_rate(m.throughput.bytes_sent_per_second)
    )?;
    writeln!(
        out,
        "  Received:    {}",
        utils::format_bytes(m.throughput.total_bytes_received)
    )?;

    writeln!(out)?;
    write_latency(out, "Operation Latency", &m.latency)?;
    write_latency(out, "Connect Time", &m.connections.connect_time)?;

    if !m.errors.is_empty() {
        writeln!(out)?;
        let sample = m.error_sample(error_sample);
        writeln!(
            out,
            "Errors ({} total, showing {}):",
            m.errors.len(),
            sample.len()
        )?;
        for error in sample {
            writeln!(out, "  - {}", error)?;
        }
    }
    write!(out, "{}", line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;
    use crate::metrics::{ConnectionOutcome, MetricsAggregator, OutcomeRecord};
    use crate::protocol::OperationKind;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn sample_results() -> RunResults {
        let metrics = MetricsAggregator::new(vec![50.0, 99.9]);
        metrics.record_connection(ConnectionOutcome::Connected {
            connect_time: Duration::from_millis(3),
            attempts: 1,
        });
        metrics.record_connection(ConnectionOutcome::Failed {
            attempts: 4,
            kind: crate::error::ErrorKind::ConnectTimeout,
            message: "client 1 failed to connect after 4 attempt(s)".into(),
        });
        for ms in 1..=5 {
            metrics.record_outcome(OutcomeRecord::success(
                OperationKind::Read,
                Duration::from_millis(ms),
                20,
                100,
            ));
        }
        for i in 0..3 {
            metrics.record_outcome(OutcomeRecord::failure(
                OperationKind::Write,
                &HarnessError::OperationTimeout(Duration::from_secs(5)),
                format!("client 0 SET failed #{}", i),
                120,
            ));
        }
        let snapshot = metrics.finalize(Duration::from_secs(2)).unwrap();
        RunResults::new(&RunConfig::default(), snapshot)
    }

    #[test]
    fn test_summary_separates_connection_and_operation_failures() {
        let summary = render_summary(&sample_results(), 2);
        assert!(summary.contains("Connections:"));
        assert!(summary.contains("Operations:"));
        assert!(summary.contains("  Failed:      1"));
        assert!(summary.contains("  Failed:      3"));
        assert!(summary.contains("Errors (4 total, showing 2):"));
        assert!(!summary.contains("SET failed #1"));
        assert!(summary.contains("operation timeout: 3"));
    }

    #[test]
    fn test_json_output() {
        let results = sample_results();
        let temp_file = NamedTempFile::new().unwrap();
        let manager = ResultsManager::new(Some(temp_file.path()), 10);
        manager.write_json(temp_file.path(), &results).unwrap();

        let written = std::fs::read_to_string(temp_file.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value["metadata"]["version"], crate::VERSION);
        assert_eq!(value["test_config"]["clients"], 50);
        assert_eq!(value["metrics"]["operations"]["total"], 8);
        assert_eq!(value["metrics"]["operations"]["by_category"]["GET"]["succeeded"], 5);
        assert_eq!(value["metrics"]["connections"]["failed"], 1);
        assert_eq!(value["metrics"]["failures_by_kind"]["operation_timeout"], 3);
        assert_eq!(value["metrics"]["errors"].as_array().unwrap().len(), 4);

        let parsed: RunResults = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.metadata.run_id, results.metadata.run_id);
    }

    #[test]
    fn test_system_info_default() {
        let info = SystemInfo::default();
        assert!(!info.os.is_empty());
        assert!(!info.architecture.is_empty());
        assert!(info.cpu_cores > 0);
    }
}
