//! Concurrency-safe metrics sink and the immutable snapshot it produces.
//!
//! Every virtual client writes into one shared [`MetricsAggregator`]; all
//! mutation happens under a single mutex so no update is lost. Once the run
//! controller has joined every client it consumes the aggregator with
//! [`MetricsAggregator::finalize`], which sorts the latency samples once and
//! derives the summary statistics.

use crate::error::{ErrorKind, HarnessError};
use crate::protocol::OperationKind;
use anyhow::Result;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Result of one operation attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { latency: Duration },
    Failure { kind: ErrorKind, message: String },
}

/// One operation attempt, created by a virtual client right after it completes
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRecord {
    pub category: OperationKind,
    pub outcome: Outcome,
    pub bytes_sent: usize,
    pub bytes_received: usize,
}

impl OutcomeRecord {
    pub fn success(
        category: OperationKind,
        latency: Duration,
        bytes_sent: usize,
        bytes_received: usize,
    ) -> Self {
        Self {
            category,
            outcome: Outcome::Success { latency },
            bytes_sent,
            bytes_received,
        }
    }

    /// A failed attempt; `bytes_sent` is whatever reached the wire before it failed
    pub fn failure(
        category: OperationKind,
        error: &HarnessError,
        message: String,
        bytes_sent: usize,
    ) -> Self {
        Self {
            category,
            outcome: Outcome::Failure {
                kind: error.kind(),
                message,
            },
            bytes_sent,
            bytes_received: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }
}

/// Result of opening one virtual client's connection, retries included
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionOutcome {
    Connected {
        connect_time: Duration,
        attempts: u32,
    },
    Failed {
        attempts: u32,
        kind: ErrorKind,
        message: String,
    },
}

/// Per-category operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Default)]
struct AggregatorState {
    categories: BTreeMap<OperationKind, CategoryCounts>,
    failures_by_kind: BTreeMap<ErrorKind, usize>,
    latencies_ms: Vec<f64>,
    connect_times_ms: Vec<f64>,
    successful_connections: usize,
    failed_connections: usize,
    connect_attempts: usize,
    bytes_sent: usize,
    bytes_received: usize,
    errors: Vec<String>,
}

/// Shared sink for outcomes, connection results and error strings
pub struct MetricsAggregator {
    state: Mutex<AggregatorState>,
    percentiles: Vec<f64>,
    started_at: chrono::DateTime<chrono::Utc>,
}

/// Running totals, for progress reporting while the run is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub operations: usize,
    pub failures: usize,
    pub connections: usize,
}

impl MetricsAggregator {
    /// Create an aggregator reporting the given percentiles (0.0 - 100.0)
    pub fn new(percentiles: Vec<f64>) -> Self {
        Self {
            state: Mutex::new(AggregatorState::default()),
            percentiles,
            started_at: chrono::Utc::now(),
        }
    }

    /// Record one operation attempt
    pub fn record_outcome(&self, record: OutcomeRecord) {
        let mut state = self.state.lock();
        state.bytes_sent += record.bytes_sent;
        state.bytes_received += record.bytes_received;
        let counts = state.categories.entry(record.category).or_default();
        counts.attempted += 1;

        match record.outcome {
            Outcome::Success { latency } => {
                counts.succeeded += 1;
                state.latencies_ms.push(duration_ms(latency));
            }
            Outcome::Failure { kind, message } => {
                counts.failed += 1;
                *state.failures_by_kind.entry(kind).or_default() += 1;
                state.errors.push(message);
            }
        }
    }

    /// Record the result of opening a connection
    pub fn record_connection(&self, outcome: ConnectionOutcome) {
        let mut state = self.state.lock();
        match outcome {
            ConnectionOutcome::Connected {
                connect_time,
                attempts,
            } => {
                state.successful_connections += 1;
                state.connect_attempts += attempts as usize;
                state.connect_times_ms.push(duration_ms(connect_time));
            }
            ConnectionOutcome::Failed {
                attempts,
                kind,
                message,
            } => {
                state.failed_connections += 1;
                state.connect_attempts += attempts as usize;
                *state.failures_by_kind.entry(kind).or_default() += 1;
                state.errors.push(message);
            }
        }
    }

    /// Append a free-text error that is not tied to a counted operation
    pub fn record_error(&self, message: impl Into<String>) {
        self.state.lock().errors.push(message.into());
    }

    pub fn progress(&self) -> Progress {
        let state = self.state.lock();
        let (operations, failures) = state
            .categories
            .values()
            .fold((0, 0), |(ops, failed), c| (ops + c.attempted, failed + c.failed));
        Progress {
            operations,
            failures,
            connections: state.successful_connections + state.failed_connections,
        }
    }

    /// Produce the immutable snapshot.
    ///
    /// Takes the aggregator by value: callers holding it behind an `Arc` can
    /// only get here once every client has dropped its handle.
    pub fn finalize(self, elapsed: Duration) -> Result<MetricsSnapshot> {
        let mut state = self.state.into_inner();

        let latency = LatencyStats::from_samples(&mut state.latencies_ms, &self.percentiles);
        let connect_time =
            LatencyStats::from_samples(&mut state.connect_times_ms, &self.percentiles);
        let latency_histogram = build_histogram(&state.latencies_ms)?;

        let total = state.categories.values().map(|c| c.attempted).sum::<usize>();
        let succeeded = state.categories.values().map(|c| c.succeeded).sum::<usize>();
        let failed = state.categories.values().map(|c| c.failed).sum::<usize>();

        let elapsed_secs = elapsed.as_secs_f64();
        let per_second = |n: usize| {
            if elapsed_secs > 0.0 {
                n as f64 / elapsed_secs
            } else {
                0.0
            }
        };
        let rate = |part: usize, whole: usize| {
            if whole > 0 {
                part as f64 / whole as f64 * 100.0
            } else {
                0.0
            }
        };

        let total_connections = state.successful_connections + state.failed_connections;

        Ok(MetricsSnapshot {
            started_at: self.started_at,
            elapsed_secs,
            operations: OperationSummary {
                total,
                succeeded,
                failed,
                success_rate: rate(succeeded, total),
                by_category: state
                    .categories
                    .iter()
                    .map(|(kind, counts)| (kind.to_string(), *counts))
                    .collect(),
            },
            connections: ConnectionSummary {
                total: total_connections,
                succeeded: state.successful_connections,
                failed: state.failed_connections,
                attempts: state.connect_attempts,
                success_rate: rate(state.successful_connections, total_connections),
                peak_active: 0,
                connect_time,
            },
            latency,
            throughput: ThroughputMetrics {
                operations_per_second: per_second(succeeded),
                bytes_sent_per_second: per_second(state.bytes_sent),
                total_bytes_sent: state.bytes_sent,
                total_bytes_received: state.bytes_received,
            },
            latency_histogram,
            failures_by_kind: state.failures_by_kind,
            errors: state.errors,
        })
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Nearest-rank-by-truncation percentile: `sorted[floor(len * p / 100)]`,
/// index clamped to the last element. `sorted` must be non-empty.
pub fn percentile_at(sorted: &[f64], percentile: f64) -> f64 {
    let index = ((sorted.len() as f64) * percentile / 100.0).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Median of a sorted, non-empty slice (mean of the two middle values for even lengths)
fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Sample standard deviation; undefined below two samples
fn sample_std_dev(values: &[f64], mean: f64) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let variance =
        values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.sqrt())
}

/// Percentile value pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_ms: f64,
}

/// Distribution summary, all values in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub median_ms: f64,
    pub std_dev_ms: Option<f64>,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub percentiles: Vec<PercentileValue>,
}

impl LatencyStats {
    /// Sort `samples` in place and summarize them; `None` when empty
    pub fn from_samples(samples: &mut [f64], percentiles: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable_by(|a, b| a.total_cmp(b));
        let sorted = &*samples;

        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        Some(Self {
            samples: sorted.len(),
            mean_ms: mean,
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            median_ms: median(sorted),
            std_dev_ms: sample_std_dev(sorted, mean),
            p95_ms: percentile_at(sorted, 95.0),
            p99_ms: percentile_at(sorted, 99.0),
            percentiles: percentiles
                .iter()
                .map(|&p| PercentileValue {
                    percentile: p,
                    value_ms: percentile_at(sorted, p),
                })
                .collect(),
        })
    }
}

/// One bucket of the latency distribution handed to chart renderers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub upper_bound_ms: f64,
    pub count: u64,
}

/// Log-scale latency buckets (100µs, 200µs, 400µs, ...) built with an HDR histogram
fn build_histogram(latencies_ms: &[f64]) -> Result<Vec<HistogramBucket>> {
    if latencies_ms.is_empty() {
        return Ok(Vec::new());
    }

    // Create histogram with 3 significant figures, auto-resizing
    let mut histogram = Histogram::<u64>::new(3)?;
    for &ms in latencies_ms {
        histogram.record((ms * 1000.0).round() as u64)?;
    }

    Ok(histogram
        .iter_log(100, 2.0)
        .map(|v| HistogramBucket {
            upper_bound_ms: v.value_iterated_to() as f64 / 1000.0,
            count: v.count_since_last_iteration(),
        })
        .collect())
}

/// Operation counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub by_category: BTreeMap<String, CategoryCounts>,
}

/// Connection counters and connect-time distribution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Connect attempts made, retries included
    pub attempts: usize,
    pub success_rate: f64,
    /// Highest number of simultaneously open connections, filled in by the runner
    pub peak_active: usize,
    pub connect_time: Option<LatencyStats>,
}

/// Throughput metrics over the whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputMetrics {
    pub operations_per_second: f64,
    pub bytes_sent_per_second: f64,
    pub total_bytes_sent: usize,
    pub total_bytes_received: usize,
}

/// Finalized, immutable view of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub elapsed_secs: f64,
    pub operations: OperationSummary,
    pub connections: ConnectionSummary,
    pub latency: Option<LatencyStats>,
    pub throughput: ThroughputMetrics,
    pub latency_histogram: Vec<HistogramBucket>,
    pub failures_by_kind: BTreeMap<ErrorKind, usize>,
    pub errors: Vec<String>,
}

impl MetricsSnapshot {
    /// The first `limit` error strings, for display
    pub fn error_sample(&self, limit: usize) -> &[String] {
        &self.errors[..self.errors.len().min(limit)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ok(category: OperationKind, ms: u64) -> OutcomeRecord {
        OutcomeRecord::success(category, Duration::from_millis(ms), 10, 5)
    }

    #[test]
    fn test_percentile_truncation() {
        let sorted: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        assert_eq!(percentile_at(&sorted, 0.0), 1.0);
        assert_eq!(percentile_at(&sorted, 50.0), 6.0);
        assert_eq!(percentile_at(&sorted, 95.0), 10.0);
        assert_eq!(percentile_at(&sorted, 100.0), 10.0);
        assert_eq!(percentile_at(&[4.2], 99.0), 4.2);
    }

    #[test]
    fn test_percentiles_are_monotonic() {
        let mut samples: Vec<f64> = (0..997).map(|i| ((i * 7919) % 1000) as f64 / 3.0).collect();
        samples.sort_unstable_by(|a, b| a.total_cmp(b));
        let mut previous = f64::MIN;
        for step in 0..=1000 {
            let value = percentile_at(&samples, step as f64 / 10.0);
            assert!(value >= previous);
            previous = value;
        }
    }

    #[test]
    fn test_latency_stats() {
        let mut samples = vec![5.0, 1.0, 3.0, 2.0, 4.0];
        let stats = LatencyStats::from_samples(&mut samples, &[50.0, 99.0]).unwrap();
        assert_eq!(stats.samples, 5);
        assert_eq!(stats.mean_ms, 3.0);
        assert_eq!(stats.min_ms, 1.0);
        assert_eq!(stats.max_ms, 5.0);
        assert_eq!(stats.median_ms, 3.0);
        assert!((stats.std_dev_ms.unwrap() - 1.5811388300841898).abs() < 1e-9);
        assert_eq!(stats.p95_ms, 5.0);
        assert_eq!(stats.percentiles[0].value_ms, 3.0);

        let mut even = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(LatencyStats::from_samples(&mut even, &[]).unwrap().median_ms, 2.5);
    }

    #[test]
    fn test_std_dev_skipped_for_single_sample() {
        let mut samples = vec![7.0];
        let stats = LatencyStats::from_samples(&mut samples, &[]).unwrap();
        assert_eq!(stats.std_dev_ms, None);
        assert!(LatencyStats::from_samples(&mut [], &[]).is_none());
    }

    #[test]
    fn test_counts_by_category() {
        let metrics = MetricsAggregator::new(vec![50.0]);
        metrics.record_outcome(ok(OperationKind::Read, 1));
        metrics.record_outcome(ok(OperationKind::Read, 2));
        metrics.record_outcome(ok(OperationKind::Write, 3));
        let err = HarnessError::Application("ERR".into());
        metrics.record_outcome(OutcomeRecord::failure(
            OperationKind::Delete,
            &err,
            "client 0 operation failed: server error: ERR".into(),
            25,
        ));

        let snapshot = metrics.finalize(Duration::from_secs(2)).unwrap();
        assert_eq!(snapshot.operations.total, 4);
        assert_eq!(snapshot.operations.succeeded, 3);
        assert_eq!(snapshot.operations.failed, 1);
        assert_eq!(snapshot.operations.by_category["GET"].succeeded, 2);
        assert_eq!(snapshot.operations.by_category["DEL"].failed, 1);
        assert_eq!(snapshot.failures_by_kind[&ErrorKind::ApplicationError], 1);
        assert_eq!(snapshot.throughput.operations_per_second, 1.5);
        // The failed DEL still put its request on the wire
        assert_eq!(snapshot.throughput.total_bytes_sent, 55);
        assert_eq!(snapshot.errors.len(), 1);
        assert_eq!(snapshot.latency.unwrap().samples, 3);
    }

    #[test]
    fn test_connection_outcomes() {
        let metrics = MetricsAggregator::new(vec![]);
        metrics.record_connection(ConnectionOutcome::Connected {
            connect_time: Duration::from_millis(4),
            attempts: 2,
        });
        metrics.record_connection(ConnectionOutcome::Failed {
            attempts: 4,
            kind: ErrorKind::ConnectTimeout,
            message: "client 1 connect timed out".into(),
        });
        metrics.record_error("client 0 seed SET failed");

        let snapshot = metrics.finalize(Duration::from_secs(1)).unwrap();
        assert_eq!(snapshot.connections.total, 2);
        assert_eq!(snapshot.connections.succeeded, 1);
        assert_eq!(snapshot.connections.failed, 1);
        assert_eq!(snapshot.connections.attempts, 6);
        assert_eq!(snapshot.connections.success_rate, 50.0);
        assert_eq!(snapshot.connections.connect_time.as_ref().unwrap().max_ms, 4.0);
        assert_eq!(snapshot.operations.total, 0);
        assert!(snapshot.latency.is_none());
        assert_eq!(snapshot.error_sample(1).len(), 1);
        assert_eq!(snapshot.errors.len(), 2);
    }

    #[test]
    fn test_histogram_counts_every_sample() {
        let metrics = MetricsAggregator::new(vec![]);
        for ms in [1, 1, 2, 8, 40, 250] {
            metrics.record_outcome(ok(OperationKind::Message, ms));
        }
        let snapshot = metrics.finalize(Duration::from_secs(1)).unwrap();
        let counted: u64 = snapshot.latency_histogram.iter().map(|b| b.count).sum();
        assert_eq!(counted, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_recording_loses_nothing() {
        const CALLERS: usize = 64;
        const RECORDS: usize = 250;

        let metrics = Arc::new(MetricsAggregator::new(vec![95.0]));
        let mut tasks = tokio::task::JoinSet::new();
        for caller in 0..CALLERS {
            let metrics = Arc::clone(&metrics);
            tasks.spawn(async move {
                for i in 0..RECORDS {
                    if (caller + i) % 5 == 0 {
                        metrics.record_outcome(OutcomeRecord::failure(
                            OperationKind::Write,
                            &HarnessError::ConnectionClosed,
                            format!("client {} failed", caller),
                            0,
                        ));
                    } else {
                        metrics.record_outcome(ok(OperationKind::Read, i as u64));
                    }
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let metrics = Arc::try_unwrap(metrics).ok().unwrap();
        let snapshot = metrics.finalize(Duration::from_secs(1)).unwrap();
        assert_eq!(snapshot.operations.total, CALLERS * RECORDS);
        assert_eq!(
            snapshot.operations.succeeded + snapshot.operations.failed,
            CALLERS * RECORDS
        );
        assert_eq!(snapshot.errors.len(), snapshot.operations.failed);
    }
}
