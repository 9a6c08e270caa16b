//! # Workload Driver
//!
//! One [`VirtualClient`] per simulated user. A client opens its connection
//! through the connection manager, issues its seeding writes, then runs the
//! main loop until its operation count is reached, its duration elapses or
//! the run is stopped. Every attempted operation yields exactly one outcome
//! record; the connection is released on every exit path.

use crate::benchmark::{RunConfig, StopSignal};
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::error::HarnessError;
use crate::metrics::{MetricsAggregator, OutcomeRecord};
use crate::protocol::{Operation, Reply};
use crate::workload::{self, Workload};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// How often (in completed operations) a client logs its progress
const PROGRESS_EVERY: usize = 1000;

/// Why a client's main loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Configured operation count reached
    Completed,
    /// Configured duration elapsed
    DurationElapsed,
    /// Run-wide stop signal observed
    Stopped,
    /// Connection could not be opened
    ConnectFailed,
    /// Connection became unusable mid-run
    ConnectionLost,
    /// The workload could not produce an operation
    WorkloadError,
}

/// What one client did, returned from its task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
    pub client_id: usize,
    pub operations: usize,
    pub failures: usize,
    pub exit: ExitReason,
}

/// Successful request/reply exchange
struct Exchange {
    latency: Duration,
    bytes_sent: usize,
    bytes_received: usize,
}

/// Failed exchange, with whatever request bytes reached the wire
struct FailedExchange {
    error: HarnessError,
    bytes_sent: usize,
}

/// Write the request and wait for its reply, each under `op_timeout`
async fn round_trip(
    connection: &mut ConnectionHandle,
    operation: &Operation,
    op_timeout: Duration,
    bytes_sent: &mut usize,
) -> Result<(Duration, Reply), HarnessError> {
    let started = Instant::now();
    *bytes_sent = match timeout(op_timeout, connection.send(operation)).await {
        Ok(sent) => sent?,
        Err(_) => return Err(HarnessError::SendTimeout(op_timeout)),
    };
    let reply = connection.receive(op_timeout).await?;
    Ok((started.elapsed(), reply))
}

/// Send one operation and wait for its reply.
///
/// Latency runs from the start of the send until the reply is fully decoded.
/// An error reply from the service becomes an `Application` failure. A stop
/// request abandons the exchange at whichever step it is waiting on.
async fn execute(
    connection: &mut ConnectionHandle,
    operation: &Operation,
    op_timeout: Duration,
    stop: &StopSignal,
) -> Result<Exchange, FailedExchange> {
    let mut bytes_sent = 0;
    let result = tokio::select! {
        result = round_trip(connection, operation, op_timeout, &mut bytes_sent) => result,
        _ = stop.stopped() => Err(HarnessError::Interrupted),
    };

    match result {
        Ok((_, Reply::Error(message))) => Err(FailedExchange {
            error: HarnessError::Application(message),
            bytes_sent,
        }),
        Ok((latency, reply)) => Ok(Exchange {
            latency,
            bytes_sent,
            bytes_received: reply.payload_len(),
        }),
        Err(error) => Err(FailedExchange { error, bytes_sent }),
    }
}

/// One simulated user of the target service
pub struct VirtualClient {
    id: usize,
    config: Arc<RunConfig>,
    manager: Arc<ConnectionManager>,
    metrics: Arc<MetricsAggregator>,
    stop: StopSignal,
    workload: Box<dyn Workload>,
    rng: StdRng,
}

impl VirtualClient {
    pub fn new(
        id: usize,
        config: Arc<RunConfig>,
        manager: Arc<ConnectionManager>,
        metrics: Arc<MetricsAggregator>,
        stop: StopSignal,
    ) -> Self {
        let workload = workload::for_client(id, &config);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id as u64)),
            None => StdRng::from_entropy(),
        };
        Self {
            id,
            config,
            manager,
            metrics,
            stop,
            workload,
            rng,
        }
    }

    /// Run the client to completion
    pub async fn run(mut self) -> ClientSummary {
        let mut summary = ClientSummary {
            client_id: self.id,
            operations: 0,
            failures: 0,
            exit: ExitReason::ConnectFailed,
        };

        let mut connection = match self.manager.open(self.id, &self.stop).await {
            Ok(connection) => connection,
            Err(failure) => {
                if matches!(failure.error, HarnessError::Interrupted) {
                    summary.exit = ExitReason::Stopped;
                }
                return summary;
            }
        };

        summary.exit = match self.seed(&mut connection).await {
            Some(exit) => exit,
            None => self.main_loop(&mut connection, &mut summary).await,
        };

        if let Err(e) = connection.release().await {
            debug!("Client {} close failed: {}", self.id, e);
        }

        info!(
            "Client {} finished: {} operations, {} failed ({:?})",
            self.id, summary.operations, summary.failures, summary.exit
        );
        summary
    }

    /// Issue the seeding writes. These are not workload operations: their
    /// failures only reach the error list.
    async fn seed(&mut self, connection: &mut ConnectionHandle) -> Option<ExitReason> {
        let seeds = self.workload.seed_operations(&mut self.rng);
        if seeds.is_empty() {
            return None;
        }

        for op in &seeds {
            if self.stop.is_stopped() {
                return Some(ExitReason::Stopped);
            }
            if let Err(FailedExchange { error: e, .. }) =
                execute(connection, op, self.config.op_timeout, &self.stop).await
            {
                if matches!(e, HarnessError::Interrupted) {
                    return Some(ExitReason::Stopped);
                }
                self.metrics
                    .record_error(format!("client {} seed write failed: {}", self.id, e));
                if e.is_fatal_to_connection() {
                    warn!("Client {} lost its connection while seeding: {}", self.id, e);
                    return Some(ExitReason::ConnectionLost);
                }
            }
        }
        debug!("Client {} seeded {} keys", self.id, seeds.len());
        None
    }

    async fn main_loop(
        &mut self,
        connection: &mut ConnectionHandle,
        summary: &mut ClientSummary,
    ) -> ExitReason {
        let started = Instant::now();
        let deadline = self.config.duration.map(|d| started + d);
        let max_operations = self.config.operations;

        loop {
            if self.stop.is_stopped() {
                return ExitReason::Stopped;
            }
            if max_operations > 0 && summary.operations >= max_operations {
                return ExitReason::Completed;
            }
            if deadline.is_some_and(|end| Instant::now() >= end) {
                return ExitReason::DurationElapsed;
            }

            let planned = match self.workload.next_operation(&mut self.rng) {
                Ok(planned) => planned,
                Err(e) => {
                    self.metrics
                        .record_error(format!("client {} workload error: {:#}", self.id, e));
                    return ExitReason::WorkloadError;
                }
            };

            let result = execute(
                connection,
                &planned.operation,
                self.config.op_timeout,
                &self.stop,
            )
            .await;
            summary.operations += 1;

            match result {
                Ok(exchange) => self.metrics.record_outcome(OutcomeRecord::success(
                    planned.kind,
                    exchange.latency,
                    exchange.bytes_sent,
                    exchange.bytes_received,
                )),
                Err(FailedExchange { error: e, bytes_sent }) => {
                    summary.failures += 1;
                    let message = format!("client {} {} failed: {}", self.id, planned.kind, e);
                    self.metrics.record_outcome(OutcomeRecord::failure(
                        planned.kind,
                        &e,
                        message,
                        bytes_sent,
                    ));
                    if matches!(e, HarnessError::Interrupted) {
                        return ExitReason::Stopped;
                    }
                    if e.is_fatal_to_connection() {
                        warn!(
                            "Client {} stopping after {} operations: {}",
                            self.id, summary.operations, e
                        );
                        return ExitReason::ConnectionLost;
                    }
                }
            }

            if summary.operations % PROGRESS_EVERY == 0 {
                debug!(
                    "Client {} progress: {} operations ({} failed)",
                    self.id, summary.operations, summary.failures
                );
            }

            if !self.config.interval.is_zero() && !self.stop.sleep_or_stop(self.config.interval).await
            {
                return ExitReason::Stopped;
            }
        }
    }
}
