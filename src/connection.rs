//! # Connection Manager
//!
//! Opens one connection per virtual client under a bounded retry policy and
//! hands back a [`ConnectionHandle`] that is released exactly once.
//!
//! Each attempt is capped by the connect timeout. A timed-out or refused
//! attempt is retried up to `max_retries` times, sleeping
//! `attempt * backoff_base` in between (linear, not exponential). The
//! backoff sleep is abandoned as soon as the run is asked to stop.
//!
//! Admission pacing across clients (connection batches) belongs to the run
//! controller; see `benchmark::BatchPacer`.

use crate::benchmark::StopSignal;
use crate::error::HarnessError;
use crate::metrics::{ConnectionOutcome, MetricsAggregator};
use crate::protocol::{Operation, Reply};
use crate::transport::{Connection, Connector};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Timeout and retry parameters for opening a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Hard cap on a single connect attempt
    pub connect_timeout: Duration,
    /// Retries after the first attempt; total attempts = max_retries + 1
    pub max_retries: u32,
    /// Backoff unit; the delay before retry `n` is `n * backoff_base`
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: crate::defaults::CONNECT_TIMEOUT,
            max_retries: crate::defaults::MAX_RETRIES,
            backoff_base: crate::defaults::RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Delay inserted after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * attempt
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Shared count of open connections, with the high-water mark.
///
/// Observability only; admission never looks at it.
#[derive(Debug, Clone, Default)]
pub struct ActiveConnections {
    inner: Arc<ActiveInner>,
}

#[derive(Debug, Default)]
struct ActiveInner {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ActiveConnections {
    fn acquire(&self) {
        let now = self.inner.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn release(&self) {
        self.inner.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.inner.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }
}

/// Longest a graceful close may take before the transport is simply dropped
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Terminal failure to open a connection after all retries
#[derive(Debug, Error)]
#[error("client {client_id} failed to connect after {attempts} attempt(s): {error}")]
pub struct ConnectFailure {
    pub client_id: usize,
    pub attempts: u32,
    #[source]
    pub error: HarnessError,
}

/// An open connection owned by one virtual client.
///
/// [`release`](Self::release) closes the transport and frees the active
/// connection slot. A handle dropped without being released (panic, task
/// abort) still frees the slot; the socket is closed by its own drop.
pub struct ConnectionHandle {
    client_id: usize,
    connection: Option<Box<dyn Connection>>,
    active: ActiveConnections,
}

impl ConnectionHandle {
    fn new(client_id: usize, connection: Box<dyn Connection>, active: ActiveConnections) -> Self {
        active.acquire();
        Self {
            client_id,
            connection: Some(connection),
            active,
        }
    }

    fn connection(&mut self) -> Result<&mut Box<dyn Connection>, HarnessError> {
        self.connection.as_mut().ok_or(HarnessError::ConnectionClosed)
    }

    pub async fn send(&mut self, op: &Operation) -> Result<usize, HarnessError> {
        self.connection()?.send(op).await
    }

    pub async fn receive(&mut self, deadline: Duration) -> Result<Reply, HarnessError> {
        self.connection()?.receive(deadline).await
    }

    /// Close the connection and release its slot
    pub async fn release(mut self) -> Result<(), HarnessError> {
        match self.connection.take() {
            Some(mut connection) => {
                self.active.release();
                debug!(
                    "Client {} releasing {} connection",
                    self.client_id,
                    connection.name()
                );
                match timeout(CLOSE_TIMEOUT, connection.close()).await {
                    Ok(result) => result,
                    Err(_) => Err(HarnessError::SendTimeout(CLOSE_TIMEOUT)),
                }
            }
            None => Ok(()),
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.connection.take().is_some() {
            self.active.release();
        }
    }
}

/// Opens connections for virtual clients and records the outcome of each
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    metrics: Arc<MetricsAggregator>,
    active: ActiveConnections,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
        metrics: Arc<MetricsAggregator>,
        active: ActiveConnections,
    ) -> Self {
        Self {
            connector,
            policy,
            metrics,
            active,
        }
    }

    pub fn active(&self) -> &ActiveConnections {
        &self.active
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Open a connection for `client_id`, retrying per the policy.
    ///
    /// The outcome (connect time and attempt count, or the terminal cause)
    /// is recorded in the metrics aggregator before returning.
    pub async fn open(
        &self,
        client_id: usize,
        stop: &StopSignal,
    ) -> Result<ConnectionHandle, ConnectFailure> {
        let total = self.policy.total_attempts();
        let mut attempt = 0;

        let error = loop {
            attempt += 1;
            let started = Instant::now();

            let error = match timeout(self.policy.connect_timeout, self.connector.connect()).await
            {
                Ok(Ok(connection)) => {
                    let connect_time = started.elapsed();
                    debug!(
                        "Client {} connected to {} in {:?} (attempt {}/{})",
                        client_id,
                        self.connector.endpoint(),
                        connect_time,
                        attempt,
                        total
                    );
                    self.metrics.record_connection(ConnectionOutcome::Connected {
                        connect_time,
                        attempts: attempt,
                    });
                    return Ok(ConnectionHandle::new(
                        client_id,
                        connection,
                        self.active.clone(),
                    ));
                }
                Ok(Err(e)) => e,
                Err(_) => HarnessError::ConnectTimeout(self.policy.connect_timeout),
            };

            if attempt >= total {
                break error;
            }

            let delay = self.policy.backoff(attempt);
            warn!(
                "Client {} connect attempt {}/{} failed: {}. Retrying in {:?}",
                client_id, attempt, total, error, delay
            );
            if !stop.sleep_or_stop(delay).await {
                debug!(
                    "Client {} stopped while retrying (last attempt: {})",
                    client_id, error
                );
                break HarnessError::Interrupted;
            }
        };

        let failure = ConnectFailure {
            client_id,
            attempts: attempt,
            error,
        };
        let message = match failure.error {
            HarnessError::Interrupted => format!(
                "client {} stopped while retrying after {} attempt(s)",
                client_id, attempt
            ),
            _ => failure.to_string(),
        };
        warn!("{}", message);
        self.metrics.record_connection(ConnectionOutcome::Failed {
            attempts: attempt,
            kind: failure.error.kind(),
            message,
        });
        Err(failure)
    }
}
