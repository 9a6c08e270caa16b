use crate::cli::Protocol;
use crate::error::HarnessError;
use crate::protocol::{Operation, Reply};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
pub(crate) mod mock;
pub mod redis;
pub mod websocket;

pub use redis::{RespConnection, RespConnector};
pub use websocket::{WebSocketConnection, WebSocketConnector};

/// One live transport connection owned by a single virtual client
///
/// Implementations carry at most one outstanding request at a time from the
/// driver's point of view: `send` is always followed by `receive` before the
/// next `send`.
#[async_trait]
pub trait Connection: Send {
    /// Write one encoded operation, returning the number of bytes sent
    async fn send(&mut self, op: &Operation) -> Result<usize, HarnessError>;

    /// Wait up to `deadline` for the reply to the last operation sent
    async fn receive(&mut self, deadline: Duration) -> Result<Reply, HarnessError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), HarnessError>;

    /// Get transport name for identification
    fn name(&self) -> &'static str;
}

/// Opens connections to the target service.
///
/// A connector makes exactly one attempt per call; timeouts, retries and
/// pacing belong to the connection manager.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, HarnessError>;

    /// Target endpoint, for logging
    fn endpoint(&self) -> &str;
}

/// Connector factory for the supported protocols
pub struct ConnectorFactory;

impl ConnectorFactory {
    /// Create a connector for `protocol` aimed at `target`
    pub fn create(protocol: Protocol, target: &str) -> Result<Arc<dyn Connector>> {
        match protocol {
            Protocol::Redis => Ok(Arc::new(RespConnector::new(target))),
            Protocol::WebSocket => Ok(Arc::new(WebSocketConnector::new(target)?)),
        }
    }
}
