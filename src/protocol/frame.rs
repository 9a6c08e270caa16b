//! Message-framed codec for the WebSocket broadcast protocol.
//!
//! Each operation is one flat JSON document sent as a single frame. The
//! framing boundary comes from the transport, so decoding a reply is just
//! taking the next data frame.

use super::Operation;
use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Command name used for broadcast operations
pub const SEND_COMMAND: &str = "SEND";

/// Application payload carried in every frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDocument {
    pub client_id: usize,
    pub seq: u64,
    /// Seconds since the Unix epoch at send time
    pub timestamp: f64,
    pub payload: String,
}

impl FrameDocument {
    pub fn new(client_id: usize, seq: u64, payload: String) -> Self {
        Self {
            client_id,
            seq,
            timestamp: crate::utils::current_timestamp_ns() as f64 / 1_000_000_000.0,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Wrap the serialized document in a broadcast operation
    pub fn into_operation(self) -> Result<Operation> {
        let body = Bytes::from(self.to_bytes()?);
        Ok(Operation::new(SEND_COMMAND, vec![body]))
    }
}

/// Frame body for an operation: its arguments, concatenated in order
pub fn encode(op: &Operation) -> Vec<u8> {
    match op.args() {
        [single] => single.to_vec(),
        args => args.iter().flat_map(|a| a.iter().copied()).collect(),
    }
}
