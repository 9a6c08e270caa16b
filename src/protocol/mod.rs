//! Wire-level data model shared by both protocol families.
//!
//! An [`Operation`] is an opaque command name plus argument byte strings. The
//! request/response family (`resp`) frames it as an array of bulk strings and
//! answers with exactly one [`Reply`]; the message-framed family (`frame`)
//! carries a single JSON document per WebSocket frame.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod frame;
pub mod resp;

/// Category tag attached to every operation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Key lookup (GET)
    Read,
    /// Key store (SET)
    Write,
    /// Key removal (DEL)
    Delete,
    /// Broadcast frame send/receive
    Message,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Read => write!(f, "GET"),
            OperationKind::Write => write!(f, "SET"),
            OperationKind::Delete => write!(f, "DEL"),
            OperationKind::Message => write!(f, "MESSAGE"),
        }
    }
}

/// A command and its ordered arguments. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    command: Bytes,
    args: Vec<Bytes>,
}

impl Operation {
    pub fn new(command: impl Into<Bytes>, args: Vec<Bytes>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn get(key: &str) -> Self {
        Self::new("GET", vec![Bytes::copy_from_slice(key.as_bytes())])
    }

    pub fn set(key: &str, value: impl Into<Bytes>) -> Self {
        Self::new(
            "SET",
            vec![Bytes::copy_from_slice(key.as_bytes()), value.into()],
        )
    }

    pub fn del(key: &str) -> Self {
        Self::new("DEL", vec![Bytes::copy_from_slice(key.as_bytes())])
    }

    pub fn command(&self) -> &[u8] {
        &self.command
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Command followed by the arguments, the order in which they hit the wire
    pub fn parts(&self) -> impl Iterator<Item = &Bytes> {
        std::iter::once(&self.command).chain(self.args.iter())
    }

    /// Number of wire elements (command included)
    pub fn len(&self) -> usize {
        1 + self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// One decoded reply unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+` status line
    Simple(String),
    /// `-` error line sent by the service
    Error(String),
    /// `:` signed integer
    Integer(i64),
    /// `$` bulk string; `None` is the explicit nil (`$-1`)
    Bulk(Option<Bytes>),
    /// `*` array header; the rest of the header line, elements are not decoded
    Array(String),
}

impl Reply {
    /// Payload bytes carried by the reply, used for throughput accounting
    pub fn payload_len(&self) -> usize {
        match self {
            Reply::Simple(s) | Reply::Error(s) | Reply::Array(s) => s.len(),
            Reply::Integer(_) => std::mem::size_of::<i64>(),
            Reply::Bulk(Some(b)) => b.len(),
            Reply::Bulk(None) => 0,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Bulk(None))
    }
}
