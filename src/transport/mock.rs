//! In-memory connector for unit tests of the connection manager, driver and
//! run controller.

use super::{Connection, Connector};
use crate::error::HarnessError;
use crate::protocol::{resp, Operation, Reply};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Copy)]
enum ConnectBehavior {
    Succeed,
    Hang,
    Refuse,
    /// Refuse this many attempts, then succeed
    Flaky(u32),
    /// Panic inside the connect call
    Panic,
}

/// Where an established mock connection gets stuck
#[derive(Clone, Copy, PartialEq, Eq)]
enum Stall {
    /// Writes never complete, like a peer that stopped reading
    Send,
    /// Requests go out but no reply ever comes back
    Receive,
}

pub(crate) struct MockConnector {
    behavior: ConnectBehavior,
    reply: Reply,
    close_after: Option<usize>,
    stall: Option<Stall>,
    pub attempts: AtomicU32,
    pub attempt_started: Mutex<Vec<Instant>>,
    pub closes: Arc<AtomicUsize>,
    pub sent: Arc<AtomicUsize>,
    pub bytes_sent: Arc<AtomicUsize>,
}

impl MockConnector {
    fn with_behavior(behavior: ConnectBehavior) -> Self {
        Self {
            behavior,
            reply: Reply::Simple("OK".into()),
            close_after: None,
            stall: None,
            attempts: AtomicU32::new(0),
            attempt_started: Mutex::new(Vec::new()),
            closes: Arc::new(AtomicUsize::new(0)),
            sent: Arc::new(AtomicUsize::new(0)),
            bytes_sent: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn healthy() -> Self {
        Self::with_behavior(ConnectBehavior::Succeed)
    }

    pub fn hanging() -> Self {
        Self::with_behavior(ConnectBehavior::Hang)
    }

    pub fn refusing() -> Self {
        Self::with_behavior(ConnectBehavior::Refuse)
    }

    pub fn panicking() -> Self {
        Self::with_behavior(ConnectBehavior::Panic)
    }

    pub fn flaky(failures: u32) -> Self {
        Self::with_behavior(ConnectBehavior::Flaky(failures))
    }

    /// Answer every operation with `reply`
    pub fn replying(mut self, reply: Reply) -> Self {
        self.reply = reply;
        self
    }

    /// Report the peer as gone once `sends` operations went through
    pub fn closing_after(mut self, sends: usize) -> Self {
        self.close_after = Some(sends);
        self
    }

    /// Never finish writing a request
    pub fn stalling_sends(mut self) -> Self {
        self.stall = Some(Stall::Send);
        self
    }

    /// Accept requests but never reply
    pub fn silent(mut self) -> Self {
        self.stall = Some(Stall::Receive);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, HarnessError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.attempt_started.lock().push(Instant::now());

        match self.behavior {
            ConnectBehavior::Hang => std::future::pending::<()>().await,
            ConnectBehavior::Panic => panic!("connector failed unexpectedly"),
            ConnectBehavior::Refuse => {
                return Err(HarnessError::Connect("connection refused".into()))
            }
            ConnectBehavior::Flaky(failures) if attempt <= failures => {
                return Err(HarnessError::Connect("connection refused".into()))
            }
            _ => {}
        }

        Ok(Box::new(MockConnection {
            reply: self.reply.clone(),
            remaining: self.close_after,
            stall: self.stall,
            closes: Arc::clone(&self.closes),
            sent: Arc::clone(&self.sent),
            bytes_sent: Arc::clone(&self.bytes_sent),
        }))
    }

    fn endpoint(&self) -> &str {
        "mock://target"
    }
}

struct MockConnection {
    reply: Reply,
    remaining: Option<usize>,
    stall: Option<Stall>,
    closes: Arc<AtomicUsize>,
    sent: Arc<AtomicUsize>,
    bytes_sent: Arc<AtomicUsize>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, op: &Operation) -> Result<usize, HarnessError> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Err(HarnessError::ConnectionClosed);
            }
            *remaining -= 1;
        }
        if self.stall == Some(Stall::Send) {
            std::future::pending::<()>().await;
        }
        let len = resp::encoded_len(op);
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.bytes_sent.fetch_add(len, Ordering::SeqCst);
        Ok(len)
    }

    async fn receive(&mut self, deadline: Duration) -> Result<Reply, HarnessError> {
        if self.stall == Some(Stall::Receive) {
            tokio::time::sleep(deadline).await;
            return Err(HarnessError::OperationTimeout(deadline));
        }
        Ok(self.reply.clone())
    }

    async fn close(&mut self) -> Result<(), HarnessError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
