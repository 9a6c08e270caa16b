use super::{Connection, Connector};
use crate::error::HarnessError;
use crate::protocol::{resp, Operation, Reply};
use async_trait::async_trait;
use bytes::BytesMut;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Opens plain TCP connections to a RESP server at `host:port`
pub struct RespConnector {
    address: String,
}

impl RespConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Connector for RespConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, HarnessError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| HarnessError::Connect(e.to_string()))?;

        // Configure socket options for low latency
        let socket = socket2::SockRef::from(&stream);
        socket
            .set_nodelay(true)
            .map_err(|e| HarnessError::Connect(e.to_string()))?;

        debug!("RESP client connected to: {}", self.address);
        Ok(Box::new(RespConnection::new(stream)))
    }

    fn endpoint(&self) -> &str {
        &self.address
    }
}

/// RESP connection with one logical request in flight.
///
/// When a reply misses its deadline the request is remembered as
/// abandoned; its late reply is read and discarded before the reply to the
/// next request, so replies never shift onto the wrong operation.
pub struct RespConnection {
    reader: resp::RespReader<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    write_buf: BytesMut,
    outstanding: usize,
}

impl RespConnection {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: resp::RespReader::new(read_half),
            writer: Some(write_half),
            write_buf: BytesMut::with_capacity(4096),
            outstanding: 0,
        }
    }
}

#[async_trait]
impl Connection for RespConnection {
    async fn send(&mut self, op: &Operation) -> Result<usize, HarnessError> {
        let writer = self.writer.as_mut().ok_or(HarnessError::ConnectionClosed)?;

        self.write_buf.clear();
        resp::encode_into(op, &mut self.write_buf);
        writer.write_all(&self.write_buf).await?;
        self.outstanding += 1;

        Ok(self.write_buf.len())
    }

    async fn receive(&mut self, deadline: Duration) -> Result<Reply, HarnessError> {
        let started = Instant::now();
        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            let reply = match self.reader.decode_reply(remaining).await {
                Ok(reply) => reply,
                // Report the full per-operation deadline, not what was left of it
                Err(HarnessError::OperationTimeout(_)) => {
                    return Err(HarnessError::OperationTimeout(deadline))
                }
                Err(e) => {
                    // An in-sync protocol violation still answered one request
                    if matches!(e, HarnessError::ProtocolViolation { desynchronized: false, .. }) {
                        self.outstanding = self.outstanding.saturating_sub(1);
                    }
                    return Err(e);
                }
            };
            self.outstanding = self.outstanding.saturating_sub(1);
            if self.outstanding == 0 {
                return Ok(reply);
            }
            trace!(
                "Discarding late reply ({} abandoned request(s) left)",
                self.outstanding
            );
        }
    }

    async fn close(&mut self) -> Result<(), HarnessError> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        debug!("RESP connection closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "RESP over TCP"
    }
}
