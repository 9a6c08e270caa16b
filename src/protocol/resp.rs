//! Request/response codec for the Redis-style text protocol.
//!
//! Requests are always framed as an array of bulk strings:
//!
//! ```text
//! *3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
//! ```
//!
//! Replies are selected by their lead byte (`+ - : $ *`). Parsing is split in
//! two layers: [`parse_reply`] is a pure function over a byte slice that
//! either yields a complete reply, asks for more input, or reports a
//! violation; [`RespReader`] owns the socket buffer and drives the parser
//! under a deadline.

use super::{Operation, Reply};
use crate::error::HarnessError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

const CRLF: &[u8] = b"\r\n";

/// Longest header or status line accepted before giving up on the stream
const MAX_LINE_LEN: usize = 64 * 1024;

/// Largest bulk payload the server may declare (matches the 512MB server limit)
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Parser failure.
///
/// `consumed` is set when the offending line was read to its end, so the
/// stream is still aligned on the next reply and the caller may continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub consumed: Option<usize>,
}

impl ParseError {
    fn desync(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            consumed: None,
        }
    }

    fn in_sync(message: impl Into<String>, consumed: usize) -> Self {
        Self {
            message: message.into(),
            consumed: Some(consumed),
        }
    }
}

impl From<ParseError> for HarnessError {
    fn from(e: ParseError) -> Self {
        HarnessError::protocol(e.message, e.consumed.is_none())
    }
}

type ParseResult<T> = Result<Option<(T, usize)>, ParseError>;

/// Serialize an operation as an array of bulk strings
pub fn encode(op: &Operation) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(encoded_len(op));
    encode_into(op, &mut buf);
    buf.to_vec()
}

/// Append the wire form of `op` to `buf`
pub fn encode_into(op: &Operation, buf: &mut BytesMut) {
    buf.put_u8(b'*');
    buf.put_slice(op.len().to_string().as_bytes());
    buf.put_slice(CRLF);
    for part in op.parts() {
        put_bulk(buf, part);
    }
}

/// Exact number of bytes [`encode`] will produce
pub fn encoded_len(op: &Operation) -> usize {
    let header = 1 + op.len().to_string().len() + 2;
    header
        + op.parts()
            .map(|p| 1 + p.len().to_string().len() + 2 + p.len() + 2)
            .sum::<usize>()
}

fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u8(b'$');
    buf.put_slice(data.len().to_string().as_bytes());
    buf.put_slice(CRLF);
    buf.put_slice(data);
    buf.put_slice(CRLF);
}

impl Reply {
    /// Serialize the reply the way a conforming server would send it
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            Reply::Simple(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            Reply::Error(s) => {
                buf.put_u8(b'-');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            Reply::Integer(n) => {
                buf.put_u8(b':');
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            Reply::Bulk(Some(data)) => put_bulk(&mut buf, data),
            Reply::Bulk(None) => buf.put_slice(b"$-1\r\n"),
            Reply::Array(raw) => {
                buf.put_u8(b'*');
                buf.put_slice(raw.as_bytes());
                buf.put_slice(CRLF);
            }
        }
        buf.to_vec()
    }
}

/// Locate the CRLF ending the line that starts at `buf[0]`
fn find_line(buf: &[u8]) -> Result<Option<usize>, ParseError> {
    match buf.windows(2).position(|w| w == CRLF) {
        Some(pos) => Ok(Some(pos)),
        None if buf.len() > MAX_LINE_LEN => Err(ParseError::desync(format!(
            "no line terminator within {} bytes",
            MAX_LINE_LEN
        ))),
        None => Ok(None),
    }
}

fn line_text(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

/// Parse a bulk-string body whose header line ends at `header_end`.
///
/// Returns the payload (or nil) and the total bytes consumed from `buf`.
fn parse_bulk_body(buf: &[u8], header: &[u8], header_end: usize) -> ParseResult<Option<Bytes>> {
    let declared: i64 = std::str::from_utf8(header)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            ParseError::desync(format!("invalid bulk length {:?}", line_text(header)))
        })?;

    let body_start = header_end + 2;
    if declared == -1 {
        return Ok(Some((None, body_start)));
    }
    if !(0..=MAX_BULK_LEN).contains(&declared) {
        return Err(ParseError::desync(format!(
            "bulk length {} out of range",
            declared
        )));
    }

    let len = declared as usize;
    let end = body_start + len;
    if buf.len() < end + 2 {
        return Ok(None);
    }
    if &buf[end..end + 2] != CRLF {
        return Err(ParseError::desync("bulk string missing CRLF terminator"));
    }
    Ok(Some((Some(Bytes::copy_from_slice(&buf[body_start..end])), end + 2)))
}

/// Try to parse one reply from the front of `buf`.
///
/// - `Ok(Some((reply, n)))`: a complete reply occupying the first `n` bytes
/// - `Ok(None)`: more input is needed
/// - `Err(_)`: the bytes do not form a valid reply
pub fn parse_reply(buf: &[u8]) -> ParseResult<Reply> {
    let Some(line_end) = find_line(buf)? else {
        return Ok(None);
    };
    let consumed = line_end + 2;
    let line = &buf[1..line_end.max(1)];

    match buf[0] {
        b'+' => Ok(Some((Reply::Simple(line_text(line)), consumed))),
        b'-' => Ok(Some((Reply::Error(line_text(line)), consumed))),
        b':' => {
            let value = std::str::from_utf8(line)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| {
                    ParseError::in_sync(
                        format!("invalid integer reply {:?}", line_text(line)),
                        consumed,
                    )
                })?;
            Ok(Some((Reply::Integer(value), consumed)))
        }
        b'$' => Ok(parse_bulk_body(buf, line, line_end)?.map(|(b, n)| (Reply::Bulk(b), n))),
        b'*' => Ok(Some((Reply::Array(line_text(line)), consumed))),
        other => Err(ParseError::desync(format!(
            "unknown reply type byte 0x{:02x}",
            other
        ))),
    }
}

/// Parse one array-of-bulk-strings request from the front of `buf`.
///
/// This is the server-side counterpart of [`encode`].
pub fn parse_command(buf: &[u8]) -> ParseResult<Operation> {
    let Some(line_end) = find_line(buf)? else {
        return Ok(None);
    };
    if buf[0] != b'*' {
        return Err(ParseError::desync(format!(
            "request must start with '*', got 0x{:02x}",
            buf[0]
        )));
    }
    let count: usize = std::str::from_utf8(&buf[1..line_end])
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|&n| n > 0)
        .ok_or_else(|| ParseError::desync("invalid request element count"))?;

    let mut pos = line_end + 2;
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let rest = &buf[pos..];
        let Some(header_end) = find_line(rest)? else {
            return Ok(None);
        };
        if rest[0] != b'$' {
            return Err(ParseError::desync("request element is not a bulk string"));
        }
        match parse_bulk_body(rest, &rest[1..header_end], header_end)? {
            Some((Some(data), n)) => {
                parts.push(data);
                pos += n;
            }
            Some((None, _)) => return Err(ParseError::desync("nil request element")),
            None => return Ok(None),
        }
    }

    let mut parts = parts.into_iter();
    let command = parts.next().unwrap_or_default();
    Ok(Some((Operation::new(command, parts.collect()), pos)))
}

/// Buffered reply decoder over an async byte source.
///
/// Bytes are accumulated with `read_buf`, which is cancellation safe, so a
/// reply that misses its deadline stays in the buffer and is picked up by
/// the next call.
pub struct RespReader<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> RespReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Decode exactly one reply, waiting at most `deadline` for input.
    ///
    /// An error reply (`-`) is returned as `Ok(Reply::Error(..))`; turning it
    /// into a failed outcome is the caller's job.
    pub async fn decode_reply(&mut self, deadline: Duration) -> Result<Reply, HarnessError> {
        match timeout(deadline, self.read_reply()).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::OperationTimeout(deadline)),
        }
    }

    async fn read_reply(&mut self) -> Result<Reply, HarnessError> {
        loop {
            match parse_reply(&self.buffer) {
                Ok(Some((reply, n))) => {
                    self.buffer.advance(n);
                    return Ok(reply);
                }
                Ok(None) => {}
                Err(e) => {
                    match e.consumed {
                        Some(n) => self.buffer.advance(n),
                        None => self.buffer.clear(),
                    }
                    return Err(e.into());
                }
            }

            self.buffer.reserve(4096);
            if self.reader.read_buf(&mut self.buffer).await? == 0 {
                return Err(HarnessError::ConnectionClosed);
            }
        }
    }

    /// Bytes received but not yet consumed by a decoded reply
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Reply {
        let (reply, n) = parse_reply(bytes).unwrap().unwrap();
        assert_eq!(n, bytes.len());
        reply
    }

    #[test]
    fn test_encode_set_command() {
        let op = Operation::set("foo", "bar");
        assert_eq!(
            encode(&op),
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n".to_vec()
        );
        assert_eq!(encoded_len(&op), encode(&op).len());
    }

    #[test]
    fn test_encode_is_binary_safe() {
        let op = Operation::set("k", Bytes::from_static(b"a\r\n$1\r\n\0"));
        let wire = encode(&op);
        let (parsed, n) = parse_command(&wire).unwrap().unwrap();
        assert_eq!(n, wire.len());
        assert_eq!(parsed, op);
    }

    #[test]
    fn test_command_round_trip() {
        let ops = vec![
            Operation::new("PING", vec![]),
            Operation::get("key_1_7"),
            Operation::set("key_1_7", "x".repeat(1000)),
            Operation::del("key_3_0"),
            Operation::set("", ""),
        ];
        for op in ops {
            let wire = encode(&op);
            let (parsed, n) = parse_command(&wire).unwrap().unwrap();
            assert_eq!(n, wire.len());
            assert_eq!(parsed.command(), op.command());
            assert_eq!(parsed.args(), op.args());
        }
    }

    #[test]
    fn test_reply_round_trip_each_variant() {
        let replies = vec![
            Reply::Simple("OK".into()),
            Reply::Error("ERR unknown command".into()),
            Reply::Integer(-42),
            Reply::Integer(i64::MAX),
            Reply::Bulk(Some(Bytes::from_static(b"hello\r\nworld"))),
            Reply::Bulk(Some(Bytes::new())),
            Reply::Bulk(None),
        ];
        for reply in replies {
            assert_eq!(decode_all(&reply.encode()), reply);
        }
    }

    #[test]
    fn test_nil_bulk_is_not_empty_string() {
        let reply = decode_all(b"$-1\r\n");
        assert_eq!(reply, Reply::Bulk(None));
        assert_ne!(reply, Reply::Bulk(Some(Bytes::new())));
    }

    #[test]
    fn test_array_header_is_opaque() {
        assert_eq!(decode_all(b"*2\r\n"), Reply::Array("2".into()));
    }

    #[test]
    fn test_incomplete_input_needs_more() {
        assert_eq!(parse_reply(b"").unwrap(), None);
        assert_eq!(parse_reply(b"+OK").unwrap(), None);
        assert_eq!(parse_reply(b"$5\r\nhel").unwrap(), None);
        assert_eq!(parse_reply(b"$5\r\nhello\r").unwrap(), None);
        assert_eq!(parse_command(b"*2\r\n$3\r\nGET\r\n").unwrap(), None);
    }

    #[test]
    fn test_bad_integer_keeps_stream_aligned() {
        let err = parse_reply(b":12x\r\n+OK\r\n").unwrap_err();
        assert_eq!(err.consumed, Some(6));
        let harness: HarnessError = err.into();
        assert!(!harness.is_fatal_to_connection());
    }

    #[test]
    fn test_violations_desynchronize() {
        for bad in [
            b"?what\r\n".as_ref(),
            b"$abc\r\n".as_ref(),
            b"$-5\r\n".as_ref(),
            b"$3\r\nabcXY".as_ref(),
        ] {
            let err = parse_reply(bad).unwrap_err();
            assert_eq!(err.consumed, None, "input {:?}", bad);
        }
    }

    #[tokio::test]
    async fn test_reader_decodes_split_reply() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = RespReader::new(client);

        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(b"$5\r\nhe").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            server.write_all(b"llo\r\n:7\r\n").await.unwrap();
            server
        });

        let first = reader.decode_reply(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first, Reply::Bulk(Some(Bytes::from_static(b"hello"))));
        let second = reader.decode_reply(Duration::from_secs(1)).await.unwrap();
        assert_eq!(second, Reply::Integer(7));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_reader_error_reply_is_not_stream_error() {
        let (client, mut server) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        server.write_all(b"-ERR wrong\r\n").await.unwrap();
        let mut reader = RespReader::new(client);
        let reply = reader.decode_reply(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, Reply::Error("ERR wrong".into()));
    }

    #[tokio::test]
    async fn test_reader_eof_mid_reply_is_connection_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        server.write_all(b"$10\r\nabc").await.unwrap();
        drop(server);
        let mut reader = RespReader::new(client);
        let err = reader
            .decode_reply(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_times_out_without_input() {
        let (client, _server) = tokio::io::duplex(64);
        let mut reader = RespReader::new(client);
        let err = reader
            .decode_reply(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::OperationTimeout(d) if d == Duration::from_secs(5)));
    }
}
