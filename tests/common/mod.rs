//! In-process servers used by the integration tests.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use netbox_stress::protocol::{resp, Reply};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

/// How the mock key-value server treats incoming commands
#[derive(Clone, Copy, Debug)]
pub enum KvMode {
    /// Answer every command like a key-value store
    Normal,
    /// Read commands but never answer
    Silent,
    /// Answer this many commands per connection, then hang up
    CloseAfter(usize),
    /// Accept connections and hold them open without reading a byte
    NeverRead,
    /// Send `bad_integers` unparsable integer replies, then `valid` real
    /// replies, then a reply with an unknown type byte
    Malformed { bad_integers: usize, valid: usize },
}

#[derive(Default)]
pub struct KvStats {
    pub commands: AtomicUsize,
    pub connections: AtomicUsize,
    store: Mutex<HashMap<Bytes, Bytes>>,
}

impl KvStats {
    pub fn commands(&self) -> usize {
        self.commands.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn apply(&self, command: &[u8], args: &[Bytes]) -> Reply {
        let mut store = self.store.lock().unwrap();
        match (command, args) {
            (b"GET", [key]) => Reply::Bulk(store.get(key).cloned()),
            (b"SET", [key, value]) => {
                store.insert(key.clone(), value.clone());
                Reply::Simple("OK".into())
            }
            (b"DEL", keys) if !keys.is_empty() => {
                let removed = keys.iter().filter(|k| store.remove(*k).is_some()).count();
                Reply::Integer(removed as i64)
            }
            _ => Reply::Error("ERR unknown command".into()),
        }
    }
}

/// Start a RESP key-value server on an ephemeral port
pub async fn spawn_kv_server(mode: KvMode) -> (String, Arc<KvStats>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let stats = Arc::new(KvStats::default());

    let server_stats = Arc::clone(&stats);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            server_stats.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_kv(stream, mode, Arc::clone(&server_stats)));
        }
    });

    (addr, stats)
}

async fn serve_kv(mut stream: TcpStream, mode: KvMode, stats: Arc<KvStats>) {
    if let KvMode::NeverRead = mode {
        std::future::pending::<()>().await;
        drop(stream);
        return;
    }

    let mut buf = BytesMut::with_capacity(4096);
    let mut answered = 0;

    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        while let Ok(Some((op, consumed))) = resp::parse_command(&buf) {
            let _ = buf.split_to(consumed);
            stats.commands.fetch_add(1, Ordering::SeqCst);

            match mode {
                KvMode::Silent => continue,
                KvMode::CloseAfter(limit) if answered >= limit => return,
                _ => {}
            }

            let reply = match mode {
                KvMode::Malformed { bad_integers, .. } if answered < bad_integers => {
                    b":12x\r\n".to_vec()
                }
                KvMode::Malformed { bad_integers, valid } if answered >= bad_integers + valid => {
                    b"?bad\r\n".to_vec()
                }
                _ => stats.apply(op.command(), op.args()).encode(),
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
            answered += 1;
        }
    }
}

/// Start a WebSocket server that echoes every data frame back
pub async fn spawn_ws_echo_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let frames = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&frames);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(_) | Message::Binary(_) => {
                            counter.fetch_add(1, Ordering::SeqCst);
                            if ws.send(message).await.is_err() {
                                return;
                            }
                        }
                        Message::Close(_) => return,
                        _ => {}
                    }
                }
            });
        }
    });

    (url, frames)
}

/// An address nothing listens on
pub async fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}
