//! In-process mock Redis server for integration tests.
//!
//! Speaks enough RESP to exercise the multiplexer over real sockets: an
//! in-memory keyspace, MULTI/EXEC queueing, WATCH dirty-tracking and an
//! optional per-command override hook.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use muxplex::proto::codec::{Decoder, Encoder};
use muxplex::Frame;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Returns `Some(reply)` to answer a command instead of the keyspace.
pub type Hook = Arc<dyn Fn(&str, &[Bytes]) -> Option<Frame> + Send + Sync>;

#[derive(Default)]
struct Keyspace {
    values: HashMap<Bytes, Bytes>,
    /// Bumped on every write, for WATCH.
    versions: HashMap<Bytes, u64>,
}

impl Keyspace {
    fn write(&mut self, key: &Bytes, value: Option<Bytes>) {
        match value {
            Some(value) => self.values.insert(key.clone(), value),
            None => self.values.remove(key),
        };
        *self.versions.entry(key.clone()).or_default() += 1;
    }

    fn version(&self, key: &Bytes) -> u64 {
        self.versions.get(key).copied().unwrap_or_default()
    }
}

/// A mock server listening on an ephemeral port.
pub struct MockServer {
    pub addr: SocketAddr,
    keyspace: Arc<Mutex<Keyspace>>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::with_hook(Arc::new(|_: &str, _: &[Bytes]| None)).await
    }

    pub async fn with_hook(hook: Hook) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let keyspace: Arc<Mutex<Keyspace>> = Arc::default();

        let shared = keyspace.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, shared.clone(), hook.clone()));
            }
        });
        Self { addr, keyspace }
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Writes a key as another client would.
    pub fn set(&self, key: &str, value: &str) {
        let key = Bytes::copy_from_slice(key.as_bytes());
        let value = Bytes::copy_from_slice(value.as_bytes());
        self.keyspace.lock().unwrap().write(&key, Some(value));
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.keyspace
            .lock()
            .unwrap()
            .values
            .get(key.as_bytes())
            .cloned()
    }
}

#[derive(Default)]
struct Session {
    queued: Option<Vec<Vec<Bytes>>>,
    watched: Vec<(Bytes, u64)>,
}

async fn serve(mut socket: TcpStream, keyspace: Arc<Mutex<Keyspace>>, hook: Hook) {
    let mut decoder = Decoder::new();
    let mut encoder = Encoder::new();
    let mut session = Session::default();
    let mut buf = [0u8; 4096];

    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.append(&buf[..n]);

        while let Ok(Some(frame)) = decoder.decode() {
            let args = args_of(frame);
            let Some(verb) = args.first() else {
                continue;
            };
            let verb = String::from_utf8_lossy(verb).to_ascii_uppercase();
            let reply = match hook(&verb, &args[1..]) {
                Some(reply) => reply,
                None => execute(&mut session, &keyspace, &verb, args),
            };
            encoder.encode(&reply);
        }
        if socket.write_all(&encoder.take()).await.is_err() {
            return;
        }
    }
}

fn args_of(frame: Frame) -> Vec<Bytes> {
    match frame {
        Frame::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Frame::BulkString(Some(b)) => Some(b),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn execute(
    session: &mut Session,
    keyspace: &Mutex<Keyspace>,
    verb: &str,
    args: Vec<Bytes>,
) -> Frame {
    match verb {
        "MULTI" => {
            session.queued = Some(Vec::new());
            return Frame::simple("OK");
        }
        "DISCARD" => {
            session.queued = None;
            session.watched.clear();
            return Frame::simple("OK");
        }
        "WATCH" => {
            let space = keyspace.lock().unwrap();
            for key in &args[1..] {
                session.watched.push((key.clone(), space.version(key)));
            }
            return Frame::simple("OK");
        }
        "UNWATCH" => {
            session.watched.clear();
            return Frame::simple("OK");
        }
        "EXEC" => {
            let Some(queued) = session.queued.take() else {
                return Frame::error("ERR EXEC without MULTI");
            };
            let mut space = keyspace.lock().unwrap();
            let dirty = session
                .watched
                .drain(..)
                .any(|(key, version)| space.version(&key) != version);
            if dirty {
                return Frame::Null;
            }
            let replies = queued
                .into_iter()
                .map(|cmd| {
                    let verb = String::from_utf8_lossy(&cmd[0]).to_ascii_uppercase();
                    apply(&mut space, &verb, &cmd)
                })
                .collect();
            return Frame::Array(replies);
        }
        _ => {}
    }

    if let Some(queued) = session.queued.as_mut() {
        queued.push(args);
        return Frame::simple("QUEUED");
    }
    let mut space = keyspace.lock().unwrap();
    apply(&mut space, verb, &args)
}

fn apply(space: &mut Keyspace, verb: &str, args: &[Bytes]) -> Frame {
    match verb {
        "PING" => Frame::simple("PONG"),
        "SELECT" | "AUTH" | "CLIENT" | "READONLY" | "READWRITE" | "ASKING" => Frame::simple("OK"),
        "GET" => Frame::BulkString(space.values.get(&args[1]).cloned()),
        "SET" => {
            space.write(&args[1], Some(args[2].clone()));
            Frame::simple("OK")
        }
        "DEL" => {
            let existed = space.values.contains_key(&args[1]);
            space.write(&args[1], None);
            Frame::Integer(i64::from(existed))
        }
        "EXISTS" => Frame::Integer(i64::from(space.values.contains_key(&args[1]))),
        "INCR" => {
            let current = space
                .values
                .get(&args[1])
                .and_then(|v| std::str::from_utf8(v).ok()?.parse::<i64>().ok())
                .unwrap_or(0);
            let next = current + 1;
            space.write(&args[1], Some(Bytes::from(next.to_string())));
            Frame::Integer(next)
        }
        _ => Frame::error(format!("ERR unknown command '{}'", verb)),
    }
}
