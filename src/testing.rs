//! In-process doubles for the transport seams.
//!
//! [`ScriptedTransport`] records every frame and answers through a
//! [`Responder`] once the writer flushes; replies are delivered in order on
//! a dedicated thread, as a socket reader would, optionally held back per
//! verb. [`ScriptedConnector`] hands such transports to bridges.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use crate::core::bridge::{ConnectionToken, PhysicalBridge};
use crate::core::transport::{Connector, Transport};
use crate::proto::error::ConnectionFailureType;
use crate::proto::frame::Frame;

/// Computes the reply for one written frame; `None` leaves it unanswered.
pub(crate) type Responder = Arc<dyn Fn(&str, &Frame) -> Option<Frame> + Send + Sync>;

/// Builds a responder from `(endpoint, VERB, args) -> reply`.
pub(crate) fn respond(
    f: impl Fn(&str, &str, &[Bytes]) -> Option<Frame> + Send + Sync + 'static,
) -> Responder {
    Arc::new(move |endpoint, frame| {
        let args = args_of(frame);
        let verb = verb_of(frame);
        f(endpoint, &verb, args.get(1..).unwrap_or(&[]))
    })
}

/// A responder that behaves like an empty Redis: PONG for PING, null or
/// zero for reads, OK otherwise. Commands between MULTI and EXEC answer
/// QUEUED and their replies come back as EXEC's array. (Un)subscribes are
/// confirmed for their first channel only.
pub(crate) fn redis_like() -> Responder {
    let queued: Arc<Mutex<HashMap<String, Vec<Frame>>>> = Arc::default();
    respond(move |endpoint, verb, args| {
        if let Some(count) = subscription_count(verb) {
            return Some(Frame::Array(vec![
                Frame::bulk(verb.to_ascii_lowercase()),
                args.first().map_or(Frame::Null, |channel| Frame::bulk(channel.clone())),
                Frame::Integer(count),
            ]));
        }
        let reply = match verb {
            "PING" => Frame::simple("PONG"),
            "GET" | "HGET" => Frame::Null,
            "EXISTS" | "HEXISTS" | "DEL" => Frame::Integer(0),
            "INCR" => Frame::Integer(1),
            _ => Frame::simple("OK"),
        };
        let mut queued = queued.lock().unwrap_or_else(PoisonError::into_inner);
        Some(match verb {
            "MULTI" => {
                queued.insert(endpoint.to_string(), Vec::new());
                Frame::simple("OK")
            }
            "EXEC" => Frame::Array(queued.remove(endpoint).unwrap_or_default()),
            "DISCARD" => {
                queued.remove(endpoint);
                Frame::simple("OK")
            }
            _ => match queued.get_mut(endpoint) {
                Some(replies) => {
                    replies.push(reply);
                    Frame::simple("QUEUED")
                }
                None => reply,
            },
        })
    })
}

fn subscription_count(verb: &str) -> Option<i64> {
    match verb {
        "SUBSCRIBE" | "PSUBSCRIBE" => Some(1),
        "UNSUBSCRIBE" | "PUNSUBSCRIBE" => Some(0),
        _ => None,
    }
}

/// The confirmation or delivery a subscription connection pushes.
pub(crate) fn push_frame(kind: &str, fields: &[&str]) -> Frame {
    let mut items = vec![Frame::bulk(kind.to_string())];
    items.extend(fields.iter().map(|field| Frame::bulk(field.to_string())));
    Frame::Array(items)
}

pub(crate) fn args_of(frame: &Frame) -> Vec<Bytes> {
    match frame {
        Frame::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Frame::BulkString(Some(b)) => Some(b.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn verb_of(frame: &Frame) -> String {
    args_of(frame)
        .first()
        .map(|verb| String::from_utf8_lossy(verb).to_ascii_uppercase())
        .unwrap_or_default()
}

/// Recording transport with scripted replies.
pub(crate) struct ScriptedTransport {
    endpoint: String,
    responder: Responder,
    delays: HashMap<String, Duration>,
    written: Mutex<Vec<Frame>>,
    unflushed: Mutex<Vec<Frame>>,
    replies: Mutex<Option<mpsc::Sender<(Frame, Option<Duration>)>>>,
    closed: AtomicBool,
}

impl ScriptedTransport {
    /// Creates a transport whose replies go to `bridge` under `token`.
    pub(crate) fn attach(
        bridge: &Arc<PhysicalBridge>,
        token: ConnectionToken,
        responder: Responder,
    ) -> Arc<Self> {
        Self::attach_delayed(bridge, token, responder, HashMap::new())
    }

    /// Like [`attach`](Self::attach), holding back the replies to the verbs
    /// in `delays`. Later replies wait behind a held one.
    pub(crate) fn attach_delayed(
        bridge: &Arc<PhysicalBridge>,
        token: ConnectionToken,
        responder: Responder,
        delays: HashMap<String, Duration>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<(Frame, Option<Duration>)>();
        let weak = Arc::downgrade(bridge);
        thread::spawn(move || {
            for (frame, delay) in rx {
                if let Some(delay) = delay {
                    thread::sleep(delay);
                }
                match weak.upgrade() {
                    Some(bridge) => bridge.on_reply(token, frame),
                    None => break,
                }
            }
        });
        Arc::new(Self {
            endpoint: bridge.endpoint().to_string(),
            responder,
            delays,
            written: Mutex::new(Vec::new()),
            unflushed: Mutex::new(Vec::new()),
            replies: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        })
    }

    /// Every flushed frame, in wire order.
    pub(crate) fn written(&self) -> Vec<Frame> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The verbs of every flushed frame.
    pub(crate) fn verbs(&self) -> Vec<String> {
        self.written().iter().map(verb_of).collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Delivers `frame` as if the server sent it unprompted.
    pub(crate) fn push(&self, frame: Frame) {
        if let Some(tx) = &*self.replies.lock().unwrap_or_else(PoisonError::into_inner) {
            let _ = tx.send((frame, None));
        }
    }
}

impl Transport for ScriptedTransport {
    fn write(&self, frame: &Frame) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"));
        }
        self.unflushed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.clone());
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"));
        }
        let batch: Vec<Frame> = self
            .unflushed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
        for frame in batch {
            let reply = (self.responder)(&self.endpoint, &frame);
            let delay = self.delays.get(&verb_of(&frame)).copied();
            self.written
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(frame);
            if let (Some(reply), Some(tx)) = (reply, &*replies) {
                let _ = tx.send((reply, delay));
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Connector that opens [`ScriptedTransport`]s synchronously.
pub(crate) struct ScriptedConnector {
    responder: Responder,
    delays: Mutex<HashMap<String, Duration>>,
    refused: Mutex<HashSet<String>>,
    opened: Mutex<Vec<Arc<ScriptedTransport>>>,
}

impl ScriptedConnector {
    pub(crate) fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            responder,
            delays: Mutex::new(HashMap::new()),
            refused: Mutex::new(HashSet::new()),
            opened: Mutex::new(Vec::new()),
        })
    }

    /// Holds back replies to `verb` by `delay` on transports opened from now
    /// on.
    pub(crate) fn delay(&self, verb: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(verb.to_ascii_uppercase(), delay);
    }

    /// Makes future connection attempts to `endpoint` fail.
    pub(crate) fn refuse(&self, endpoint: &str) {
        self.refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.to_string());
    }

    /// Lets connection attempts to `endpoint` succeed again.
    pub(crate) fn allow(&self, endpoint: &str) {
        self.refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint);
    }

    /// The most recent transport opened to `endpoint`.
    pub(crate) fn transport(&self, endpoint: &str) -> Option<Arc<ScriptedTransport>> {
        self.transports(endpoint).pop()
    }

    /// Every transport opened to `endpoint`, oldest first.
    pub(crate) fn transports(&self, endpoint: &str) -> Vec<Arc<ScriptedTransport>> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| t.endpoint == endpoint)
            .cloned()
            .collect()
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, bridge: Arc<PhysicalBridge>, token: ConnectionToken) {
        let refused = self
            .refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(bridge.endpoint());
        if refused {
            bridge.on_connection_failed(token, ConnectionFailureType::UnableToConnect, "refused");
            return;
        }
        let delays = self
            .delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let transport =
            ScriptedTransport::attach_delayed(&bridge, token, self.responder.clone(), delays);
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transport.clone());
        bridge.on_connected(token, transport);
    }
}
