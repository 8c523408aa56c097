//! The per-endpoint pipeline.
//!
//! A [`PhysicalBridge`] owns one logical connection of one type to one
//! server. Producers push onto its [`MessageQueue`]; a single writer at a
//! time drains the queue onto the [`Transport`]; the transport's reader
//! hands every reply back through [`PhysicalBridge::on_reply`], where it is
//! matched to the oldest outstanding message.
//!
//! ```text
//! Disconnected --try_connect--> Connecting --on_connected--> ConnectedEstablishing
//!      ^                                                           |
//!      |                                               tracer reply |
//!      +------------------ failure / timeout ---- ConnectedEstablished
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use crate::cluster::errors::{parse_redirect, parse_redis_error};
use crate::core::command::{self, Cmd};
use crate::core::completion::Completable;
use crate::core::events::MultiplexerEvent;
use crate::core::message::{Message, Payload, ResultProcessor};
use crate::core::queue::MessageQueue;
use crate::core::server::{ServerEndPoint, ServerType};
use crate::core::transport::Transport;
use crate::core::Shared;
use crate::proto::error::{ConnectionFailureType, Error, Result};
use crate::proto::frame::Frame;

/// Which traffic a bridge carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Request/response commands.
    Interactive,
    /// Pub/sub.
    Subscription,
}

/// Connection state of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    /// No connection and no attempt in progress.
    Disconnected = 0,
    /// Waiting for the connector.
    Connecting = 1,
    /// Socket open, handshake in flight.
    ConnectedEstablishing = 2,
    /// Ready for caller traffic.
    ConnectedEstablished = 3,
}

impl BridgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BridgeState::Connecting,
            2 => BridgeState::ConnectedEstablishing,
            3 => BridgeState::ConnectedEstablished,
            _ => BridgeState::Disconnected,
        }
    }
}

/// Outcome of one write pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// Everything queued was written and flushed.
    QueueEmptyAfterWrite,
    /// The batch limit was hit; another pass has been scheduled.
    MoreWork,
    /// Another thread is already writing.
    CompetingWriter,
    /// There is no transport to write to.
    NoConnection,
}

/// Identifies one connection attempt. Callbacks carrying a token from an
/// older attempt are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionToken(u64);

/// Diagnostics for one bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCounters {
    /// Current state.
    pub state: BridgeState,
    /// Messages queued but not yet written.
    pub pending_unsent: usize,
    /// Messages written and waiting for a reply.
    pub sent_awaiting_response: usize,
    /// Connections opened over the bridge's lifetime.
    pub socket_count: u64,
    /// Messages accepted over the bridge's lifetime.
    pub operation_count: u64,
    /// Whether a write pass is running.
    pub writer_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    NotSpecified,
    ReadOnly,
    ReadWrite,
}

#[derive(Debug)]
struct WireState {
    db: Option<i64>,
    read_mode: ReadMode,
}

impl WireState {
    fn fresh() -> Self {
        Self {
            db: Some(0),
            read_mode: ReadMode::NotSpecified,
        }
    }
}

/// Confirmations a subscription command still owes after its first reply.
#[derive(Debug)]
enum Confirmations {
    None,
    /// One more `kind` reply per remaining channel.
    Count { kind: String, remaining: usize },
    /// `kind` replies until the subscription count reaches zero.
    UntilEmpty { kind: String },
}

/// Splits a pub/sub push into its lower-cased kind and remaining fields.
fn push_kind(frame: &Frame) -> Option<(String, &[Frame])> {
    let Frame::Array(items) = frame else {
        return None;
    };
    let kind = items.first()?.as_bytes()?;
    Some((String::from_utf8_lossy(kind).to_ascii_lowercase(), &items[1..]))
}

/// The subscription count carried by an (un)subscribe confirmation.
fn subscription_count(fields: &[Frame]) -> Option<i64> {
    fields.get(1).and_then(Frame::to_int)
}

fn connection_replaced() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection was replaced")
}

static KEEPALIVE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Per (endpoint, connection type) queue, writer and state machine.
pub struct PhysicalBridge {
    endpoint: String,
    connection_type: ConnectionType,
    server: Weak<ServerEndPoint>,
    shared: Weak<Shared>,
    state: AtomicU8,
    state_changed: Notify,
    queue: MessageQueue,
    awaiting: Mutex<VecDeque<Arc<Message>>>,
    active_writer: AtomicBool,
    /// The live connection and the token it was opened under.
    transport: Mutex<Option<(ConnectionToken, Arc<dyn Transport>)>>,
    generation: AtomicU64,
    wire: Mutex<WireState>,
    connect_started: Mutex<Instant>,
    last_write: Mutex<Instant>,
    /// Last time the reply backlog moved: a reply arrived, or the first
    /// outstanding write went out.
    last_progress: Mutex<Instant>,
    confirmations: Mutex<Confirmations>,
    had_failure: AtomicBool,
    disposed: AtomicBool,
    socket_count: AtomicU64,
    operation_count: AtomicU64,
    keepalive_channel: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PhysicalBridge {
    pub(crate) fn new(
        endpoint: String,
        connection_type: ConnectionType,
        server: Weak<ServerEndPoint>,
        shared: Weak<Shared>,
    ) -> Arc<Self> {
        let keepalive_channel = format!(
            "__muxplex_keepalive:{}:{}",
            std::process::id(),
            KEEPALIVE_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Arc::new(Self {
            endpoint,
            connection_type,
            server,
            shared,
            state: AtomicU8::new(BridgeState::Disconnected as u8),
            state_changed: Notify::new(),
            queue: MessageQueue::new(),
            awaiting: Mutex::new(VecDeque::new()),
            active_writer: AtomicBool::new(false),
            transport: Mutex::new(None),
            generation: AtomicU64::new(0),
            wire: Mutex::new(WireState::fresh()),
            connect_started: Mutex::new(Instant::now()),
            last_write: Mutex::new(Instant::now()),
            last_progress: Mutex::new(Instant::now()),
            confirmations: Mutex::new(Confirmations::None),
            had_failure: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            socket_count: AtomicU64::new(0),
            operation_count: AtomicU64::new(0),
            keepalive_channel,
        })
    }

    /// The `host:port` this bridge connects to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Which traffic the bridge carries.
    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    /// Current state.
    pub fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns true once the handshake has completed.
    pub fn is_established(&self) -> bool {
        self.state() == BridgeState::ConnectedEstablished
    }

    pub(crate) fn server_ref(&self) -> Weak<ServerEndPoint> {
        self.server.clone()
    }

    fn set_state(&self, state: BridgeState) -> BridgeState {
        let prev = BridgeState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if prev != state {
            debug!(endpoint = %self.endpoint, ?prev, ?state, "bridge state change");
            self.state_changed.notify_waiters();
        }
        prev
    }

    pub(crate) fn current_token(&self) -> ConnectionToken {
        ConnectionToken(self.generation.load(Ordering::Acquire))
    }

    fn is_current(&self, token: ConnectionToken) -> bool {
        token == self.current_token()
    }

    /// Waits until the bridge is established or `timeout` elapses.
    pub async fn wait_established(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.state_changed.notified();
            if self.is_established() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_established();
            }
        }
    }

    /// Queues a message for writing.
    ///
    /// # Returns
    ///
    /// `false` if the bridge is not established and the message is not an
    /// internal one; nothing is queued in that case.
    pub fn try_enqueue(self: &Arc<Self>, msg: Arc<Message>) -> bool {
        if !self.is_established() && !msg.is_internal() {
            trace!(endpoint = %self.endpoint, command = %msg.command_name(), "rejecting message, not connected");
            return false;
        }
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        if self.queue.push(msg) {
            self.request_write();
        }
        true
    }

    fn request_write(self: &Arc<Self>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.scheduler.schedule_write(self.clone());
        }
    }

    /// Runs a write pass with the configured batch size.
    pub fn write_queue_default(self: &Arc<Self>) -> WriteResult {
        let batch = self
            .shared
            .upgrade()
            .map_or(usize::MAX, |shared| shared.options.write_batch_size.max(1));
        self.write_queue(batch)
    }

    /// Drains up to `max_batch` messages onto the transport.
    ///
    /// Only one caller writes at a time; competitors return
    /// [`WriteResult::CompetingWriter`] at once.
    pub fn write_queue(self: &Arc<Self>, max_batch: usize) -> WriteResult {
        if !self.claim_writer() {
            return WriteResult::CompetingWriter;
        }

        loop {
            let connection = lock(&self.transport).clone();
            let Some((token, transport)) = connection else {
                self.release_writer();
                return WriteResult::NoConnection;
            };

            let mut written = 0;
            while written < max_batch && self.is_current(token) {
                let Some(msg) = self.queue.pop() else {
                    break;
                };
                if msg.is_completed() {
                    continue;
                }
                if let Err(e) = self.write_message(token, &transport, &msg) {
                    self.abandon(&msg, &e);
                    return self.write_failed(token, e);
                }
                written += 1;
            }

            if let Err(e) = transport.flush() {
                return self.write_failed(token, e);
            }
            if !self.is_current(token) {
                return self.write_failed(token, connection_replaced());
            }
            if written > 0 {
                trace!(endpoint = %self.endpoint, written, "flushed");
            }

            if written >= max_batch && !self.queue.is_empty() {
                self.release_writer();
                self.request_write();
                return WriteResult::MoreWork;
            }

            self.release_writer();
            // A producer may have pushed after our last pop and lost the
            // race for the writer flag.
            if self.queue.is_empty() || !self.claim_writer() {
                return WriteResult::QueueEmptyAfterWrite;
            }
        }
    }

    fn claim_writer(&self) -> bool {
        self.active_writer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release_writer(&self) {
        self.active_writer.store(false, Ordering::Release);
    }

    /// Ends a pass whose connection broke under it.
    fn write_failed(self: &Arc<Self>, token: ConnectionToken, e: io::Error) -> WriteResult {
        self.release_writer();
        self.on_connection_failed(token, ConnectionFailureType::SocketFailure, e.to_string());
        // Anything still queued was pushed for a newer connection.
        if !self.queue.is_empty() {
            self.request_write();
        }
        WriteResult::NoConnection
    }

    fn abandon(&self, msg: &Arc<Message>, e: &io::Error) {
        self.complete(
            msg,
            Err(Error::connection(
                ConnectionFailureType::SocketFailure,
                &self.endpoint,
                e.to_string(),
            )),
        );
    }

    fn write_message(
        &self,
        token: ConnectionToken,
        transport: &Arc<dyn Transport>,
        msg: &Arc<Message>,
    ) -> io::Result<()> {
        let on_slave = self.server.upgrade().map_or(false, |s| s.is_slave());
        let slave_writes = self
            .shared
            .upgrade()
            .map_or(false, |shared| shared.options.allow_slave_writes);
        if on_slave && !slave_writes && msg.is_master_only() {
            self.complete(
                msg,
                Err(Error::MasterOnly {
                    command: msg.command_name(),
                    endpoint: self.endpoint.clone(),
                }),
            );
            return Ok(());
        }

        match msg.payload() {
            Payload::Transaction(txn) => {
                txn.expand(msg, &mut WireWriter::new(self, token, transport))
            }
            _ => self.write_single(token, transport, msg),
        }
    }

    /// Writes one wire message, injecting SELECT, READONLY/READWRITE and
    /// ASKING ahead of it when needed.
    fn write_single(
        &self,
        token: ConnectionToken,
        transport: &Arc<dyn Transport>,
        msg: &Arc<Message>,
    ) -> io::Result<()> {
        let shared = self.shared.upgrade();
        let server = self.server.upgrade();
        let is_slave = server.as_ref().map_or(false, |s| s.is_slave());
        let (server_type, scripts_keep_db) =
            shared.as_ref().map_or((ServerType::Standalone, false), |s| {
                (
                    s.options.server_type,
                    s.options.features.scripting_database_safe,
                )
            });

        let mut wire = lock(&self.wire);

        if msg.db() >= 0
            && server_type == ServerType::Standalone
            && !msg.is_command("SELECT")
            && wire.db != Some(msg.db())
        {
            self.write_injected(token, transport, command::select(msg.db()))?;
            wire.db = Some(msg.db());
        }

        if server_type == ServerType::Cluster && self.connection_type == ConnectionType::Interactive
        {
            let wanted = if is_slave {
                Some(if msg.is_master_only() {
                    ReadMode::ReadWrite
                } else {
                    ReadMode::ReadOnly
                })
            } else if wire.read_mode == ReadMode::ReadOnly {
                Some(ReadMode::ReadWrite)
            } else {
                None
            };
            if let Some(mode) = wanted.filter(|&mode| mode != wire.read_mode) {
                let cmd = match mode {
                    ReadMode::ReadOnly => command::readonly(),
                    _ => command::readwrite(),
                };
                self.write_injected(token, transport, cmd)?;
                wire.read_mode = mode;
            }
        }

        if msg.is_asking() {
            self.write_injected(token, transport, command::asking())?;
        }

        self.track(token, msg)?;
        transport.write(&msg.to_frame())?;
        *lock(&self.last_write) = Instant::now();

        match msg.command_name().as_str() {
            "SELECT" => wire.db = Some(msg.db()),
            "EXEC" | "DISCARD" => wire.db = None,
            "EVAL" | "EVALSHA" if !scripts_keep_db => wire.db = None,
            _ => {}
        }
        Ok(())
    }

    fn write_injected(
        &self,
        token: ConnectionToken,
        transport: &Arc<dyn Transport>,
        cmd: Cmd,
    ) -> io::Result<()> {
        let msg = Arc::new(Message::internal(cmd, ResultProcessor::DemandOk));
        trace!(endpoint = %self.endpoint, command = %msg.command_name(), "injecting");
        self.track(token, &msg)?;
        transport.write(&msg.to_frame())
    }

    /// Records that `msg` is owed a reply on the connection `token` names.
    fn track(&self, token: ConnectionToken, msg: &Arc<Message>) -> io::Result<()> {
        let mut awaiting = lock(&self.awaiting);
        // Checked under the lock: a failure either drains this entry or has
        // already moved the generation on.
        if !self.is_current(token) {
            return Err(connection_replaced());
        }
        if awaiting.is_empty() {
            *lock(&self.last_progress) = Instant::now();
        }
        awaiting.push_back(msg.clone());
        Ok(())
    }

    /// Starts a connection attempt if the bridge is disconnected.
    pub fn try_connect(self: &Arc<Self>) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        if self
            .state
            .compare_exchange(
                BridgeState::Disconnected as u8,
                BridgeState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.state_changed.notify_waiters();
        let token = ConnectionToken(self.generation.fetch_add(1, Ordering::AcqRel) + 1);
        *lock(&self.connect_started) = Instant::now();
        debug!(endpoint = %self.endpoint, connection_type = ?self.connection_type, "connecting");
        shared.connector.connect(self.clone(), token);
        true
    }

    /// Called by the connector once the socket is open.
    ///
    /// # Returns
    ///
    /// `false` if the token is stale; the transport is closed in that case.
    pub fn on_connected(self: &Arc<Self>, token: ConnectionToken, transport: Arc<dyn Transport>) -> bool {
        if !self.is_current(token) || self.state() != BridgeState::Connecting {
            debug!(endpoint = %self.endpoint, "discarding stale connection");
            transport.close();
            return false;
        }
        // Replies owed on an earlier connection will never arrive.
        let stranded: Vec<_> = lock(&self.awaiting).drain(..).collect();
        for msg in &stranded {
            self.complete(
                msg,
                Err(Error::connection(
                    ConnectionFailureType::SocketClosed,
                    &self.endpoint,
                    "connection replaced",
                )),
            );
        }
        *lock(&self.transport) = Some((token, transport));
        *lock(&self.wire) = WireState::fresh();
        *lock(&self.last_progress) = Instant::now();
        *lock(&self.confirmations) = Confirmations::None;
        self.socket_count.fetch_add(1, Ordering::Relaxed);
        self.set_state(BridgeState::ConnectedEstablishing);

        for msg in self.handshake() {
            self.try_enqueue(Arc::new(msg));
        }
        true
    }

    fn handshake(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        if let Some(shared) = self.shared.upgrade() {
            let options = &shared.options;
            if let Some(password) = &options.password {
                let cmd = match &options.username {
                    Some(user) => command::auth_with_username(user.clone(), password.clone()),
                    None => command::auth(password.clone()),
                };
                messages.push(Message::internal(cmd, ResultProcessor::Auth));
            }
            if self.connection_type == ConnectionType::Interactive {
                if let Some(name) = &options.client_name {
                    messages.push(Message::internal(
                        command::client_setname(name.clone()),
                        ResultProcessor::DemandOk,
                    ));
                }
            }
        }
        messages.push(Message::internal(command::ping(), ResultProcessor::Tracer));
        messages
    }

    /// Called by the transport for every reply, in wire order.
    pub fn on_reply(self: &Arc<Self>, token: ConnectionToken, frame: Frame) {
        if !self.is_current(token) {
            trace!(endpoint = %self.endpoint, "ignoring reply from stale connection");
            return;
        }
        if self.connection_type == ConnectionType::Subscription && self.absorb_push(&frame) {
            *lock(&self.last_progress) = Instant::now();
            return;
        }
        let next = lock(&self.awaiting).pop_front();
        *lock(&self.last_progress) = Instant::now();
        let Some(msg) = next else {
            error!(endpoint = %self.endpoint, ?frame, "reply with nothing outstanding");
            self.on_connection_failed(
                token,
                ConnectionFailureType::ProtocolFailure,
                "unexpected reply",
            );
            return;
        };
        trace!(endpoint = %self.endpoint, command = %msg.command_name(), "matched reply");
        if self.connection_type == ConnectionType::Subscription {
            self.expect_confirmations(&msg, &frame);
        }
        self.process_reply(token, &msg, frame);
    }

    /// Consumes pub/sub traffic that answers no outstanding command:
    /// published messages and the trailing confirmations of a multi-channel
    /// (un)subscribe.
    fn absorb_push(&self, frame: &Frame) -> bool {
        let Some((kind, fields)) = push_kind(frame) else {
            return false;
        };
        match kind.as_str() {
            "message" | "smessage" => {
                self.publish(None, fields.first(), fields.get(1));
                true
            }
            "pmessage" => {
                self.publish(fields.first(), fields.get(1), fields.get(2));
                true
            }
            _ => {
                let mut pending = lock(&self.confirmations);
                let (absorbed, done) = match &mut *pending {
                    Confirmations::Count { kind: owed, remaining } if *owed == kind => {
                        *remaining = remaining.saturating_sub(1);
                        (true, *remaining == 0)
                    }
                    Confirmations::UntilEmpty { kind: owed } if *owed == kind => {
                        (true, subscription_count(fields).map_or(true, |n| n <= 0))
                    }
                    _ => (false, false),
                };
                if done {
                    *pending = Confirmations::None;
                }
                absorbed
            }
        }
    }

    /// Records the confirmations `msg` still owes after its first reply.
    fn expect_confirmations(&self, msg: &Message, frame: &Frame) {
        let Some(cmd) = msg.command().filter(|cmd| cmd.is_subscription()) else {
            return;
        };
        let Some((kind, fields)) = push_kind(frame) else {
            return;
        };
        let channels = cmd.args().len().saturating_sub(1);
        *lock(&self.confirmations) = if channels > 1 {
            Confirmations::Count {
                kind,
                remaining: channels - 1,
            }
        } else if channels == 0 && subscription_count(fields).map_or(false, |n| n > 0) {
            Confirmations::UntilEmpty { kind }
        } else {
            Confirmations::None
        };
    }

    fn publish(&self, pattern: Option<&Frame>, channel: Option<&Frame>, payload: Option<&Frame>) {
        let (Some(channel), Some(payload)) = (
            channel.and_then(Frame::as_bytes),
            payload.and_then(Frame::as_bytes),
        ) else {
            warn!(endpoint = %self.endpoint, "malformed pub/sub message");
            return;
        };
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.events.raise(
            &shared.completions,
            MultiplexerEvent::SubscriptionMessage {
                endpoint: self.endpoint.clone(),
                pattern: pattern
                    .and_then(Frame::as_bytes)
                    .map(Bytes::copy_from_slice),
                channel: Bytes::copy_from_slice(channel),
                payload: Bytes::copy_from_slice(payload),
            },
        );
    }

    fn process_reply(self: &Arc<Self>, token: ConnectionToken, msg: &Arc<Message>, frame: Frame) {
        let shared = self.shared.upgrade();

        if let Frame::Error(text) = &frame {
            if let Some(shared) = &shared {
                if shared.options.server_type == ServerType::Cluster {
                    if let Some(redirect) = parse_redirect(text) {
                        if redirect.endpoint != self.endpoint
                            && shared.strategy.try_resend(
                                shared,
                                redirect.slot,
                                msg,
                                &redirect.endpoint,
                                redirect.is_moved(),
                            )
                        {
                            return;
                        }
                        self.complete(msg, Err(redirect.into_error()));
                        return;
                    }
                }
            }

            let message = String::from_utf8_lossy(text).into_owned();
            match msg.processor() {
                ResultProcessor::Auth => {
                    self.complete(msg, Err(Error::Auth));
                    self.on_connection_failed(
                        token,
                        ConnectionFailureType::AuthenticationFailure,
                        message,
                    );
                    return;
                }
                ResultProcessor::Tracer => {
                    self.complete(msg, Err(parse_redis_error(text)));
                    self.on_connection_failed(token, ConnectionFailureType::ProtocolFailure, message);
                    return;
                }
                _ => {}
            }
            if let Some(shared) = &shared {
                shared.events.raise(
                    &shared.completions,
                    MultiplexerEvent::ErrorMessage {
                        endpoint: self.endpoint.clone(),
                        message,
                    },
                );
            }
            self.complete(msg, Err(parse_redis_error(text)));
            return;
        }

        let result = match msg.processor() {
            ResultProcessor::Raw | ResultProcessor::KeepAlive => Ok(frame),
            ResultProcessor::DemandOk | ResultProcessor::Auth => {
                if frame.is_simple("OK") {
                    Ok(frame)
                } else {
                    Err(Error::protocol(format!("expected OK, got {:?}", frame)))
                }
            }
            ResultProcessor::Tracer => {
                self.on_established();
                Ok(frame)
            }
            ResultProcessor::Liveness => Ok(Frame::Integer(1)),
            ResultProcessor::Queued { acked, .. } => {
                if frame.is_simple("QUEUED") {
                    acked.store(true, Ordering::Release);
                    Ok(frame)
                } else {
                    self.protocol_failure(token, msg, format!("expected QUEUED, got {:?}", frame));
                    return;
                }
            }
            ResultProcessor::Condition { state, .. } => match state.resolve(&frame) {
                Ok(()) => Ok(frame),
                Err(detail) => {
                    self.protocol_failure(token, msg, detail);
                    return;
                }
            },
            ResultProcessor::Transaction => {
                let Payload::Transaction(txn) = msg.payload() else {
                    self.protocol_failure(token, msg, "transaction reply without transaction".into());
                    return;
                };
                match txn.complete_exec(self, frame) {
                    Ok(committed) => Ok(Frame::Integer(i64::from(committed))),
                    Err(detail) => {
                        self.protocol_failure(token, msg, detail);
                        return;
                    }
                }
            }
        };
        self.complete(msg, result);
    }

    fn protocol_failure(&self, token: ConnectionToken, msg: &Arc<Message>, detail: String) {
        error!(endpoint = %self.endpoint, command = %msg.command_name(), %detail, "protocol failure");
        self.complete(msg, Err(Error::protocol(detail.clone())));
        self.on_connection_failed(token, ConnectionFailureType::ProtocolFailure, detail);
    }

    fn on_established(&self) {
        if self.state() != BridgeState::ConnectedEstablishing {
            return;
        }
        self.set_state(BridgeState::ConnectedEstablished);
        info!(endpoint = %self.endpoint, connection_type = ?self.connection_type, "connection established");
        if self.had_failure.swap(false, Ordering::AcqRel) {
            if let Some(shared) = self.shared.upgrade() {
                shared.events.raise(
                    &shared.completions,
                    MultiplexerEvent::ConnectionRestored {
                        endpoint: self.endpoint.clone(),
                    },
                );
            }
        }
    }

    /// Records the outcome of `msg` and hands it to the completion manager.
    pub(crate) fn complete(&self, msg: &Arc<Message>, result: Result<Frame>) {
        if msg.is_completed() {
            return;
        }
        if let (Payload::Transaction(txn), Err(e)) = (msg.payload(), &result) {
            txn.fail_operations(self, e);
        }
        if !msg.set_result(result) {
            return;
        }
        match self.shared.upgrade() {
            Some(shared) => {
                let op: Arc<dyn Completable> = msg.clone();
                shared.completions.complete_sync_or_async(op);
            }
            None => {
                msg.try_complete(true);
            }
        }
    }

    /// Called when the connection attempt or the live connection fails.
    ///
    /// Every queued and outstanding message is failed; the bridge returns to
    /// `Disconnected` and reconnects on a later heartbeat.
    pub fn on_connection_failed(
        &self,
        token: ConnectionToken,
        failure: ConnectionFailureType,
        detail: impl Into<String>,
    ) {
        if !self.is_current(token) {
            return;
        }
        if self.set_state(BridgeState::Disconnected) == BridgeState::Disconnected {
            return;
        }
        // Late callbacks from the dead transport must not match new traffic.
        self.generation.fetch_add(1, Ordering::AcqRel);
        let detail = detail.into();
        if let Some((_, transport)) = lock(&self.transport).take() {
            transport.close();
        }
        *lock(&self.wire) = WireState::fresh();
        self.had_failure.store(true, Ordering::Release);
        warn!(endpoint = %self.endpoint, %failure, %detail, "connection failed");

        let awaiting: Vec<_> = lock(&self.awaiting).drain(..).collect();
        let queued = self.queue.drain_all();
        for msg in awaiting.iter().chain(queued.iter()) {
            self.complete(
                msg,
                Err(Error::connection(failure, &self.endpoint, detail.clone())),
            );
        }

        if let Some(shared) = self.shared.upgrade() {
            shared.events.raise(
                &shared.completions,
                MultiplexerEvent::ConnectionFailed {
                    endpoint: self.endpoint.clone(),
                    failure,
                    detail,
                },
            );
        }
    }

    /// Periodic maintenance.
    pub fn on_heartbeat(self: &Arc<Self>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let options = &shared.options;
        match self.state() {
            BridgeState::Connecting | BridgeState::ConnectedEstablishing => {
                if lock(&self.connect_started).elapsed() >= options.connect_timeout {
                    self.on_connection_failed(
                        self.current_token(),
                        ConnectionFailureType::UnableToConnect,
                        "connect timeout",
                    );
                    self.try_connect();
                }
            }
            BridgeState::ConnectedEstablished => {
                let (owed, keep_alive_owed) = {
                    let awaiting = lock(&self.awaiting);
                    let keep_alive_owed = awaiting
                        .iter()
                        .any(|msg| matches!(msg.processor(), ResultProcessor::KeepAlive));
                    (!awaiting.is_empty(), keep_alive_owed)
                };
                if owed && lock(&self.last_progress).elapsed() >= options.response_timeout {
                    self.on_connection_failed(
                        self.current_token(),
                        ConnectionFailureType::SocketFailure,
                        "heartbeat timeout",
                    );
                    return;
                }
                if let Some(ping) = self.queue.peek_if_command("PING") {
                    if ping.is_internal() && ping.created().elapsed() >= options.sync_timeout {
                        self.complete(
                            &ping,
                            Err(Error::Timeout {
                                command: "PING".to_string(),
                                elapsed_ms: ping.created().elapsed().as_millis() as u64,
                            }),
                        );
                    }
                }
                let idle = lock(&self.last_write).elapsed() >= options.keep_alive;
                if idle && owed && !keep_alive_owed && self.queue.is_empty() {
                    debug!(endpoint = %self.endpoint, "sending keep-alive");
                    self.try_enqueue(Arc::new(self.keep_alive()));
                } else if !self.queue.is_empty() {
                    self.request_write();
                }
            }
            BridgeState::Disconnected => {
                self.try_connect();
            }
        }
    }

    fn keep_alive(&self) -> Message {
        let cmd = match self.connection_type {
            ConnectionType::Interactive => command::ping(),
            ConnectionType::Subscription => command::unsubscribe(self.keepalive_channel.clone()),
        };
        Message::internal(cmd, ResultProcessor::KeepAlive)
    }

    /// Shuts the bridge down for good.
    pub(crate) fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.on_connection_failed(
            self.current_token(),
            ConnectionFailureType::ConnectionDisposed,
            "multiplexer disposed",
        );
    }

    /// Returns diagnostic counters.
    pub fn counters(&self) -> BridgeCounters {
        BridgeCounters {
            state: self.state(),
            pending_unsent: self.queue.len(),
            sent_awaiting_response: lock(&self.awaiting).len(),
            socket_count: self.socket_count.load(Ordering::Relaxed),
            operation_count: self.operation_count.load(Ordering::Relaxed),
            writer_active: self.active_writer.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn options_sync_timeout(&self) -> Duration {
        self.shared
            .upgrade()
            .map_or(Duration::from_secs(5), |shared| shared.options.sync_timeout)
    }

    pub(crate) fn exec_abort_supported(&self) -> bool {
        self.shared
            .upgrade()
            .map_or(true, |shared| shared.options.features.exec_abort)
    }
}

impl std::fmt::Debug for PhysicalBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalBridge")
            .field("endpoint", &self.endpoint)
            .field("connection_type", &self.connection_type)
            .field("counters", &self.counters())
            .finish()
    }
}

/// Writer handle used while a composite message expands itself.
pub(crate) struct WireWriter<'a> {
    bridge: &'a PhysicalBridge,
    token: ConnectionToken,
    transport: &'a Arc<dyn Transport>,
}

impl<'a> WireWriter<'a> {
    pub(crate) fn new(
        bridge: &'a PhysicalBridge,
        token: ConnectionToken,
        transport: &'a Arc<dyn Transport>,
    ) -> Self {
        Self {
            bridge,
            token,
            transport,
        }
    }

    pub(crate) fn write(&mut self, msg: &Arc<Message>) -> io::Result<()> {
        self.bridge.write_single(self.token, self.transport, msg)
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.transport.flush()
    }

    pub(crate) fn bridge(&self) -> &PhysicalBridge {
        self.bridge
    }
}
