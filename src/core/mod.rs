//! # Muxplex core
//!
//! The multiplexing engine: per-endpoint bridges, their queues, reply
//! matching and completion delivery, tied together by [`Multiplexer`].
//!
//! ## Modules
//!
//! - [`bridge`] - Per-endpoint write queue, writer and state machine
//! - [`builder`] - Options and the multiplexer builder
//! - [`command`] - Command builders
//! - [`completion`] - Inline or background delivery of results
//! - [`connection`] - TCP/TLS transport
//! - [`queue`] - Two-tier message queue

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use crate::proto::error::{Error, Result};

/// Per-endpoint pipelines.
pub mod bridge;
/// Options and builder.
pub mod builder;
/// Command construction helpers.
pub mod command;
/// Completion delivery.
pub mod completion;
/// TCP/TLS transport.
pub mod connection;
pub(crate) mod events;
/// Units of work.
pub mod message;
/// Per-bridge write queue.
pub mod queue;
pub(crate) mod result_box;
/// Server endpoints.
pub mod server;
/// External seams.
pub mod transport;

cfg_if::cfg_if! {
    if #[cfg(feature = "tls")] {
        mod tls;
    }
}

use crate::cluster::selection::ServerSelectionStrategy;
use crate::cluster::topology::ClusterTopology;
use crate::cluster::{hash_slot, SlotHint};
use crate::proto::error::ConnectionFailureType;
use crate::proto::frame::Frame;
use crate::transaction::Transaction;
use bridge::BridgeCounters;
use builder::Options;
use command::Cmd;
use completion::{CompletionCounters, CompletionManager};
use connection::TcpConnector;
use events::{EventHub, MultiplexerEvent};
use message::{CommandFlags, Completion, Message, RolePreference};
use result_box::ResultBoxPool;
use server::{ServerCounters, ServerRegistry, ServerType};
use transport::{BlockingWriteScheduler, Connector, WriteScheduler};

/// State shared by the multiplexer, its servers and their bridges.
pub(crate) struct Shared {
    pub(crate) options: Options,
    pub(crate) completions: Arc<CompletionManager>,
    pub(crate) servers: ServerRegistry,
    pub(crate) strategy: ServerSelectionStrategy,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) scheduler: Arc<dyn WriteScheduler>,
    pub(crate) events: EventHub,
    pub(crate) result_boxes: ResultBoxPool,
    pub(crate) sync_timeouts: AtomicU64,
}

/// Aggregated diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerCounters {
    /// Messages queued on some bridge but not yet written.
    pub pending_unsent: usize,
    /// Messages written and waiting for their reply.
    pub sent_awaiting_response: usize,
    /// Completions waiting for a background worker.
    pub awaiting_async_completion: usize,
    /// Connections opened over the multiplexer's lifetime.
    pub socket_count: u64,
    /// Commands served by a server of the non-preferred role.
    pub non_preferred_endpoint_count: u64,
    /// Blocking calls that gave up waiting.
    pub sync_timeouts: u64,
    /// Completion manager counters.
    pub completions: CompletionCounters,
    /// Per-server breakdown.
    pub servers: Vec<ServerCounters>,
}

struct Inner {
    shared: Arc<Shared>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        for server in self.shared.servers.snapshot() {
            server.dispose();
        }
    }
}

/// Shares a few connections among any number of concurrent callers.
///
/// Cloning is cheap; the connections close when the last clone is dropped.
///
/// # Example
///
/// ```no_run
/// use muxplex::{command, MultiplexerBuilder};
///
/// # #[tokio::main]
/// # async fn main() -> muxplex::Result<()> {
/// let mux = MultiplexerBuilder::new()
///     .endpoint("redis://127.0.0.1:6379")
///     .connect()
///     .await?;
///
/// mux.execute(command::set("greeting", "hello")).await?;
/// let reply = mux.execute(command::get("greeting")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    /// Connects over TCP and waits until at least one server is ready.
    ///
    /// In cluster mode the slot map is loaded with `CLUSTER SLOTS` before
    /// returning.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error if no server is established within the
    /// connect timeout.
    pub async fn connect(options: Options) -> Result<Self> {
        let connector = Arc::new(TcpConnector::new(&options)?);
        let scheduler = Arc::new(BlockingWriteScheduler::new(Handle::current()));
        let mux = Self::new(options, connector, scheduler);

        let timeout = mux.shared().options.connect_timeout;
        if !mux.wait_connected(timeout).await {
            return Err(Error::connection(
                ConnectionFailureType::UnableToConnect,
                mux.shared().options.endpoints.join(","),
                "no server became available",
            ));
        }
        if mux.shared().options.server_type == ServerType::Cluster {
            mux.refresh_topology().await?;
        }
        Ok(mux)
    }

    /// Builds a multiplexer over custom transport seams and starts
    /// connecting to every configured endpoint.
    ///
    /// The heartbeat runs only when called inside a tokio runtime.
    pub fn new(
        options: Options,
        connector: Arc<dyn Connector>,
        scheduler: Arc<dyn WriteScheduler>,
    ) -> Self {
        let shared = Arc::new(Shared {
            completions: Arc::new(CompletionManager::new(
                "muxplex",
                options.preserve_async_order,
            )),
            servers: ServerRegistry::default(),
            strategy: ServerSelectionStrategy::new(options.server_type),
            connector,
            scheduler,
            events: EventHub::default(),
            result_boxes: ResultBoxPool::new(options.result_box_pool_size),
            sync_timeouts: AtomicU64::new(0),
            options,
        });

        let weak = Arc::downgrade(&shared);
        for endpoint in &shared.options.endpoints {
            let (server, created) = shared.servers.get_or_create(&weak, endpoint);
            if created {
                server.activate();
            }
        }

        let heartbeat = Handle::try_current()
            .ok()
            .map(|handle| handle.spawn(heartbeat(weak, shared.options.heartbeat_interval)));
        info!(endpoints = ?shared.options.endpoints, server_type = ?shared.options.server_type, "multiplexer created");

        Self {
            inner: Arc::new(Inner {
                shared,
                heartbeat: Mutex::new(heartbeat),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    /// The configuration in use.
    pub fn options(&self) -> &Options {
        &self.shared().options
    }

    /// Waits until any server's interactive connection is established.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let servers = self.shared().servers.snapshot();
        let mut waits: FuturesUnordered<_> = servers
            .iter()
            .map(|server| server.bridge().wait_established(timeout))
            .collect();
        while let Some(established) = waits.next().await {
            if established {
                return true;
            }
        }
        false
    }

    /// Sends a command and awaits its reply.
    ///
    /// `SUBSCRIBE` and its kin travel on the node's subscription
    /// connection, which is opened on first use; published messages arrive
    /// as [`MultiplexerEvent::SubscriptionMessage`].
    ///
    /// # Errors
    ///
    /// Policy failures are reported before anything is written; otherwise
    /// the error is whatever the server or the connection produced.
    pub async fn execute(&self, cmd: Cmd) -> Result<Frame> {
        self.execute_with(cmd, CommandFlags::empty()).await
    }

    /// Like [`execute`](Self::execute), with explicit flags. A
    /// fire-and-forget command resolves to `Frame::Null` once queued.
    pub async fn execute_with(&self, cmd: Cmd, flags: CommandFlags) -> Result<Frame> {
        let msg = self.prepare(cmd, flags)?;
        self.send(msg).await
    }

    /// Sends a command and parks the calling thread until the reply arrives
    /// or the sync timeout elapses.
    ///
    /// Must not be called from an async task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the wait expires; the command is not
    /// retracted and its late reply is dropped.
    pub fn execute_blocking(&self, cmd: Cmd, flags: CommandFlags) -> Result<Frame> {
        let msg = self.prepare(cmd, flags)?;
        self.send_blocking(msg)
    }

    /// Queues a command with a caller-supplied completion.
    ///
    /// # Returns
    ///
    /// `Ok(false)` if no connected server accepted the command; the
    /// completion is dropped in that case.
    ///
    /// # Errors
    ///
    /// Policy failures.
    pub fn enqueue(&self, cmd: Cmd, flags: CommandFlags, completion: Completion) -> Result<bool> {
        let msg = self.prepare(cmd, flags)?.with_completion(completion);
        Ok(self.dispatch(Arc::new(msg)).is_ok())
    }

    /// Returns the endpoint a command touching `key` would be sent to.
    pub fn select_endpoint(&self, key: &[u8], cmd: &Cmd, flags: CommandFlags) -> Option<String> {
        let flags = role_flags(cmd, flags).ok()?;
        let shared = self.shared();
        shared
            .strategy
            .select(&shared.servers, SlotHint::Slot(hash_slot(key)), flags)
            .map(|server| server.endpoint().to_string())
    }

    /// The cluster hash slot of `key`.
    pub fn hash_slot(&self, key: &[u8]) -> u16 {
        hash_slot(key)
    }

    /// Starts a WATCH/MULTI/EXEC transaction.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(self.clone())
    }

    /// Registers a handler for connection, topology and pub/sub events.
    /// Handlers run on a background worker.
    pub fn on_event(&self, handler: impl Fn(&MultiplexerEvent) + Send + Sync + 'static) {
        self.shared().events.subscribe(handler);
    }

    /// Returns diagnostic counters.
    pub fn counters(&self) -> MultiplexerCounters {
        let shared = self.shared();
        let servers: Vec<ServerCounters> = shared
            .servers
            .snapshot()
            .iter()
            .map(|server| server.counters())
            .collect();
        let bridges: Vec<&BridgeCounters> = servers
            .iter()
            .flat_map(|s| std::iter::once(&s.interactive).chain(s.subscription.as_ref()))
            .collect();
        let pending_unsent = bridges.iter().map(|b| b.pending_unsent).sum();
        let sent_awaiting_response = bridges.iter().map(|b| b.sent_awaiting_response).sum();
        let socket_count = bridges.iter().map(|b| b.socket_count).sum();
        let completions = shared.completions.counters();
        MultiplexerCounters {
            pending_unsent,
            sent_awaiting_response,
            awaiting_async_completion: completions.pending,
            socket_count,
            non_preferred_endpoint_count: shared.strategy.non_preferred_count(),
            sync_timeouts: shared.sync_timeouts.load(Ordering::Relaxed),
            completions,
            servers,
        }
    }

    /// Reloads the slot map from `CLUSTER SLOTS`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] outside cluster mode, or the error
    /// of the `CLUSTER SLOTS` call.
    pub async fn refresh_topology(&self) -> Result<()> {
        let shared = self.shared();
        if shared.options.server_type != ServerType::Cluster {
            return Err(Error::InvalidArgument {
                message: "topology refresh requires cluster mode".to_string(),
            });
        }
        let msg = Message::new(-1, CommandFlags::empty(), command::cluster_slots());
        let frame = self.send(msg).await?;
        let topology = ClusterTopology::from_cluster_slots(frame)?;
        shared.strategy.apply_topology(shared, &topology);
        Ok(())
    }

    /// Rejects disabled commands.
    pub(crate) fn check_command(&self, verb: &str) -> Result<()> {
        if self.shared().options.disabled_commands.contains(verb) {
            return Err(Error::CommandDisabled {
                command: verb.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn database(&self) -> i64 {
        self.shared().options.default_database
    }

    fn check_database(&self, db: i64) -> Result<()> {
        let options = &self.shared().options;
        let limit = match options.server_type {
            ServerType::Cluster => Some(1),
            ServerType::Standalone => options.databases,
        };
        match limit {
            Some(limit) if db < 0 || db >= limit => Err(Error::DatabaseOutOfRange {
                db,
                endpoint: options.endpoints.join(","),
            }),
            _ => Ok(()),
        }
    }

    /// Runs every pre-dispatch policy check and wraps `cmd`.
    pub(crate) fn prepare(&self, cmd: Cmd, flags: CommandFlags) -> Result<Message> {
        let name = cmd.name();
        self.check_command(&name)?;
        let flags = role_flags(&cmd, flags)?;
        let db = self.database();
        self.check_database(db)?;
        let msg = Message::new(db, flags, cmd);
        if msg.slot() == SlotHint::Multiple
            && self.shared().options.server_type == ServerType::Cluster
        {
            return Err(Error::MultiSlot { command: name });
        }
        Ok(msg)
    }

    /// Routes a message to a server's bridge.
    pub(crate) fn dispatch(&self, msg: Arc<Message>) -> Result<()> {
        let shared = self.shared();
        let command = msg.command_name();
        let Some(server) = shared.strategy.select_message(&shared.servers, &msg) else {
            debug!(%command, "no server selectable");
            return Err(Error::NoConnectionAvailable { command });
        };
        if server.try_enqueue(msg) {
            Ok(())
        } else {
            Err(Error::NoConnectionAvailable {
                command: format!("{} on {}", command, server.endpoint()),
            })
        }
    }

    /// Brings up the subscription connection of the node `msg` routes to.
    async fn open_subscription(&self, msg: &Message) -> bool {
        let shared = self.shared();
        let Some(server) = shared.strategy.select_message(&shared.servers, msg) else {
            return false;
        };
        let bridge = server.subscription_bridge().clone();
        bridge.try_connect();
        bridge.wait_established(shared.options.connect_timeout).await
    }

    /// Dispatches and awaits the reply.
    pub(crate) async fn send(&self, msg: Message) -> Result<Frame> {
        if msg.is_subscription() && !self.open_subscription(&msg).await {
            debug!(command = %msg.command_name(), "subscription connection not ready");
        }
        if msg.is_fire_and_forget() {
            self.dispatch(Arc::new(msg))?;
            return Ok(Frame::Null);
        }
        let (completion, rx) = Completion::channel();
        self.dispatch(Arc::new(msg.with_completion(completion)))?;
        rx.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Dispatches and parks on a pooled result slot.
    pub(crate) fn send_blocking(&self, msg: Message) -> Result<Frame> {
        if msg.is_fire_and_forget() {
            self.dispatch(Arc::new(msg))?;
            return Ok(Frame::Null);
        }
        let shared = self.shared();
        let command = msg.command_name();
        let slot = shared.result_boxes.acquire();
        let started = Instant::now();
        self.dispatch(Arc::new(
            msg.with_completion(Completion::Blocking(slot.clone())),
        ))?;

        match slot.wait(shared.options.sync_timeout) {
            Some(result) => {
                shared.result_boxes.release(slot);
                result
            }
            None => {
                shared.sync_timeouts.fetch_add(1, Ordering::Relaxed);
                let elapsed_ms = started.elapsed().as_millis() as u64;
                warn!(%command, elapsed_ms, "timeout waiting for reply");
                Err(Error::Timeout {
                    command,
                    elapsed_ms,
                })
            }
        }
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("endpoints", &self.options().endpoints)
            .field("server_type", &self.options().server_type)
            .finish()
    }
}

/// Forces master-only commands onto masters.
fn role_flags(cmd: &Cmd, flags: CommandFlags) -> Result<CommandFlags> {
    if !cmd.is_master_only() {
        return Ok(flags);
    }
    match flags.role() {
        RolePreference::DemandSlave => Err(Error::InvalidArgument {
            message: format!("{} cannot be sent to a slave", cmd.name()),
        }),
        _ => Ok(flags.difference(CommandFlags::DEMAND_SLAVE) | CommandFlags::DEMAND_MASTER),
    }
}

async fn heartbeat(shared: Weak<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        for server in shared.servers.snapshot() {
            server.on_heartbeat();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool;

    use crate::core::bridge::BridgeState;
    use crate::core::server::ServerEndPoint;
    use crate::core::transport::InlineWriteScheduler;
    use crate::testing::{
        args_of, push_frame, redis_like, respond, verb_of, Responder, ScriptedConnector,
    };

    const A: &str = "127.0.0.1:7000";
    const B: &str = "127.0.0.1:7001";
    const C: &str = "127.0.0.1:7002";

    fn options(endpoints: &[&str], server_type: ServerType) -> Options {
        Options {
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
            server_type,
            ..Options::default()
        }
    }

    async fn start(options: Options, responder: Responder) -> (Multiplexer, Arc<ScriptedConnector>) {
        let connector = ScriptedConnector::new(responder);
        let mux = Multiplexer::new(options, connector.clone(), Arc::new(InlineWriteScheduler));
        for server in mux.shared().servers.snapshot() {
            assert!(server.bridge().wait_established(Duration::from_secs(2)).await);
        }
        (mux, connector)
    }

    fn server(mux: &Multiplexer, endpoint: &str) -> Arc<ServerEndPoint> {
        mux.shared().servers.get(endpoint).unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    /// Leaves GETs unanswered.
    fn silent_reads() -> Responder {
        let inner = redis_like();
        Arc::new(move |endpoint, frame| match crate::testing::verb_of(frame).as_str() {
            "GET" => None,
            _ => inner(endpoint, frame),
        })
    }

    /// Answers like an empty Redis until `muted` is set.
    fn mutable(muted: Arc<AtomicBool>) -> Responder {
        let inner = redis_like();
        Arc::new(move |endpoint, frame| {
            if muted.load(Ordering::Acquire) {
                None
            } else {
                inner(endpoint, frame)
            }
        })
    }

    #[tokio::test]
    async fn test_execute_round_trip() {
        let (mux, _) = start(options(&[A], ServerType::Standalone), redis_like()).await;
        assert_eq!(
            mux.execute(command::set("k", "v")).await.unwrap(),
            Frame::simple("OK")
        );
        assert_eq!(mux.execute(command::get("k")).await.unwrap(), Frame::Null);

        let counters = mux.counters();
        assert_eq!(counters.socket_count, 1);
        assert_eq!(counters.pending_unsent, 0);
        assert_eq!(counters.sent_awaiting_response, 0);
    }

    #[tokio::test]
    async fn test_select_injected_once() {
        let mut opts = options(&[A], ServerType::Standalone);
        opts.default_database = 3;
        let (mux, connector) = start(opts, redis_like()).await;

        mux.execute(command::set("a", "1")).await.unwrap();
        mux.execute(command::get("a")).await.unwrap();

        let written = connector.transport(A).unwrap().written();
        let selects: Vec<_> = written
            .iter()
            .filter(|f| crate::testing::verb_of(f) == "SELECT")
            .collect();
        assert_eq!(selects.len(), 1);
        assert_eq!(crate::testing::args_of(selects[0])[1], Bytes::from("3"));

        let verbs = connector.transport(A).unwrap().verbs();
        let select = verbs.iter().position(|v| v == "SELECT").unwrap();
        assert_eq!(verbs[select + 1], "SET");
    }

    #[tokio::test]
    async fn test_policy_rejections() {
        let mut opts = options(&[A], ServerType::Standalone);
        opts.disabled_commands.insert("FLUSHALL".to_string());
        let (mux, _) = start(opts, redis_like()).await;

        assert!(matches!(
            mux.execute(Cmd::new("flushall")).await,
            Err(Error::CommandDisabled { command }) if command == "FLUSHALL"
        ));
        assert!(matches!(
            mux.execute_with(command::set("k", "v"), CommandFlags::DEMAND_SLAVE).await,
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_database_out_of_range() {
        let mut opts = options(&[A], ServerType::Standalone);
        opts.default_database = 16;
        let (mux, _) = start(opts, redis_like()).await;
        assert!(matches!(
            mux.execute(command::get("k")).await,
            Err(Error::DatabaseOutOfRange { db: 16, .. })
        ));
    }

    #[tokio::test]
    async fn test_no_connection_available() {
        let connector = ScriptedConnector::new(redis_like());
        connector.refuse(A);
        let mux = Multiplexer::new(
            options(&[A], ServerType::Standalone),
            connector,
            Arc::new(InlineWriteScheduler),
        );
        assert!(!mux.wait_connected(Duration::from_millis(50)).await);
        assert!(matches!(
            mux.execute(command::ping()).await,
            Err(Error::NoConnectionAvailable { .. })
        ));
        assert!(!mux
            .enqueue(command::ping(), CommandFlags::empty(), Completion::callback(|_| {}))
            .unwrap());
    }

    #[tokio::test]
    async fn test_fire_and_forget_returns_null() {
        let (mux, connector) = start(options(&[A], ServerType::Standalone), redis_like()).await;
        let reply = mux
            .execute_with(command::incr("hits"), CommandFlags::FIRE_AND_FORGET)
            .await
            .unwrap();
        assert_eq!(reply, Frame::Null);
        wait_for(|| connector.transport(A).unwrap().verbs().contains(&"INCR".to_string())).await;
    }

    #[tokio::test]
    async fn test_connection_failure_fails_outstanding() {
        let (mux, _) = start(options(&[A], ServerType::Standalone), silent_reads()).await;
        let task = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.execute(command::get("k")).await })
        };
        wait_for(|| mux.counters().sent_awaiting_response == 1).await;

        let bridge = server(&mux, A).bridge().clone();
        let stale = bridge.current_token();
        bridge.on_connection_failed(stale, ConnectionFailureType::SocketFailure, "reset");

        match task.await.unwrap() {
            Err(Error::ConnectionUnavailable { failure, endpoint, .. }) => {
                assert_eq!(failure, ConnectionFailureType::SocketFailure);
                assert_eq!(endpoint, A);
            }
            other => panic!("expected connection error, got {:?}", other),
        }
        assert_eq!(mux.counters().sent_awaiting_response, 0);

        // Replies from the dead connection are ignored.
        bridge.on_reply(stale, Frame::simple("OK"));
        assert_eq!(bridge.state(), BridgeState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_on_heartbeat() {
        let (mux, connector) = start(options(&[A], ServerType::Standalone), redis_like()).await;
        let bridge = server(&mux, A).bridge().clone();
        bridge.on_connection_failed(
            bridge.current_token(),
            ConnectionFailureType::SocketClosed,
            "closed",
        );
        assert!(connector.transport(A).unwrap().is_closed());

        server(&mux, A).on_heartbeat();
        assert!(bridge.wait_established(Duration::from_secs(2)).await);
        assert_eq!(mux.counters().socket_count, 2);
        assert_eq!(mux.execute(command::ping()).await.unwrap(), Frame::simple("PONG"));
    }

    #[tokio::test]
    async fn test_blocking_timeout() {
        let mut opts = options(&[A], ServerType::Standalone);
        opts.sync_timeout = Duration::from_millis(100);
        let (mux, _) = start(opts, silent_reads()).await;

        let blocking = mux.clone();
        let result = tokio::task::spawn_blocking(move || {
            blocking.execute_blocking(command::get("k"), CommandFlags::empty())
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(Error::Timeout { command, .. }) if command == "GET"));
        assert_eq!(mux.counters().sync_timeouts, 1);
        // The command stays outstanding.
        assert_eq!(mux.counters().sent_awaiting_response, 1);
    }

    #[tokio::test]
    async fn test_blocking_round_trip() {
        let (mux, _) = start(options(&[A], ServerType::Standalone), redis_like()).await;
        let blocking = mux.clone();
        let reply = tokio::task::spawn_blocking(move || {
            blocking.execute_blocking(command::incr("n"), CommandFlags::empty())
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reply, Frame::Integer(1));
    }

    #[tokio::test]
    async fn test_cluster_rejects_cross_slot_command() {
        let (mux, _) = start(options(&[A], ServerType::Cluster), redis_like()).await;
        assert!(matches!(
            mux.execute(command::mget(["a", "b"])).await,
            Err(Error::MultiSlot { .. })
        ));
        mux.execute(command::mget(["{t}a", "{t}b"])).await.unwrap();
    }

    fn cluster_slots() -> Frame {
        let node = |port: i64| Frame::Array(vec![Frame::bulk("127.0.0.1"), Frame::Integer(port)]);
        Frame::Array(vec![
            Frame::Array(vec![Frame::Integer(0), Frame::Integer(8191), node(7000)]),
            Frame::Array(vec![
                Frame::Integer(8192),
                Frame::Integer(16383),
                node(7001),
                node(7002),
            ]),
        ])
    }

    #[tokio::test]
    async fn test_refresh_topology_builds_slot_map() {
        let inner = redis_like();
        let responder = respond(move |endpoint, verb, args| match verb {
            "CLUSTER" => Some(cluster_slots()),
            _ => {
                let mut frame = vec![Frame::bulk(verb.to_string())];
                frame.extend(args.iter().cloned().map(Frame::bulk));
                inner(endpoint, &Frame::Array(frame))
            }
        });
        let (mux, _) = start(options(&[A], ServerType::Cluster), responder).await;
        assert!(mux.refresh_topology().await.is_ok());

        assert_eq!(mux.shared().servers.len(), 3);
        assert!(server(&mux, C).is_slave());
        assert_eq!(server(&mux, C).master_index(), Some(server(&mux, B).index()));
        let strategy = &mux.shared().strategy;
        assert_eq!(strategy.owner_index(0), Some(server(&mux, A).index()));
        assert_eq!(strategy.owner_index(12182), Some(server(&mux, B).index()));

        assert!(server(&mux, B).bridge().wait_established(Duration::from_secs(2)).await);
        assert!(server(&mux, C).bridge().wait_established(Duration::from_secs(2)).await);
        assert_eq!(
            mux.select_endpoint(b"foo", &command::get("foo"), CommandFlags::empty()),
            Some(B.to_string())
        );
        assert_eq!(
            mux.select_endpoint(b"foo", &command::get("foo"), CommandFlags::DEMAND_SLAVE),
            Some(C.to_string())
        );
        // Writes never go to a slave unless allowed.
        assert_eq!(
            mux.select_endpoint(b"foo", &command::set("foo", "1"), CommandFlags::PREFER_SLAVE),
            Some(B.to_string())
        );
    }

    #[tokio::test]
    async fn test_refresh_requires_cluster() {
        let (mux, _) = start(options(&[A], ServerType::Standalone), redis_like()).await;
        assert!(matches!(
            mux.refresh_topology().await,
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_unresponsive_connection_times_out() {
        let mut opts = options(&[A], ServerType::Standalone);
        opts.keep_alive = Duration::from_millis(20);
        opts.response_timeout = Duration::from_millis(500);
        opts.heartbeat_interval = Duration::from_secs(3600);
        let muted = Arc::new(AtomicBool::new(false));
        let (mux, connector) = start(opts, mutable(muted.clone())).await;
        muted.store(true, Ordering::Release);

        let task = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.execute(command::get("k")).await })
        };
        wait_for(|| mux.counters().sent_awaiting_response == 1).await;
        let node = server(&mux, A);

        tokio::time::sleep(Duration::from_millis(40)).await;
        node.on_heartbeat();
        tokio::time::sleep(Duration::from_millis(40)).await;
        node.on_heartbeat();
        // A single keep-alive stays outstanding; no second one piles up.
        assert_eq!(mux.counters().sent_awaiting_response, 2);
        assert_eq!(node.bridge().state(), BridgeState::ConnectedEstablished);

        tokio::time::sleep(Duration::from_millis(500)).await;
        node.on_heartbeat();
        match task.await.unwrap() {
            Err(Error::ConnectionUnavailable { failure, .. }) => {
                assert_eq!(failure, ConnectionFailureType::SocketFailure);
            }
            other => panic!("expected connection error, got {:?}", other),
        }
        assert_eq!(mux.counters().sent_awaiting_response, 0);

        let verbs = connector.transports(A)[0].verbs();
        let get = verbs.iter().position(|v| v == "GET").unwrap();
        assert_eq!(&verbs[get..], ["GET", "PING"]);
    }

    #[tokio::test]
    async fn test_subscribe_uses_subscription_connection() {
        let (mux, connector) = start(options(&[A], ServerType::Standalone), redis_like()).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        mux.on_event(move |event| {
            if let MultiplexerEvent::SubscriptionMessage { .. } = event {
                let _ = tx.send(event.clone());
            }
        });

        let reply = mux
            .execute(Cmd::new("SUBSCRIBE").arg("news").arg("sport"))
            .await
            .unwrap();
        assert!(matches!(reply, Frame::Array(_)));

        let transports = connector.transports(A);
        assert_eq!(transports.len(), 2);
        let (interactive, subscription) = (&transports[0], &transports[1]);
        assert!(!interactive.verbs().iter().any(|v| v == "SUBSCRIBE"));
        assert_eq!(subscription.verbs(), ["PING", "SUBSCRIBE"]);

        // The second channel's confirmation answers nothing outstanding.
        subscription.push(Frame::Array(vec![
            Frame::bulk("subscribe"),
            Frame::bulk("sport"),
            Frame::Integer(2),
        ]));
        subscription.push(push_frame("message", &["news", "hello"]));
        subscription.push(push_frame("pmessage", &["s*", "sport", "goal"]));

        let mut events = Vec::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            events.push(event);
        }
        assert_eq!(
            events,
            [
                MultiplexerEvent::SubscriptionMessage {
                    endpoint: A.to_string(),
                    pattern: None,
                    channel: Bytes::from("news"),
                    payload: Bytes::from("hello"),
                },
                MultiplexerEvent::SubscriptionMessage {
                    endpoint: A.to_string(),
                    pattern: Some(Bytes::from("s*")),
                    channel: Bytes::from("sport"),
                    payload: Bytes::from("goal"),
                },
            ]
        );

        let bridge = server(&mux, A).subscription_bridge().clone();
        assert!(bridge.is_established());
        assert_eq!(bridge.counters().socket_count, 1);
        assert_eq!(bridge.counters().sent_awaiting_response, 0);
    }

    #[tokio::test]
    async fn test_subscription_keep_alive_uses_private_channel() {
        let mut opts = options(&[A], ServerType::Standalone);
        opts.keep_alive = Duration::from_millis(20);
        opts.heartbeat_interval = Duration::from_secs(3600);
        let muted = Arc::new(AtomicBool::new(false));
        let (mux, connector) = start(opts, mutable(muted.clone())).await;
        let node = server(&mux, A);
        let bridge = node.subscription_bridge().clone();
        assert!(bridge.wait_established(Duration::from_secs(2)).await);
        muted.store(true, Ordering::Release);

        let task = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.execute(Cmd::new("SUBSCRIBE").arg("news")).await })
        };
        wait_for(|| bridge.counters().sent_awaiting_response == 1).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        node.on_heartbeat();

        let written = connector.transport(A).unwrap().written();
        let keep_alive = written.last().unwrap();
        assert_eq!(verb_of(keep_alive), "UNSUBSCRIBE");
        assert!(args_of(keep_alive)[1].starts_with(b"__muxplex_keepalive"));
        assert_eq!(bridge.counters().sent_awaiting_response, 2);
        task.abort();
    }
}
