//! Units of work flowing through a bridge.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use bitflags::bitflags;
use tokio::sync::oneshot;

use crate::cluster::{slot_of_keys, SlotHint};
use crate::core::command::Cmd;
use crate::core::completion::Completable;
use crate::core::result_box::ResultBox;
use crate::proto::error::Result;
use crate::proto::frame::Frame;
use crate::transaction::{ConditionState, ReplyGate, TransactionMessage};

bitflags! {
    /// Per-command behaviour flags.
    ///
    /// No role bits means "prefer master".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandFlags: u16 {
        /// Jump ahead of normal traffic on the bridge.
        const HIGH_PRIORITY = 1 << 0;
        /// Do not wait for, or report, the reply.
        const FIRE_AND_FORGET = 1 << 1;
        /// Only a master may serve the command.
        const DEMAND_MASTER = 1 << 2;
        /// Use a slave when one is available.
        const PREFER_SLAVE = 1 << 3;
        /// Only a slave may serve the command.
        const DEMAND_SLAVE = Self::DEMAND_MASTER.bits() | Self::PREFER_SLAVE.bits();
        /// Fail instead of following a MOVED/ASK redirect.
        const NO_REDIRECT = 1 << 4;
    }
}

/// Resolved master/slave preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolePreference {
    /// Master if possible, else a slave.
    PreferMaster,
    /// Master only.
    DemandMaster,
    /// Slave if possible, else the master.
    PreferSlave,
    /// Slave only.
    DemandSlave,
}

impl CommandFlags {
    /// Decodes the role bits.
    pub fn role(self) -> RolePreference {
        match self.intersection(CommandFlags::DEMAND_SLAVE).bits() {
            b if b == CommandFlags::DEMAND_SLAVE.bits() => RolePreference::DemandSlave,
            b if b == CommandFlags::PREFER_SLAVE.bits() => RolePreference::PreferSlave,
            b if b == CommandFlags::DEMAND_MASTER.bits() => RolePreference::DemandMaster,
            _ => RolePreference::PreferMaster,
        }
    }
}

/// Where a finished message delivers its outcome.
pub enum Completion {
    /// Wake a thread parked on a [`ResultBox`].
    Blocking(Arc<ResultBox>),
    /// Resolve an async waiter.
    Async(oneshot::Sender<Result<Frame>>),
    /// Run caller code; never executed on the reader.
    Callback(Box<dyn FnOnce(Result<Frame>) + Send>),
}

impl Completion {
    /// Wraps a closure.
    pub fn callback(f: impl FnOnce(Result<Frame>) + Send + 'static) -> Self {
        Completion::Callback(Box::new(f))
    }

    /// Creates an async completion and its receiving half.
    pub fn channel() -> (Self, oneshot::Receiver<Result<Frame>>) {
        let (tx, rx) = oneshot::channel();
        (Completion::Async(tx), rx)
    }

    fn runs_caller_code(&self) -> bool {
        matches!(self, Completion::Callback(_))
    }

    fn deliver(self, result: Result<Frame>) {
        match self {
            Completion::Blocking(slot) => slot.set(result),
            Completion::Async(tx) => {
                // The receiver may have stopped waiting.
                let _ = tx.send(result);
            }
            Completion::Callback(f) => f(result),
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Blocking(_) => f.write_str("Blocking"),
            Completion::Async(_) => f.write_str("Async"),
            Completion::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// What a message carries onto the wire.
#[derive(Debug)]
pub(crate) enum Payload {
    /// A single command.
    Command(Cmd),
    /// A transaction operation written between MULTI and EXEC; its own reply
    /// is the QUEUED acknowledgement, the real result arrives through EXEC.
    Queued(Arc<Message>),
    /// A whole transaction, expanded by the writer.
    Transaction(TransactionMessage),
}

/// How a reply is interpreted.
#[derive(Debug)]
pub(crate) enum ResultProcessor {
    /// Hand the frame to the caller.
    Raw,
    /// Expect `+OK`.
    DemandOk,
    /// Handshake authentication.
    Auth,
    /// Handshake tracer; its reply establishes the bridge.
    Tracer,
    /// Heartbeat keep-alive.
    KeepAlive,
    /// Empty transaction; any non-error reply commits.
    Liveness,
    /// Expect `+QUEUED`.
    Queued {
        acked: Arc<AtomicBool>,
        gate: Arc<ReplyGate>,
    },
    /// Transaction precondition check.
    Condition {
        state: Arc<ConditionState>,
        gate: Arc<ReplyGate>,
    },
    /// EXEC / UNWATCH / DISCARD of a transaction.
    Transaction,
}

#[derive(Default)]
struct MessageState {
    completion: Option<Completion>,
    result: Option<Result<Frame>>,
}

/// An immutable unit of work with a one-shot completion target.
pub struct Message {
    db: i64,
    flags: AtomicU16,
    internal: bool,
    asking: AtomicBool,
    slot: SlotHint,
    payload: Payload,
    processor: ResultProcessor,
    created: Instant,
    done: AtomicBool,
    state: Mutex<MessageState>,
}

impl Message {
    fn build(
        db: i64,
        flags: CommandFlags,
        slot: SlotHint,
        payload: Payload,
        processor: ResultProcessor,
    ) -> Self {
        Self {
            db,
            flags: AtomicU16::new(flags.bits()),
            internal: false,
            asking: AtomicBool::new(false),
            slot,
            payload,
            processor,
            created: Instant::now(),
            done: AtomicBool::new(false),
            state: Mutex::new(MessageState::default()),
        }
    }

    /// Creates a caller command; the slot is derived from its keys.
    pub(crate) fn new(db: i64, flags: CommandFlags, cmd: Cmd) -> Self {
        let slot = slot_of_keys(cmd.keys());
        Self::build(db, flags, slot, Payload::Command(cmd), ResultProcessor::Raw)
    }

    /// Creates an engine-generated command that bypasses the "connected"
    /// check on enqueue.
    pub(crate) fn internal(cmd: Cmd, processor: ResultProcessor) -> Self {
        let mut msg = Self::build(
            -1,
            CommandFlags::HIGH_PRIORITY,
            SlotHint::NoSlot,
            Payload::Command(cmd),
            processor,
        );
        msg.internal = true;
        msg
    }

    /// Wraps a transaction operation for writing inside MULTI.
    pub(crate) fn queued(op: Arc<Message>, acked: Arc<AtomicBool>, gate: Arc<ReplyGate>) -> Self {
        Self::build(
            op.db,
            op.flags() | CommandFlags::NO_REDIRECT,
            op.slot,
            Payload::Queued(op),
            ResultProcessor::Queued { acked, gate },
        )
    }

    /// Creates the composite transaction message.
    pub(crate) fn transaction(
        db: i64,
        flags: CommandFlags,
        slot: SlotHint,
        txn: TransactionMessage,
    ) -> Self {
        Self::build(
            db,
            flags,
            slot,
            Payload::Transaction(txn),
            ResultProcessor::Transaction,
        )
    }

    /// Overrides the database, so an engine command takes part in SELECT
    /// tracking like the caller commands around it.
    pub(crate) fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// Replaces the reply processor.
    pub(crate) fn with_processor(mut self, processor: ResultProcessor) -> Self {
        self.processor = processor;
        self
    }

    /// Attaches the completion target. Must happen before enqueue.
    pub(crate) fn with_completion(self, completion: Completion) -> Self {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .completion = Some(completion);
        self
    }

    pub(crate) fn db(&self) -> i64 {
        self.db
    }

    pub(crate) fn flags(&self) -> CommandFlags {
        CommandFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn add_flags(&self, flags: CommandFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn is_high_priority(&self) -> bool {
        self.flags().contains(CommandFlags::HIGH_PRIORITY)
    }

    pub(crate) fn is_fire_and_forget(&self) -> bool {
        self.flags().contains(CommandFlags::FIRE_AND_FORGET)
    }

    pub(crate) fn is_no_redirect(&self) -> bool {
        self.flags().contains(CommandFlags::NO_REDIRECT)
    }

    pub(crate) fn is_internal(&self) -> bool {
        self.internal
    }

    pub(crate) fn is_asking(&self) -> bool {
        self.asking.load(Ordering::Acquire)
    }

    pub(crate) fn set_asking(&self, asking: bool) {
        self.asking.store(asking, Ordering::Release);
    }

    pub(crate) fn slot(&self) -> SlotHint {
        self.slot
    }

    pub(crate) fn payload(&self) -> &Payload {
        &self.payload
    }

    pub(crate) fn processor(&self) -> &ResultProcessor {
        &self.processor
    }

    pub(crate) fn created(&self) -> Instant {
        self.created
    }

    /// The single command this message writes, if it is not composite.
    pub(crate) fn command(&self) -> Option<&Cmd> {
        match &self.payload {
            Payload::Command(cmd) => Some(cmd),
            Payload::Queued(op) => op.command(),
            Payload::Transaction(_) => None,
        }
    }

    pub(crate) fn is_command(&self, verb: &str) -> bool {
        self.command().map_or(false, |cmd| cmd.is(verb))
    }

    /// Whether this is a caller's (un)subscribe, which travels on the
    /// subscription connection.
    pub(crate) fn is_subscription(&self) -> bool {
        matches!(&self.payload, Payload::Command(cmd) if cmd.is_subscription())
    }

    /// Verb used in logs and errors.
    pub(crate) fn command_name(&self) -> String {
        match &self.payload {
            Payload::Transaction(txn) => txn.terminal().name(),
            _ => self.command().map_or_else(String::new, Cmd::name),
        }
    }

    pub(crate) fn is_master_only(&self) -> bool {
        match &self.payload {
            Payload::Transaction(_) => true,
            _ => self.command().map_or(false, Cmd::is_master_only),
        }
    }

    /// The wire frame for this message; a transaction writes its terminal
    /// verb once expansion has decided it.
    pub(crate) fn to_frame(&self) -> Frame {
        match &self.payload {
            Payload::Transaction(txn) => txn.terminal().to_frame(),
            _ => self
                .command()
                .map_or_else(|| Frame::Array(Vec::new()), Cmd::to_frame),
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Records the outcome. Only the first call wins.
    ///
    /// Delivery happens later through the completion manager.
    pub(crate) fn set_result(&self, result: Result<Frame>) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .result = Some(result);
        match &self.processor {
            ResultProcessor::Queued { gate, .. } | ResultProcessor::Condition { gate, .. } => {
                gate.arrive()
            }
            _ => {}
        }
        true
    }
}

impl Completable for Message {
    fn try_complete(&self, is_async: bool) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !is_async
            && state
                .completion
                .as_ref()
                .map_or(false, Completion::runs_caller_code)
        {
            return false;
        }
        let completion = state.completion.take();
        let result = state.result.take();
        drop(state);

        if let (Some(completion), Some(result)) = (completion, result) {
            completion.deliver(result);
        }
        true
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("command", &self.command_name())
            .field("db", &self.db)
            .field("flags", &self.flags())
            .field("slot", &self.slot)
            .field("internal", &self.internal)
            .field("done", &self.is_completed())
            .finish()
    }
}
