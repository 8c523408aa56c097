//! Optimistic WATCH/MULTI/EXEC transactions with client-side conditions.
//!
//! A [`Transaction`] collects [`Condition`]s and commands, then travels to a
//! single server as one unit. The writer watches every condition key, checks
//! its current value, and either sends `MULTI … EXEC` or aborts with
//! `UNWATCH`/`DISCARD` when a condition does not hold.
//!
//! # Example
//!
//! ```no_run
//! use muxplex::{command, transaction::Condition, MultiplexerBuilder};
//!
//! # #[tokio::main]
//! # async fn main() -> muxplex::Result<()> {
//! let mux = MultiplexerBuilder::new().endpoint("127.0.0.1:6379").connect().await?;
//!
//! let mut txn = mux.transaction();
//! let guard = txn.add_condition(Condition::key_not_exists("lock"));
//! let reply = txn.queue(command::set("lock", "me"))?;
//! if txn.execute().await? {
//!     assert!(guard.was_satisfied());
//!     reply.recv().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod condition;
mod lowering;

use std::sync::Arc;

use tokio::sync::oneshot;

pub use condition::{Condition, ConditionResult};
pub(crate) use condition::ConditionState;
pub(crate) use lowering::{ReplyGate, TransactionMessage};

use crate::cluster::{combine_slot, SlotHint};
use crate::core::command;
use crate::core::command::Cmd;
use crate::core::message::{CommandFlags, Completion, Message, ResultProcessor};
use crate::core::server::ServerType;
use crate::core::Multiplexer;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// A batch of commands executed atomically if every condition holds.
#[derive(Debug)]
pub struct Transaction {
    mux: Multiplexer,
    conditions: Vec<(Condition, Arc<ConditionState>)>,
    operations: Vec<Arc<Message>>,
    slot: SlotHint,
}

impl Transaction {
    pub(crate) fn new(mux: Multiplexer) -> Self {
        Self {
            mux,
            conditions: Vec::new(),
            operations: Vec::new(),
            slot: SlotHint::NoSlot,
        }
    }

    /// Adds a precondition. The returned handle reports whether it held
    /// once the transaction has run.
    pub fn add_condition(&mut self, condition: Condition) -> ConditionResult {
        self.slot = combine_slot(self.slot, condition.key());
        let state = Arc::new(ConditionState::new(&condition));
        self.conditions.push((condition, state.clone()));
        ConditionResult::new(state)
    }

    /// Queues a command inside the transaction.
    ///
    /// The returned reply resolves after `EXEC`, or with
    /// [`Error::Cancelled`] if the transaction does not commit.
    ///
    /// # Errors
    ///
    /// The same policy checks as a standalone command.
    pub fn queue(&mut self, cmd: Cmd) -> Result<PendingReply> {
        let msg = self.mux.prepare(cmd, CommandFlags::empty())?;
        self.slot = self.slot.merge(msg.slot());
        let (completion, rx) = Completion::channel();
        self.operations.push(Arc::new(msg.with_completion(completion)));
        Ok(PendingReply { rx })
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether nothing has been queued.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Runs the transaction.
    ///
    /// # Returns
    ///
    /// `true` if it committed; `false` if a condition failed or a watched
    /// key changed, in which case every queued reply is cancelled.
    ///
    /// # Errors
    ///
    /// Policy failures, or the connection failing before `EXEC` was
    /// answered.
    pub async fn execute(self) -> Result<bool> {
        self.execute_with(CommandFlags::empty()).await
    }

    /// Like [`execute`](Self::execute), with explicit flags. A
    /// fire-and-forget transaction reports `false`.
    pub async fn execute_with(self, flags: CommandFlags) -> Result<bool> {
        let mux = self.mux.clone();
        let Some(msg) = self.into_message(flags)? else {
            return Ok(!flags.contains(CommandFlags::FIRE_AND_FORGET));
        };
        Ok(committed(&mux.send(msg).await?))
    }

    /// Runs the transaction and parks the calling thread until it finishes.
    pub fn execute_blocking(self, flags: CommandFlags) -> Result<bool> {
        let mux = self.mux.clone();
        let Some(msg) = self.into_message(flags)? else {
            return Ok(!flags.contains(CommandFlags::FIRE_AND_FORGET));
        };
        Ok(committed(&mux.send_blocking(msg)?))
    }

    /// Builds the message to dispatch; `None` when there is nothing to send.
    fn into_message(self, flags: CommandFlags) -> Result<Option<Message>> {
        self.mux.check_command("MULTI")?;
        self.mux.check_command("EXEC")?;
        if self.mux.options().server_type == ServerType::Cluster && self.slot == SlotHint::Multiple
        {
            return Err(Error::MultiSlot {
                command: "EXEC".to_string(),
            });
        }
        let flags = flags.difference(CommandFlags::DEMAND_SLAVE | CommandFlags::PREFER_SLAVE)
            | CommandFlags::DEMAND_MASTER;
        let db = self.mux.database();

        if self.operations.is_empty() && self.conditions.is_empty() {
            if flags.contains(CommandFlags::FIRE_AND_FORGET) {
                return Ok(None);
            }
            let ping = Message::new(db, flags, command::ping())
                .with_processor(ResultProcessor::Liveness);
            return Ok(Some(ping));
        }

        let txn = TransactionMessage::new(self.conditions, self.operations);
        Ok(Some(Message::transaction(db, flags, self.slot, txn)))
    }
}

fn committed(frame: &Frame) -> bool {
    matches!(frame, Frame::Integer(n) if *n != 0)
}

/// The future reply of a command queued in a [`Transaction`].
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Frame>>,
}

impl PendingReply {
    /// Waits for the reply.
    pub async fn recv(self) -> Result<Frame> {
        self.rx.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Parks the calling thread until the reply arrives.
    pub fn blocking_recv(self) -> Result<Frame> {
        self.rx.blocking_recv().unwrap_or(Err(Error::Cancelled))
    }
}
