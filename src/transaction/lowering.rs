//! Lowering a transaction onto the wire.
//!
//! The writer calls [`TransactionMessage::expand`] with exclusive use of the
//! connection, so nothing else is interleaved between `WATCH` and the
//! terminal verb. The terminal reply comes back through
//! [`TransactionMessage::complete_exec`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cluster::errors::parse_redis_error;
use crate::core::bridge::{PhysicalBridge, WireWriter};
use crate::core::command::{self, Cmd};
use crate::core::message::{CommandFlags, Message, ResultProcessor};
use crate::proto::error::Error;
use crate::proto::frame::Frame;
use crate::transaction::condition::{Condition, ConditionState};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts replies the writer is still waiting for.
///
/// The writer arms the gate before it writes the commands whose replies it
/// will wait on, so a reply arriving before the wait starts is not lost.
#[derive(Debug, Default)]
pub(crate) struct ReplyGate {
    pending: Mutex<usize>,
    settled: Condvar,
}

impl ReplyGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn arm(&self, replies: usize) {
        *lock(&self.pending) += replies;
    }

    pub(crate) fn arrive(&self) {
        let mut pending = lock(&self.pending);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.settled.notify_all();
        }
    }

    /// Waits until every armed reply has arrived.
    ///
    /// # Returns
    ///
    /// `false` if `timeout` elapsed first.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = lock(&self.pending);
        while *pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .settled
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            pending = guard;
        }
        true
    }
}

/// The composite payload of a transaction.
#[derive(Debug)]
pub(crate) struct TransactionMessage {
    conditions: Vec<(Condition, Arc<ConditionState>)>,
    operations: Vec<Arc<Message>>,
    terminal: Mutex<Cmd>,
    aborted: AtomicBool,
    /// One entry per command queued inside MULTI; `None` marks an
    /// engine-injected command whose EXEC element is discarded.
    exec_slots: Mutex<Vec<Option<Arc<Message>>>>,
}

impl TransactionMessage {
    pub(crate) fn new(
        conditions: Vec<(Condition, Arc<ConditionState>)>,
        operations: Vec<Arc<Message>>,
    ) -> Self {
        Self {
            conditions,
            operations,
            terminal: Mutex::new(command::exec()),
            aborted: AtomicBool::new(false),
            exec_slots: Mutex::new(Vec::new()),
        }
    }

    /// The verb that ends the transaction on the wire: `EXEC`, or `UNWATCH`
    /// / `DISCARD` once the writer has decided to abort.
    pub(crate) fn terminal(&self) -> Cmd {
        lock(&self.terminal).clone()
    }

    fn engine(db: i64, cmd: Cmd, processor: ResultProcessor) -> Arc<Message> {
        let msg = Message::internal(cmd, processor).with_db(db);
        msg.add_flags(CommandFlags::NO_REDIRECT);
        Arc::new(msg)
    }

    /// Writes the whole transaction, ending with `outer` itself carrying the
    /// terminal verb.
    ///
    /// Blocks the writer while waiting for check replies (and, on servers
    /// without EXECABORT, for the QUEUED acknowledgements), bounded by the
    /// sync timeout.
    pub(crate) fn expand(&self, outer: &Arc<Message>, wire: &mut WireWriter<'_>) -> io::Result<()> {
        let db = outer.db();
        let timeout = wire.bridge().options_sync_timeout();
        let exec_abort = wire.bridge().exec_abort_supported();
        let gate = Arc::new(ReplyGate::new());
        *lock(&self.terminal) = command::exec();
        self.aborted.store(false, Ordering::Release);

        if !self.conditions.is_empty() {
            gate.arm(self.conditions.len());
            for (condition, state) in &self.conditions {
                wire.write(&Self::engine(db, condition.watch(), ResultProcessor::DemandOk))?;
                wire.write(&Self::engine(
                    db,
                    condition.check_command(),
                    ResultProcessor::Condition {
                        state: state.clone(),
                        gate: gate.clone(),
                    },
                ))?;
            }
            if exec_abort {
                wire.flush()?;
                if !self.conditions_hold(&gate, timeout) {
                    return self.abort(outer, wire, command::unwatch());
                }
            }
        }

        wire.write(&Self::engine(db, command::multi(), ResultProcessor::DemandOk))?;

        let mut slots = Vec::with_capacity(self.operations.len());
        let mut acks = Vec::with_capacity(self.operations.len());
        for op in &self.operations {
            let reselect = op.db() >= 0 && (op.is_command("EVAL") || op.is_command("EVALSHA"));
            let mut queue = vec![Some(op.clone())];
            if reselect {
                // Scripts may SELECT server-side.
                queue.push(None);
            }
            for entry in queue {
                let inner = entry.clone().unwrap_or_else(|| {
                    Arc::new(Message::new(
                        op.db(),
                        CommandFlags::NO_REDIRECT,
                        command::select(op.db()),
                    ))
                });
                let acked = Arc::new(AtomicBool::new(false));
                gate.arm(1);
                wire.write(&Arc::new(Message::queued(inner, acked.clone(), gate.clone())))?;
                slots.push(entry);
                acks.push(acked);
            }
        }
        *lock(&self.exec_slots) = slots;

        if !exec_abort {
            wire.flush()?;
            let conditions = self.conditions_hold(&gate, timeout);
            let queued = acks.iter().all(|acked| acked.load(Ordering::Acquire));
            if !conditions || !queued {
                debug!(conditions, queued, "transaction not accepted, discarding");
                return self.abort(outer, wire, command::discard());
            }
        }

        wire.write(outer)
    }

    fn conditions_hold(&self, gate: &ReplyGate, timeout: Duration) -> bool {
        if !gate.wait(timeout) {
            debug!(?timeout, "timed out waiting for transaction replies");
            return false;
        }
        self.conditions.iter().all(|(_, state)| state.satisfied())
    }

    fn abort(&self, outer: &Arc<Message>, wire: &mut WireWriter<'_>, verb: Cmd) -> io::Result<()> {
        debug!(verb = %verb.name(), "aborting transaction");
        self.aborted.store(true, Ordering::Release);
        *lock(&self.terminal) = verb;
        wire.write(outer)
    }

    /// Interprets the reply to the terminal verb.
    ///
    /// # Returns
    ///
    /// Whether the transaction committed.
    ///
    /// # Errors
    ///
    /// Returns a description of the reply when its shape does not fit the
    /// transaction; the caller tears the connection down.
    pub(crate) fn complete_exec(&self, bridge: &PhysicalBridge, frame: Frame) -> Result<bool, String> {
        if self.aborted.load(Ordering::Acquire) {
            if !frame.is_simple("OK") {
                return Err(format!("expected OK to {}, got {:?}", self.terminal().name(), frame));
            }
            self.cancel_operations(bridge);
            return Ok(false);
        }

        match frame {
            Frame::Null => {
                debug!("EXEC returned null, watched key changed");
                self.cancel_operations(bridge);
                Ok(false)
            }
            Frame::Array(items) => {
                let slots = std::mem::take(&mut *lock(&self.exec_slots));
                if items.len() != slots.len() {
                    return Err(format!(
                        "EXEC returned {} replies for {} queued commands",
                        items.len(),
                        slots.len()
                    ));
                }
                for (slot, item) in slots.into_iter().zip(items) {
                    let Some(op) = slot else {
                        continue;
                    };
                    let result = match item {
                        Frame::Error(text) => Err(parse_redis_error(&text)),
                        other => Ok(other),
                    };
                    bridge.complete(&op, result);
                }
                Ok(true)
            }
            other => Err(format!("unexpected EXEC reply {:?}", other)),
        }
    }

    fn cancel_operations(&self, bridge: &PhysicalBridge) {
        for op in &self.operations {
            bridge.complete(op, Err(Error::Cancelled));
        }
    }

    /// Fails every queued operation with a copy of `err`.
    pub(crate) fn fail_operations(&self, bridge: &PhysicalBridge, err: &Error) {
        for op in &self.operations {
            bridge.complete(op, Err(replicate(err)));
        }
    }
}

fn replicate(err: &Error) -> Error {
    match err {
        Error::ConnectionUnavailable {
            failure,
            endpoint,
            detail,
        } => Error::ConnectionUnavailable {
            failure: *failure,
            endpoint: endpoint.clone(),
            detail: detail.clone(),
        },
        Error::Protocol { message } => Error::Protocol {
            message: message.clone(),
        },
        Error::Timeout {
            command,
            elapsed_ms,
        } => Error::Timeout {
            command: command.clone(),
            elapsed_ms: *elapsed_ms,
        },
        Error::Cancelled => Error::Cancelled,
        other => Error::Server {
            message: other.to_string(),
        },
    }
}
