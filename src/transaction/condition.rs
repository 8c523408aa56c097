//! Transaction preconditions.
//!
//! Every [`Condition`] is lowered to `WATCH key` followed by a check command.
//! The check reply resolves the condition once; the transaction then reads
//! the outcome exactly once when it decides between commit and abort.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::core::command::{self, Cmd};
use crate::proto::frame::Frame;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Check {
    Exists { expect: bool },
    Equal { value: Bytes, expect: bool },
}

/// A precondition checked before a transaction commits.
///
/// # Examples
///
/// ```
/// use muxplex::transaction::Condition;
///
/// let cond = Condition::hash_equal("user:1", "state", "active");
/// assert_eq!(cond.key(), b"user:1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    key: Bytes,
    field: Option<Bytes>,
    check: Check,
}

impl Condition {
    fn new(key: impl Into<Bytes>, field: Option<Bytes>, check: Check) -> Self {
        Self {
            key: key.into(),
            field,
            check,
        }
    }

    /// The key must exist.
    pub fn key_exists(key: impl Into<Bytes>) -> Self {
        Self::new(key, None, Check::Exists { expect: true })
    }

    /// The key must not exist.
    pub fn key_not_exists(key: impl Into<Bytes>) -> Self {
        Self::new(key, None, Check::Exists { expect: false })
    }

    /// The string at `key` must equal `value`.
    pub fn string_equal(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(
            key,
            None,
            Check::Equal {
                value: value.into(),
                expect: true,
            },
        )
    }

    /// The string at `key` must differ from `value` (a missing key differs).
    pub fn string_not_equal(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(
            key,
            None,
            Check::Equal {
                value: value.into(),
                expect: false,
            },
        )
    }

    /// The hash at `key` must contain `field`.
    pub fn hash_exists(key: impl Into<Bytes>, field: impl Into<Bytes>) -> Self {
        Self::new(key, Some(field.into()), Check::Exists { expect: true })
    }

    /// The hash at `key` must not contain `field`.
    pub fn hash_not_exists(key: impl Into<Bytes>, field: impl Into<Bytes>) -> Self {
        Self::new(key, Some(field.into()), Check::Exists { expect: false })
    }

    /// `field` of the hash at `key` must equal `value`.
    pub fn hash_equal(
        key: impl Into<Bytes>,
        field: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self::new(
            key,
            Some(field.into()),
            Check::Equal {
                value: value.into(),
                expect: true,
            },
        )
    }

    /// `field` of the hash at `key` must differ from `value`.
    pub fn hash_not_equal(
        key: impl Into<Bytes>,
        field: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self::new(
            key,
            Some(field.into()),
            Check::Equal {
                value: value.into(),
                expect: false,
            },
        )
    }

    /// The watched key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn watch(&self) -> Cmd {
        command::watch(self.key.clone())
    }

    /// The command whose reply decides the condition.
    pub(crate) fn check_command(&self) -> Cmd {
        match (&self.check, &self.field) {
            (Check::Exists { .. }, None) => command::exists(self.key.clone()),
            (Check::Exists { .. }, Some(field)) => command::hexists(self.key.clone(), field.clone()),
            (Check::Equal { .. }, None) => command::get(self.key.clone()),
            (Check::Equal { .. }, Some(field)) => command::hget(self.key.clone(), field.clone()),
        }
    }
}

/// Shared resolution slot between a check reply and the transaction.
#[derive(Debug)]
pub(crate) struct ConditionState {
    check: Check,
    outcome: Mutex<Option<bool>>,
}

impl ConditionState {
    pub(crate) fn new(condition: &Condition) -> Self {
        Self {
            check: condition.check.clone(),
            outcome: Mutex::new(None),
        }
    }

    /// Interprets the check reply.
    ///
    /// # Errors
    ///
    /// Returns a description of the reply when its shape cannot answer the
    /// check; the caller treats that as a protocol failure.
    pub(crate) fn resolve(&self, frame: &Frame) -> Result<(), String> {
        let satisfied = match &self.check {
            Check::Exists { expect } => match frame.to_int() {
                Some(n) => (n == 1) == *expect,
                None => return Err(format!("condition check expected an integer, got {:?}", frame)),
            },
            Check::Equal { value, expect } => {
                let equal = match frame {
                    Frame::BulkString(Some(b)) => b.as_ref() == value.as_ref(),
                    Frame::SimpleString(s) => s.as_slice() == value.as_ref(),
                    f if f.is_null() => false,
                    other => {
                        return Err(format!("condition check expected a string, got {:?}", other))
                    }
                };
                equal == *expect
            }
        };
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(satisfied);
        Ok(())
    }

    /// Whether the check resolved and was satisfied. Unresolved counts as
    /// not satisfied.
    pub(crate) fn satisfied(&self) -> bool {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(false)
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Caller-side view of a condition's outcome.
#[derive(Debug, Clone)]
pub struct ConditionResult {
    state: Arc<ConditionState>,
}

impl ConditionResult {
    pub(crate) fn new(state: Arc<ConditionState>) -> Self {
        Self { state }
    }

    /// Whether the check has answered.
    pub fn is_resolved(&self) -> bool {
        self.state.is_resolved()
    }

    /// Whether the condition held. `false` until resolved.
    pub fn was_satisfied(&self) -> bool {
        self.state.satisfied()
    }
}
