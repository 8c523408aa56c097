//! Connection and topology notifications.

use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tracing::debug;

use crate::core::completion::{Completable, CompletionManager};
use crate::proto::error::ConnectionFailureType;

/// Something noteworthy happened to a connection or to the cluster map.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MultiplexerEvent {
    /// A bridge lost (or never obtained) its connection.
    ConnectionFailed {
        /// The affected endpoint.
        endpoint: String,
        /// Failure classification.
        failure: ConnectionFailureType,
        /// Free-form detail.
        detail: String,
    },
    /// A bridge that had failed is established again.
    ConnectionRestored {
        /// The affected endpoint.
        endpoint: String,
    },
    /// A `MOVED` reply repointed a slot.
    HashSlotMoved {
        /// The slot.
        slot: u16,
        /// Previous owner, if one was known.
        old: Option<String>,
        /// New owner.
        new: String,
    },
    /// The server answered a command with an error.
    ErrorMessage {
        /// The server that replied.
        endpoint: String,
        /// Error text.
        message: String,
    },
    /// A message was published to a subscribed channel.
    SubscriptionMessage {
        /// The server that pushed it.
        endpoint: String,
        /// The matching pattern, for `PSUBSCRIBE` deliveries.
        pattern: Option<Bytes>,
        /// The channel it was published to.
        channel: Bytes,
        /// The payload.
        payload: Bytes,
    },
}

type Handler = Arc<dyn Fn(&MultiplexerEvent) + Send + Sync>;

/// Registered event handlers.
#[derive(Default)]
pub(crate) struct EventHub {
    handlers: RwLock<Vec<Handler>>,
}

struct Dispatch {
    handlers: Vec<Handler>,
    event: MultiplexerEvent,
}

impl Completable for Dispatch {
    fn try_complete(&self, is_async: bool) -> bool {
        if !is_async {
            return false;
        }
        for handler in &self.handlers {
            handler(&self.event);
        }
        true
    }
}

impl EventHub {
    pub(crate) fn subscribe(&self, handler: impl Fn(&MultiplexerEvent) + Send + Sync + 'static) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Hands the event to every handler on a completion worker.
    pub(crate) fn raise(&self, completions: &Arc<CompletionManager>, event: MultiplexerEvent) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if handlers.is_empty() {
            return;
        }
        debug!(?event, "raising event");
        completions.complete_sync_or_async(Arc::new(Dispatch { handlers, event }));
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("EventHub").field("handlers", &count).finish()
    }
}
