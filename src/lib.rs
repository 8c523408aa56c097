//! # Muxplex
//!
//! Client-side Redis multiplexer: any number of concurrent callers share one
//! interactive connection per server. Commands are pipelined through a
//! per-server queue, replies are matched in order, and results are handed
//! back inline or on a background worker.
//!
//! ## Features
//!
//! - Standalone and cluster routing with `MOVED`/`ASK` redirect handling
//! - Master/slave role preferences
//! - WATCH/MULTI/EXEC transactions with client-side conditions
//! - Async, blocking and callback completions
//! - `tls` - TLS/SSL support
//!
//! ## Example
//!
//! ```no_run
//! use muxplex::{command, MultiplexerBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mux = MultiplexerBuilder::new()
//!         .endpoint("redis://localhost:6379")
//!         .connect()
//!         .await?;
//!     let _ = mux.execute(command::ping()).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub(crate) mod core;
pub mod cluster;
pub mod proto;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::core::bridge::{
    BridgeCounters, BridgeState, ConnectionToken, ConnectionType, PhysicalBridge, WriteResult,
};
pub use crate::core::builder::{MultiplexerBuilder, Options, ServerFeatures};
pub use crate::core::command;
pub use crate::core::completion::{Completable, CompletionCounters, CompletionManager};
pub use crate::core::connection::TcpConnector;
pub use crate::core::events::MultiplexerEvent;
pub use crate::core::message::{CommandFlags, Completion, Message, RolePreference};
pub use crate::core::queue::MessageQueue;
pub use crate::core::server::{ServerCounters, ServerEndPoint, ServerType};
pub use crate::core::transport::{
    BlockingWriteScheduler, Connector, InlineWriteScheduler, Transport, WriteScheduler,
};
pub use crate::core::{Error, Multiplexer, MultiplexerCounters, Result};
pub use crate::proto::error::ConnectionFailureType;
pub use crate::proto::frame::Frame;
pub use crate::transaction::{Condition, ConditionResult, PendingReply, Transaction};
