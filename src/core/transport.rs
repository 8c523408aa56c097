//! Seams between the engine and the outside world.
//!
//! A [`Connector`] opens sockets, a [`Transport`] carries frames, and a
//! [`WriteScheduler`] decides where write passes run. The crate ships a TCP
//! implementation in [`connection`](crate::core::connection); tests plug in
//! recording doubles.

use std::io;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::trace;

use crate::core::bridge::{ConnectionToken, PhysicalBridge};
use crate::proto::frame::Frame;

/// One physical connection as seen by the writer.
///
/// `write` may buffer; `flush` pushes everything buffered so far towards the
/// socket. Neither may block on the peer reading.
pub trait Transport: Send + Sync {
    /// Serialises one command.
    fn write(&self, frame: &Frame) -> io::Result<()>;

    /// Sends everything written since the last flush.
    fn flush(&self) -> io::Result<()>;

    /// Closes the connection; the reader stops calling back.
    fn close(&self);
}

/// Opens connections for bridges.
pub trait Connector: Send + Sync {
    /// Starts a connection attempt.
    ///
    /// The implementation must eventually call either
    /// [`PhysicalBridge::on_connected`] or
    /// [`PhysicalBridge::on_connection_failed`] with `token`, and deliver
    /// replies through [`PhysicalBridge::on_reply`].
    fn connect(&self, bridge: Arc<PhysicalBridge>, token: ConnectionToken);
}

/// Decides where a bridge's write pass runs.
pub trait WriteScheduler: Send + Sync {
    /// Requests a write pass for `bridge`.
    fn schedule_write(&self, bridge: Arc<PhysicalBridge>);
}

/// Runs write passes on tokio's blocking pool.
///
/// A write pass may park while a transaction waits for its preconditions,
/// so it must not occupy an async worker thread.
#[derive(Debug, Clone)]
pub struct BlockingWriteScheduler {
    handle: Handle,
}

impl BlockingWriteScheduler {
    /// Creates a scheduler bound to a runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl WriteScheduler for BlockingWriteScheduler {
    fn schedule_write(&self, bridge: Arc<PhysicalBridge>) {
        self.handle.spawn_blocking(move || {
            let result = bridge.write_queue_default();
            trace!(endpoint = %bridge.endpoint(), ?result, "write pass finished");
        });
    }
}

/// Runs write passes on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineWriteScheduler;

impl WriteScheduler for InlineWriteScheduler {
    fn schedule_write(&self, bridge: Arc<PhysicalBridge>) {
        bridge.write_queue_default();
    }
}
