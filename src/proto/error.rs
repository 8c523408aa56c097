use std::fmt;
use std::io;

use thiserror::Error;

/// Result type alias for muxplex operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a physical connection could not carry a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ConnectionFailureType {
    /// No server could be selected for the message.
    UnableToResolvePhysicalConnection,
    /// The connect attempt failed or timed out.
    UnableToConnect,
    /// The socket reported an error.
    SocketFailure,
    /// The remote end closed the socket.
    SocketClosed,
    /// The reply stream no longer matches the outstanding commands.
    ProtocolFailure,
    /// The handshake was rejected by the server.
    AuthenticationFailure,
    /// The multiplexer was shut down.
    ConnectionDisposed,
}

impl fmt::Display for ConnectionFailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnableToResolvePhysicalConnection => "UnableToResolvePhysicalConnection",
            Self::UnableToConnect => "UnableToConnect",
            Self::SocketFailure => "SocketFailure",
            Self::SocketClosed => "SocketClosed",
            Self::ProtocolFailure => "ProtocolFailure",
            Self::AuthenticationFailure => "AuthenticationFailure",
            Self::ConnectionDisposed => "ConnectionDisposed",
        };
        f.write_str(name)
    }
}

/// Broad classes of failure, used to decide where an error is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transport down, connect failure, authentication failure.
    Connectivity,
    /// Malformed or unexpected reply shape.
    Protocol,
    /// Rejected locally before any write.
    Policy,
    /// The caller stopped waiting; the command may still run.
    Timeout,
    /// The server answered with an error.
    Server,
}

/// Errors that can occur while multiplexing commands onto Redis connections.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An IO error occurred.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// A protocol error occurred.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// The server returned an error.
    #[error("server error: {message}")]
    Server {
        /// Error message from server.
        message: String,
    },

    /// Authentication failed.
    #[error("authentication failed")]
    Auth,

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of invalid argument.
        message: String,
    },

    /// The connection carrying the message failed or was never available.
    #[error("{failure} on {endpoint}: {detail}")]
    ConnectionUnavailable {
        /// Failure classification.
        failure: ConnectionFailureType,
        /// Endpoint of the failed bridge.
        endpoint: String,
        /// Free-form detail.
        detail: String,
    },

    /// No connected server was available to accept the command.
    #[error("no connection is available to service this operation: {command}")]
    NoConnectionAvailable {
        /// The command that could not be dispatched.
        command: String,
    },

    /// The caller gave up waiting. The command is not retracted.
    #[error("timeout performing {command} after {elapsed_ms}ms")]
    Timeout {
        /// The command being waited on.
        command: String,
        /// How long the caller waited.
        elapsed_ms: u64,
    },

    /// The operation was part of a transaction that did not commit.
    #[error("the operation was cancelled")]
    Cancelled,

    /// The command is disabled in the command map.
    #[error("this operation has been disabled in the command-map and cannot be used: {command}")]
    CommandDisabled {
        /// The disabled command.
        command: String,
    },

    /// A write command was routed to a read-only replica.
    #[error("command cannot be issued to a slave: {command} ({endpoint})")]
    MasterOnly {
        /// The rejected command.
        command: String,
        /// The replica it was routed to.
        endpoint: String,
    },

    /// The keys of one operation hash to different cluster slots.
    #[error("multi-key operations must involve a single slot; keys can use 'hash tags' to help this, i.e. '{{/users/12345}}/account' and '{{/users/12345}}/contacts' will always be in the same slot: {command}")]
    MultiSlot {
        /// The rejected command.
        command: String,
    },

    /// The database index is not served by the selected server.
    #[error("database {db} is out of range for {endpoint}")]
    DatabaseOutOfRange {
        /// Requested database.
        db: i64,
        /// Server that rejected it.
        endpoint: String,
    },

    /// Redis Cluster: key moved to another node (permanent redirect).
    ///
    /// Surfaced only when the redirect could not be followed, e.g. because
    /// the message carried `NO_REDIRECT` or the target was not selectable.
    #[error("MOVED to slot {slot} at {address}")]
    Moved {
        /// The slot number (0-16383).
        slot: u16,
        /// The address of the node owning this slot (e.g., "127.0.0.1:7001").
        address: String,
    },

    /// Redis Cluster: temporary redirect during migration (ASK redirect).
    #[error("ASK to slot {slot} at {address}")]
    Ask {
        /// The slot number (0-16383).
        slot: u16,
        /// The address of the node temporarily handling this slot.
        address: String,
    },

    /// Redis Cluster is down or unavailable.
    #[error("CLUSTERDOWN cluster is down")]
    ClusterDown,

    /// The server rejected a multi-key operation spanning slots.
    #[error("CROSSSLOT keys in multi-key operation map to different slots")]
    CrossSlot,
}

impl Error {
    /// Builds a connection failure for the given endpoint.
    pub fn connection(
        failure: ConnectionFailureType,
        endpoint: impl fmt::Display,
        detail: impl Into<String>,
    ) -> Self {
        Error::ConnectionUnavailable {
            failure,
            endpoint: endpoint.to_string(),
            detail: detail.into(),
        }
    }

    /// Builds a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Classifies the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Io { .. }
            | Error::Auth
            | Error::ConnectionUnavailable { .. }
            | Error::NoConnectionAvailable { .. }
            | Error::ClusterDown => ErrorCategory::Connectivity,
            Error::Protocol { .. } => ErrorCategory::Protocol,
            Error::InvalidArgument { .. }
            | Error::CommandDisabled { .. }
            | Error::MasterOnly { .. }
            | Error::MultiSlot { .. }
            | Error::DatabaseOutOfRange { .. } => ErrorCategory::Policy,
            Error::Timeout { .. } => ErrorCategory::Timeout,
            Error::Server { .. }
            | Error::Moved { .. }
            | Error::Ask { .. }
            | Error::CrossSlot
            | Error::Cancelled => ErrorCategory::Server,
        }
    }
}
