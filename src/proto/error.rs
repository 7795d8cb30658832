use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for slotwise operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while routing commands through a Redis Cluster.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An IO error occurred on a node connection.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// Connecting to a node failed.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        /// Address that was dialed.
        address: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// A protocol error occurred.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// The server rejected the command for a reason unrelated to routing.
    #[error("server error: {message}")]
    Server {
        /// Error message from server, verbatim.
        message: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of invalid argument.
        message: String,
    },

    /// The slot for the requested key lives on another node (permanent redirect).
    ///
    /// The slot map is updated and the command retried on the new owner.
    #[error("MOVED to slot {slot} at {address}")]
    Moved {
        /// The slot number (0-16383).
        slot: u16,
        /// The address of the node owning this slot (e.g., "127.0.0.1:7001").
        address: String,
    },

    /// Temporary redirect for a single key during slot migration.
    ///
    /// The command is replayed on the target after an `ASKING` handshake. The
    /// slot map is never updated for ASK redirects.
    #[error("ASK to slot {slot} at {address}")]
    Ask {
        /// The slot number (0-16383).
        slot: u16,
        /// The address of the node temporarily handling this key.
        address: String,
    },

    /// The operation touched keys that are in flux and should be retried.
    #[error("TRYAGAIN {message}")]
    TryAgain {
        /// Server message following the error kind.
        message: String,
    },

    /// The cluster reports itself as non-operational.
    #[error("CLUSTERDOWN {message}")]
    ClusterDown {
        /// Server message following the error kind.
        message: String,
    },

    /// Multi-key operation with keys in different slots.
    ///
    /// Use hash tags `{...}` to place related keys in the same slot.
    #[error("CROSSSLOT keys in request don't hash to the same slot")]
    CrossSlot {
        /// Slot of the first key and of the first key that disagreed with it,
        /// when detected client-side.
        slots: Option<(u16, u16)>,
    },

    /// No reachable node answered a topology query.
    #[error("cluster topology unavailable: {message}")]
    TopologyUnavailable {
        /// Description of the last failure.
        message: String,
    },

    /// The retry budget ran out while following redirects or transient errors.
    #[error("gave up after {attempts} attempts in {elapsed:?}: {last}")]
    RetriesExhausted {
        /// Number of dispatches made.
        attempts: u32,
        /// Time spent in the call.
        elapsed: Duration,
        /// The last error observed.
        #[source]
        last: Box<Error>,
    },

    /// The command deadline passed before a reply was obtained.
    #[error("deadline exceeded after {attempts} attempts in {elapsed:?}")]
    Timeout {
        /// Number of dispatches started.
        attempts: u32,
        /// Time spent in the call.
        elapsed: Duration,
        /// The last error observed before the deadline, if any.
        last: Option<Box<Error>>,
    },
}

impl Error {
    /// Returns true for MOVED, ASK, TRYAGAIN and CLUSTERDOWN.
    pub fn is_redirect(&self) -> bool {
        matches!(
            self,
            Error::Moved { .. } | Error::Ask { .. } | Error::TryAgain { .. } | Error::ClusterDown { .. }
        )
    }

    /// Returns true for connection-level failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io { .. } | Error::Connect { .. } | Error::Protocol { .. }
        )
    }

    /// Returns the routing error that ended a retried call, if this is one.
    pub fn last_error(&self) -> Option<&Error> {
        match self {
            Error::RetriesExhausted { last, .. } => Some(last),
            Error::Timeout { last, .. } => last.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn connection_closed() -> Self {
        Error::Io {
            source: io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"),
        }
    }
}
