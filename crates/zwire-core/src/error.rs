//! Error types for the driver core.
//!
//! Errors are layered the way the machines are: the scheduler surfaces
//! transaction failures, the security managers surface envelope failures,
//! storage surfaces persistence failures, and [`DriverError`] is the
//! driver-level sum the host facade exposes. Codec errors
//! ([`zwire_proto::ProtocolError`]) never bubble past the dispatcher; they
//! become wire-level ACK/NAK and a drop.

use thiserror::Error;
use zwire_proto::{Message, NodeId};

/// Transaction failures surfaced on a transaction's result channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The controller never ACKed the frame, even after retries
    #[error("no ACK from controller after {attempts} attempts")]
    AckTimeout {
        /// Write attempts performed
        attempts: u8,
    },

    /// The controller ACKed but never answered with a Response
    #[error("timeout waiting for controller response")]
    ResponseTimeout,

    /// The controller answered but the asynchronous callback never came
    #[error("timeout waiting for controller callback")]
    CallbackTimeout,

    /// The controller rejected the command in its Response
    #[error("controller rejected the command")]
    ResponseNok {
        /// The rejecting Response, for diagnostics
        response: Box<Message>,
    },

    /// The callback reported a controller-side transmit failure
    #[error("controller reported transmit failure {status:#04x}")]
    CallbackNok {
        /// Raw transmit status byte
        status: u8,
    },

    /// The node did not acknowledge the radio frame
    #[error("{node_id} did not respond")]
    NodeTimeout {
        /// Node that stayed silent
        node_id: NodeId,
    },

    /// A reducer dropped the transaction before completion
    #[error("message dropped: {reason}")]
    MessageDropped {
        /// Why the transaction was abandoned
        reason: &'static str,
    },

    /// The transaction's expiry deadline passed while it was queued
    #[error("message expired before it could be sent")]
    MessageExpired,

    /// The target node was removed from the network
    #[error("{node_id} was removed from the network")]
    NodeRemoved {
        /// The removed node
        node_id: NodeId,
    },

    /// The node's interview restarted and invalidated this transaction
    #[error("interview for {node_id} was restarted")]
    InterviewRestarted {
        /// Node being re-interviewed
        node_id: NodeId,
    },
}

impl SchedulerError {
    /// True when the facade should consider demoting the node's status
    /// (asleep for battery devices, dead for mains).
    #[must_use]
    pub fn is_node_failure(&self) -> bool {
        matches!(self, SchedulerError::NodeTimeout { .. })
    }
}

/// Security envelope failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// No security manager configured for the scheme the node requires
    #[error("no network key configured for the required security scheme")]
    NoSecurity,

    /// The S2 manager has not been initialized with keys
    #[error("S2 security has not been initialized")]
    NotInitialized,

    /// No synchronized SPAN with this peer; a nonce exchange is required
    #[error("no SPAN established with {node_id}")]
    NoSpan {
        /// Peer we cannot decrypt for
        node_id: NodeId,
    },

    /// Authentication failed within the current SPAN window
    #[error("cannot decode S2 message from {node_id}")]
    CannotDecode {
        /// Peer whose message failed authentication
        node_id: NodeId,
    },

    /// No fresh receiver nonce cached for an S0 encapsulation
    #[error("no fresh S0 nonce for {node_id}")]
    NoNonce {
        /// Peer a nonce handshake is needed for
        node_id: NodeId,
    },

    /// S0 MAC verification failed
    #[error("S0 authentication failed for message from {node_id}")]
    AuthenticationFailed {
        /// Peer whose message failed the MAC check
        node_id: NodeId,
    },

    /// Envelope payload malformed
    #[error("malformed {scheme} envelope: {reason}")]
    MalformedEnvelope {
        /// "S0" or "S2"
        scheme: &'static str,
        /// What was wrong
        reason: &'static str,
    },
}

/// Persistence failures.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem error while touching a cache file
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A cache line failed to serialize or parse
    #[error("cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The on-disk cache uses a format this build cannot read
    #[error("unsupported cache format {found}, expected {expected}")]
    UnsupportedFormat {
        /// Version found in the file
        found: u32,
        /// Version this build writes
        expected: u32,
    },
}

/// Driver-level errors exposed by the host facade.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The driver has not completed `start` yet
    #[error("driver is not ready")]
    NotReady,

    /// The driver was destroyed; no further operations are possible
    #[error("driver was destroyed")]
    Destroyed,

    /// Options failed validation
    #[error("invalid driver options: {0}")]
    InvalidOptions(String),

    /// A feature was disabled by configuration
    #[error("feature disabled by configuration: {0}")]
    FeatureDisabled(&'static str),

    /// The driver failed fatally; the owner must call `destroy`
    #[error("driver failed: {0}")]
    Failed(String),

    /// A transaction failed
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// A security envelope could not be built or opened
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Persistence failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A `wait_for_*` deadline passed without a match
    #[error("timed out waiting for a matching message")]
    WaitTimeout,
}
