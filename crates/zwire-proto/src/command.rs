//! Command class PDUs and encapsulation bookkeeping.
//!
//! A [`Command`] is the application-layer unit the radio carries: a command
//! class id, a command id within that class, and an opaque payload. The
//! core treats per-class semantics as plugins; this module only knows the
//! two-byte header and the encapsulation flags that record which wrappers
//! were applied (outbound) or stripped (inbound).

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// A Z-Wave node id. Classic networks use 1..=232; 0 is never a node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u8);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node {}", self.0)
    }
}

/// Command class ids the core itself understands.
///
/// Everything else is opaque payload handed to registered plugins.
pub mod cc {
    /// No Operation: the ping primitive
    pub const NO_OP: u8 = 0x00;
    /// Transport Service (radio-level fragmentation)
    pub const TRANSPORT_SERVICE: u8 = 0x55;
    /// CRC-16 Encapsulation
    pub const CRC16: u8 = 0x56;
    /// Device Reset Locally (node announces factory reset)
    pub const DEVICE_RESET_LOCALLY: u8 = 0x5A;
    /// Multi Channel (endpoint addressing)
    pub const MULTI_CHANNEL: u8 = 0x60;
    /// Supervision (application-layer ack)
    pub const SUPERVISION: u8 = 0x6C;
    /// Wake Up (battery device protocol)
    pub const WAKE_UP: u8 = 0x84;
    /// Multi Command (multiple inner commands; rejected by the core)
    pub const MULTI_COMMAND: u8 = 0x8F;
    /// Security (S0)
    pub const SECURITY: u8 = 0x98;
    /// Security 2 (S2)
    pub const SECURITY_2: u8 = 0x9F;
}

bitflags! {
    /// Wrappers applied to (or stripped from) a command.
    ///
    /// On receive, every unwrap ORs its flag in so a reply can mirror the
    /// sender's encapsulation. On send, the pipeline reads the same flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct EncapsulationFlags: u8 {
        /// Supervision Get wrapped the command
        const SUPERVISION = 0b0000_0001;
        /// An S0 or S2 envelope secured the command
        const SECURITY = 0b0000_0010;
        /// CRC-16 encapsulation protected the command
        const CRC16 = 0b0000_0100;
        /// Multi Channel addressed an endpoint
        const MULTI_CHANNEL = 0b0000_1000;
    }
}

impl Default for EncapsulationFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// A command class PDU.
///
/// `payload` is everything after the two-byte `[cc, command]` header. An
/// encapsulating command (Supervision Get, Multi Channel encap, S0/S2
/// message encap...) additionally owns its decoded inner command so the
/// pipeline can peel layers without re-parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command class id
    pub cc: u8,
    /// Command id within the class
    pub command: u8,
    /// Destination (outbound) or source (inbound) node
    pub node_id: NodeId,
    /// Endpoint index; 0 is the root device
    pub endpoint: u8,
    /// Bytes after the two-byte header
    pub payload: Bytes,
    /// Wrappers applied/stripped so far
    pub flags: EncapsulationFlags,
    /// Decoded inner command, present on encapsulating commands
    pub inner: Option<Box<Command>>,
}

impl Command {
    /// A leaf command with no wrapper history.
    #[must_use]
    pub fn new(cc: u8, command: u8, node_id: NodeId, payload: impl Into<Bytes>) -> Self {
        Self {
            cc,
            command,
            node_id,
            endpoint: 0,
            payload: payload.into(),
            flags: EncapsulationFlags::empty(),
            inner: None,
        }
    }

    /// The ping primitive: No Operation aimed at `node_id`.
    #[must_use]
    pub fn no_op(node_id: NodeId) -> Self {
        // NoOp is the one command class with no command byte on the wire;
        // we normalize it to command 0.
        Self::new(cc::NO_OP, 0x00, node_id, Bytes::new())
    }

    /// Builder-style endpoint assignment.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: u8) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// True if this command wraps another.
    #[must_use]
    pub fn is_encapsulating(&self) -> bool {
        self.inner.is_some()
    }

    /// The innermost command of an encapsulation chain (self for leaves).
    #[must_use]
    pub fn leaf(&self) -> &Command {
        match &self.inner {
            Some(inner) => inner.leaf(),
            None => self,
        }
    }

    /// Serialized length of the `[cc, command, payload...]` image.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        if self.cc == cc::NO_OP { 1 } else { 2 + self.payload.len() }
    }

    /// Serialize the PDU.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.cc);
        if self.cc == cc::NO_OP {
            return;
        }
        dst.put_u8(self.command);
        dst.put_slice(&self.payload);
    }

    /// Serialize to a fresh byte vector.
    #[must_use]
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out
    }

    /// Parse a PDU received from `node_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::CommandTruncated`] when the two-byte header
    /// is missing (a bare NoOp is the single one-byte exception).
    pub fn decode(node_id: NodeId, bytes: &[u8]) -> Result<Self> {
        match bytes {
            [] => Err(ProtocolError::CommandTruncated { expected: 1, actual: 0 }),
            [cc::NO_OP] => Ok(Self::no_op(node_id)),
            [_] => Err(ProtocolError::CommandTruncated { expected: 2, actual: 1 }),
            [cc_id, command, payload @ ..] => Ok(Self::new(
                *cc_id,
                *command,
                node_id,
                Bytes::copy_from_slice(payload),
            )),
        }
    }
}
