//! Error types for the zwire wire layer.
//!
//! All errors are structured, testable, and carry enough context to log a
//! useful diagnostic without re-parsing the offending bytes.

use thiserror::Error;

/// Protocol-level errors that can occur while framing and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    // Frame-level errors. The dispatcher answers these with NAK on the wire.
    /// Frame is shorter than its length byte claims
    #[error("frame truncated: length byte claims {expected} bytes, got {actual}")]
    FrameTruncated {
        /// Byte count the length byte claims
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Length byte outside the legal range for a Serial API frame
    #[error("invalid frame length: {0}")]
    InvalidLength(u8),

    /// XOR checksum mismatch
    #[error("checksum mismatch: expected {expected:#04x}, computed {computed:#04x}")]
    ChecksumMismatch {
        /// Checksum byte carried by the frame
        expected: u8,
        /// Checksum computed over the received bytes
        computed: u8,
    },

    // Message-level errors. The dispatcher ACKs the frame, then drops it.
    /// Frame type byte is neither Request (0x00) nor Response (0x01)
    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Function byte has no known Serial API function
    #[error("unknown function type: {0:#04x}")]
    UnknownFunction(u8),

    /// Payload too short or malformed for the declared function
    #[error("invalid payload for {function}: {reason}")]
    InvalidPayload {
        /// Function the payload belongs to
        function: &'static str,
        /// What was wrong
        reason: &'static str,
    },

    // Command-level errors.
    /// Command class PDU shorter than the two-byte header
    #[error("command truncated: need at least {expected} bytes, got {actual}")]
    CommandTruncated {
        /// Minimum byte count
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Deserialization for this command class is not implemented
    #[error("no decoder registered for command class {cc:#04x} command {command:#04x}")]
    DeserializationNotImplemented {
        /// Command class id
        cc: u8,
        /// Command id within the class
        command: u8,
    },
}

impl ProtocolError {
    /// True if the right wire-level reply to this error is a NAK.
    ///
    /// Frame-level corruption gets a NAK so the controller retransmits.
    /// Everything above the frame layer is ACKed and dropped, since the
    /// frame itself arrived intact.
    #[must_use]
    pub fn wants_nak(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTruncated { .. }
                | ProtocolError::InvalidLength(_)
                | ProtocolError::ChecksumMismatch { .. }
        )
    }
}

/// Convenient Result alias for wire-layer operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
