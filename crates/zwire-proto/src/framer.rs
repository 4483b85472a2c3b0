//! Byte ↔ frame boundary for the Serial API line discipline.
//!
//! The wire carries two kinds of items:
//!
//! - single control bytes: `ACK` (0x06), `NAK` (0x15), `CAN` (0x18)
//! - data frames: `SOF` (0x01), length, type, function, payload, checksum
//!
//! The length byte counts everything after itself including the checksum.
//! The checksum is XOR over the length byte and all data bytes, seeded
//! with 0xFF.
//!
//! [`Framer`] is an incremental accumulator: feed it whatever the port
//! read, get back the items that completed. It never performs I/O and
//! never blocks; a corrupt frame is reported as an item so the caller can
//! answer NAK and keep going. The inter-byte timeout lives in the driver,
//! which calls [`Framer::reset`] when it fires.

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};

/// Start-of-frame marker
pub const SOF: u8 = 0x01;

/// Smallest legal length byte: type + function + checksum
pub const MIN_FRAME_LENGTH: u8 = 3;

/// Single-byte line control items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlByte {
    /// Positive acknowledgement of the last data frame
    Ack = 0x06,
    /// Negative acknowledgement; sender should retransmit
    Nak = 0x15,
    /// Cancel: collision or controller buffer overflow
    Can = 0x18,
}

impl ControlByte {
    /// Parse a control byte. Anything else returns `None`.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x06 => Some(ControlByte::Ack),
            0x15 => Some(ControlByte::Nak),
            0x18 => Some(ControlByte::Can),
            _ => None,
        }
    }
}

/// A complete, checksum-verified data frame.
///
/// `data` is the region the length byte covers minus the checksum:
/// `[type, function, payload...]`. SOF, length and checksum are consumed
/// during framing and re-synthesized on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Frame contents: type byte, function byte, payload
    pub data: Bytes,
}

impl DataFrame {
    /// Build a frame from type/function/payload parts.
    #[must_use]
    pub fn new(msg_type: u8, function: u8, payload: &[u8]) -> Self {
        let mut data = BytesMut::with_capacity(2 + payload.len());
        data.put_u8(msg_type);
        data.put_u8(function);
        data.put_slice(payload);
        Self { data: data.freeze() }
    }

    /// Serialize to wire bytes: SOF, length, data, checksum.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidLength`] if the frame would not fit
    /// a one-byte length field.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let length = self
            .data
            .len()
            .checked_add(1)
            .filter(|len| *len <= u8::MAX as usize)
            .ok_or(ProtocolError::InvalidLength(u8::MAX))? as u8;

        dst.put_u8(SOF);
        dst.put_u8(length);
        dst.put_slice(&self.data);
        dst.put_u8(checksum(length, &self.data));
        Ok(())
    }

    /// Serialize to a fresh byte vector.
    ///
    /// # Errors
    ///
    /// Same as [`DataFrame::encode`].
    pub fn encode_to_vec(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.data.len() + 3);
        self.encode(&mut out)?;
        Ok(out)
    }
}

/// XOR checksum over the length byte and frame data, seeded with 0xFF.
#[must_use]
pub fn checksum(length: u8, data: &[u8]) -> u8 {
    data.iter().fold(0xFF ^ length, |acc, byte| acc ^ byte)
}

/// One item produced by the framer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialItem {
    /// A line control byte arrived
    Control(ControlByte),
    /// A complete, checksum-verified data frame arrived
    Frame(DataFrame),
    /// A structurally broken frame arrived; answer NAK and resynchronize
    Corrupt(ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FramerState {
    /// Between frames; expecting SOF or a control byte
    Idle,
    /// SOF seen; expecting the length byte
    AwaitingLength,
    /// Collecting `length` bytes of data + checksum
    Collecting { length: u8, buf: BytesMut },
}

/// Incremental frame accumulator.
///
/// Bytes not recognizable as SOF or a control byte while idle are garbage
/// from a half-seen frame or line noise; they are counted and skipped so
/// the framer resynchronizes on the next SOF.
#[derive(Debug)]
pub struct Framer {
    state: FramerState,
    skipped: u64,
}

impl Framer {
    /// Create an idle framer.
    #[must_use]
    pub fn new() -> Self {
        Self { state: FramerState::Idle, skipped: 0 }
    }

    /// Total garbage bytes skipped while idle, for diagnostics.
    #[must_use]
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    /// True when a frame is partially accumulated.
    ///
    /// The driver consults this to decide whether the inter-byte timeout
    /// is armed.
    #[must_use]
    pub fn mid_frame(&self) -> bool {
        self.state != FramerState::Idle
    }

    /// Abandon a partial frame (inter-byte timeout or port reopen).
    pub fn reset(&mut self) {
        self.state = FramerState::Idle;
    }

    /// Feed received bytes; returns every item that completed.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SerialItem> {
        let mut items = Vec::new();
        for &byte in bytes {
            if let Some(item) = self.push(byte) {
                items.push(item);
            }
        }
        items
    }

    fn push(&mut self, byte: u8) -> Option<SerialItem> {
        match &mut self.state {
            FramerState::Idle => {
                if byte == SOF {
                    self.state = FramerState::AwaitingLength;
                    None
                } else if let Some(control) = ControlByte::from_u8(byte) {
                    Some(SerialItem::Control(control))
                } else {
                    self.skipped += 1;
                    None
                }
            },
            FramerState::AwaitingLength => {
                if byte < MIN_FRAME_LENGTH {
                    self.state = FramerState::Idle;
                    return Some(SerialItem::Corrupt(ProtocolError::InvalidLength(byte)));
                }
                self.state = FramerState::Collecting {
                    length: byte,
                    buf: BytesMut::with_capacity(byte as usize),
                };
                None
            },
            FramerState::Collecting { length, buf } => {
                buf.put_u8(byte);
                if buf.len() < *length as usize {
                    return None;
                }

                let length = *length;
                let mut frame = std::mem::take(buf);
                self.state = FramerState::Idle;

                let expected = frame.split_off(frame.len() - 1)[0];
                let computed = checksum(length, &frame);
                if expected != computed {
                    return Some(SerialItem::Corrupt(ProtocolError::ChecksumMismatch {
                        expected,
                        computed,
                    }));
                }

                Some(SerialItem::Frame(DataFrame { data: frame.freeze() }))
            },
        }
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}
