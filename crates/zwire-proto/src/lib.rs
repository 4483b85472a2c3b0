//! Wire layer for the zwire Z-Wave host driver.
//!
//! This crate contains everything that touches raw bytes and nothing that
//! touches I/O or time:
//!
//! - [`framer`]: byte stream ↔ frame boundary (SOF/ACK/NAK/CAN, length, XOR
//!   checksum)
//! - [`message`]: frame ↔ typed [`Message`] (function type, message type,
//!   callback id, payload)
//! - [`command`]: payload ↔ typed [`Command`] PDU with encapsulation flags
//! - [`funcs`]: Serial API function types
//! - [`errors`]: structured protocol error types
//!
//! Higher layers (`zwire-core`) consume these types; the Tokio shell
//! (`zwire-driver`) owns the actual serial port.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod command;
pub mod errors;
pub mod framer;
pub mod funcs;
pub mod message;

pub use command::{Command, EncapsulationFlags, NodeId, cc};
pub use errors::{ProtocolError, Result};
pub use framer::{ControlByte, DataFrame, Framer, SerialItem};
pub use funcs::{FunctionType, MessageType};
pub use message::{Message, TransmitStatus};
