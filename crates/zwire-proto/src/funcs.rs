//! Serial API function types.
//!
//! The function byte identifies the operation a host↔controller frame
//! performs. Values are fixed by the Serial API; unknown values decode to
//! `None` and are dropped by the dispatcher rather than guessed at.

/// Direction/kind discriminator carried in the frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Host→controller command, or controller→host unsolicited/callback
    Request = 0x00,
    /// Controller→host answer to the immediately preceding Request
    Response = 0x01,
}

impl MessageType {
    /// Parse the frame type byte. Unknown values return `None`.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(MessageType::Request),
            0x01 => Some(MessageType::Response),
            _ => None,
        }
    }
}

/// Serial API function codes understood by the driver core.
///
/// The set is deliberately the core's working vocabulary, not the full
/// Serial API surface: command-class semantics live behind opaque payloads
/// and everything interview-specific is routed through registered request
/// handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionType {
    /// Unsolicited inbound command class PDU from a node
    ApplicationCommand = 0x04,
    /// Controller capability bitmask
    GetControllerCapabilities = 0x05,
    /// Serial API capability report
    GetSerialApiCapabilities = 0x07,
    /// Reboot the controller firmware without losing network state
    SoftReset = 0x08,
    /// Controller announces its Serial API is up after a reset
    SerialApiStarted = 0x0A,
    /// Transmit a command class PDU to one node (async, with callback)
    SendData = 0x13,
    /// Transmit a command class PDU to a multicast group
    SendDataMulticast = 0x14,
    /// Controller library version string
    GetControllerVersion = 0x15,
    /// Abort the SendData currently in flight
    SendDataAbort = 0x16,
    /// Home id and own node id
    MemoryGetId = 0x20,
    /// Protocol info (listening, device class) for one node
    GetNodeProtocolInfo = 0x41,
    /// Node information frame / update notifications
    ApplicationUpdate = 0x49,
    /// Request a node information frame from a node
    RequestNodeInfo = 0x60,
    /// Remove a node the protocol has marked failed
    RemoveFailedNode = 0x61,
    /// Ask whether the protocol considers a node failed
    IsFailedNode = 0x62,
    /// Unsolicited inbound PDU delivered through the bridge API
    BridgeApplicationCommand = 0xA8,
}

impl FunctionType {
    /// Parse a function byte. Unknown values return `None`.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        use FunctionType::*;
        Some(match value {
            0x04 => ApplicationCommand,
            0x05 => GetControllerCapabilities,
            0x07 => GetSerialApiCapabilities,
            0x08 => SoftReset,
            0x0A => SerialApiStarted,
            0x13 => SendData,
            0x14 => SendDataMulticast,
            0x15 => GetControllerVersion,
            0x16 => SendDataAbort,
            0x20 => MemoryGetId,
            0x41 => GetNodeProtocolInfo,
            0x49 => ApplicationUpdate,
            0x60 => RequestNodeInfo,
            0x61 => RemoveFailedNode,
            0x62 => IsFailedNode,
            0xA8 => BridgeApplicationCommand,
            _ => return None,
        })
    }

    /// Raw function byte
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Does a Request with this function expect a Response frame?
    ///
    /// SoftReset and SerialApiStarted are fire-and-forget at the serial
    /// level; everything else the core sends is answered.
    #[must_use]
    pub fn expects_response(self) -> bool {
        !matches!(self, FunctionType::SoftReset | FunctionType::SerialApiStarted)
    }

    /// Does a Request with this function expect an asynchronous callback
    /// Request after the Response?
    #[must_use]
    pub fn expects_callback(self) -> bool {
        matches!(
            self,
            FunctionType::SendData
                | FunctionType::SendDataMulticast
                | FunctionType::RemoveFailedNode
        )
    }

    /// True for the SendData family, whose callbacks are correlated by
    /// callback id and whose retries refresh that id.
    #[must_use]
    pub fn is_send_data(self) -> bool {
        matches!(self, FunctionType::SendData | FunctionType::SendDataMulticast)
    }
}
