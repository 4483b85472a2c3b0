//! Typed host↔controller messages.
//!
//! A [`Message`] is one Serial API frame with its function-specific fields
//! lifted out: message type, function, callback id, addressed node. The
//! payload stays opaque except for the handful of shapes the driver core
//! must see through (SendData, ApplicationCommand, MemoryGetId...).
//!
//! Callback id placement differs by direction and the codec knows both:
//! host→controller requests append it as the last payload byte, while
//! controller→host callback requests lead with it. [`Message::to_frame`]
//! implements the outbound convention, [`Message::from_frame`] the inbound
//! one; the two are deliberately not inverses.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    command::NodeId,
    errors::{ProtocolError, Result},
    framer::DataFrame,
    funcs::{FunctionType, MessageType},
};

/// Radio-layer result carried by a SendData callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransmitStatus {
    /// Node acknowledged the frame
    Ok = 0x00,
    /// No acknowledgement from the node
    NoAck = 0x01,
    /// Transmission failed in the controller
    Fail = 0x02,
    /// Controller busy, try again
    NotIdle = 0x03,
    /// No route to the node
    NoRoute = 0x04,
}

impl TransmitStatus {
    /// Parse a transmit status byte. Unknown values return `None`.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(TransmitStatus::Ok),
            0x01 => Some(TransmitStatus::NoAck),
            0x02 => Some(TransmitStatus::Fail),
            0x03 => Some(TransmitStatus::NotIdle),
            0x04 => Some(TransmitStatus::NoRoute),
            _ => None,
        }
    }
}

/// Transmit option bits for the SendData family.
pub mod tx_options {
    /// Request node acknowledgement
    pub const ACK: u8 = 0x01;
    /// Allow low transmit power
    pub const LOW_POWER: u8 = 0x02;
    /// Allow routed delivery
    pub const AUTO_ROUTE: u8 = 0x04;
    /// Allow explorer frames as last resort
    pub const EXPLORE: u8 = 0x20;
    /// Default: acknowledged, routed, explorer fallback
    pub const DEFAULT: u8 = ACK | AUTO_ROUTE | EXPLORE;
}

/// One typed Serial API message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Request or Response
    pub message_type: MessageType,
    /// Serial API function
    pub function: FunctionType,
    /// Correlation token for asynchronous callbacks. `None` both when the
    /// function never produces a callback and when "no callback" (0) was
    /// explicitly requested.
    pub callback_id: Option<u8>,
    /// Node the message addresses or originates from, when the function
    /// carries one
    pub node_id: Option<NodeId>,
    /// Function-specific bytes, excluding the callback id
    pub payload: Bytes,
}

impl Message {
    /// A host→controller request with an opaque payload.
    #[must_use]
    pub fn request(function: FunctionType, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type: MessageType::Request,
            function,
            callback_id: None,
            node_id: None,
            payload: payload.into(),
        }
    }

    /// GetControllerVersion request.
    #[must_use]
    pub fn get_controller_version() -> Self {
        Self::request(FunctionType::GetControllerVersion, Bytes::new())
    }

    /// MemoryGetId request (home id + own node id).
    #[must_use]
    pub fn memory_get_id() -> Self {
        Self::request(FunctionType::MemoryGetId, Bytes::new())
    }

    /// SoftReset request. No response, no callback.
    #[must_use]
    pub fn soft_reset() -> Self {
        Self::request(FunctionType::SoftReset, Bytes::new())
    }

    /// Abort the SendData currently in flight.
    #[must_use]
    pub fn send_data_abort() -> Self {
        Self::request(FunctionType::SendDataAbort, Bytes::new())
    }

    /// SendData request carrying an encoded command class PDU.
    ///
    /// Payload layout: node id, PDU length, PDU, transmit options. The
    /// callback id is appended by [`Message::to_frame`].
    #[must_use]
    pub fn send_data(node_id: NodeId, pdu: &[u8], options: u8, callback_id: u8) -> Self {
        let mut payload = BytesMut::with_capacity(pdu.len() + 3);
        payload.put_u8(node_id.0);
        payload.put_u8(pdu.len() as u8);
        payload.put_slice(pdu);
        payload.put_u8(options);

        Self {
            message_type: MessageType::Request,
            function: FunctionType::SendData,
            callback_id: (callback_id != 0).then_some(callback_id),
            node_id: Some(node_id),
            payload: payload.freeze(),
        }
    }

    /// Refresh the callback id on a SendData-family request (used when a
    /// retry must not collide with a possibly-late previous callback).
    pub fn set_callback_id(&mut self, callback_id: u8) {
        debug_assert!(self.function.expects_callback());
        self.callback_id = (callback_id != 0).then_some(callback_id);
    }

    /// Serialize into a data frame using the outbound (host→controller)
    /// convention: the callback id, when the function expects one, is the
    /// final payload byte (0 when suppressed).
    #[must_use]
    pub fn to_frame(&self) -> DataFrame {
        let mut body = BytesMut::with_capacity(self.payload.len() + 1);
        body.put_slice(&self.payload);
        if self.function.expects_callback() {
            body.put_u8(self.callback_id.unwrap_or(0));
        }
        DataFrame::new(self.message_type as u8, self.function.to_u8(), &body)
    }

    /// Parse a frame using the inbound (controller→host) convention:
    /// callback-bearing Request functions lead with the callback id.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown type/function bytes or a missing
    /// callback id; per the dispatch policy these are ACKed and dropped.
    pub fn from_frame(frame: &DataFrame) -> Result<Self> {
        let data = &frame.data;
        if data.len() < 2 {
            return Err(ProtocolError::FrameTruncated { expected: 2, actual: data.len() });
        }

        let message_type = MessageType::from_u8(data[0])
            .ok_or(ProtocolError::UnknownMessageType(data[0]))?;
        let function =
            FunctionType::from_u8(data[1]).ok_or(ProtocolError::UnknownFunction(data[1]))?;

        let body = data.slice(2..);
        let is_callback = message_type == MessageType::Request && function.expects_callback();

        let (callback_id, payload) = if is_callback {
            let (first, rest) = body
                .split_first()
                .ok_or(ProtocolError::InvalidPayload {
                    function: "callback request",
                    reason: "missing callback id byte",
                })?;
            ((*first != 0).then_some(*first), Bytes::copy_from_slice(rest))
        } else {
            (None, body)
        };

        let node_id = match function {
            FunctionType::ApplicationCommand => payload.get(1).copied().map(NodeId),
            FunctionType::BridgeApplicationCommand => payload.get(2).copied().map(NodeId),
            _ => None,
        };

        Ok(Self { message_type, function, callback_id, node_id, payload })
    }

    /// True when this is the Response frame answering `function`.
    #[must_use]
    pub fn is_response_to(&self, function: FunctionType) -> bool {
        self.message_type == MessageType::Response && self.function == function
    }

    /// True when this is an asynchronous callback Request for `function`.
    #[must_use]
    pub fn is_callback_for(&self, function: FunctionType) -> bool {
        self.message_type == MessageType::Request
            && self.function == function
            && function.expects_callback()
    }

    /// A Response's leading status byte, where nonzero means the
    /// controller accepted the command.
    #[must_use]
    pub fn response_ok(&self) -> bool {
        self.message_type == MessageType::Response
            && self.payload.first().is_some_and(|status| *status != 0)
    }

    /// Transmit status from a SendData-family callback payload.
    #[must_use]
    pub fn transmit_status(&self) -> Option<TransmitStatus> {
        if !self.is_callback_for(FunctionType::SendData)
            && !self.is_callback_for(FunctionType::SendDataMulticast)
        {
            return None;
        }
        self.payload.first().copied().and_then(TransmitStatus::from_u8)
    }

    /// Extract `(source node, PDU bytes)` from an ApplicationCommand or
    /// BridgeApplicationCommand request.
    ///
    /// ApplicationCommand payload: rx status, source node, PDU length,
    /// PDU. The bridge variant inserts the destination node before the
    /// source.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPayload`] when the layout is too
    /// short or the PDU length overruns the payload.
    pub fn application_command(&self) -> Result<(NodeId, Bytes)> {
        let skip = match self.function {
            FunctionType::ApplicationCommand => 1,
            FunctionType::BridgeApplicationCommand => 2,
            _ => {
                return Err(ProtocolError::InvalidPayload {
                    function: "application command",
                    reason: "not an application command frame",
                });
            },
        };

        let header = skip + 2;
        if self.payload.len() < header {
            return Err(ProtocolError::InvalidPayload {
                function: "application command",
                reason: "payload shorter than fixed header",
            });
        }

        let source = NodeId(self.payload[skip]);
        let pdu_len = self.payload[skip + 1] as usize;
        if self.payload.len() < header + pdu_len {
            return Err(ProtocolError::InvalidPayload {
                function: "application command",
                reason: "PDU length overruns payload",
            });
        }

        Ok((source, self.payload.slice(header..header + pdu_len)))
    }

    /// Home id from a MemoryGetId response.
    #[must_use]
    pub fn home_id(&self) -> Option<u32> {
        if !self.is_response_to(FunctionType::MemoryGetId) || self.payload.len() < 5 {
            return None;
        }
        Some(u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]))
    }
}

/// Helpers for synthesizing controller→host frames. Production code never
/// builds these; the mock controller and tests do.
pub mod inbound {
    use super::*;

    /// A Response frame for `function` with the given payload.
    #[must_use]
    pub fn response(function: FunctionType, payload: &[u8]) -> DataFrame {
        DataFrame::new(MessageType::Response as u8, function.to_u8(), payload)
    }

    /// A SendData callback Request with the given correlation id and
    /// transmit status.
    #[must_use]
    pub fn send_data_callback(callback_id: u8, status: TransmitStatus) -> DataFrame {
        DataFrame::new(
            MessageType::Request as u8,
            FunctionType::SendData.to_u8(),
            &[callback_id, status as u8],
        )
    }

    /// An ApplicationCommand Request delivering `pdu` from `source`.
    #[must_use]
    pub fn application_command(source: NodeId, pdu: &[u8]) -> DataFrame {
        let mut payload = Vec::with_capacity(pdu.len() + 3);
        payload.push(0x00); // rx status
        payload.push(source.0);
        payload.push(pdu.len() as u8);
        payload.extend_from_slice(pdu);
        DataFrame::new(
            MessageType::Request as u8,
            FunctionType::ApplicationCommand.to_u8(),
            &payload,
        )
    }
}
