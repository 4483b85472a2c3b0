//! Multi Channel encapsulation: endpoint addressing.
//!
//! Commands for `endpoint_index > 0` are wrapped with a source/destination
//! endpoint pair. Bit 7 of the destination byte flags bitmask addressing,
//! which the core does not generate and refuses to interpret.

use bytes::{BufMut, BytesMut};
use zwire_proto::{cc, Command, ProtocolError};

/// Multi Channel Command Encapsulation
pub const CMD_ENCAP: u8 = 0x0D;

const BITMASK_FLAG: u8 = 0b1000_0000;

/// Wrap `inner` so it addresses `inner.endpoint` on the target node.
#[must_use]
pub fn wrap(inner: &Command) -> Command {
    let inner_pdu = inner.encode_to_vec();

    let mut payload = BytesMut::with_capacity(inner_pdu.len() + 2);
    payload.put_u8(0); // source: the root device (us)
    payload.put_u8(inner.endpoint & !BITMASK_FLAG);
    payload.put_slice(&inner_pdu);

    let mut wrapped = Command::new(cc::MULTI_CHANNEL, CMD_ENCAP, inner.node_id, payload.freeze());
    wrapped.flags = inner.flags;
    wrapped.inner = Some(Box::new(inner.clone()));
    wrapped
}

/// Unwrap a Multi Channel encapsulation. The inner command carries the
/// *source* endpoint, i.e. which endpoint of the sending node produced it.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidPayload`] on truncation or bitmask
/// addressing, which only makes sense node→node.
pub fn unwrap(outer: &Command) -> Result<Command, ProtocolError> {
    if outer.payload.len() < 3 {
        return Err(ProtocolError::InvalidPayload {
            function: "Multi Channel encapsulation",
            reason: "envelope shorter than endpoint header",
        });
    }
    if outer.payload[1] & BITMASK_FLAG != 0 {
        return Err(ProtocolError::InvalidPayload {
            function: "Multi Channel encapsulation",
            reason: "bitmask destinations are not addressed to the host",
        });
    }

    // Whichever side is not the root device names the endpoint: inbound
    // frames carry it in the source slot, mirrored replies in the
    // destination slot.
    let source = outer.payload[0] & !BITMASK_FLAG;
    let destination = outer.payload[1] & !BITMASK_FLAG;
    let endpoint = if source != 0 { source } else { destination };

    let mut inner = Command::decode(outer.node_id, &outer.payload[2..])?;
    inner.endpoint = endpoint;
    Ok(inner)
}

#[cfg(test)]
mod tests {
    use zwire_proto::NodeId;

    use super::*;

    #[test]
    fn endpoint_round_trip() {
        let inner = Command::new(0x25, 0x01, NodeId(4), vec![0xFF]).with_endpoint(3);
        let wrapped = wrap(&inner);
        assert_eq!(wrapped.payload[0], 0);
        assert_eq!(wrapped.payload[1], 3);

        // A node replying from endpoint 3 puts 3 in the source slot.
        let reply = Command::new(
            cc::MULTI_CHANNEL,
            CMD_ENCAP,
            NodeId(4),
            vec![3, 0, 0x25, 0x03, 0xFF],
        );
        let unwrapped = unwrap(&reply).unwrap();
        assert_eq!(unwrapped.endpoint, 3);
        assert_eq!(unwrapped.cc, 0x25);
    }

    #[test]
    fn bitmask_destination_rejected() {
        let outer = Command::new(
            cc::MULTI_CHANNEL,
            CMD_ENCAP,
            NodeId(4),
            vec![0, BITMASK_FLAG | 0x03, 0x25, 0x03],
        );
        assert!(unwrap(&outer).is_err());
    }

    #[test]
    fn truncated_envelope_rejected() {
        let outer = Command::new(cc::MULTI_CHANNEL, CMD_ENCAP, NodeId(4), vec![0, 1]);
        assert!(unwrap(&outer).is_err());
    }
}
