//! CRC-16 encapsulation.
//!
//! Older non-secure devices protect application commands against radio
//! corruption with a CRC-16/AUG-CCITT trailer (poly 0x1021, init 0x1D0F)
//! computed over the encapsulation header and the inner PDU.

use zwire_proto::{cc, Command, ProtocolError};

/// Command id for CRC-16 Command Encapsulation.
pub const CMD_ENCAP: u8 = 0x01;

/// CRC-16/AUG-CCITT over `data`.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x1D0F;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

/// Wrap `inner` in a CRC-16 encapsulation command.
#[must_use]
pub fn wrap(inner: &Command) -> Command {
    let inner_pdu = inner.encode_to_vec();

    let mut covered = Vec::with_capacity(inner_pdu.len() + 2);
    covered.push(cc::CRC16);
    covered.push(CMD_ENCAP);
    covered.extend_from_slice(&inner_pdu);
    let checksum = crc16(&covered);

    let mut payload = inner_pdu;
    payload.extend_from_slice(&checksum.to_be_bytes());

    let mut wrapped = Command::new(cc::CRC16, CMD_ENCAP, inner.node_id, payload);
    wrapped.endpoint = inner.endpoint;
    wrapped.flags = inner.flags;
    wrapped.inner = Some(Box::new(inner.clone()));
    wrapped
}

/// Unwrap a CRC-16 encapsulation, verifying the trailer.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidPayload`] on a truncated envelope or
/// checksum mismatch, and propagates inner PDU decode errors.
pub fn unwrap(outer: &Command) -> Result<Command, ProtocolError> {
    if outer.payload.len() < 4 {
        return Err(ProtocolError::InvalidPayload {
            function: "CRC-16 encapsulation",
            reason: "envelope shorter than PDU header plus checksum",
        });
    }

    let split = outer.payload.len() - 2;
    let inner_pdu = &outer.payload[..split];
    let expected = u16::from_be_bytes([outer.payload[split], outer.payload[split + 1]]);

    let mut covered = Vec::with_capacity(inner_pdu.len() + 2);
    covered.push(cc::CRC16);
    covered.push(CMD_ENCAP);
    covered.extend_from_slice(inner_pdu);

    if crc16(&covered) != expected {
        return Err(ProtocolError::InvalidPayload {
            function: "CRC-16 encapsulation",
            reason: "checksum mismatch",
        });
    }

    let mut inner = Command::decode(outer.node_id, inner_pdu)?;
    inner.endpoint = outer.endpoint;
    Ok(inner)
}

#[cfg(test)]
mod tests {
    use zwire_proto::NodeId;

    use super::*;

    #[test]
    fn aug_ccitt_check_value() {
        // Standard check input "123456789" for CRC-16/AUG-CCITT.
        assert_eq!(crc16(b"123456789"), 0xE5CC);
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let inner = Command::new(0x25, 0x01, NodeId(4), vec![0xFF]);
        let wrapped = wrap(&inner);
        assert_eq!(wrapped.cc, cc::CRC16);
        assert_eq!(unwrap(&wrapped).unwrap(), inner);
    }

    #[test]
    fn corrupted_trailer_rejected() {
        let inner = Command::new(0x25, 0x01, NodeId(4), vec![0xFF]);
        let mut wrapped = wrap(&inner);
        let mut payload = wrapped.payload.to_vec();
        let last = payload.len() - 1;
        payload[last] ^= 0x01;
        wrapped.payload = payload.into();

        assert!(unwrap(&wrapped).is_err());
    }

    #[test]
    fn truncated_envelope_rejected() {
        let outer = Command::new(cc::CRC16, CMD_ENCAP, NodeId(4), vec![0x25, 0x01]);
        assert!(unwrap(&outer).is_err());
    }
}
