//! Supervision encapsulation: application-layer acknowledgement.
//!
//! Supervision Get wraps a SET-type command and asks the target to report
//! back with a status and, for slow actuators, progress updates. Session
//! ids occupy six bits; the `more updates follow` / `status updates
//! requested` bit rides on top of them.

use bytes::{BufMut, BytesMut};
use zwire_proto::{cc, Command, ProtocolError};

/// Supervision Get: wraps a command
pub const GET: u8 = 0x01;
/// Supervision Report: status reply
pub const REPORT: u8 = 0x02;

const SESSION_MASK: u8 = 0b0011_1111;
const MORE_FOLLOWS: u8 = 0b1000_0000;

/// Status carried by a Supervision Report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisionStatus {
    /// The command class is not supported under supervision
    NoSupport = 0x00,
    /// The command is being executed; more reports follow
    Working = 0x01,
    /// The command failed
    Fail = 0x02,
    /// The command completed
    Success = 0xFF,
}

impl SupervisionStatus {
    /// Parse a status byte. Unknown values return `None`.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(SupervisionStatus::NoSupport),
            0x01 => Some(SupervisionStatus::Working),
            0x02 => Some(SupervisionStatus::Fail),
            0xFF => Some(SupervisionStatus::Success),
            _ => None,
        }
    }
}

/// Parsed contents of a Supervision Report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisionReport {
    /// Session the report answers
    pub session_id: u8,
    /// Whether further reports for this session follow
    pub more_updates_follow: bool,
    /// Command status
    pub status: SupervisionStatus,
    /// Remaining duration in its raw encoded form
    pub remaining_duration: u8,
}

/// Wrap `inner` in a Supervision Get for `session_id`.
///
/// `request_updates` asks the target for progress reports while a slow
/// command (dimming ramps, door locks) executes.
#[must_use]
pub fn wrap(inner: &Command, session_id: u8, request_updates: bool) -> Command {
    let inner_pdu = inner.encode_to_vec();

    let mut payload = BytesMut::with_capacity(inner_pdu.len() + 2);
    let mut properties = session_id & SESSION_MASK;
    if request_updates {
        properties |= MORE_FOLLOWS;
    }
    payload.put_u8(properties);
    payload.put_u8(inner_pdu.len() as u8);
    payload.put_slice(&inner_pdu);

    let mut wrapped = Command::new(cc::SUPERVISION, GET, inner.node_id, payload.freeze());
    wrapped.endpoint = inner.endpoint;
    wrapped.flags = inner.flags;
    wrapped.inner = Some(Box::new(inner.clone()));
    wrapped
}

/// Unwrap a Supervision Get, returning `(session_id, inner command)`.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidPayload`] on truncation or an inner
/// length that overruns the envelope.
pub fn unwrap(outer: &Command) -> Result<(u8, Command), ProtocolError> {
    if outer.payload.len() < 2 {
        return Err(ProtocolError::InvalidPayload {
            function: "Supervision Get",
            reason: "envelope shorter than fixed header",
        });
    }

    let session_id = outer.payload[0] & SESSION_MASK;
    let inner_len = outer.payload[1] as usize;
    if outer.payload.len() < 2 + inner_len {
        return Err(ProtocolError::InvalidPayload {
            function: "Supervision Get",
            reason: "inner length overruns envelope",
        });
    }

    let mut inner = Command::decode(outer.node_id, &outer.payload[2..2 + inner_len])?;
    inner.endpoint = outer.endpoint;
    Ok((session_id, inner))
}

/// Build the Supervision Report answering `session_id`.
#[must_use]
pub fn report(
    node_id: zwire_proto::NodeId,
    session_id: u8,
    status: SupervisionStatus,
    more_updates_follow: bool,
) -> Command {
    let mut properties = session_id & SESSION_MASK;
    if more_updates_follow {
        properties |= MORE_FOLLOWS;
    }
    Command::new(cc::SUPERVISION, REPORT, node_id, vec![properties, status as u8, 0x00])
}

/// Parse a Supervision Report PDU.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidPayload`] on truncation or an unknown
/// status byte.
pub fn parse_report(command: &Command) -> Result<SupervisionReport, ProtocolError> {
    if command.payload.len() < 3 {
        return Err(ProtocolError::InvalidPayload {
            function: "Supervision Report",
            reason: "payload shorter than fixed layout",
        });
    }
    let status = SupervisionStatus::from_u8(command.payload[1]).ok_or(
        ProtocolError::InvalidPayload {
            function: "Supervision Report",
            reason: "unknown status byte",
        },
    )?;
    Ok(SupervisionReport {
        session_id: command.payload[0] & SESSION_MASK,
        more_updates_follow: command.payload[0] & MORE_FOLLOWS != 0,
        status,
        remaining_duration: command.payload[2],
    })
}

#[cfg(test)]
mod tests {
    use zwire_proto::NodeId;

    use super::*;

    #[test]
    fn get_round_trip() {
        let inner = Command::new(0x25, 0x01, NodeId(4), vec![0xFF]);
        let wrapped = wrap(&inner, 0x2A, false);
        let (session, unwrapped) = unwrap(&wrapped).unwrap();
        assert_eq!(session, 0x2A);
        assert_eq!(unwrapped, inner);
    }

    #[test]
    fn session_id_is_masked_to_six_bits() {
        let inner = Command::new(0x25, 0x01, NodeId(4), vec![]);
        let wrapped = wrap(&inner, 0xFF, true);
        let (session, _) = unwrap(&wrapped).unwrap();
        assert_eq!(session, 0x3F);
    }

    #[test]
    fn report_round_trip() {
        let command = report(NodeId(4), 0x11, SupervisionStatus::Working, true);
        let parsed = parse_report(&command).unwrap();
        assert_eq!(parsed.session_id, 0x11);
        assert!(parsed.more_updates_follow);
        assert_eq!(parsed.status, SupervisionStatus::Working);
    }

    #[test]
    fn malformed_get_rejected() {
        let outer = Command::new(cc::SUPERVISION, GET, NodeId(4), vec![0x01]);
        assert!(unwrap(&outer).is_err());

        // Length byte overruns the envelope.
        let outer = Command::new(cc::SUPERVISION, GET, NodeId(4), vec![0x01, 0x10, 0x25]);
        assert!(unwrap(&outer).is_err());
    }

    #[test]
    fn unknown_report_status_rejected() {
        let command = Command::new(cc::SUPERVISION, REPORT, NodeId(4), vec![0x01, 0x42, 0x00]);
        assert!(parse_report(&command).is_err());
    }
}
