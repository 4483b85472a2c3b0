//! Transport Service: radio-level fragmentation and reassembly.
//!
//! Datagrams larger than the radio MTU are split into a first segment plus
//! subsequent segments addressed by byte offset. The receiver requests
//! missing segments and confirms completion; the sender services those
//! requests from the datagram it keeps until the session closes.
//!
//! # RX State Machine
//!
//! ```text
//!            FirstSegment              gap seen
//! Initial ───────────────> Receiving ───────────> AwaitingGap
//!                              │    <───────────       │
//!                              │     gap filled        │ timer: SegmentRequest
//!                              │ all segments          │
//!                              ↓                       │
//!                          Complete <──────────────────┘
//! ```
//!
//! Timers are emitted as actions: the machine never sleeps, the shell owns
//! one missing-segment timer per `(node, session)`.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use zwire_proto::{cc, Command, NodeId, ProtocolError};

use super::crc16::crc16;

const FIRST_SEGMENT: u8 = 0xC0;
const SEGMENT_REQUEST: u8 = 0xC8;
const SUBSEQUENT_SEGMENT: u8 = 0xE0;
const SEGMENT_COMPLETE: u8 = 0xE8;
const SEGMENT_WAIT: u8 = 0xF0;

const SUBCMD_MASK: u8 = 0xF8;
const SIZE_HIGH_MASK: u8 = 0x07;

/// Largest datagram the 11-bit size field can express.
pub const MAX_DATAGRAM_SIZE: u16 = 0x07FF;

/// Default wait before requesting a missing segment.
pub const MISSING_SEGMENT_TIMEOUT: Duration = Duration::from_millis(800);

/// A decoded Transport Service frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsFrame {
    /// Opens (or reopens) a session and carries the first fragment
    FirstSegment {
        /// Session id (4 bits)
        session_id: u8,
        /// Total datagram size in bytes
        datagram_size: u16,
        /// First fragment; its length fixes the session's fragment size
        payload: Bytes,
    },
    /// Carries a fragment at a byte offset into the datagram
    SubsequentSegment {
        /// Session id
        session_id: u8,
        /// Total datagram size, repeated for robustness
        datagram_size: u16,
        /// Byte offset of this fragment
        offset: u16,
        /// Fragment contents
        payload: Bytes,
    },
    /// Receiver asks for the fragment at `offset` again
    SegmentRequest {
        /// Session id
        session_id: u8,
        /// Byte offset of the missing fragment
        offset: u16,
    },
    /// Receiver confirms the full datagram arrived
    SegmentComplete {
        /// Session id
        session_id: u8,
    },
    /// Receiver is busy; sender should back off
    SegmentWait {
        /// Number of pending sessions ahead of ours
        pending: u8,
    },
}

impl TsFrame {
    /// Encode into a Transport Service command PDU for `node_id`.
    #[must_use]
    pub fn to_command(&self, node_id: NodeId) -> Command {
        let (command, mut payload) = match self {
            TsFrame::FirstSegment { session_id, datagram_size, payload } => {
                let mut body = Vec::with_capacity(payload.len() + 4);
                body.push((datagram_size & 0xFF) as u8);
                body.push(session_id << 4);
                body.extend_from_slice(payload);
                (FIRST_SEGMENT | ((datagram_size >> 8) as u8 & SIZE_HIGH_MASK), body)
            },
            TsFrame::SubsequentSegment { session_id, datagram_size, offset, payload } => {
                let mut body = Vec::with_capacity(payload.len() + 5);
                body.push((datagram_size & 0xFF) as u8);
                body.push((session_id << 4) | ((offset >> 8) as u8 & SIZE_HIGH_MASK));
                body.push((offset & 0xFF) as u8);
                body.extend_from_slice(payload);
                (SUBSEQUENT_SEGMENT | ((datagram_size >> 8) as u8 & SIZE_HIGH_MASK), body)
            },
            TsFrame::SegmentRequest { session_id, offset } => (
                SEGMENT_REQUEST,
                vec![(session_id << 4) | ((offset >> 8) as u8 & SIZE_HIGH_MASK), (offset & 0xFF) as u8],
            ),
            TsFrame::SegmentComplete { session_id } => (SEGMENT_COMPLETE, vec![session_id << 4]),
            TsFrame::SegmentWait { pending } => (SEGMENT_WAIT, vec![*pending]),
        };

        // Segment frames carry a CRC-16 trailer over header and fragment.
        if matches!(self, TsFrame::FirstSegment { .. } | TsFrame::SubsequentSegment { .. }) {
            let mut covered = Vec::with_capacity(payload.len() + 2);
            covered.push(cc::TRANSPORT_SERVICE);
            covered.push(command);
            covered.extend_from_slice(&payload);
            payload.extend_from_slice(&crc16(&covered).to_be_bytes());
        }

        Command::new(cc::TRANSPORT_SERVICE, command, node_id, payload)
    }

    /// Decode a Transport Service command PDU.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPayload`] on truncation, an unknown
    /// subcommand, or a CRC mismatch on a segment frame.
    pub fn from_command(command: &Command) -> Result<Self, ProtocolError> {
        let subcmd = command.command & SUBCMD_MASK;
        let size_high = u16::from(command.command & SIZE_HIGH_MASK);
        let body = &command.payload;

        let truncated = ProtocolError::InvalidPayload {
            function: "Transport Service",
            reason: "frame shorter than its fixed layout",
        };

        match subcmd {
            FIRST_SEGMENT => {
                if body.len() < 4 {
                    return Err(truncated);
                }
                let data = verify_segment_crc(command)?;
                Ok(TsFrame::FirstSegment {
                    session_id: data[1] >> 4,
                    datagram_size: (size_high << 8) | u16::from(data[0]),
                    payload: Bytes::copy_from_slice(&data[2..]),
                })
            },
            SUBSEQUENT_SEGMENT => {
                if body.len() < 5 {
                    return Err(truncated);
                }
                let data = verify_segment_crc(command)?;
                Ok(TsFrame::SubsequentSegment {
                    session_id: data[1] >> 4,
                    datagram_size: (size_high << 8) | u16::from(data[0]),
                    offset: (u16::from(data[1] & SIZE_HIGH_MASK) << 8) | u16::from(data[2]),
                    payload: Bytes::copy_from_slice(&data[3..]),
                })
            },
            SEGMENT_REQUEST => {
                if body.len() < 2 {
                    return Err(truncated);
                }
                Ok(TsFrame::SegmentRequest {
                    session_id: body[0] >> 4,
                    offset: (u16::from(body[0] & SIZE_HIGH_MASK) << 8) | u16::from(body[1]),
                })
            },
            SEGMENT_COMPLETE => {
                if body.is_empty() {
                    return Err(truncated);
                }
                Ok(TsFrame::SegmentComplete { session_id: body[0] >> 4 })
            },
            SEGMENT_WAIT => {
                if body.is_empty() {
                    return Err(truncated);
                }
                Ok(TsFrame::SegmentWait { pending: body[0] })
            },
            _ => Err(ProtocolError::InvalidPayload {
                function: "Transport Service",
                reason: "unknown subcommand",
            }),
        }
    }
}

/// Strip and verify the CRC-16 trailer of a segment frame, returning the
/// covered body.
fn verify_segment_crc(command: &Command) -> Result<&[u8], ProtocolError> {
    let body = &command.payload;
    if body.len() < 2 {
        return Err(ProtocolError::InvalidPayload {
            function: "Transport Service",
            reason: "segment too short for its CRC trailer",
        });
    }
    let split = body.len() - 2;
    let expected = u16::from_be_bytes([body[split], body[split + 1]]);

    let mut covered = Vec::with_capacity(split + 2);
    covered.push(cc::TRANSPORT_SERVICE);
    covered.push(command.command);
    covered.extend_from_slice(&body[..split]);

    if crc16(&covered) != expected {
        return Err(ProtocolError::InvalidPayload {
            function: "Transport Service",
            reason: "segment CRC mismatch",
        });
    }
    Ok(&body[..split])
}

/// RX session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Segments arriving in order
    Receiving,
    /// A gap was observed; the missing-segment timer will request it
    AwaitingGap,
    /// Datagram delivered; a repeated FirstSegment reopens the session
    Complete,
    /// Unrecoverable (size mismatch between segments)
    Failure,
}

/// Actions emitted by the RX machine, keyed so the shell can run one
/// missing-segment timer per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsRxAction {
    /// Send this frame back to the node
    Send {
        /// Destination node
        node_id: NodeId,
        /// Reply frame
        frame: TsFrame,
    },
    /// The full datagram is assembled; dispatch it as a command PDU
    Deliver {
        /// Originating node
        node_id: NodeId,
        /// Session that completed
        session_id: u8,
        /// The reassembled datagram
        datagram: Bytes,
    },
    /// Arm (or re-arm) the session's missing-segment timer
    SetTimer {
        /// Originating node
        node_id: NodeId,
        /// Session the timer belongs to
        session_id: u8,
        /// Fire this long after now
        after: Duration,
    },
    /// Disarm the session's missing-segment timer
    ClearTimer {
        /// Originating node
        node_id: NodeId,
        /// Session the timer belonged to
        session_id: u8,
    },
}

#[derive(Debug)]
struct RxSession {
    state: RxState,
    datagram_size: u16,
    fragment_size: u16,
    buffer: Vec<u8>,
    received: Vec<bool>,
}

impl RxSession {
    fn new(datagram_size: u16, fragment_size: u16) -> Self {
        let segments = datagram_size.div_ceil(fragment_size.max(1)) as usize;
        Self {
            state: RxState::Receiving,
            datagram_size,
            fragment_size,
            buffer: vec![0; datagram_size as usize],
            received: vec![false; segments],
        }
    }

    fn store(&mut self, offset: u16, payload: &[u8]) -> bool {
        let start = offset as usize;
        let end = start + payload.len();
        if end > self.buffer.len() || self.fragment_size == 0 {
            return false;
        }
        self.buffer[start..end].copy_from_slice(payload);
        let index = start / self.fragment_size as usize;
        if let Some(slot) = self.received.get_mut(index) {
            *slot = true;
        }
        true
    }

    fn first_missing_offset(&self) -> Option<u16> {
        self.received
            .iter()
            .position(|received| !received)
            .map(|index| index as u16 * self.fragment_size)
    }

    fn is_complete(&self) -> bool {
        self.received.iter().all(|received| *received)
    }
}

/// Per-node, per-session reassembly manager.
pub struct TransportServiceRx {
    sessions: HashMap<(NodeId, u8), RxSession>,
    missing_segment_timeout: Duration,
}

impl TransportServiceRx {
    /// Create a manager with the given missing-segment timeout.
    #[must_use]
    pub fn new(missing_segment_timeout: Duration) -> Self {
        Self { sessions: HashMap::new(), missing_segment_timeout }
    }

    /// State of a session, for diagnostics and tests.
    #[must_use]
    pub fn session_state(&self, node_id: NodeId, session_id: u8) -> Option<RxState> {
        self.sessions.get(&(node_id, session_id)).map(|session| session.state)
    }

    /// Feed one received Transport Service frame.
    pub fn handle_frame(&mut self, node_id: NodeId, frame: &TsFrame) -> Vec<TsRxAction> {
        let mut actions = Vec::new();
        match frame {
            TsFrame::FirstSegment { session_id, datagram_size, payload } => {
                // A new first segment implicitly closes any prior session
                // with the same id, complete or not.
                let key = (node_id, *session_id);
                if self.sessions.remove(&key).is_some() {
                    tracing::debug!(%node_id, session_id, "reopening transport session");
                    actions.push(TsRxAction::ClearTimer { node_id, session_id: *session_id });
                }

                let mut session = RxSession::new(*datagram_size, payload.len() as u16);
                if !session.store(0, payload) {
                    session.state = RxState::Failure;
                    self.sessions.insert(key, session);
                    return actions;
                }

                if session.is_complete() {
                    session.state = RxState::Complete;
                    actions.push(TsRxAction::Send {
                        node_id,
                        frame: TsFrame::SegmentComplete { session_id: *session_id },
                    });
                    actions.push(TsRxAction::Deliver {
                        node_id,
                        session_id: *session_id,
                        datagram: Bytes::from(session.buffer.clone()),
                    });
                } else {
                    actions.push(TsRxAction::SetTimer {
                        node_id,
                        session_id: *session_id,
                        after: self.missing_segment_timeout,
                    });
                }
                self.sessions.insert(key, session);
                actions
            },

            TsFrame::SubsequentSegment { session_id, datagram_size, offset, payload } => {
                let key = (node_id, *session_id);
                let Some(session) = self.sessions.get_mut(&key) else {
                    // We never saw the first segment; ask for it.
                    actions.push(TsRxAction::Send {
                        node_id,
                        frame: TsFrame::SegmentRequest { session_id: *session_id, offset: 0 },
                    });
                    return actions;
                };

                if matches!(session.state, RxState::Complete | RxState::Failure) {
                    return actions;
                }
                if session.datagram_size != *datagram_size {
                    tracing::warn!(%node_id, session_id, "datagram size changed mid-session");
                    session.state = RxState::Failure;
                    actions.push(TsRxAction::ClearTimer { node_id, session_id: *session_id });
                    return actions;
                }
                if !session.store(*offset, payload) {
                    session.state = RxState::Failure;
                    actions.push(TsRxAction::ClearTimer { node_id, session_id: *session_id });
                    return actions;
                }

                if session.is_complete() {
                    session.state = RxState::Complete;
                    actions.push(TsRxAction::ClearTimer { node_id, session_id: *session_id });
                    actions.push(TsRxAction::Send {
                        node_id,
                        frame: TsFrame::SegmentComplete { session_id: *session_id },
                    });
                    actions.push(TsRxAction::Deliver {
                        node_id,
                        session_id: *session_id,
                        datagram: Bytes::from(session.buffer.clone()),
                    });
                } else {
                    let gap_behind = session
                        .first_missing_offset()
                        .is_some_and(|missing| missing < *offset);
                    session.state =
                        if gap_behind { RxState::AwaitingGap } else { RxState::Receiving };
                    actions.push(TsRxAction::SetTimer {
                        node_id,
                        session_id: *session_id,
                        after: self.missing_segment_timeout,
                    });
                }
                actions
            },

            // Sender-side frames; the RX machine ignores them.
            TsFrame::SegmentRequest { .. }
            | TsFrame::SegmentComplete { .. }
            | TsFrame::SegmentWait { .. } => actions,
        }
    }

    /// The session's missing-segment timer fired.
    pub fn handle_timeout(&mut self, node_id: NodeId, session_id: u8) -> Vec<TsRxAction> {
        let mut actions = Vec::new();
        let Some(session) = self.sessions.get_mut(&(node_id, session_id)) else {
            return actions;
        };
        if matches!(session.state, RxState::Complete | RxState::Failure) {
            return actions;
        }

        if let Some(offset) = session.first_missing_offset() {
            session.state = RxState::AwaitingGap;
            actions.push(TsRxAction::Send {
                node_id,
                frame: TsFrame::SegmentRequest { session_id, offset },
            });
            actions.push(TsRxAction::SetTimer {
                node_id,
                session_id,
                after: self.missing_segment_timeout,
            });
        }
        actions
    }

    /// Drop every session belonging to `node_id` (node removed).
    pub fn purge_node(&mut self, node_id: NodeId) {
        self.sessions.retain(|(node, _), _| *node != node_id);
    }
}

/// Outbound fragmentation: split a datagram and service segment requests.
pub struct TransportServiceTx {
    datagram: Bytes,
    session_id: u8,
    fragment_size: u16,
}

impl TransportServiceTx {
    /// Prepare a session. The datagram is retained so segment requests can
    /// be serviced until the receiver confirms completion.
    ///
    /// Returns `None` when the datagram exceeds [`MAX_DATAGRAM_SIZE`] or
    /// the fragment size is zero.
    #[must_use]
    pub fn new(session_id: u8, datagram: Bytes, fragment_size: u16) -> Option<Self> {
        if datagram.is_empty()
            || datagram.len() > MAX_DATAGRAM_SIZE as usize
            || fragment_size == 0
        {
            return None;
        }
        Some(Self { datagram, session_id: session_id & 0x0F, fragment_size })
    }

    /// All segments in transmit order.
    #[must_use]
    pub fn segments(&self) -> Vec<TsFrame> {
        let size = self.datagram.len() as u16;
        let step = self.fragment_size as usize;
        let mut frames = Vec::with_capacity(self.datagram.len().div_ceil(step));

        for (index, chunk) in self.datagram.chunks(step).enumerate() {
            let payload = Bytes::copy_from_slice(chunk);
            if index == 0 {
                frames.push(TsFrame::FirstSegment {
                    session_id: self.session_id,
                    datagram_size: size,
                    payload,
                });
            } else {
                frames.push(TsFrame::SubsequentSegment {
                    session_id: self.session_id,
                    datagram_size: size,
                    offset: (index * step) as u16,
                    payload,
                });
            }
        }
        frames
    }

    /// Service a segment request: re-emit the segment containing `offset`.
    #[must_use]
    pub fn segment_at(&self, offset: u16) -> Option<TsFrame> {
        let start = offset as usize;
        if start >= self.datagram.len() {
            return None;
        }
        let end = (start + self.fragment_size as usize).min(self.datagram.len());
        let payload = self.datagram.slice(start..end);
        if start == 0 {
            Some(TsFrame::FirstSegment {
                session_id: self.session_id,
                datagram_size: self.datagram.len() as u16,
                payload,
            })
        } else {
            Some(TsFrame::SubsequentSegment {
                session_id: self.session_id,
                datagram_size: self.datagram.len() as u16,
                offset,
                payload,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rx() -> TransportServiceRx {
        TransportServiceRx::new(MISSING_SEGMENT_TIMEOUT)
    }

    fn sends(actions: &[TsRxAction]) -> Vec<&TsFrame> {
        actions
            .iter()
            .filter_map(|action| match action {
                TsRxAction::Send { frame, .. } => Some(frame),
                _ => None,
            })
            .collect()
    }

    fn delivered(actions: &[TsRxAction]) -> Option<&Bytes> {
        actions.iter().find_map(|action| match action {
            TsRxAction::Deliver { datagram, .. } => Some(datagram),
            _ => None,
        })
    }

    #[test]
    fn frame_codec_round_trip() {
        let node = NodeId(7);
        let frames = [
            TsFrame::FirstSegment {
                session_id: 7,
                datagram_size: 300,
                payload: Bytes::from(vec![1u8; 40]),
            },
            TsFrame::SubsequentSegment {
                session_id: 7,
                datagram_size: 300,
                offset: 280,
                payload: Bytes::from(vec![2u8; 20]),
            },
            TsFrame::SegmentRequest { session_id: 7, offset: 0x123 },
            TsFrame::SegmentComplete { session_id: 7 },
            TsFrame::SegmentWait { pending: 2 },
        ];
        for frame in frames {
            let command = frame.to_command(node);
            assert_eq!(TsFrame::from_command(&command).unwrap(), frame);
        }
    }

    #[test]
    fn corrupted_segment_crc_rejected() {
        let frame = TsFrame::FirstSegment {
            session_id: 1,
            datagram_size: 80,
            payload: Bytes::from(vec![1u8; 40]),
        };
        let mut command = frame.to_command(NodeId(7));
        let mut payload = command.payload.to_vec();
        let mid = payload.len() / 2;
        payload[mid] ^= 0xFF;
        command.payload = payload.into();
        assert!(TsFrame::from_command(&command).is_err());
    }

    #[test]
    fn in_order_reassembly() {
        let mut rx = rx();
        let node = NodeId(5);
        let datagram: Vec<u8> = (0..100u8).collect();

        let tx = TransportServiceTx::new(3, Bytes::from(datagram.clone()), 40).unwrap();
        let mut final_actions = Vec::new();
        for segment in tx.segments() {
            final_actions = rx.handle_frame(node, &segment);
        }

        assert_eq!(delivered(&final_actions).unwrap().as_ref(), datagram.as_slice());
        assert!(matches!(sends(&final_actions)[0], TsFrame::SegmentComplete { session_id: 3 }));
        assert_eq!(rx.session_state(node, 3), Some(RxState::Complete));
    }

    #[test]
    fn missing_segment_is_requested_then_completes() {
        let mut rx = rx();
        let node = NodeId(5);
        let datagram: Vec<u8> = (0..140u8).collect();
        let tx = TransportServiceTx::new(7, Bytes::from(datagram.clone()), 40).unwrap();
        let segments = tx.segments();
        assert_eq!(segments.len(), 4); // offsets 0, 40, 80, 120

        rx.handle_frame(node, &segments[0]);
        rx.handle_frame(node, &segments[1]);
        let actions = rx.handle_frame(node, &segments[3]); // 80 skipped
        assert!(delivered(&actions).is_none());
        assert_eq!(rx.session_state(node, 7), Some(RxState::AwaitingGap));

        // Timer fires: the gap at offset 80 is requested.
        let actions = rx.handle_timeout(node, 7);
        assert_eq!(
            sends(&actions),
            vec![&TsFrame::SegmentRequest { session_id: 7, offset: 80 }]
        );

        // Sender services the request; reassembly completes.
        let resent = tx.segment_at(80).unwrap();
        let actions = rx.handle_frame(node, &resent);
        assert_eq!(delivered(&actions).unwrap().as_ref(), datagram.as_slice());
        assert!(sends(&actions)
            .iter()
            .any(|frame| matches!(frame, TsFrame::SegmentComplete { session_id: 7 })));
    }

    #[test]
    fn subsequent_without_first_asks_for_offset_zero() {
        let mut rx = rx();
        let actions = rx.handle_frame(
            NodeId(5),
            &TsFrame::SubsequentSegment {
                session_id: 2,
                datagram_size: 100,
                offset: 40,
                payload: Bytes::from(vec![0u8; 40]),
            },
        );
        assert_eq!(
            sends(&actions),
            vec![&TsFrame::SegmentRequest { session_id: 2, offset: 0 }]
        );
    }

    #[test]
    fn reopening_a_completed_session() {
        let mut rx = rx();
        let node = NodeId(5);

        let first = TsFrame::FirstSegment {
            session_id: 1,
            datagram_size: 10,
            payload: Bytes::from(vec![0xAAu8; 10]),
        };
        let actions = rx.handle_frame(node, &first);
        assert!(delivered(&actions).is_some());
        assert_eq!(rx.session_state(node, 1), Some(RxState::Complete));

        // The same session id starts over; the old session is discarded.
        let reopened = TsFrame::FirstSegment {
            session_id: 1,
            datagram_size: 80,
            payload: Bytes::from(vec![0xBBu8; 40]),
        };
        let actions = rx.handle_frame(node, &reopened);
        assert!(delivered(&actions).is_none());
        assert_eq!(rx.session_state(node, 1), Some(RxState::Receiving));
        assert!(actions
            .iter()
            .any(|action| matches!(action, TsRxAction::ClearTimer { .. })));
    }

    #[test]
    fn size_change_mid_session_fails() {
        let mut rx = rx();
        let node = NodeId(5);
        rx.handle_frame(
            node,
            &TsFrame::FirstSegment {
                session_id: 1,
                datagram_size: 100,
                payload: Bytes::from(vec![0u8; 40]),
            },
        );
        rx.handle_frame(
            node,
            &TsFrame::SubsequentSegment {
                session_id: 1,
                datagram_size: 90,
                offset: 40,
                payload: Bytes::from(vec![0u8; 40]),
            },
        );
        assert_eq!(rx.session_state(node, 1), Some(RxState::Failure));
    }

    #[test]
    fn oversized_datagram_refused_by_tx() {
        assert!(TransportServiceTx::new(1, Bytes::from(vec![0u8; 3000]), 40).is_none());
        assert!(TransportServiceTx::new(1, Bytes::from(vec![0u8; 100]), 0).is_none());
    }
}
