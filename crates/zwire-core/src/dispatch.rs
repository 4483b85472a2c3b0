//! The Receive Dispatcher: classifies and routes every inbound message.
//!
//! The shell feeds it messages that neither the scheduler (known
//! response/callback) nor a pending `wait_for_*` claimed. The dispatcher
//! unwraps envelopes, reassembles fragments, tracks node power state from
//! traffic, and returns routing actions.
//!
//! # Decode-error policy
//!
//! Frame-level corruption was already answered with NAK at the framer.
//! Everything that reaches this module arrived in a structurally valid
//! frame, so failures here drop the message after the wire-level ACK:
//! unknown commands silently, S2 decode failures with a nonce
//! resynchronization (deduplicated per peer).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use zwire_proto::{cc, Command, EncapsulationFlags, FunctionType, Message, NodeId, ProtocolError};

use crate::{
    encap::{
        self, supervision,
        transport_service::{TransportServiceRx, TsFrame, TsRxAction, MISSING_SEGMENT_TIMEOUT},
        Decapsulated, EncapError,
    },
    env::Environment,
    error::SecurityError,
    node::{
        sessions::{SupervisionSessions, SupervisionUpdate},
        NodeStatus, Nodes,
    },
    scheduler::transaction::Priority,
    security::{s0, s2, SecurityManagers},
    storage::{CacheFile, CacheRecord},
};

/// Routing outcomes for the shell to execute, in order.
#[derive(Debug)]
pub enum DispatchAction {
    /// Deliver this fully unwrapped command to the node's handler
    NodeCommand {
        /// Source node
        node_id: NodeId,
        /// Innermost command with mirror flags set
        command: Command,
    },
    /// A supervision session we own received a report
    SupervisionUpdate(SupervisionUpdate),
    /// Answer a node's Supervision Get with a Success report, mirroring
    /// the sender's encapsulation
    SendSupervisionReport {
        /// Node to answer
        node_id: NodeId,
        /// Session being acknowledged
        session_id: u8,
        /// Encapsulation to mirror
        flags: EncapsulationFlags,
    },
    /// Send a command back to a node (transport-service replies)
    SendCommand {
        /// Destination node
        command: Command,
        /// Queue band to use
        priority: Priority,
    },
    /// Enqueue an S0 Nonce Report at `Nonce` priority
    SendS0NonceReport {
        /// Requesting node
        node_id: NodeId,
    },
    /// Enqueue an S2 Nonce Report (SOS) at `Nonce` priority
    SendS2NonceReport {
        /// Out-of-sync peer
        node_id: NodeId,
    },
    /// An S0 nonce from this peer was stored; a blocked secure send may
    /// proceed
    S0NonceStored {
        /// Peer that reported the nonce
        node_id: NodeId,
    },
    /// The peer answered our S2 Nonce Get; a blocked secure send may
    /// proceed
    S2NonceReported {
        /// Peer that reported
        node_id: NodeId,
    },
    /// Secure bootstrap must be torn down: the temporary channel failed
    /// repeatedly. The shell retires the bootstrap key, sends the KEX
    /// Fail, and fires the inclusion abort hook
    AbortBootstrap {
        /// Node being bootstrapped
        node_id: NodeId,
        /// Failure code to carry in the KEX Fail
        reason: s2::KexFailType,
    },
    /// The node announced a local reset; remove it and purge its state
    RemoveNode {
        /// Node that reset
        node_id: NodeId,
    },
    /// An `Asleep` node produced traffic: requeue its parked transactions
    /// at their original priority and drop stale pings
    NodeAwoke {
        /// Node that woke
        node_id: NodeId,
    },
    /// A `Dead` node produced traffic: mark alive and resume its interview
    NodeRevived {
        /// Node that came back
        node_id: NodeId,
    },
    /// Persist a value extracted from unsolicited traffic
    Persist {
        /// Which log
        file: CacheFile,
        /// The record
        record: CacheRecord,
    },
    /// Arm the missing-segment timer for a transport session
    SetTransportTimer {
        /// Session owner
        node_id: NodeId,
        /// Session id
        session_id: u8,
        /// Fire this long after now
        after: Duration,
    },
    /// Disarm a transport session timer
    ClearTransportTimer {
        /// Session owner
        node_id: NodeId,
        /// Session id
        session_id: u8,
    },
    /// Hand the message to the registered per-function request handlers
    HandleRequest {
        /// The unclaimed message
        message: Message,
    },
    /// A node answered one of our outbound fragmented sends (segment
    /// request, completion, or wait); the shell owns the TX session
    TransportSenderFrame {
        /// The requesting node
        node_id: NodeId,
        /// The sender-side frame
        frame: TsFrame,
    },
}

/// Plugin for command classes that arrive split across several PDUs.
pub trait PartialCommand: Send {
    /// When `command` is one segment of a larger report, its session id
    /// and whether more segments follow.
    fn session(&self, command: &Command) -> Option<(u8, bool)>;

    /// Merge the buffered segments (arrival order, final segment last).
    ///
    /// # Errors
    ///
    /// Validation errors drop the whole aggregate.
    fn merge(&self, segments: Vec<Command>) -> Result<Command, ProtocolError>;
}

/// Registry of partial-capable command classes plus their reassembly
/// buffers, keyed by `(node, cc, command, session)`.
#[derive(Default)]
pub struct PartialRegistry {
    handlers: HashMap<(u8, u8), Box<dyn PartialCommand>>,
    buffers: HashMap<(NodeId, u8, u8, u8), Vec<Command>>,
}

impl PartialRegistry {
    /// Register a plugin for `(cc, command)`.
    pub fn register(&mut self, cc_id: u8, command_id: u8, handler: Box<dyn PartialCommand>) {
        self.handlers.insert((cc_id, command_id), handler);
    }

    /// Feed a command through partial assembly. `None` means "buffered,
    /// nothing to route yet"; `Some` is the command to route (merged, or
    /// untouched when the class is not partial).
    fn assemble(&mut self, command: Command) -> Option<Command> {
        let Some(handler) = self.handlers.get(&(command.cc, command.command)) else {
            return Some(command);
        };
        let Some((session_id, more_follows)) = handler.session(&command) else {
            return Some(command);
        };

        let key = (command.node_id, command.cc, command.command, session_id);
        let buffer = self.buffers.entry(key).or_default();
        buffer.push(command);

        if more_follows {
            return None;
        }

        let segments = self.buffers.remove(&key).expect("buffer just touched");
        let (cc_id, command_id) = (key.1, key.2);
        match self.handlers[&(cc_id, command_id)].merge(segments) {
            Ok(merged) => Some(merged),
            Err(error) => {
                tracing::warn!(%error, "dropping partial command aggregate");
                None
            },
        }
    }

    fn purge_node(&mut self, node_id: NodeId) {
        self.buffers.retain(|(node, ..), _| *node != node_id);
    }
}

/// The dispatcher. Owns transport-service reassembly and partial-CC
/// buffers; borrows the node arena, security managers and supervision
/// sessions per call so the shell keeps single ownership of those.
pub struct Dispatcher {
    own_node_id: NodeId,
    transport_rx: TransportServiceRx,
    partials: PartialRegistry,
}

impl Dispatcher {
    /// Create a dispatcher for the controller's own node id.
    #[must_use]
    pub fn new(own_node_id: NodeId) -> Self {
        Self {
            own_node_id,
            transport_rx: TransportServiceRx::new(MISSING_SEGMENT_TIMEOUT),
            partials: PartialRegistry::default(),
        }
    }

    /// Update the own node id once controller identification completes.
    pub fn set_own_node_id(&mut self, own_node_id: NodeId) {
        self.own_node_id = own_node_id;
    }

    /// Access the partial-command registry for plugin registration.
    pub fn partials_mut(&mut self) -> &mut PartialRegistry {
        &mut self.partials
    }

    /// Route an unsolicited message (not claimed by scheduler/awaiters).
    pub fn dispatch<E: Environment>(
        &mut self,
        message: Message,
        nodes: &mut Nodes,
        security: &mut SecurityManagers<E>,
        sessions: &mut SupervisionSessions,
        now: Instant,
    ) -> Vec<DispatchAction> {
        let mut actions = Vec::new();

        // Any traffic proves the node is reachable; power-state bookkeeping
        // happens before routing so wake-up requeues precede delivery.
        if let Some(node_id) = message.node_id {
            self.note_traffic(node_id, nodes, &mut actions, now);
        }

        match message.function {
            FunctionType::ApplicationCommand | FunctionType::BridgeApplicationCommand => {
                match message.application_command() {
                    Ok((source, pdu)) => match Command::decode(source, &pdu) {
                        Ok(command) => {
                            self.route_command(command, nodes, security, sessions, now, &mut actions);
                        },
                        Err(error) => {
                            tracing::debug!(%source, %error, "dropping undecodable PDU");
                        },
                    },
                    Err(error) => {
                        tracing::debug!(%error, "dropping malformed application command frame");
                    },
                }
            },
            _ => actions.push(DispatchAction::HandleRequest { message }),
        }

        actions
    }

    /// A transport-session missing-segment timer fired.
    pub fn transport_timeout(&mut self, node_id: NodeId, session_id: u8) -> Vec<DispatchAction> {
        let ts_actions = self.transport_rx.handle_timeout(node_id, session_id);
        let mut actions = Vec::new();
        self.map_transport_actions(ts_actions, &mut actions);
        actions
    }

    /// Forget all per-node dispatcher state for a removed node.
    pub fn purge_node(&mut self, node_id: NodeId) {
        self.transport_rx.purge_node(node_id);
        self.partials.purge_node(node_id);
    }

    fn note_traffic(
        &mut self,
        node_id: NodeId,
        nodes: &mut Nodes,
        actions: &mut Vec<DispatchAction>,
        now: Instant,
    ) {
        let node = nodes.get_or_insert(node_id);
        node.last_activity = Some(now);
        match node.status {
            NodeStatus::Dead => {
                tracing::info!(%node_id, "presumed-dead node produced traffic");
                node.status = NodeStatus::Alive;
                actions.push(DispatchAction::NodeRevived { node_id });
            },
            NodeStatus::Asleep => {
                node.status = NodeStatus::Awake;
                actions.push(DispatchAction::NodeAwoke { node_id });
            },
            NodeStatus::Unknown => {
                node.status = if node.can_sleep { NodeStatus::Awake } else { NodeStatus::Alive };
            },
            NodeStatus::Alive | NodeStatus::Awake => {},
        }
    }

    fn route_command<E: Environment>(
        &mut self,
        command: Command,
        nodes: &mut Nodes,
        security: &mut SecurityManagers<E>,
        sessions: &mut SupervisionSessions,
        now: Instant,
        actions: &mut Vec<DispatchAction>,
    ) {
        let node_id = command.node_id;

        // Radio-level fragmentation sits below every other envelope.
        if command.cc == cc::TRANSPORT_SERVICE {
            match TsFrame::from_command(&command) {
                Ok(
                    frame @ (TsFrame::SegmentRequest { .. }
                    | TsFrame::SegmentComplete { .. }
                    | TsFrame::SegmentWait { .. }),
                ) => {
                    actions.push(DispatchAction::TransportSenderFrame { node_id, frame });
                },
                Ok(frame) => {
                    let ts_actions = self.transport_rx.handle_frame(node_id, &frame);
                    let mut delivered = Vec::new();
                    for action in ts_actions {
                        if let TsRxAction::Deliver { node_id, datagram, .. } = action {
                            delivered.push((node_id, datagram));
                        } else {
                            self.map_transport_actions(vec![action], actions);
                        }
                    }
                    for (node_id, datagram) in delivered {
                        match Command::decode(node_id, &datagram) {
                            Ok(inner) => self
                                .route_command(inner, nodes, security, sessions, now, actions),
                            Err(error) => {
                                tracing::debug!(%node_id, %error, "undecodable reassembled datagram");
                            },
                        }
                    }
                },
                Err(error) => tracing::debug!(%node_id, %error, "bad transport service frame"),
            }
            return;
        }

        // Nonce plumbing is answered before (and outside) decapsulation.
        match (command.cc, command.command) {
            (cc::SECURITY, s0::NONCE_GET) => {
                actions.push(DispatchAction::SendS0NonceReport { node_id });
                return;
            },
            (cc::SECURITY, s0::NONCE_REPORT) => {
                let Ok(nonce) = <[u8; 8]>::try_from(command.payload.as_ref()) else {
                    tracing::debug!(%node_id, "malformed S0 nonce report");
                    return;
                };
                if let Some(s0) = security.s0.as_mut() {
                    s0.store_peer_nonce(node_id, nonce, now);
                    actions.push(DispatchAction::S0NonceStored { node_id });
                }
                return;
            },
            (cc::SECURITY_2, s2::NONCE_GET) => {
                actions.push(DispatchAction::SendS2NonceReport { node_id });
                return;
            },
            (cc::SECURITY_2, s2::NONCE_REPORT) => {
                if let Some(s2) = security.s2.as_mut() {
                    match s2.handle_nonce_report(node_id, &command.payload) {
                        Ok(()) => actions.push(DispatchAction::S2NonceReported { node_id }),
                        Err(error) => {
                            tracing::debug!(%node_id, %error, "bad S2 nonce report");
                        },
                    }
                }
                return;
            },
            _ => {},
        }

        let node_class = nodes.get(node_id).and_then(|node| node.highest_security_class);
        let decapsulated =
            match encap::decapsulate(command, self.own_node_id, node_class, security, now) {
                Ok(decapsulated) => decapsulated,
                Err(EncapError::Security(
                    SecurityError::NoSpan { .. } | SecurityError::CannotDecode { .. },
                )) => {
                    // Resynchronize, once per window: a second failure while
                    // a report is pending must not enqueue another. A second
                    // failure while the temporary bootstrap key is live
                    // means the bootstrap channel itself is broken, so the
                    // bootstrap is canceled instead of resyncing forever.
                    let (first_failure, bootstrapping) = match security.s2.as_mut() {
                        Some(s2) => {
                            (s2.mark_nonce_report_pending(node_id), s2.has_bootstrap_key())
                        },
                        None => (false, false),
                    };
                    if first_failure {
                        actions.push(DispatchAction::SendS2NonceReport { node_id });
                    } else if bootstrapping {
                        tracing::warn!(%node_id, "repeated S2 failure mid-bootstrap, canceling");
                        actions.push(DispatchAction::AbortBootstrap {
                            node_id,
                            reason: s2::KexFailType::BootstrappingCanceled,
                        });
                    } else {
                        tracing::debug!(%node_id, "S2 decode failed, nonce report already pending");
                    }
                    return;
                },
                Err(error) => {
                    tracing::warn!(%node_id, %error, "dropping message that failed decapsulation");
                    return;
                },
            };

        let Decapsulated { command, supervision_session, s0_nonce_requested } = decapsulated;

        if s0_nonce_requested {
            actions.push(DispatchAction::SendS0NonceReport { node_id });
        }

        // Security policy: a secure node's secure CC must arrive secured.
        if let Some(node) = nodes.get(node_id) {
            if node.requires_security(command.cc)
                && !command.flags.contains(EncapsulationFlags::SECURITY)
            {
                tracing::warn!(
                    %node_id,
                    cc = format_args!("{:#04x}", command.cc),
                    "discarding insecure command from secure node"
                );
                return;
            }
        }

        // Partial-report reassembly; buffered segments produce no routing.
        let Some(command) = self.partials.assemble(command) else {
            return;
        };

        // A Supervision Get must be acknowledged even when the inner
        // command is all we deliver.
        if let Some(session_id) = supervision_session {
            actions.push(DispatchAction::SendSupervisionReport {
                node_id,
                session_id,
                flags: command.flags,
            });
        }

        match (command.cc, command.command) {
            (cc::DEVICE_RESET_LOCALLY, 0x01) => {
                actions.push(DispatchAction::RemoveNode { node_id });
            },
            (cc::SUPERVISION, supervision::REPORT) => match supervision::parse_report(&command) {
                Ok(report) => {
                    let update = SupervisionUpdate {
                        node_id,
                        session_id: report.session_id,
                        status: report.status,
                        remaining_duration: report.remaining_duration,
                        more_updates_follow: report.more_updates_follow,
                    };
                    if sessions.on_report(&update) {
                        actions.push(DispatchAction::SupervisionUpdate(update));
                    } else {
                        // Not a session we opened; the node handler may
                        // still care.
                        actions.push(DispatchAction::NodeCommand { node_id, command });
                    }
                },
                Err(error) => tracing::debug!(%node_id, %error, "bad supervision report"),
            },
            _ => {
                actions.push(DispatchAction::Persist {
                    file: CacheFile::Values,
                    record: value_record(&command),
                });
                actions.push(DispatchAction::NodeCommand { node_id, command });
            },
        }
    }

    fn map_transport_actions(
        &mut self,
        ts_actions: Vec<TsRxAction>,
        actions: &mut Vec<DispatchAction>,
    ) {
        for action in ts_actions {
            match action {
                TsRxAction::Send { node_id, frame } => {
                    actions.push(DispatchAction::SendCommand {
                        command: frame.to_command(node_id),
                        priority: Priority::Supervision,
                    });
                },
                TsRxAction::SetTimer { node_id, session_id, after } => {
                    actions.push(DispatchAction::SetTransportTimer { node_id, session_id, after });
                },
                TsRxAction::ClearTimer { node_id, session_id } => {
                    actions.push(DispatchAction::ClearTransportTimer { node_id, session_id });
                },
                TsRxAction::Deliver { .. } => {
                    debug_assert!(false, "Deliver is handled inline by route_command");
                },
            }
        }
    }
}

/// Last-received-value record for the value DB.
fn value_record(command: &Command) -> CacheRecord {
    let key = format!(
        "node.{}.ep{}.cc{:#04x}.cmd{:#04x}",
        command.node_id.0, command.endpoint, command.cc, command.command
    );
    let payload: Vec<u8> = command.payload.to_vec();
    CacheRecord::new(key, serde_json::json!(payload))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use zwire_proto::message::inbound;

    use super::*;
    use crate::security::NetworkKeys;

    #[derive(Clone)]
    struct TestEnv;

    impl Environment for TestEnv {
        fn fill_random(&self, buffer: &mut [u8]) {
            for (index, byte) in buffer.iter_mut().enumerate() {
                *byte = (index as u8).wrapping_mul(7) | 1;
            }
        }
    }

    const OWN: NodeId = NodeId(1);

    struct Fixture {
        dispatcher: Dispatcher,
        nodes: Nodes,
        security: SecurityManagers<TestEnv>,
        sessions: SupervisionSessions,
    }

    impl Fixture {
        fn new() -> Self {
            let keys = NetworkKeys {
                s0_legacy: Some([0x0A; 16]),
                s2_unauthenticated: Some([0x0B; 16]),
                s2_authenticated: Some([0x0C; 16]),
                s2_access_control: None,
            };
            Self {
                dispatcher: Dispatcher::new(OWN),
                nodes: Nodes::new(),
                security: SecurityManagers::new(&keys, TestEnv, Duration::from_secs(5)),
                sessions: SupervisionSessions::new(Duration::from_secs(10)),
            }
        }

        fn dispatch_pdu(&mut self, source: NodeId, pdu: &[u8]) -> Vec<DispatchAction> {
            let frame = inbound::application_command(source, pdu);
            let message = Message::from_frame(&frame).unwrap();
            self.dispatcher.dispatch(
                message,
                &mut self.nodes,
                &mut self.security,
                &mut self.sessions,
                Instant::now(),
            )
        }
    }

    #[test]
    fn plain_command_is_persisted_and_delivered() {
        let mut fixture = Fixture::new();
        let actions = fixture.dispatch_pdu(NodeId(9), &[0x20, 0x01, 0x63]);

        assert!(matches!(actions[0], DispatchAction::Persist { file: CacheFile::Values, .. }));
        assert!(matches!(
            actions[1],
            DispatchAction::NodeCommand { node_id: NodeId(9), ref command }
                if command.cc == 0x20 && command.command == 0x01
        ));
    }

    #[test]
    fn traffic_from_dead_node_revives_it() {
        let mut fixture = Fixture::new();
        fixture.nodes.get_or_insert(NodeId(9)).status = NodeStatus::Dead;

        let actions = fixture.dispatch_pdu(NodeId(9), &[0x20, 0x01, 0x63]);
        assert!(matches!(actions[0], DispatchAction::NodeRevived { node_id: NodeId(9) }));
        assert_eq!(fixture.nodes.get(NodeId(9)).unwrap().status, NodeStatus::Alive);
    }

    #[test]
    fn traffic_from_asleep_node_wakes_it() {
        let mut fixture = Fixture::new();
        let node = fixture.nodes.get_or_insert(NodeId(9));
        node.status = NodeStatus::Asleep;
        node.can_sleep = true;

        let actions = fixture.dispatch_pdu(NodeId(9), &[0x84, 0x07]);
        assert!(matches!(actions[0], DispatchAction::NodeAwoke { node_id: NodeId(9) }));
        assert_eq!(fixture.nodes.get(NodeId(9)).unwrap().status, NodeStatus::Awake);
    }

    #[test]
    fn s2_envelope_without_span_requests_nonce_once() {
        let mut fixture = Fixture::new();
        // An S2 Message Encapsulation we cannot possibly decode.
        let envelope = [cc::SECURITY_2, s2::MESSAGE_ENCAP, 0x01, 0x00, 0xDE, 0xAD, 0xBE, 0xEF,
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

        let actions = fixture.dispatch_pdu(NodeId(9), &envelope);
        assert!(actions
            .iter()
            .any(|action| matches!(action, DispatchAction::SendS2NonceReport { node_id: NodeId(9) })));

        // A second failure within the window is deduplicated.
        let actions = fixture.dispatch_pdu(NodeId(9), &envelope);
        assert!(!actions
            .iter()
            .any(|action| matches!(action, DispatchAction::SendS2NonceReport { .. })));
    }

    #[test]
    fn repeated_s2_failure_mid_bootstrap_aborts() {
        let mut fixture = Fixture::new();
        fixture.security.s2.as_mut().unwrap().set_bootstrap_key([0x77; 16]);
        let envelope = [cc::SECURITY_2, s2::MESSAGE_ENCAP, 0x01, 0x00, 0xDE, 0xAD, 0xBE, 0xEF,
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

        // The first failure still tries to resynchronize.
        let actions = fixture.dispatch_pdu(NodeId(9), &envelope);
        assert!(actions
            .iter()
            .any(|action| matches!(action, DispatchAction::SendS2NonceReport { .. })));
        assert!(!actions
            .iter()
            .any(|action| matches!(action, DispatchAction::AbortBootstrap { .. })));

        // A repeated failure while the temporary key is live cancels the
        // bootstrap.
        let actions = fixture.dispatch_pdu(NodeId(9), &envelope);
        assert!(actions.iter().any(|action| matches!(
            action,
            DispatchAction::AbortBootstrap {
                node_id: NodeId(9),
                reason: s2::KexFailType::BootstrappingCanceled,
            }
        )));
        assert!(!actions
            .iter()
            .any(|action| matches!(action, DispatchAction::SendS2NonceReport { .. })));
    }

    #[test]
    fn s0_nonce_get_is_answered() {
        let mut fixture = Fixture::new();
        let actions = fixture.dispatch_pdu(NodeId(9), &[cc::SECURITY, s0::NONCE_GET]);
        assert!(matches!(actions[0], DispatchAction::SendS0NonceReport { node_id: NodeId(9) }));
    }

    #[test]
    fn s0_nonce_report_is_stored() {
        let mut fixture = Fixture::new();
        let mut pdu = vec![cc::SECURITY, s0::NONCE_REPORT];
        pdu.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let actions = fixture.dispatch_pdu(NodeId(9), &pdu);
        assert!(matches!(actions[0], DispatchAction::S0NonceStored { node_id: NodeId(9) }));
        assert!(fixture
            .security
            .s0
            .as_ref()
            .unwrap()
            .has_peer_nonce(NodeId(9), Instant::now()));
    }

    #[test]
    fn device_reset_locally_removes_node() {
        let mut fixture = Fixture::new();
        let actions = fixture.dispatch_pdu(NodeId(9), &[cc::DEVICE_RESET_LOCALLY, 0x01]);
        assert!(actions
            .iter()
            .any(|action| matches!(action, DispatchAction::RemoveNode { node_id: NodeId(9) })));
    }

    #[test]
    fn supervision_report_resolves_open_session() {
        let mut fixture = Fixture::new();
        let now = Instant::now();
        let session_id = fixture.sessions.open(NodeId(9), now);

        let report = supervision::report(
            NodeId(9),
            session_id,
            supervision::SupervisionStatus::Success,
            false,
        );
        let actions = fixture.dispatch_pdu(NodeId(9), &report.encode_to_vec());

        assert!(actions.iter().any(|action| matches!(
            action,
            DispatchAction::SupervisionUpdate(update)
                if update.session_id == session_id && !update.more_updates_follow
        )));
        assert!(fixture.sessions.is_empty());
    }

    #[test]
    fn unknown_supervision_report_goes_to_node_handler() {
        let mut fixture = Fixture::new();
        let report = supervision::report(
            NodeId(9),
            0x15,
            supervision::SupervisionStatus::Success,
            false,
        );
        let actions = fixture.dispatch_pdu(NodeId(9), &report.encode_to_vec());
        assert!(actions
            .iter()
            .any(|action| matches!(action, DispatchAction::NodeCommand { .. })));
    }

    #[test]
    fn insecure_command_from_secure_node_is_discarded() {
        let mut fixture = Fixture::new();
        {
            let node = fixture.nodes.get_or_insert(NodeId(9));
            node.highest_security_class = Some(crate::security::SecurityClass::S2Authenticated);
            node.secure_command_classes.push(0x20);
        }

        let actions = fixture.dispatch_pdu(NodeId(9), &[0x20, 0x01, 0x63]);
        assert!(!actions
            .iter()
            .any(|action| matches!(action, DispatchAction::NodeCommand { .. })));
    }

    #[test]
    fn transport_segments_reassemble_and_route() {
        use crate::encap::transport_service::TransportServiceTx;

        let mut fixture = Fixture::new();
        // A 100-byte Basic-style PDU split into 40-byte fragments.
        let mut datagram = vec![0x20, 0x01];
        datagram.extend(std::iter::repeat(0x55).take(98));
        let tx = TransportServiceTx::new(4, Bytes::from(datagram), 40).unwrap();

        let mut last_actions = Vec::new();
        for segment in tx.segments() {
            let pdu = segment.to_command(NodeId(9)).encode_to_vec();
            last_actions = fixture.dispatch_pdu(NodeId(9), &pdu);
        }

        assert!(last_actions.iter().any(|action| matches!(
            action,
            DispatchAction::SendCommand { command, .. } if command.cc == cc::TRANSPORT_SERVICE
        )));
        assert!(last_actions.iter().any(|action| matches!(
            action,
            DispatchAction::NodeCommand { command, .. } if command.cc == 0x20
        )));
    }

    #[test]
    fn unhandled_functions_reach_request_handlers() {
        let mut fixture = Fixture::new();
        let frame = zwire_proto::DataFrame::new(
            0x00,
            FunctionType::ApplicationUpdate.to_u8(),
            &[0x84, 0x09, 0x00],
        );
        let message = Message::from_frame(&frame).unwrap();
        let actions = fixture.dispatcher.dispatch(
            message,
            &mut fixture.nodes,
            &mut fixture.security,
            &mut fixture.sessions,
            Instant::now(),
        );
        assert!(matches!(actions[0], DispatchAction::HandleRequest { .. }));
    }
}
