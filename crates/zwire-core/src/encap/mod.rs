//! The encapsulation pipeline: layered wrap/unwrap over user commands.
//!
//! Outbound, wrappers apply innermost-first in the fixed order
//! Supervision → Multi Channel → (CRC-16 xor Security); Transport Service
//! fragmentation happens after the pipeline, on the finished PDU, when it
//! exceeds the MTU. Inbound, the dispatcher peels outermost-to-innermost,
//! OR-ing each layer's [`EncapsulationFlags`] bit so a reply can mirror
//! the sender's envelopes.
//!
//! Rather than a class hierarchy, each layer is a pair of free functions
//! (`wrap`/`unwrap`) and the pipeline is the ordered composition below;
//! `encapsulate`/`decapsulate` are exact inverses, which the tests pin
//! down for every wrapper combination.

pub mod crc16;
pub mod multichannel;
pub mod supervision;
pub mod transport_service;

use std::time::Instant;

use thiserror::Error;
use zwire_proto::{cc, Command, EncapsulationFlags, NodeId, ProtocolError};

use crate::{
    env::Environment,
    error::SecurityError,
    security::{SecurityClass, SecurityManagers, SecurityScheme},
};

/// Pipeline failures.
#[derive(Error, Debug)]
pub enum EncapError {
    /// A layer's wire format was malformed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A security envelope failed
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Multi Command carries several inner commands; the core refuses to
    /// half-process it
    #[error("Multi Command encapsulation is not supported")]
    MultiCommandRejected,
}

/// Supervision parameters for an outbound wrap.
#[derive(Debug, Clone, Copy)]
pub struct SupervisionRequest {
    /// Session id allocated by the session registry
    pub session_id: u8,
    /// Ask the node for progress updates
    pub request_updates: bool,
}

/// Everything the pipeline needs to know about the target to wrap one
/// command. Computed by the facade from node state; kept as plain data so
/// the pipeline stays testable.
#[derive(Debug, Clone, Copy)]
pub struct WrapProfile {
    /// Our own node id (the S0/S2 sender)
    pub own_node_id: NodeId,
    /// Wrap in Supervision Get
    pub supervision: Option<SupervisionRequest>,
    /// Security envelope to apply
    pub scheme: SecurityScheme,
    /// Apply CRC-16 when no security envelope is used
    pub crc16: bool,
}

/// Result of peeling every envelope off an inbound command.
#[derive(Debug)]
pub struct Decapsulated {
    /// The innermost command; `flags` records every stripped wrapper
    pub command: Command,
    /// Session id of a Supervision Get that must be answered
    pub supervision_session: Option<u8>,
    /// The S0 envelope doubled as a Nonce Get; report a fresh nonce
    pub s0_nonce_requested: bool,
}

/// Apply every wrapper the profile calls for, innermost first.
///
/// # Errors
///
/// Propagates security failures; notably [`SecurityError::NoNonce`] /
/// [`SecurityError::NoSpan`], which the caller answers by prepending the
/// respective handshake transaction.
pub fn encapsulate<E: Environment>(
    command: Command,
    profile: &WrapProfile,
    security: &mut SecurityManagers<E>,
    now: Instant,
) -> Result<Command, EncapError> {
    let mut current = command;

    if let Some(request) = profile.supervision {
        current = supervision::wrap(&current, request.session_id, request.request_updates);
        current.flags |= EncapsulationFlags::SUPERVISION;
    }

    if current.endpoint > 0 {
        current = multichannel::wrap(&current);
        current.flags |= EncapsulationFlags::MULTI_CHANNEL;
    }

    // CRC-16 and Security are mutually exclusive at this level; a node
    // with an assigned class always gets the security envelope.
    match profile.scheme {
        SecurityScheme::None => {
            if profile.crc16 {
                current = crc16::wrap(&current);
                current.flags |= EncapsulationFlags::CRC16;
            }
        },
        SecurityScheme::S0 => {
            let manager = security.s0.as_mut().ok_or(SecurityError::NoSecurity)?;
            let envelope = manager.encapsulate(
                &current.encode_to_vec(),
                profile.own_node_id,
                current.node_id,
                now,
            )?;
            let mut wrapped =
                Command::new(cc::SECURITY, crate::security::s0::MESSAGE_ENCAP, current.node_id, envelope);
            wrapped.endpoint = 0;
            wrapped.flags = current.flags | EncapsulationFlags::SECURITY;
            wrapped.inner = Some(Box::new(current));
            current = wrapped;
        },
        SecurityScheme::S2(class) => {
            let manager = security.s2.as_mut().ok_or(SecurityError::NoSecurity)?;
            let envelope = manager.encapsulate(
                &current.encode_to_vec(),
                profile.own_node_id,
                current.node_id,
                class,
            )?;
            let mut wrapped = Command::new(
                cc::SECURITY_2,
                crate::security::s2::MESSAGE_ENCAP,
                current.node_id,
                envelope,
            );
            wrapped.endpoint = 0;
            wrapped.flags = current.flags | EncapsulationFlags::SECURITY;
            wrapped.inner = Some(Box::new(current));
            current = wrapped;
        },
    }

    Ok(current)
}

/// Peel every envelope off an inbound command, outermost to innermost.
///
/// # Errors
///
/// Security failures surface so the dispatcher can run its ACK-and-
/// resynchronize policy; malformed layers surface as protocol errors.
pub fn decapsulate<E: Environment>(
    command: Command,
    own_node_id: NodeId,
    node_class: Option<SecurityClass>,
    security: &mut SecurityManagers<E>,
    now: Instant,
) -> Result<Decapsulated, EncapError> {
    let mut current = command;
    let mut flags = current.flags;
    let mut supervision_session = None;
    let mut s0_nonce_requested = false;

    loop {
        match (current.cc, current.command) {
            (cc::SUPERVISION, supervision::GET) => {
                let (session_id, inner) = supervision::unwrap(&current)?;
                supervision_session = Some(session_id);
                flags |= EncapsulationFlags::SUPERVISION;
                current = inner;
            },
            (cc::MULTI_CHANNEL, multichannel::CMD_ENCAP) => {
                let inner = multichannel::unwrap(&current)?;
                flags |= EncapsulationFlags::MULTI_CHANNEL;
                current = inner;
            },
            (cc::CRC16, crc16::CMD_ENCAP) => {
                let inner = crc16::unwrap(&current)?;
                flags |= EncapsulationFlags::CRC16;
                current = inner;
            },
            (cc::SECURITY, command_id)
                if command_id == crate::security::s0::MESSAGE_ENCAP
                    || command_id == crate::security::s0::MESSAGE_ENCAP_NONCE_GET =>
            {
                let manager = security.s0.as_mut().ok_or(SecurityError::NoSecurity)?;
                let pdu =
                    manager.decapsulate(&current.payload, current.node_id, own_node_id, now)?;
                if command_id == crate::security::s0::MESSAGE_ENCAP_NONCE_GET {
                    s0_nonce_requested = true;
                }
                flags |= EncapsulationFlags::SECURITY;
                let mut inner = Command::decode(current.node_id, &pdu)?;
                inner.endpoint = current.endpoint;
                current = inner;
            },
            (cc::SECURITY_2, command_id)
                if command_id == crate::security::s2::MESSAGE_ENCAP =>
            {
                let manager = security.s2.as_mut().ok_or(SecurityError::NoSecurity)?;
                let class = node_class.unwrap_or(SecurityClass::S2Unauthenticated);
                let pdu =
                    manager.decapsulate(&current.payload, current.node_id, own_node_id, class)?;
                flags |= EncapsulationFlags::SECURITY;
                let mut inner = Command::decode(current.node_id, &pdu)?;
                inner.endpoint = current.endpoint;
                current = inner;
            },
            (cc::MULTI_COMMAND, _) => {
                tracing::warn!(node_id = %current.node_id, "rejecting Multi Command envelope");
                return Err(EncapError::MultiCommandRejected);
            },
            _ => break,
        }
    }

    current.flags = flags;
    Ok(Decapsulated { command: current, supervision_session, s0_nonce_requested })
}
