//! Security managers for the S0 and S2 schemes.
//!
//! Both schemes authenticate and encrypt command class PDUs end to end
//! between the host and a node; the controller only ferries ciphertext.
//! S0 is the legacy scheme built on a nonce handshake per message; S2
//! synchronizes a per-peer nonce generator (SPAN) once and advances it
//! per exchange.
//!
//! Nonce tables and SPAN state are owned here and mutated only by the
//! encapsulation pipeline; randomness comes from the [`Environment`]
//! trait so simulations replay byte-for-byte.

pub mod s0;
pub mod s2;

use serde::{Deserialize, Serialize};

use crate::env::Environment;

/// Security classes in descending order of trust.
///
/// A node is granted at most one *highest* class during bootstrap; keys
/// for each class are independent 16-byte secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityClass {
    /// S2 Access Control (door locks, garage doors)
    S2AccessControl,
    /// S2 Authenticated (verified DSK)
    S2Authenticated,
    /// S2 Unauthenticated
    S2Unauthenticated,
    /// Legacy S0
    S0Legacy,
}

impl SecurityClass {
    /// All classes, most trusted first.
    pub const ALL: [SecurityClass; 4] = [
        SecurityClass::S2AccessControl,
        SecurityClass::S2Authenticated,
        SecurityClass::S2Unauthenticated,
        SecurityClass::S0Legacy,
    ];

    /// True for the three S2 classes.
    #[must_use]
    pub fn is_s2(self) -> bool {
        !matches!(self, SecurityClass::S0Legacy)
    }
}

/// Which envelope an outgoing command must wear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityScheme {
    /// Plaintext
    None,
    /// S0 envelope
    S0,
    /// S2 envelope at the given class
    S2(SecurityClass),
}

/// Scheme selection per the precedence rules: S2 wins over S0 whenever
/// the node holds a non-legacy class or a temporary bootstrap key is
/// installed; S0 applies to `S0Legacy`-only nodes; everything else goes
/// plaintext.
#[must_use]
pub fn scheme_for(
    highest_class: Option<SecurityClass>,
    bootstrap_key_present: bool,
) -> SecurityScheme {
    if bootstrap_key_present {
        return SecurityScheme::S2(SecurityClass::S2Unauthenticated);
    }
    match highest_class {
        Some(class) if class.is_s2() => SecurityScheme::S2(class),
        Some(SecurityClass::S0Legacy) => SecurityScheme::S0,
        _ => SecurityScheme::None,
    }
}

/// The configured network keys, one per class.
#[derive(Debug, Clone, Default)]
pub struct NetworkKeys {
    /// S0 legacy network key
    pub s0_legacy: Option<[u8; 16]>,
    /// S2 Unauthenticated key
    pub s2_unauthenticated: Option<[u8; 16]>,
    /// S2 Authenticated key
    pub s2_authenticated: Option<[u8; 16]>,
    /// S2 Access Control key
    pub s2_access_control: Option<[u8; 16]>,
}

impl NetworkKeys {
    /// Key for a class, when configured.
    #[must_use]
    pub fn for_class(&self, class: SecurityClass) -> Option<[u8; 16]> {
        match class {
            SecurityClass::S0Legacy => self.s0_legacy,
            SecurityClass::S2Unauthenticated => self.s2_unauthenticated,
            SecurityClass::S2Authenticated => self.s2_authenticated,
            SecurityClass::S2AccessControl => self.s2_access_control,
        }
    }

    /// Reject duplicated keys: reusing one secret across classes voids
    /// the class isolation S2 is built on.
    #[must_use]
    pub fn all_distinct(&self) -> bool {
        let present: Vec<[u8; 16]> = SecurityClass::ALL
            .iter()
            .filter_map(|class| self.for_class(*class))
            .collect();
        for (index, key) in present.iter().enumerate() {
            if present[index + 1..].contains(key) {
                return false;
            }
        }
        true
    }
}

/// The pair of scheme managers, present when their keys are configured.
pub struct SecurityManagers<E: Environment> {
    /// S0 manager, when an S0 key is configured
    pub s0: Option<s0::S0Manager<E>>,
    /// S2 manager, when any S2 key is configured
    pub s2: Option<s2::S2Manager<E>>,
}

impl<E: Environment> SecurityManagers<E> {
    /// Build managers from the configured keys.
    #[must_use]
    pub fn new(keys: &NetworkKeys, env: E, nonce_timeout: std::time::Duration) -> Self {
        let s0 = keys.s0_legacy.map(|key| s0::S0Manager::new(key, env.clone(), nonce_timeout));
        let s2 = if keys.s2_unauthenticated.is_some()
            || keys.s2_authenticated.is_some()
            || keys.s2_access_control.is_some()
        {
            Some(s2::S2Manager::new(keys.clone(), env))
        } else {
            None
        };
        Self { s0, s2 }
    }

    /// Forget all per-node state (nonces, SPAN) for a removed node.
    pub fn purge_node(&mut self, node_id: zwire_proto::NodeId) {
        if let Some(s0) = &mut self.s0 {
            s0.purge_node(node_id);
        }
        if let Some(s2) = &mut self.s2 {
            s2.purge_node(node_id);
        }
    }
}
