//! Per-node session registries.
//!
//! Supervision sessions map `(node, session id)` to the caller interested
//! in status updates; entries expire on the terminal report or by
//! timeout. The registry is data-only: the dispatcher consults it and
//! emits actions, the shell owns whatever completion primitive the caller
//! was handed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use zwire_proto::NodeId;

use crate::encap::supervision::SupervisionStatus;

/// A supervision status update delivered to the session's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisionUpdate {
    /// Node the report came from
    pub node_id: NodeId,
    /// Session the report answers
    pub session_id: u8,
    /// Command status
    pub status: SupervisionStatus,
    /// Remaining duration, raw encoding
    pub remaining_duration: u8,
    /// Whether further updates follow; `false` closes the session
    pub more_updates_follow: bool,
}

#[derive(Debug, Clone, Copy)]
struct SessionEntry {
    opened_at: Instant,
}

/// Registry of open supervision sessions.
pub struct SupervisionSessions {
    entries: HashMap<(NodeId, u8), SessionEntry>,
    next_session_id: u8,
    session_timeout: Duration,
}

impl SupervisionSessions {
    /// Create a registry; sessions silently expire after `session_timeout`.
    #[must_use]
    pub fn new(session_timeout: Duration) -> Self {
        Self { entries: HashMap::new(), next_session_id: 0, session_timeout }
    }

    /// Allocate the next session id (six bits, skipping collisions with
    /// sessions still open toward the same node) and register it.
    pub fn open(&mut self, node_id: NodeId, now: Instant) -> u8 {
        self.expire(now);
        loop {
            self.next_session_id = (self.next_session_id + 1) & 0x3F;
            let candidate = self.next_session_id;
            if candidate != 0 && !self.entries.contains_key(&(node_id, candidate)) {
                self.entries.insert((node_id, candidate), SessionEntry { opened_at: now });
                return candidate;
            }
        }
    }

    /// True when the session is known and fresh.
    #[must_use]
    pub fn is_open(&self, node_id: NodeId, session_id: u8) -> bool {
        self.entries.contains_key(&(node_id, session_id))
    }

    /// Record a report for the session. Returns `true` when the session
    /// was known; a terminal report (`more_updates_follow == false`)
    /// closes it.
    pub fn on_report(&mut self, update: &SupervisionUpdate) -> bool {
        let key = (update.node_id, update.session_id);
        if !self.entries.contains_key(&key) {
            return false;
        }
        if !update.more_updates_follow {
            self.entries.remove(&key);
        }
        true
    }

    /// Drop all sessions for a removed node.
    pub fn purge_node(&mut self, node_id: NodeId) {
        self.entries.retain(|(node, _), _| *node != node_id);
    }

    /// Number of open sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no session is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        let timeout = self.session_timeout;
        self.entries
            .retain(|_, entry| now.duration_since(entry.opened_at) < timeout);
    }
}
