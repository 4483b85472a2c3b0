//! Node state as the driver core needs it.
//!
//! Nodes live in an arena keyed by [`NodeId`]; everything else in the
//! core refers to them by id only, never by reference, which keeps the
//! ownership graph acyclic. The dispatcher mutates status on traffic,
//! the facade mutates it on transaction failure, and removal purges
//! every trace of the id.

pub mod sessions;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use zwire_proto::NodeId;

use crate::security::SecurityClass;

/// Reachability status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Never heard from
    Unknown,
    /// Mains-powered and reachable
    Alive,
    /// Battery-powered and currently listening
    Awake,
    /// Battery-powered and sleeping; traffic is parked
    Asleep,
    /// Did not respond and is presumed gone
    Dead,
}

/// One network node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Network-unique id
    pub id: NodeId,
    /// Reachability
    pub status: NodeStatus,
    /// Battery-powered device that sleeps between wakeups
    pub can_sleep: bool,
    /// Supports the Wake Up command class
    pub supports_wake_up: bool,
    /// Wake Up interval in seconds; 0 means wakeup is event-driven only
    pub wake_up_interval: u32,
    /// Host requested the node stay awake (interview, firmware update)
    pub keep_awake: bool,
    /// Highest security class granted during bootstrap
    pub highest_security_class: Option<SecurityClass>,
    /// Command classes the node supports securely
    pub secure_command_classes: Vec<u8>,
    /// Command class versions learned during the interview
    pub cc_versions: HashMap<u8, u8>,
    /// Interview attempts consumed so far
    pub interview_attempts: u8,
    /// Instant of the last successful exchange; drives the sleep debounce
    #[serde(skip)]
    pub last_activity: Option<Instant>,
}

impl Node {
    /// A fresh node in `Unknown` status.
    #[must_use]
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            status: NodeStatus::Unknown,
            can_sleep: false,
            supports_wake_up: false,
            wake_up_interval: 0,
            keep_awake: false,
            highest_security_class: None,
            secure_command_classes: Vec::new(),
            cc_versions: HashMap::new(),
            interview_attempts: 0,
            last_activity: None,
        }
    }

    /// True when a command of this class must arrive securely.
    #[must_use]
    pub fn requires_security(&self, cc: u8) -> bool {
        self.highest_security_class.is_some() && self.secure_command_classes.contains(&cc)
    }

    /// Status after this node fails to answer: battery devices are
    /// presumed asleep, mains devices dead.
    #[must_use]
    pub fn status_on_timeout(&self) -> NodeStatus {
        if self.can_sleep { NodeStatus::Asleep } else { NodeStatus::Dead }
    }

    /// Whether the sleep debounce should send WakeUpNoMoreInformation:
    /// the node sleeps on an interval schedule, nothing pins it awake,
    /// and it has been quiet since `debounce` before `now`.
    #[must_use]
    pub fn ready_for_sleep(&self, now: Instant, debounce: Duration) -> bool {
        self.supports_wake_up
            && self.wake_up_interval != 0
            && !self.keep_awake
            && self.status == NodeStatus::Awake
            && self
                .last_activity
                .is_some_and(|last| now.duration_since(last) >= debounce)
    }
}

/// The node arena.
#[derive(Debug, Default)]
pub struct Nodes {
    entries: HashMap<NodeId, Node>,
}

impl Nodes {
    /// An empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Look up a node.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.entries.get(&id)
    }

    /// Look up a node mutably.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.entries.get_mut(&id)
    }

    /// Fetch a node, creating it in `Unknown` status on first contact.
    pub fn get_or_insert(&mut self, id: NodeId) -> &mut Node {
        self.entries.entry(id).or_insert_with(|| Node::new(id))
    }

    /// Insert or replace a node record.
    pub fn insert(&mut self, node: Node) {
        self.entries.insert(node.id, node);
    }

    /// Remove a node record entirely.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.entries.remove(&id)
    }

    /// Iterate all nodes.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.entries.values()
    }

    /// Number of known nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no node is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_status_depends_on_power_source() {
        let mut node = Node::new(NodeId(5));
        assert_eq!(node.status_on_timeout(), NodeStatus::Dead);
        node.can_sleep = true;
        assert_eq!(node.status_on_timeout(), NodeStatus::Asleep);
    }

    #[test]
    fn security_requirement_needs_class_and_cc() {
        let mut node = Node::new(NodeId(5));
        node.secure_command_classes.push(0x25);
        assert!(!node.requires_security(0x25)); // no class granted yet

        node.highest_security_class = Some(SecurityClass::S2Authenticated);
        assert!(node.requires_security(0x25));
        assert!(!node.requires_security(0x26));
    }

    #[test]
    fn sleep_debounce_conditions() {
        let now = Instant::now();
        let debounce = Duration::from_millis(1000);

        let mut node = Node::new(NodeId(5));
        node.supports_wake_up = true;
        node.wake_up_interval = 3600;
        node.status = NodeStatus::Awake;
        node.last_activity = Some(now);

        assert!(!node.ready_for_sleep(now, debounce));
        assert!(node.ready_for_sleep(now + Duration::from_millis(1000), debounce));

        node.keep_awake = true;
        assert!(!node.ready_for_sleep(now + Duration::from_millis(1000), debounce));

        node.keep_awake = false;
        node.wake_up_interval = 0;
        assert!(!node.ready_for_sleep(now + Duration::from_millis(1000), debounce));
    }

    #[test]
    fn arena_creates_on_first_contact() {
        let mut nodes = Nodes::new();
        assert!(nodes.get(NodeId(5)).is_none());
        nodes.get_or_insert(NodeId(5)).status = NodeStatus::Alive;
        assert_eq!(nodes.get(NodeId(5)).unwrap().status, NodeStatus::Alive);
        assert_eq!(nodes.len(), 1);
    }
}
