//! Transactions: one logical host→network exchange.
//!
//! A transaction owns the head [`Message`], an optional parts generator
//! producing follow-up messages, and the bookkeeping the scheduler needs
//! (priority, tag, expiry, retry counters). Results flow out of the
//! scheduler as actions keyed by [`TransactionId`]; the shell maps ids to
//! whatever completion primitive it hands callers.

use std::time::Instant;

use zwire_proto::{Message, NodeId};

/// Identity of a transaction, unique for the lifetime of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// Transaction priority bands, highest first.
///
/// The derived order makes a *smaller* variant more urgent, so the queue
/// pops the minimum. Ties within a band break by enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Nonce replies; must never wait behind normal traffic
    Nonce,
    /// Supervision report replies
    Supervision,
    /// Controller-local commands (no radio involved)
    Controller,
    /// Pings probing node reachability
    Ping,
    /// Multi-message controller sequences that must not interleave
    MultistepController,
    /// Security bootstrap handshakes
    Handshake,
    /// Nonce round-trips prepended to an outgoing secure command
    PreTransmitHandshake,
    /// Node interview traffic
    NodeQuery,
    /// Ordinary application commands
    Normal,
    /// Background polling
    Poll,
    /// Traffic parked until a sleeping node wakes
    WakeUp,
}

/// Follow-up message generator for multi-part exchanges.
///
/// After each part's protocol exchange completes, the scheduler calls
/// [`MessageParts::next`] with the final message of that exchange. A
/// `Some` return becomes the next part; `None` completes the transaction
/// and resolves it with the last exchange's final message.
pub trait MessageParts: Send {
    /// Produce the next message, given the previous part's final message.
    fn next(&mut self, previous: Option<&Message>) -> Option<Message>;
}

impl<F> MessageParts for F
where
    F: FnMut(Option<&Message>) -> Option<Message> + Send,
{
    fn next(&mut self, previous: Option<&Message>) -> Option<Message> {
        self(previous)
    }
}

/// One logical host→network exchange.
///
/// Not `Clone`: the parts generator is stateful and identity matters. The
/// transaction is live from enqueue until the scheduler emits exactly one
/// `Resolve` or `Reject` action for its id.
pub struct Transaction {
    /// Scheduler-assigned identity
    pub id: TransactionId,
    /// Priority band
    pub priority: Priority,
    /// The band the transaction was created with. Requeues mutate
    /// `priority`; wake-up restoration reads this
    pub original_priority: Priority,
    /// The message currently being executed
    pub message: Message,
    /// Generator for follow-up messages, if this exchange has several
    pub parts: Option<Box<dyn MessageParts>>,
    /// Free-form label reducers match on (`"interview"`, `"ping"`, ...)
    pub tag: Option<&'static str>,
    /// Reject with `MessageExpired` if still live at this instant
    pub expires_at: Option<Instant>,
    /// Whether a node timeout on this transaction should demote the
    /// node's status (asleep/dead)
    pub change_node_status_on_timeout: bool,
    /// Suspend dequeueing after this transaction completes (soft reset)
    pub pause_after_dispatch: bool,
    /// Enqueue order, assigned by the scheduler; stable FIFO within a band
    pub(crate) seq: u64,
}

impl Transaction {
    /// A single-message transaction with default flags.
    #[must_use]
    pub fn new(id: TransactionId, priority: Priority, message: Message) -> Self {
        Self {
            id,
            priority,
            original_priority: priority,
            message,
            parts: None,
            tag: None,
            expires_at: None,
            change_node_status_on_timeout: true,
            pause_after_dispatch: false,
            seq: 0,
        }
    }

    /// Attach a parts generator.
    #[must_use]
    pub fn with_parts(mut self, parts: Box<dyn MessageParts>) -> Self {
        self.parts = Some(parts);
        self
    }

    /// Attach a reducer-matchable tag.
    #[must_use]
    pub fn with_tag(mut self, tag: &'static str) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Set an expiry deadline.
    #[must_use]
    pub fn with_expiry(mut self, expires_at: Instant) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Mark as a transaction whose node-level timeout should not touch
    /// node status (pings used as probes, for example).
    #[must_use]
    pub fn without_node_status_updates(mut self) -> Self {
        self.change_node_status_on_timeout = false;
        self
    }

    /// Suspend the send loop once this transaction settles.
    #[must_use]
    pub fn with_pause_after_dispatch(mut self) -> Self {
        self.pause_after_dispatch = true;
        self
    }

    /// Node this transaction addresses, if any.
    #[must_use]
    pub fn node_id(&self) -> Option<NodeId> {
        self.message.node_id
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("function", &self.message.function)
            .field("node_id", &self.message.node_id)
            .field("tag", &self.tag)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}
