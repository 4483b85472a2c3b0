//! The Send Scheduler: serializes every host→controller transaction.
//!
//! # Architecture: Action-Based State Machine
//!
//! The scheduler is pure logic in the action pattern:
//!
//! - methods accept `now` as a parameter (no stored clock)
//! - methods return `Vec<SchedulerAction>` for the shell to execute
//! - timers are emitted as `SetTimer`/`ClearTimer` actions and come back
//!   as [`SchedulerEvent::TimerElapsed`], so tests can drive time
//!
//! # State Machine
//!
//! ```text
//!        pop              ACK                Response           Callback
//! Idle ──────> ExecutingSend ──> WaitingForResponse ──> WaitingForCallback
//!  ↑               │   ↑                │                        │
//!  │      NAK/CAN/ │   │ retry         │ (RequestNodeInfo)      │
//!  │      timeout  ↓   │               ↓                        │
//!  │            Retrying          WaitingForNodeUpdate          │
//!  │                                                            │
//!  └──────────────── resolve / reject / requeue ────────────────┘
//! ```
//!
//! # Invariants
//!
//! - At most one transaction is ever past `ExecutingSend` (strict
//!   serialization against the controller's single callback slot)
//! - Every transaction settles exactly once: one `Resolve` or `Reject`
//!   action per id
//! - Callback ids cycle 1..=0xFF; 0 means "no callback expected"
//! - FIFO within a priority band, strict priority across bands

pub mod queue;
pub mod transaction;

use std::time::{Duration, Instant};

use zwire_proto::{DataFrame, FunctionType, Message, TransmitStatus};

use crate::error::SchedulerError;
use queue::TransactionQueue;
use transaction::{Priority, Transaction, TransactionId};

/// Scheduler states, driven by events and timer expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Nothing queued or executing
    Idle,
    /// Frame written, waiting for the serial ACK
    ExecutingSend,
    /// ACKed, waiting for the Response frame
    WaitingForResponse,
    /// Response received, waiting for the asynchronous callback
    WaitingForCallback,
    /// Waiting for an ApplicationUpdate that completes a node query
    WaitingForNodeUpdate,
    /// Backing off before a retransmit
    Retrying,
    /// Dequeueing suspended (soft reset in progress)
    Paused,
}

/// Timer slots the scheduler uses. One of each at most is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Serial ACK wait after a write
    Ack,
    /// Response wait after an ACK
    Response,
    /// Callback wait after a Response
    Callback,
    /// Retry backoff
    Retry,
}

/// External events the scheduler reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// Serial ACK received
    Ack,
    /// Serial NAK received
    Nak,
    /// Serial CAN received
    Can,
    /// A previously armed timer fired
    TimerElapsed(TimerKind),
    /// Suspend dequeueing once the active transaction drains
    Pause,
    /// Resume dequeueing
    Unpause,
}

/// Side effects for the shell to execute, in order.
#[derive(Debug)]
pub enum SchedulerAction {
    /// Write this frame to the serial line
    Write(DataFrame),
    /// Arm a timer; an armed timer of the same kind is replaced
    SetTimer {
        /// Which slot
        kind: TimerKind,
        /// Fire this long after `now`
        after: Duration,
    },
    /// Disarm a timer slot
    ClearTimer(TimerKind),
    /// The transaction completed; `result` is the final protocol message
    Resolve {
        /// Which transaction
        id: TransactionId,
        /// Final message of the exchange, `None` for fire-and-forget
        result: Option<Message>,
    },
    /// The transaction failed
    Reject {
        /// Which transaction
        id: TransactionId,
        /// Why
        error: SchedulerError,
    },
    /// The pause requested earlier has taken effect
    EnteredPause,
}

/// Outcome of applying a reducer to one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Leave the transaction where it is
    Keep,
    /// Abandon silently: the transaction resolves with no result
    Drop,
    /// Reject with this error
    Reject(SchedulerErrorKind),
    /// Move to a new priority band (and optionally retag), re-enqueued
    /// behind that band's existing entries in stable order
    Requeue {
        /// New priority band
        priority: Priority,
        /// Replacement tag, if any
        tag: Option<&'static str>,
    },
    /// Resolve immediately with no result
    Resolve,
}

/// Reducers cannot carry owned errors (they are `Fn`, applied to many
/// transactions), so rejection outcomes name an error kind and the
/// scheduler materializes the concrete [`SchedulerError`] with the
/// transaction's own context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerErrorKind {
    /// Becomes [`SchedulerError::MessageExpired`]
    Expired,
    /// Becomes [`SchedulerError::MessageDropped`]
    Dropped,
    /// Becomes [`SchedulerError::NodeRemoved`] with the transaction's node
    NodeRemoved,
    /// Becomes [`SchedulerError::InterviewRestarted`]
    InterviewRestarted,
}

impl SchedulerErrorKind {
    fn materialize(self, transaction: &Transaction) -> SchedulerError {
        let node_id = transaction.node_id().unwrap_or(zwire_proto::NodeId(0));
        match self {
            SchedulerErrorKind::Expired => SchedulerError::MessageExpired,
            SchedulerErrorKind::Dropped => {
                SchedulerError::MessageDropped { reason: "dropped by reducer" }
            },
            SchedulerErrorKind::NodeRemoved => SchedulerError::NodeRemoved { node_id },
            SchedulerErrorKind::InterviewRestarted => {
                SchedulerError::InterviewRestarted { node_id }
            },
        }
    }
}

/// Timeout and retry limits, wired from the driver options.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Serial ACK wait
    pub ack_timeout: Duration,
    /// Response wait after ACK
    pub response_timeout: Duration,
    /// Callback wait after Response
    pub callback_timeout: Duration,
    /// Response-level attempts per message. The wire-level ACK retry
    /// budget is fixed ([`MAX_ACK_ATTEMPTS`]) and not bounded by this.
    pub controller_attempts: u8,
    /// Total radio attempts per SendData
    pub send_data_attempts: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(1000),
            response_timeout: Duration::from_millis(10_000),
            callback_timeout: Duration::from_millis(65_000),
            controller_attempts: 3,
            send_data_attempts: 3,
        }
    }
}

/// Wire-level write attempts per transmission. NAK, CAN and ACK timeouts
/// draw from this fixed budget; `controller_attempts` bounds only the
/// response level, so even a limit of 1 still retries an unACKed frame.
pub const MAX_ACK_ATTEMPTS: u8 = 3;

struct Active {
    tx: Transaction,
    /// Write attempts since the last successful ACK, counting the first
    writes: u8,
    /// Response waits that timed out for the current message
    response_attempts: u8,
    /// Radio-level retransmits performed (SendData family)
    radio_retries: u8,
    /// A SendDataAbort was injected; swallow its Response silently
    expect_abort_response: bool,
}

/// The Send Scheduler.
///
/// Owns the priority queue and the single active transaction. All methods
/// are synchronous and pure with respect to I/O; the shell executes the
/// returned actions.
pub struct SendScheduler {
    config: SchedulerConfig,
    state: SchedulerState,
    queue: TransactionQueue,
    active: Option<Active>,
    paused: bool,
    /// Nodes whose `WakeUp`-band traffic stays parked until they wake
    blocked_nodes: std::collections::HashSet<zwire_proto::NodeId>,
    next_seq: u64,
    next_callback_id: u8,
}

impl SendScheduler {
    /// Create an idle scheduler.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: SchedulerState::Idle,
            queue: TransactionQueue::new(),
            active: None,
            paused: false,
            blocked_nodes: std::collections::HashSet::new(),
            next_seq: 0,
            next_callback_id: 0,
        }
    }

    /// Park or release a node's `WakeUp`-band traffic. Parked entries
    /// keep their queue position but are skipped when dequeueing, so a
    /// sleeping node's backlog waits for its wake-up notification.
    pub fn set_node_blocked(
        &mut self,
        node_id: zwire_proto::NodeId,
        blocked: bool,
    ) -> Vec<SchedulerAction> {
        let mut actions = Vec::new();
        if blocked {
            self.blocked_nodes.insert(node_id);
        } else if self.blocked_nodes.remove(&node_id) {
            self.try_start(&mut actions);
        }
        actions
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Number of queued (not active) transactions.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Id of the active transaction, if one is executing.
    #[must_use]
    pub fn active_id(&self) -> Option<TransactionId> {
        self.active.as_ref().map(|active| active.tx.id)
    }

    /// True when any queued or active transaction addresses `node_id`.
    /// The sleep debounce consults this before letting a node doze off.
    #[must_use]
    pub fn has_work_for(&self, node_id: zwire_proto::NodeId) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.tx.node_id() == Some(node_id))
            || self.queue.iter().any(|queued| queued.node_id() == Some(node_id))
    }

    /// Enqueue a transaction and start it immediately if the line is free.
    pub fn enqueue(&mut self, mut transaction: Transaction) -> Vec<SchedulerAction> {
        transaction.seq = self.next_seq;
        self.next_seq += 1;

        tracing::debug!(
            id = %transaction.id,
            priority = ?transaction.priority,
            function = ?transaction.message.function,
            "transaction enqueued"
        );

        self.queue.insert(transaction);

        let mut actions = Vec::new();
        self.try_start(&mut actions);
        actions
    }

    /// Handle a control event or timer expiry.
    pub fn handle(&mut self, event: SchedulerEvent) -> Vec<SchedulerAction> {
        let mut actions = Vec::new();
        match event {
            SchedulerEvent::Ack => self.on_ack(&mut actions),
            SchedulerEvent::Nak | SchedulerEvent::Can => self.on_write_failure(&mut actions),
            SchedulerEvent::TimerElapsed(kind) => self.on_timer(kind, &mut actions),
            SchedulerEvent::Pause => {
                self.paused = true;
                if self.active.is_none() {
                    self.state = SchedulerState::Paused;
                    actions.push(SchedulerAction::EnteredPause);
                }
            },
            SchedulerEvent::Unpause => {
                self.paused = false;
                if self.state == SchedulerState::Paused {
                    self.state = SchedulerState::Idle;
                }
                self.try_start(&mut actions);
            },
        }
        actions
    }

    /// Offer an inbound protocol message. Returns `true` when the
    /// scheduler consumed it (it belonged to the active transaction).
    pub fn offer_message(&mut self, message: &Message) -> (bool, Vec<SchedulerAction>) {
        let mut actions = Vec::new();
        let Some(active) = &mut self.active else {
            return (false, actions);
        };

        match self.state {
            SchedulerState::WaitingForResponse
                if message.is_response_to(active.tx.message.function) =>
            {
                actions.push(SchedulerAction::ClearTimer(TimerKind::Response));
                if !message.response_ok() {
                    self.reject_active(
                        SchedulerError::ResponseNok { response: Box::new(message.clone()) },
                        &mut actions,
                    );
                } else if active.tx.message.function.expects_callback() {
                    self.state = SchedulerState::WaitingForCallback;
                    actions.push(SchedulerAction::SetTimer {
                        kind: TimerKind::Callback,
                        after: self.config.callback_timeout,
                    });
                } else if active.tx.message.function == FunctionType::RequestNodeInfo {
                    self.state = SchedulerState::WaitingForNodeUpdate;
                    actions.push(SchedulerAction::SetTimer {
                        kind: TimerKind::Response,
                        after: self.config.response_timeout,
                    });
                } else {
                    self.complete_part(Some(message.clone()), &mut actions);
                }
                (true, actions)
            },

            SchedulerState::WaitingForCallback => {
                if active.expect_abort_response
                    && message.is_response_to(FunctionType::SendDataAbort)
                {
                    active.expect_abort_response = false;
                    return (true, actions);
                }

                if !message.is_callback_for(active.tx.message.function) {
                    return (false, actions);
                }

                if message.callback_id != active.tx.message.callback_id {
                    tracing::debug!(
                        expected = ?active.tx.message.callback_id,
                        received = ?message.callback_id,
                        "callback id mismatch, discarding"
                    );
                    return (true, actions);
                }

                actions.push(SchedulerAction::ClearTimer(TimerKind::Callback));

                if active.tx.message.function.is_send_data() {
                    match message.transmit_status() {
                        Some(TransmitStatus::Ok) => {
                            self.complete_part(Some(message.clone()), &mut actions);
                        },
                        Some(TransmitStatus::NoAck) => {
                            let node_id =
                                active.tx.node_id().unwrap_or(zwire_proto::NodeId(0));
                            self.reject_active(
                                SchedulerError::NodeTimeout { node_id },
                                &mut actions,
                            );
                        },
                        Some(TransmitStatus::NotIdle) => {
                            // Controller busy: transient, worth a retransmit.
                            self.retry_send_data(false, &mut actions);
                        },
                        status => {
                            let raw = message.payload.first().copied().unwrap_or(0xFF);
                            tracing::warn!(?status, "SendData callback reported failure");
                            self.reject_active(
                                SchedulerError::CallbackNok { status: raw },
                                &mut actions,
                            );
                        },
                    }
                } else {
                    self.complete_part(Some(message.clone()), &mut actions);
                }
                (true, actions)
            },

            SchedulerState::WaitingForNodeUpdate
                if message.function == FunctionType::ApplicationUpdate =>
            {
                actions.push(SchedulerAction::ClearTimer(TimerKind::Response));
                self.complete_part(Some(message.clone()), &mut actions);
                (true, actions)
            },

            _ => (false, actions),
        }
    }

    /// Apply a reducer over the queue and, when it is safe (no frame on
    /// the wire), the active transaction.
    ///
    /// Reducers are the sole mechanism for requeueing, purging and
    /// expiring transactions. They observe a consistent snapshot: the
    /// whole queue plus active set, applied serially.
    pub fn reduce(
        &mut self,
        reducer: &dyn Fn(&Transaction) -> Reduction,
    ) -> Vec<SchedulerAction> {
        let mut actions = Vec::new();

        let drained = self.queue.drain();
        let mut survivors = Vec::with_capacity(drained.len());
        for mut transaction in drained {
            match reducer(&transaction) {
                Reduction::Keep => survivors.push(transaction),
                Reduction::Drop => {
                    tracing::debug!(id = %transaction.id, "transaction dropped by reducer");
                    actions
                        .push(SchedulerAction::Resolve { id: transaction.id, result: None });
                },
                Reduction::Resolve => {
                    actions
                        .push(SchedulerAction::Resolve { id: transaction.id, result: None });
                },
                Reduction::Reject(kind) => {
                    actions.push(SchedulerAction::Reject {
                        id: transaction.id,
                        error: kind.materialize(&transaction),
                    });
                },
                Reduction::Requeue { priority, tag } => {
                    transaction.priority = priority;
                    if let Some(tag) = tag {
                        transaction.tag = Some(tag);
                    }
                    transaction.seq = self.next_seq;
                    self.next_seq += 1;
                    survivors.push(transaction);
                },
            }
        }
        for transaction in survivors {
            self.queue.insert(transaction);
        }
        // Kept entries retain their original seq while requeued ones got a
        // fresh one, so a stable resort restores (priority, seq) order.
        self.queue.resort();

        // The active transaction is only touched while it is off the wire.
        // Once a frame is written the controller is already committed, so
        // the exchange drains and settles through the normal paths.
        if self.state == SchedulerState::Retrying {
            if let Some(active) = &self.active {
                match reducer(&active.tx) {
                    Reduction::Keep => {},
                    Reduction::Drop | Reduction::Resolve => {
                        actions.push(SchedulerAction::ClearTimer(TimerKind::Retry));
                        let active = self.active.take().expect("active checked above");
                        actions
                            .push(SchedulerAction::Resolve { id: active.tx.id, result: None });
                        self.after_settle(false, true, &mut actions);
                    },
                    Reduction::Reject(kind) => {
                        actions.push(SchedulerAction::ClearTimer(TimerKind::Retry));
                        let active = self.active.take().expect("active checked above");
                        actions.push(SchedulerAction::Reject {
                            id: active.tx.id,
                            error: kind.materialize(&active.tx),
                        });
                        self.after_settle(false, true, &mut actions);
                    },
                    Reduction::Requeue { priority, tag } => {
                        actions.push(SchedulerAction::ClearTimer(TimerKind::Retry));
                        let active = self.active.take().expect("active checked above");
                        let mut transaction = active.tx;
                        transaction.priority = priority;
                        if let Some(tag) = tag {
                            transaction.tag = Some(tag);
                        }
                        transaction.seq = self.next_seq;
                        self.next_seq += 1;
                        self.queue.insert(transaction);
                        self.state = SchedulerState::Idle;
                    },
                }
            }
        }

        self.try_start(&mut actions);
        actions
    }

    /// Stable re-sort after external priority mutation.
    pub fn sort_queue(&mut self) {
        self.queue.resort();
    }

    // Internal machinery

    fn try_start(&mut self, actions: &mut Vec<SchedulerAction>) {
        if self.paused || self.active.is_some() || self.state != SchedulerState::Idle {
            return;
        }
        let blocked = &self.blocked_nodes;
        let Some(transaction) = self.queue.pop_where(|queued| {
            !(queued.priority == Priority::WakeUp
                && queued.node_id().is_some_and(|node| blocked.contains(&node)))
        }) else {
            return;
        };
        self.active = Some(Active {
            tx: transaction,
            writes: 0,
            response_attempts: 0,
            radio_retries: 0,
            expect_abort_response: false,
        });
        self.execute_send(actions);
    }

    fn execute_send(&mut self, actions: &mut Vec<SchedulerAction>) {
        let next_callback = self.allocate_callback_id();
        let active = self.active.as_mut().expect("execute_send requires an active transaction");

        if active.tx.message.function.expects_callback()
            && active.tx.message.callback_id.is_none()
        {
            active.tx.message.set_callback_id(next_callback);
        }

        active.writes += 1;
        tracing::debug!(
            id = %active.tx.id,
            function = ?active.tx.message.function,
            attempt = active.writes,
            "writing frame"
        );

        actions.push(SchedulerAction::Write(active.tx.message.to_frame()));
        actions.push(SchedulerAction::SetTimer {
            kind: TimerKind::Ack,
            after: self.config.ack_timeout,
        });
        self.state = SchedulerState::ExecutingSend;
    }

    fn allocate_callback_id(&mut self) -> u8 {
        self.next_callback_id = match self.next_callback_id {
            0xFF => 1,
            id => id + 1,
        };
        self.next_callback_id
    }

    fn on_ack(&mut self, actions: &mut Vec<SchedulerAction>) {
        if self.state != SchedulerState::ExecutingSend {
            tracing::debug!(state = ?self.state, "stray ACK");
            return;
        }
        actions.push(SchedulerAction::ClearTimer(TimerKind::Ack));

        let active = self.active.as_mut().expect("ExecutingSend implies an active transaction");
        // The frame made it; a later response-level retransmit gets a
        // fresh wire budget.
        active.writes = 0;
        let function = active.tx.message.function;

        if function.expects_response() {
            self.state = SchedulerState::WaitingForResponse;
            actions.push(SchedulerAction::SetTimer {
                kind: TimerKind::Response,
                after: self.config.response_timeout,
            });
        } else if function.expects_callback() {
            self.state = SchedulerState::WaitingForCallback;
            actions.push(SchedulerAction::SetTimer {
                kind: TimerKind::Callback,
                after: self.config.callback_timeout,
            });
        } else {
            self.complete_part(None, actions);
        }
    }

    fn on_write_failure(&mut self, actions: &mut Vec<SchedulerAction>) {
        if self.state != SchedulerState::ExecutingSend {
            tracing::debug!(state = ?self.state, "stray NAK/CAN");
            return;
        }
        actions.push(SchedulerAction::ClearTimer(TimerKind::Ack));
        self.retry_ack(actions);
    }

    fn on_timer(&mut self, kind: TimerKind, actions: &mut Vec<SchedulerAction>) {
        match (self.state, kind) {
            (SchedulerState::ExecutingSend, TimerKind::Ack) => {
                self.retry_ack(actions);
            },
            (SchedulerState::WaitingForResponse, TimerKind::Response) => {
                self.retry_response(actions);
            },
            (SchedulerState::WaitingForCallback, TimerKind::Callback) => {
                // The previous callback never arrived: abort it on the
                // controller before retransmitting.
                self.retry_send_data(true, actions);
            },
            (SchedulerState::WaitingForNodeUpdate, TimerKind::Response) => {
                self.reject_active(SchedulerError::ResponseTimeout, actions);
            },
            (SchedulerState::Retrying, TimerKind::Retry) => {
                self.execute_send(actions);
            },
            (state, kind) => {
                tracing::debug!(?state, ?kind, "stale timer, ignoring");
            },
        }
    }

    /// Wire-level retransmit: the frame was NAKed, CANed, or never ACKed.
    /// Draws from the fixed [`MAX_ACK_ATTEMPTS`] budget, independent of
    /// `controller_attempts`.
    fn retry_ack(&mut self, actions: &mut Vec<SchedulerAction>) {
        let active = self.active.as_ref().expect("retry requires an active transaction");
        let writes = active.writes;
        if writes >= MAX_ACK_ATTEMPTS {
            self.reject_active(SchedulerError::AckTimeout { attempts: writes }, actions);
            return;
        }

        self.state = SchedulerState::Retrying;
        actions.push(SchedulerAction::SetTimer {
            kind: TimerKind::Retry,
            after: controller_backoff(writes),
        });
    }

    /// Response-level retry: the controller ACKed but never answered.
    /// Bounded by `controller_attempts`.
    fn retry_response(&mut self, actions: &mut Vec<SchedulerAction>) {
        let active = self.active.as_mut().expect("retry requires an active transaction");
        active.response_attempts += 1;
        let attempts = active.response_attempts;
        if attempts >= self.config.controller_attempts {
            self.reject_active(SchedulerError::ResponseTimeout, actions);
            return;
        }

        self.state = SchedulerState::Retrying;
        actions.push(SchedulerAction::SetTimer {
            kind: TimerKind::Retry,
            after: controller_backoff(attempts),
        });
    }

    /// Radio-level SendData retry: refresh the callback id so a late
    /// callback for the old attempt cannot be mistaken for the new one,
    /// optionally aborting the in-flight transmission first.
    fn retry_send_data(&mut self, inject_abort: bool, actions: &mut Vec<SchedulerAction>) {
        let next_callback = self.allocate_callback_id();
        let send_data_attempts = self.config.send_data_attempts;
        let active = self.active.as_mut().expect("retry requires an active transaction");

        if active.radio_retries + 1 >= send_data_attempts {
            self.reject_active(SchedulerError::CallbackTimeout, actions);
            return;
        }
        active.radio_retries += 1;

        if inject_abort {
            actions.push(SchedulerAction::Write(Message::send_data_abort().to_frame()));
            active.expect_abort_response = true;
        }

        if active.tx.message.function.is_send_data() {
            active.tx.message.set_callback_id(next_callback);
        }
        active.writes = 0;
        active.response_attempts = 0;

        let retries = active.radio_retries;
        self.state = SchedulerState::Retrying;
        actions.push(SchedulerAction::SetTimer {
            kind: TimerKind::Retry,
            after: send_data_backoff(retries),
        });
    }

    fn complete_part(&mut self, final_message: Option<Message>, actions: &mut Vec<SchedulerAction>) {
        let active = self.active.as_mut().expect("completion requires an active transaction");

        let follow_up = active
            .tx
            .parts
            .as_mut()
            .and_then(|parts| parts.next(final_message.as_ref()));

        if let Some(next_message) = follow_up {
            active.tx.message = next_message;
            active.writes = 0;
            active.response_attempts = 0;
            active.radio_retries = 0;
            active.expect_abort_response = false;
            self.state = SchedulerState::Idle;
            self.execute_send(actions);
            return;
        }

        let active = self.active.take().expect("checked above");
        tracing::debug!(id = %active.tx.id, "transaction resolved");
        actions.push(SchedulerAction::Resolve { id: active.tx.id, result: final_message });
        self.after_settle(active.tx.pause_after_dispatch, true, actions);
    }

    fn reject_active(&mut self, error: SchedulerError, actions: &mut Vec<SchedulerAction>) {
        let active = self.active.take().expect("rejection requires an active transaction");
        tracing::debug!(id = %active.tx.id, %error, "transaction rejected");
        actions.push(SchedulerAction::Reject { id: active.tx.id, error });
        // A rejection may change what should be sent next (a node timeout
        // parks the node's whole backlog), so the shell reacts to the
        // Reject first and then calls continue_sending.
        self.after_settle(active.tx.pause_after_dispatch, false, actions);
    }

    /// Resume dequeueing after the shell has reacted to a rejection.
    pub fn continue_sending(&mut self) -> Vec<SchedulerAction> {
        let mut actions = Vec::new();
        self.try_start(&mut actions);
        actions
    }

    fn after_settle(
        &mut self,
        pause_requested: bool,
        auto_start: bool,
        actions: &mut Vec<SchedulerAction>,
    ) {
        if pause_requested {
            self.paused = true;
        }
        if self.paused {
            self.state = SchedulerState::Paused;
            actions.push(SchedulerAction::EnteredPause);
            return;
        }
        self.state = SchedulerState::Idle;
        if auto_start {
            self.try_start(actions);
        }
    }
}

/// Backoff before rewriting a frame the controller did not ACK or answer.
fn controller_backoff(attempt: u8) -> Duration {
    Duration::from_millis(100 + 1000 * u64::from(attempt))
}

/// Backoff before retransmitting a SendData whose callback failed.
fn send_data_backoff(retries: u8) -> Duration {
    Duration::from_millis(500 * u64::from(retries))
}

#[cfg(test)]
mod tests {
    use zwire_proto::{message::inbound, FunctionType, Message, NodeId, TransmitStatus};

    use super::*;

    fn scheduler() -> SendScheduler {
        SendScheduler::new(SchedulerConfig::default())
    }

    fn version_tx(id: u64) -> Transaction {
        Transaction::new(
            TransactionId(id),
            Priority::Controller,
            Message::get_controller_version(),
        )
    }

    fn send_data_tx(id: u64, node: u8, priority: Priority) -> Transaction {
        Transaction::new(
            TransactionId(id),
            priority,
            Message::send_data(NodeId(node), &[0x25, 0x01, 0xFF], 0x25, 0),
        )
    }

    fn response(function: FunctionType, payload: &[u8]) -> Message {
        Message::from_frame(&inbound::response(function, payload)).unwrap()
    }

    fn has_write(actions: &[SchedulerAction]) -> bool {
        actions.iter().any(|action| matches!(action, SchedulerAction::Write(_)))
    }

    fn find_resolution(actions: &[SchedulerAction]) -> Option<&SchedulerAction> {
        actions.iter().find(|action| {
            matches!(action, SchedulerAction::Resolve { .. } | SchedulerAction::Reject { .. })
        })
    }

    #[test]
    fn controller_command_happy_path() {
        let mut scheduler = scheduler();

        let actions = scheduler.enqueue(version_tx(1));
        assert!(has_write(&actions));
        assert_eq!(scheduler.state(), SchedulerState::ExecutingSend);

        scheduler.handle(SchedulerEvent::Ack);
        assert_eq!(scheduler.state(), SchedulerState::WaitingForResponse);

        let reply = response(FunctionType::GetControllerVersion, b"\x01Z-Wave 7.0");
        let (consumed, actions) = scheduler.offer_message(&reply);
        assert!(consumed);
        assert!(matches!(
            find_resolution(&actions),
            Some(SchedulerAction::Resolve { id: TransactionId(1), result: Some(_) })
        ));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn only_one_transaction_past_executing_send() {
        let mut scheduler = scheduler();
        scheduler.enqueue(version_tx(1));
        scheduler.enqueue(version_tx(2));

        // The second stays queued while the first is in flight.
        assert_eq!(scheduler.queue_len(), 1);
        assert_eq!(scheduler.active_id(), Some(TransactionId(1)));

        scheduler.handle(SchedulerEvent::Ack);
        let (_, actions) =
            scheduler.offer_message(&response(FunctionType::GetControllerVersion, &[0x01]));
        // Completing the first starts the second.
        assert!(has_write(&actions));
        assert_eq!(scheduler.active_id(), Some(TransactionId(2)));
        assert_eq!(scheduler.queue_len(), 0);
    }

    #[test]
    fn priority_dominance_with_active_transaction() {
        let mut scheduler = scheduler();
        scheduler.enqueue(send_data_tx(1, 5, Priority::Normal));
        scheduler.enqueue(send_data_tx(2, 5, Priority::Normal));
        scheduler.enqueue(version_tx(3)); // Controller outranks Normal

        // Transaction 1 was already active when 3 arrived; 3 jumps 2.
        assert_eq!(scheduler.active_id(), Some(TransactionId(1)));
        assert_eq!(scheduler.queue.front().unwrap().id, TransactionId(3));
    }

    #[test]
    fn nak_triggers_retry_then_exhaustion() {
        let mut scheduler = scheduler();
        scheduler.enqueue(version_tx(1));

        // Attempts 1..3 fail: two retries, then rejection.
        for _ in 0..2 {
            let actions = scheduler.handle(SchedulerEvent::Nak);
            assert_eq!(scheduler.state(), SchedulerState::Retrying);
            assert!(actions
                .iter()
                .any(|action| matches!(action, SchedulerAction::SetTimer { kind: TimerKind::Retry, .. })));

            let actions = scheduler.handle(SchedulerEvent::TimerElapsed(TimerKind::Retry));
            assert!(has_write(&actions));
        }

        let actions = scheduler.handle(SchedulerEvent::Nak);
        assert!(matches!(
            find_resolution(&actions),
            Some(SchedulerAction::Reject {
                error: SchedulerError::AckTimeout { attempts: 3 },
                ..
            })
        ));
    }

    #[test]
    fn single_controller_attempt_still_retries_ack() {
        let mut scheduler = SendScheduler::new(SchedulerConfig {
            controller_attempts: 1,
            ..SchedulerConfig::default()
        });
        scheduler.enqueue(version_tx(1));

        // The wire-level budget is untouched by the limit of 1: an ACK
        // timeout retransmits instead of rejecting.
        let actions = scheduler.handle(SchedulerEvent::TimerElapsed(TimerKind::Ack));
        assert!(find_resolution(&actions).is_none());
        assert_eq!(scheduler.state(), SchedulerState::Retrying);

        let actions = scheduler.handle(SchedulerEvent::TimerElapsed(TimerKind::Retry));
        assert!(has_write(&actions));

        // The response level is what the limit bounds: the first response
        // timeout rejects with no retry.
        scheduler.handle(SchedulerEvent::Ack);
        assert_eq!(scheduler.state(), SchedulerState::WaitingForResponse);
        let actions = scheduler.handle(SchedulerEvent::TimerElapsed(TimerKind::Response));
        assert!(matches!(
            find_resolution(&actions),
            Some(SchedulerAction::Reject { error: SchedulerError::ResponseTimeout, .. })
        ));
    }

    #[test]
    fn response_timeouts_retry_up_to_controller_attempts() {
        let mut scheduler = scheduler();
        scheduler.enqueue(version_tx(1));

        // Three response-level attempts in total: two retransmits, then
        // rejection on the third timeout.
        for _ in 0..2 {
            scheduler.handle(SchedulerEvent::Ack);
            let actions = scheduler.handle(SchedulerEvent::TimerElapsed(TimerKind::Response));
            assert!(find_resolution(&actions).is_none());
            assert_eq!(scheduler.state(), SchedulerState::Retrying);
            let actions = scheduler.handle(SchedulerEvent::TimerElapsed(TimerKind::Retry));
            assert!(has_write(&actions));
        }

        scheduler.handle(SchedulerEvent::Ack);
        let actions = scheduler.handle(SchedulerEvent::TimerElapsed(TimerKind::Response));
        assert!(matches!(
            find_resolution(&actions),
            Some(SchedulerAction::Reject { error: SchedulerError::ResponseTimeout, .. })
        ));
    }

    #[test]
    fn response_nok_rejects_with_context() {
        let mut scheduler = scheduler();
        scheduler.enqueue(send_data_tx(1, 5, Priority::Normal));
        scheduler.handle(SchedulerEvent::Ack);

        let (consumed, actions) =
            scheduler.offer_message(&response(FunctionType::SendData, &[0x00]));
        assert!(consumed);
        assert!(matches!(
            find_resolution(&actions),
            Some(SchedulerAction::Reject { error: SchedulerError::ResponseNok { .. }, .. })
        ));
    }

    #[test]
    fn send_data_full_exchange() {
        let mut scheduler = scheduler();
        scheduler.enqueue(send_data_tx(1, 5, Priority::Normal));
        scheduler.handle(SchedulerEvent::Ack);
        scheduler.offer_message(&response(FunctionType::SendData, &[0x01]));
        assert_eq!(scheduler.state(), SchedulerState::WaitingForCallback);

        let callback_id = 1; // first allocation
        let callback = Message::from_frame(&inbound::send_data_callback(
            callback_id,
            TransmitStatus::Ok,
        ))
        .unwrap();
        let (consumed, actions) = scheduler.offer_message(&callback);
        assert!(consumed);
        assert!(matches!(
            find_resolution(&actions),
            Some(SchedulerAction::Resolve { id: TransactionId(1), result: Some(_) })
        ));
    }

    #[test]
    fn callback_id_mismatch_is_discarded_not_fatal() {
        let mut scheduler = scheduler();
        scheduler.enqueue(send_data_tx(1, 5, Priority::Normal));
        scheduler.handle(SchedulerEvent::Ack);
        scheduler.offer_message(&response(FunctionType::SendData, &[0x01]));

        let wrong = Message::from_frame(&inbound::send_data_callback(0x77, TransmitStatus::Ok))
            .unwrap();
        let (consumed, actions) = scheduler.offer_message(&wrong);
        assert!(consumed);
        assert!(find_resolution(&actions).is_none());
        assert_eq!(scheduler.state(), SchedulerState::WaitingForCallback);
    }

    #[test]
    fn callback_no_ack_rejects_node_timeout() {
        let mut scheduler = scheduler();
        scheduler.enqueue(send_data_tx(1, 5, Priority::Normal));
        scheduler.handle(SchedulerEvent::Ack);
        scheduler.offer_message(&response(FunctionType::SendData, &[0x01]));

        let callback =
            Message::from_frame(&inbound::send_data_callback(1, TransmitStatus::NoAck)).unwrap();
        let (_, actions) = scheduler.offer_message(&callback);
        assert!(matches!(
            find_resolution(&actions),
            Some(SchedulerAction::Reject {
                error: SchedulerError::NodeTimeout { node_id: NodeId(5) },
                ..
            })
        ));
    }

    #[test]
    fn callback_timeout_injects_abort_and_refreshes_id() {
        let mut scheduler = scheduler();
        scheduler.enqueue(send_data_tx(1, 5, Priority::Normal));
        scheduler.handle(SchedulerEvent::Ack);
        scheduler.offer_message(&response(FunctionType::SendData, &[0x01]));

        let actions = scheduler.handle(SchedulerEvent::TimerElapsed(TimerKind::Callback));
        // Abort injected before the retry backoff.
        let abort_written = actions.iter().any(|action| match action {
            SchedulerAction::Write(frame) => frame.data[1] == FunctionType::SendDataAbort.to_u8(),
            _ => false,
        });
        assert!(abort_written);
        assert_eq!(scheduler.state(), SchedulerState::Retrying);

        // After the backoff the frame is rewritten with a fresh callback id.
        let actions = scheduler.handle(SchedulerEvent::TimerElapsed(TimerKind::Retry));
        let rewritten = actions.iter().find_map(|action| match action {
            SchedulerAction::Write(frame) => Some(frame.data.last().copied().unwrap()),
            _ => None,
        });
        assert_eq!(rewritten, Some(2)); // id 1 was the first attempt

        // The late response to the abort is swallowed silently.
        scheduler.handle(SchedulerEvent::Ack);
        let (consumed, actions) =
            scheduler.offer_message(&response(FunctionType::SendData, &[0x01]));
        assert!(consumed);
        assert!(find_resolution(&actions).is_none());
        let (consumed, _) =
            scheduler.offer_message(&response(FunctionType::SendDataAbort, &[0x01]));
        assert!(consumed);
        assert_eq!(scheduler.state(), SchedulerState::WaitingForCallback);
    }

    #[test]
    fn callback_timeouts_exhaust_into_rejection() {
        let mut scheduler = scheduler();
        scheduler.enqueue(send_data_tx(1, 5, Priority::Normal));

        for _ in 0..2 {
            scheduler.handle(SchedulerEvent::Ack);
            scheduler.offer_message(&response(FunctionType::SendData, &[0x01]));
            scheduler.handle(SchedulerEvent::TimerElapsed(TimerKind::Callback));
            scheduler.handle(SchedulerEvent::TimerElapsed(TimerKind::Retry));
        }

        scheduler.handle(SchedulerEvent::Ack);
        scheduler.offer_message(&response(FunctionType::SendData, &[0x01]));
        let actions = scheduler.handle(SchedulerEvent::TimerElapsed(TimerKind::Callback));
        assert!(matches!(
            find_resolution(&actions),
            Some(SchedulerAction::Reject { error: SchedulerError::CallbackTimeout, .. })
        ));
    }

    #[test]
    fn pause_completes_active_then_suspends() {
        let mut scheduler = scheduler();
        scheduler.enqueue(version_tx(1));
        scheduler.enqueue(version_tx(2));

        let actions = scheduler.handle(SchedulerEvent::Pause);
        // Active transaction drains first; no pause action yet.
        assert!(actions.is_empty());

        scheduler.handle(SchedulerEvent::Ack);
        let (_, actions) =
            scheduler.offer_message(&response(FunctionType::GetControllerVersion, &[0x01]));
        assert!(actions.iter().any(|a| matches!(a, SchedulerAction::EnteredPause)));
        assert_eq!(scheduler.state(), SchedulerState::Paused);
        // Transaction 2 did not start.
        assert!(!has_write(&actions));
        assert_eq!(scheduler.queue_len(), 1);

        let actions = scheduler.handle(SchedulerEvent::Unpause);
        assert!(has_write(&actions));
        assert_eq!(scheduler.active_id(), Some(TransactionId(2)));
    }

    #[test]
    fn reducer_rejects_queued_for_removed_node() {
        let mut scheduler = scheduler();
        scheduler.enqueue(version_tx(1)); // active, not for node 3
        for id in 2..=5 {
            scheduler.enqueue(send_data_tx(id, 3, Priority::Normal));
        }

        let actions = scheduler.reduce(&|tx| {
            if tx.node_id() == Some(NodeId(3)) {
                Reduction::Reject(SchedulerErrorKind::NodeRemoved)
            } else {
                Reduction::Keep
            }
        });

        let rejected: Vec<_> = actions
            .iter()
            .filter(|action| {
                matches!(
                    action,
                    SchedulerAction::Reject {
                        error: SchedulerError::NodeRemoved { node_id: NodeId(3) },
                        ..
                    }
                )
            })
            .collect();
        assert_eq!(rejected.len(), 4);
        assert_eq!(scheduler.queue_len(), 0);
    }

    #[test]
    fn reducer_requeue_preserves_relative_order() {
        let mut scheduler = scheduler();
        scheduler.enqueue(version_tx(1)); // occupies the line
        for id in 2..=4 {
            scheduler.enqueue(send_data_tx(id, 5, Priority::Normal));
        }
        scheduler.enqueue(send_data_tx(9, 6, Priority::WakeUp));

        // Node 5 falls asleep: its traffic moves to the WakeUp band.
        scheduler.reduce(&|tx| {
            if tx.node_id() == Some(NodeId(5)) {
                Reduction::Requeue { priority: Priority::WakeUp, tag: None }
            } else {
                Reduction::Keep
            }
        });

        let order: Vec<u64> = scheduler.queue.iter().map(|tx| tx.id.0).collect();
        // Node 6's ping was queued at WakeUp first and keeps its spot;
        // node 5's transactions follow in their original relative order.
        assert_eq!(order, vec![9, 2, 3, 4]);

        // Node 5 wakes: its traffic returns to Normal, jumping the band.
        scheduler.reduce(&|tx| {
            if tx.node_id() == Some(NodeId(5)) {
                Reduction::Requeue { priority: Priority::Normal, tag: None }
            } else {
                Reduction::Keep
            }
        });
        let order: Vec<u64> = scheduler.queue.iter().map(|tx| tx.id.0).collect();
        assert_eq!(order, vec![2, 3, 4, 9]);
    }

    #[test]
    fn reducer_drop_resolves_silently() {
        let mut scheduler = scheduler();
        scheduler.enqueue(version_tx(1));
        scheduler.enqueue(
            send_data_tx(2, 5, Priority::Ping).with_tag("ping"),
        );

        let actions = scheduler.reduce(&|tx| {
            if tx.tag == Some("ping") { Reduction::Drop } else { Reduction::Keep }
        });
        assert!(matches!(
            find_resolution(&actions),
            Some(SchedulerAction::Resolve { id: TransactionId(2), result: None })
        ));
    }

    #[test]
    fn blocked_node_wakeup_traffic_stays_parked() {
        let mut scheduler = scheduler();
        scheduler.set_node_blocked(NodeId(5), true);

        let actions = scheduler.enqueue(send_data_tx(1, 5, Priority::WakeUp));
        assert!(!has_write(&actions));
        assert_eq!(scheduler.active_id(), None);
        assert_eq!(scheduler.queue_len(), 1);

        // Traffic for an unblocked node skips past the parked entry.
        let actions = scheduler.enqueue(send_data_tx(2, 6, Priority::WakeUp));
        assert!(has_write(&actions));
        assert_eq!(scheduler.active_id(), Some(TransactionId(2)));
        assert_eq!(scheduler.queue_len(), 1);

        // Drain the active transaction, then release the parked one.
        scheduler.handle(SchedulerEvent::Ack);
        scheduler.offer_message(&response(FunctionType::SendData, &[0x01]));
        let callback =
            Message::from_frame(&inbound::send_data_callback(1, TransmitStatus::Ok)).unwrap();
        scheduler.offer_message(&callback);
        assert_eq!(scheduler.active_id(), None);

        let actions = scheduler.set_node_blocked(NodeId(5), false);
        assert!(has_write(&actions));
        assert_eq!(scheduler.active_id(), Some(TransactionId(1)));
    }

    #[test]
    fn callback_ids_cycle_skipping_zero() {
        let mut scheduler = scheduler();
        scheduler.next_callback_id = 0xFE;
        assert_eq!(scheduler.allocate_callback_id(), 0xFF);
        assert_eq!(scheduler.allocate_callback_id(), 1);
        assert_eq!(scheduler.allocate_callback_id(), 2);
    }

    #[test]
    fn multi_part_transaction_runs_all_parts() {
        let mut scheduler = scheduler();

        let mut follow_ups = vec![Message::memory_get_id()];
        let tx = Transaction::new(
            TransactionId(1),
            Priority::MultistepController,
            Message::get_controller_version(),
        )
        .with_parts(Box::new(move |prev: Option<&Message>| {
            // First completion hands us the version response; after the
            // follow-up completes there is nothing left.
            prev.and_then(|_| follow_ups.pop())
        }));

        scheduler.enqueue(tx);
        scheduler.handle(SchedulerEvent::Ack);
        let (_, actions) =
            scheduler.offer_message(&response(FunctionType::GetControllerVersion, &[0x01]));
        // Follow-up written, transaction still live.
        assert!(has_write(&actions));
        assert!(find_resolution(&actions).is_none());

        scheduler.handle(SchedulerEvent::Ack);
        let (_, actions) = scheduler
            .offer_message(&response(FunctionType::MemoryGetId, &[0xC0, 0xFF, 0xEE, 0x11, 0x01]));
        assert!(matches!(
            find_resolution(&actions),
            Some(SchedulerAction::Resolve { id: TransactionId(1), result: Some(_) })
        ));
    }
}
