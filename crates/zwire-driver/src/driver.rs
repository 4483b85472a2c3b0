//! The Host Facade and its event loop.
//!
//! [`Driver`] is the handle application code holds: `send_message`,
//! `send_command`, `wait_for_message`, node removal, lifecycle. Behind it
//! a single actor task owns every protocol machine from `zwire-core` plus
//! the transport, and does nothing but translate between them:
//!
//! - serial bytes → framer → scheduler / awaiters / dispatcher
//! - machine actions → serial writes, timers, completions, events
//!
//! All timers live here in one wheel; the machines only ever ask for them.
//! Completion flows through oneshot channels keyed by transaction id, so
//! the machines never hold futures.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use zwire_core::{
    dispatch::{DispatchAction, Dispatcher},
    encap::{
        self, supervision,
        transport_service::{TransportServiceTx, TsFrame},
        EncapError, SupervisionRequest, WrapProfile,
    },
    error::{DriverError, SchedulerError, SecurityError},
    node::{sessions::SupervisionSessions, NodeStatus, Nodes},
    scheduler::{
        transaction::{Priority, Transaction, TransactionId},
        Reduction, SchedulerAction, SchedulerConfig, SchedulerErrorKind, SchedulerEvent,
        SendScheduler, TimerKind,
    },
    security::{scheme_for, SecurityManagers, SecurityScheme},
    storage::{CacheFile, CacheRecord, JsonlStore, MemoryStore, Storage},
};
use zwire_proto::{
    cc, message::tx_options, Command, ControlByte, EncapsulationFlags, Framer, FunctionType,
    Message, NodeId, SerialItem,
};

use crate::{
    env::SystemEnv,
    options::DriverOptions,
    transport::{open_with_retries, SerialBinding, SerialTransport},
};

/// Radio MTU: encapsulated PDUs longer than this leave the host through
/// Transport Service fragmentation.
const RADIO_MTU: usize = 46;

/// Fragment payload size used for outbound Transport Service sessions.
const FRAGMENT_SIZE: u16 = 40;

/// Quiet period after a node's last exchange before it is released to
/// sleep with WakeUpNoMoreInformation.
const SLEEP_DEBOUNCE: Duration = Duration::from_millis(1000);

/// WakeUp command ids the driver emits/recognizes.
const WAKE_UP_NO_MORE_INFORMATION: u8 = 0x08;

/// Per-send knobs for `send_message` / `send_command`.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Queue band; sends to sleeping nodes are demoted to `WakeUp`
    pub priority: Priority,
    /// Ask for Supervision wrapping
    pub supervision: bool,
    /// Reject with `MessageExpired` if still queued after this long
    pub expire: Option<Duration>,
    /// Reducer-matchable label
    pub tag: Option<&'static str>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self { priority: Priority::Normal, supervision: false, expire: None, tag: None }
    }
}

/// Events the driver surfaces to the application.
#[derive(Debug)]
pub enum DriverEvent {
    /// Startup finished; the driver accepts traffic
    Ready,
    /// An unsolicited, fully unwrapped command from a node
    NodeCommand {
        /// Source node
        node_id: NodeId,
        /// The command, flags mirroring its envelopes
        command: Command,
    },
    /// A supervision session we opened got a report
    Supervision(zwire_core::node::sessions::SupervisionUpdate),
    /// A node was removed (locally reset or via `remove_node`)
    NodeRemoved {
        /// The removed node
        node_id: NodeId,
    },
    /// Secure bootstrap was canceled after repeated failures on the
    /// temporary channel; the bootstrap key has been retired
    BootstrapAborted {
        /// Node whose bootstrap was torn down
        node_id: NodeId,
    },
    /// A presumed-dead node produced traffic; its interview should resume
    NodeRevived {
        /// The node that came back
        node_id: NodeId,
    },
    /// A message no handler claimed
    Unhandled(Message),
    /// A fatal driver error; the owner must call `destroy`
    Error(String),
}

type SendReply = oneshot::Sender<Result<Option<Message>, DriverError>>;
type WaitReply = oneshot::Sender<Result<Message, DriverError>>;
type CommandWaitReply = oneshot::Sender<Result<Command, DriverError>>;
type Matcher = Box<dyn Fn(&Message) -> bool + Send>;
type CommandMatcher = Box<dyn Fn(&Command) -> bool + Send>;
type RequestHandler = Box<dyn FnMut(&Message) -> bool + Send>;

enum DriverCommand {
    SendMessage { message: Message, options: SendOptions, reply: SendReply },
    SendCommand { command: Command, options: SendOptions, reply: SendReply },
    WaitFor { matcher: Matcher, timeout: Duration, reply: WaitReply },
    WaitForCommand { matcher: CommandMatcher, timeout: Duration, reply: CommandWaitReply },
    RegisterRequestHandler { function: FunctionType, once: bool, handler: RequestHandler },
    SetBootstrapKey { key: Option<[u8; 16]>, reply: oneshot::Sender<()> },
    ConfigureNode { node: zwire_core::node::Node, reply: oneshot::Sender<()> },
    CancelInterview { node_id: NodeId, reply: oneshot::Sender<()> },
    RemoveNode { node_id: NodeId, reply: oneshot::Sender<()> },
    Destroy { reply: oneshot::Sender<()> },
}

/// The application-facing driver handle.
pub struct Driver {
    commands: mpsc::UnboundedSender<DriverCommand>,
}

impl Driver {
    /// Validate options, connect, run the startup sequence (optional soft
    /// reset, Serial API handshake, controller identification, cache
    /// open), and return the ready driver plus its event stream.
    ///
    /// # Errors
    ///
    /// [`DriverError::InvalidOptions`] for bad configuration, or
    /// [`DriverError::Failed`] when the controller cannot be reached or
    /// another instance holds the lock.
    pub async fn start<B>(
        binding: B,
        options: DriverOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DriverEvent>), DriverError>
    where
        B: SerialBinding,
        B::Transport: 'static,
    {
        options.validate()?;
        let mut options = options;
        options.apply_env();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(async move {
            match Actor::connect(binding, options, command_rx, event_tx.clone()).await {
                Ok(actor) => actor.run(ready_tx).await,
                Err(error) => {
                    let _ = ready_tx.send(Err(error));
                },
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok((Self { commands: command_tx }, event_rx)),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(DriverError::Failed("driver task died during startup".into())),
        }
    }

    /// Queue a raw Serial API message. The message is enqueued before
    /// this returns; awaiting the returned future yields the
    /// transaction's result, so callers that need causal ordering simply
    /// call in order.
    ///
    /// # Errors
    ///
    /// The transaction's failure, or [`DriverError::Destroyed`].
    pub fn send_message(
        &self,
        message: Message,
        options: SendOptions,
    ) -> impl std::future::Future<Output = Result<Option<Message>, DriverError>> + Send + 'static
    {
        let (reply, result) = oneshot::channel();
        let queued = self.send(DriverCommand::SendMessage { message, options, reply });
        async move {
            queued?;
            result.await.map_err(|_| DriverError::Destroyed)?
        }
    }

    /// Encapsulate and send a command class PDU to a node. Enqueued
    /// before returning; the future yields the radio-level result.
    ///
    /// # Errors
    ///
    /// The transaction's failure, a security failure, or
    /// [`DriverError::Destroyed`].
    pub fn send_command(
        &self,
        command: Command,
        options: SendOptions,
    ) -> impl std::future::Future<Output = Result<Option<Message>, DriverError>> + Send + 'static
    {
        let (reply, result) = oneshot::channel();
        let queued = self.send(DriverCommand::SendCommand { command, options, reply });
        async move {
            queued?;
            result.await.map_err(|_| DriverError::Destroyed)?
        }
    }

    /// Await the first inbound message matching `matcher`. The awaiter is
    /// registered before this returns.
    ///
    /// # Errors
    ///
    /// [`DriverError::WaitTimeout`] when the deadline passes first.
    pub fn wait_for_message<F>(
        &self,
        matcher: F,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<Message, DriverError>> + Send + 'static
    where
        F: Fn(&Message) -> bool + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let queued =
            self.send(DriverCommand::WaitFor { matcher: Box::new(matcher), timeout, reply });
        async move {
            queued?;
            result.await.map_err(|_| DriverError::Destroyed)?
        }
    }

    /// Register a per-function request handler, invoked in registration
    /// order until one returns `true`. `once` handlers self-remove after
    /// their first hit.
    ///
    /// # Errors
    ///
    /// [`DriverError::Destroyed`] when the driver is gone.
    pub fn register_request_handler<F>(
        &self,
        function: FunctionType,
        once: bool,
        handler: F,
    ) -> Result<(), DriverError>
    where
        F: FnMut(&Message) -> bool + Send + 'static,
    {
        self.send(DriverCommand::RegisterRequestHandler {
            function,
            once,
            handler: Box::new(handler),
        })
    }

    /// Await the first unsolicited, fully decapsulated command matching
    /// `matcher`. Registered before this returns; a match is consumed and
    /// does not also surface as a [`DriverEvent::NodeCommand`].
    ///
    /// # Errors
    ///
    /// [`DriverError::WaitTimeout`] when the deadline passes first.
    pub fn wait_for_command<F>(
        &self,
        matcher: F,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<Command, DriverError>> + Send + 'static
    where
        F: Fn(&Command) -> bool + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let queued = self.send(DriverCommand::WaitForCommand {
            matcher: Box::new(matcher),
            timeout,
            reply,
        });
        async move {
            queued?;
            result.await.map_err(|_| DriverError::Destroyed)?
        }
    }

    /// Install the temporary S2 key used while bootstrapping a node, or
    /// retire it with `None`. Owned by the inclusion layer; the driver
    /// retires the key itself when it cancels a broken bootstrap.
    ///
    /// # Errors
    ///
    /// [`DriverError::Destroyed`] when the driver is gone.
    pub async fn set_bootstrap_key(&self, key: Option<[u8; 16]>) -> Result<(), DriverError> {
        let (reply, done) = oneshot::channel();
        self.send(DriverCommand::SetBootstrapKey { key, reply })?;
        done.await.map_err(|_| DriverError::Destroyed)
    }

    /// Cancel a node's interview in progress: transactions tagged as
    /// interview traffic reject with `InterviewRestarted`.
    ///
    /// # Errors
    ///
    /// [`DriverError::Destroyed`] when the driver is gone.
    pub async fn cancel_interview(&self, node_id: NodeId) -> Result<(), DriverError> {
        let (reply, done) = oneshot::channel();
        self.send(DriverCommand::CancelInterview { node_id, reply })?;
        done.await.map_err(|_| DriverError::Destroyed)
    }

    /// Publish (or replace) a node record. This is the seam the interview
    /// and cache layers use to hand the core what it needs to know about
    /// a node: power profile, wake-up support, security class.
    ///
    /// # Errors
    ///
    /// [`DriverError::Destroyed`] when the driver is gone.
    pub async fn configure_node(&self, node: zwire_core::node::Node) -> Result<(), DriverError> {
        let (reply, done) = oneshot::channel();
        self.send(DriverCommand::ConfigureNode { node, reply })?;
        done.await.map_err(|_| DriverError::Destroyed)
    }

    /// Remove a node: reject its queued work, purge its sessions, nonce
    /// and SPAN state, and erase its record.
    ///
    /// # Errors
    ///
    /// [`DriverError::Destroyed`] when the driver is gone.
    pub async fn remove_node(&self, node_id: NodeId) -> Result<(), DriverError> {
        let (reply, done) = oneshot::channel();
        self.send(DriverCommand::RemoveNode { node_id, reply })?;
        done.await.map_err(|_| DriverError::Destroyed)
    }

    /// Shut down: cancel the scheduler, settle everything outstanding,
    /// flush persistence, release the lock.
    pub async fn destroy(&self) {
        let (reply, done) = oneshot::channel();
        if self.send(DriverCommand::Destroy { reply }).is_ok() {
            let _ = done.await;
        }
    }

    fn send(&self, command: DriverCommand) -> Result<(), DriverError> {
        self.commands.send(command).map_err(|_| DriverError::Destroyed)
    }
}

// Actor internals

#[derive(Debug, Clone, PartialEq, Eq)]
enum TimerEvent {
    Scheduler(TimerKind),
    Transport(NodeId, u8),
    Expire(TransactionId),
    Awaiter(u64),
    CommandAwaiter(u64),
    StorageFlush,
    SleepDebounce(NodeId),
    InterByte,
}

/// One wheel for every deadline in the driver. Arming an event replaces
/// any armed duplicate, so machine timer slots behave as slots.
#[derive(Default)]
struct Timers {
    entries: Vec<(Instant, TimerEvent)>,
}

impl Timers {
    fn arm(&mut self, at: Instant, event: TimerEvent) {
        self.entries.retain(|(_, armed)| *armed != event);
        self.entries.push((at, event));
    }

    fn cancel(&mut self, event: &TimerEvent) {
        self.entries.retain(|(_, armed)| armed != event);
    }

    fn cancel_if(&mut self, mut predicate: impl FnMut(&TimerEvent) -> bool) {
        self.entries.retain(|(_, armed)| !predicate(armed));
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|(at, _)| *at).min()
    }

    fn take_due(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut due = Vec::new();
        self.entries.retain(|(at, event)| {
            if *at <= now {
                due.push(event.clone());
                false
            } else {
                true
            }
        });
        due
    }
}

struct Pending {
    reply: Option<SendReply>,
    node_id: Option<NodeId>,
    change_node_status: bool,
    mark_asleep_on_success: bool,
}

struct Awaiter {
    id: u64,
    matcher: Matcher,
    reply: WaitReply,
}

struct CommandAwaiter {
    id: u64,
    matcher: CommandMatcher,
    reply: CommandWaitReply,
}

struct BlockedSend {
    node_id: NodeId,
    command: Command,
    options: SendOptions,
    reply: Option<SendReply>,
}

enum LoopEvent {
    Command(Option<DriverCommand>),
    Read(io::Result<usize>),
    Timers,
}

struct Actor<B: SerialBinding> {
    binding: B,
    transport: B::Transport,
    options: DriverOptions,
    framer: Framer,
    read_buf: [u8; 256],

    scheduler: SendScheduler,
    dispatcher: Dispatcher,
    nodes: Nodes,
    security: SecurityManagers<SystemEnv>,
    sessions: SupervisionSessions,
    storage: Box<dyn Storage>,
    timers: Timers,

    commands: mpsc::UnboundedReceiver<DriverCommand>,
    events: mpsc::UnboundedSender<DriverEvent>,

    pending: HashMap<TransactionId, Pending>,
    awaiters: Vec<Awaiter>,
    command_awaiters: Vec<CommandAwaiter>,
    blocked_secure: Vec<BlockedSend>,
    request_handlers: Vec<(FunctionType, bool, RequestHandler)>,
    ts_sessions: HashMap<NodeId, TransportServiceTx>,
    next_ts_session: u8,

    next_transaction_id: u64,
    next_awaiter_id: u64,
    own_node_id: NodeId,
    home_id: u32,
    lock_file: Option<PathBuf>,
    saw_serial_api_started: bool,
    entered_pause: bool,
    destroyed: bool,
}

impl<B: SerialBinding> Actor<B> {
    async fn connect(
        mut binding: B,
        options: DriverOptions,
        commands: mpsc::UnboundedReceiver<DriverCommand>,
        events: mpsc::UnboundedSender<DriverEvent>,
    ) -> Result<Self, DriverError> {
        let lock_file = acquire_lock(&options)?;
        let transport = open_with_retries(&mut binding, options.attempts.open_serial_port)
            .await
            .map_err(|error| DriverError::Failed(format!("cannot open controller: {error}")))?;

        let scheduler_config = SchedulerConfig {
            ack_timeout: options.timeouts.ack,
            response_timeout: options.timeouts.response,
            callback_timeout: options.timeouts.send_data_callback,
            controller_attempts: options.attempts.controller,
            send_data_attempts: options.attempts.send_data,
        };
        let security =
            SecurityManagers::new(&options.security_keys, SystemEnv, options.timeouts.nonce);

        Ok(Self {
            binding,
            transport,
            framer: Framer::new(),
            read_buf: [0u8; 256],
            scheduler: SendScheduler::new(scheduler_config),
            dispatcher: Dispatcher::new(NodeId(1)),
            nodes: Nodes::new(),
            security,
            sessions: SupervisionSessions::new(options.timeouts.report * 10),
            storage: Box::new(MemoryStore::new()),
            timers: Timers::default(),
            commands,
            events,
            pending: HashMap::new(),
            awaiters: Vec::new(),
            command_awaiters: Vec::new(),
            blocked_secure: Vec::new(),
            request_handlers: Vec::new(),
            ts_sessions: HashMap::new(),
            next_ts_session: 0,
            next_transaction_id: 0,
            next_awaiter_id: 0,
            own_node_id: NodeId(1),
            home_id: 0,
            lock_file,
            saw_serial_api_started: false,
            entered_pause: false,
            destroyed: false,
            options,
        })
    }

    async fn run(mut self, ready: oneshot::Sender<Result<(), DriverError>>) {
        if let Err(error) = self.startup().await {
            let _ = ready.send(Err(error));
            self.release_lock();
            return;
        }
        let _ = ready.send(Ok(()));
        let _ = self.events.send(DriverEvent::Ready);

        while !self.destroyed {
            match self.next_event(true).await {
                LoopEvent::Command(Some(DriverCommand::Destroy { reply })) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                },
                LoopEvent::Command(Some(command)) => self.handle_command(command).await,
                LoopEvent::Command(None) => {
                    self.shutdown().await;
                    return;
                },
                LoopEvent::Read(result) => self.handle_read(result).await,
                LoopEvent::Timers => self.fire_timers().await,
            }
        }
    }

    /// Wait for the next unit of work. `with_commands` is false during
    /// startup, before the facade may talk to us.
    async fn next_event(&mut self, with_commands: bool) -> LoopEvent {
        let deadline = self.timers.next_deadline();
        tokio::select! {
            command = self.commands.recv(), if with_commands => LoopEvent::Command(command),
            result = self.transport.read(&mut self.read_buf) => LoopEvent::Read(result),
            () = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => LoopEvent::Timers,
        }
    }

    // Startup

    async fn startup(&mut self) -> Result<(), DriverError> {
        // A NAK resynchronizes the controller's framing layer after
        // whatever state the line was left in.
        self.write_control(ControlByte::Nak).await;

        if self.options.enable_soft_reset {
            self.soft_reset().await?;
        }

        self.identify_controller().await?;
        self.open_cache()?;
        Ok(())
    }

    async fn soft_reset(&mut self) -> Result<(), DriverError> {
        tracing::info!("soft-resetting controller");
        self.entered_pause = false;
        self.saw_serial_api_started = false;

        let id = self.allocate_transaction_id();
        let transaction = Transaction::new(id, Priority::Controller, Message::soft_reset())
            .with_pause_after_dispatch();
        self.pending.insert(
            id,
            Pending {
                reply: None,
                node_id: None,
                change_node_status: false,
                mark_asleep_on_success: false,
            },
        );
        let actions = self.scheduler.enqueue(transaction);
        self.execute_scheduler_actions(actions).await;

        // The reset drains, then the controller reboots: USB sticks drop
        // the connection (handled as a reconnect), others just announce
        // SerialApiStarted.
        let deadline = Instant::now() + self.options.timeouts.ack + Duration::from_millis(1500);
        self.pump_until(deadline, |actor| actor.entered_pause).await;

        let deadline = Instant::now() + self.options.timeouts.serial_api_started;
        self.pump_until(deadline, |actor| actor.saw_serial_api_started).await;

        if !self.saw_serial_api_started {
            tracing::warn!("no SerialApiStarted after soft reset, continuing anyway");
        }
        let actions = self.scheduler.handle(SchedulerEvent::Unpause);
        self.execute_scheduler_actions(actions).await;
        Ok(())
    }

    async fn identify_controller(&mut self) -> Result<(), DriverError> {
        for message in [Message::get_controller_version(), Message::memory_get_id()] {
            let id = self.allocate_transaction_id();
            self.pending.insert(
                id,
                Pending {
                    reply: None,
                    node_id: None,
                    change_node_status: false,
                    mark_asleep_on_success: false,
                },
            );
            let transaction = Transaction::new(id, Priority::Controller, message);
            let actions = self.scheduler.enqueue(transaction);
            self.execute_scheduler_actions(actions).await;
        }

        let deadline = Instant::now() + self.options.timeouts.response * 4;
        self.pump_until(deadline, |actor| actor.pending.is_empty()).await;

        if self.home_id == 0 {
            return Err(DriverError::Failed("controller identification failed".into()));
        }
        tracing::info!(home_id = format_args!("{:08x}", self.home_id), "controller identified");
        Ok(())
    }

    fn open_cache(&mut self) -> Result<(), DriverError> {
        if let Some(dir) = self.options.storage.cache_dir.clone() {
            let mut store = JsonlStore::open(dir, self.home_id)?;
            if self.options.no_cache {
                store.clear()?;
            }
            self.storage = Box::new(store);
        }
        Ok(())
    }

    /// Drive reads and timers until `done` or the deadline.
    async fn pump_until(&mut self, deadline: Instant, done: impl Fn(&Self) -> bool) {
        while !done(self) && Instant::now() < deadline {
            let step = tokio::time::timeout_at(deadline, self.next_event(false)).await;
            match step {
                Ok(LoopEvent::Read(result)) => self.handle_read(result).await,
                Ok(LoopEvent::Timers) => self.fire_timers().await,
                Ok(LoopEvent::Command(_)) => {},
                Err(_) => break,
            }
        }
    }

    // Serial input

    async fn handle_read(&mut self, result: io::Result<usize>) {
        match result {
            Ok(0) => self.handle_disconnect(None).await,
            Err(error) => self.handle_disconnect(Some(error)).await,
            Ok(count) => {
                let items = self.framer.feed(&self.read_buf[..count]);
                for item in items {
                    self.handle_item(item).await;
                }
                if self.framer.mid_frame() {
                    self.timers
                        .arm(Instant::now() + self.options.timeouts.byte, TimerEvent::InterByte);
                } else {
                    self.timers.cancel(&TimerEvent::InterByte);
                }
            },
        }
    }

    async fn handle_disconnect(&mut self, error: Option<io::Error>) {
        if let Some(error) = &error {
            tracing::warn!(%error, "serial connection lost");
        } else {
            tracing::info!("serial connection closed by peer");
        }
        self.framer.reset();

        match open_with_retries(&mut self.binding, self.options.attempts.open_serial_port).await {
            Ok(transport) => {
                self.transport = transport;
                tracing::info!("serial connection reopened");
            },
            Err(error) => {
                let _ = self
                    .events
                    .send(DriverEvent::Error(format!("cannot reopen controller: {error}")));
                self.destroyed = true;
            },
        }
    }

    async fn handle_item(&mut self, item: SerialItem) {
        match item {
            SerialItem::Control(ControlByte::Ack) => {
                let actions = self.scheduler.handle(SchedulerEvent::Ack);
                self.execute_scheduler_actions(actions).await;
            },
            SerialItem::Control(ControlByte::Nak) => {
                let actions = self.scheduler.handle(SchedulerEvent::Nak);
                self.execute_scheduler_actions(actions).await;
            },
            SerialItem::Control(ControlByte::Can) => {
                let actions = self.scheduler.handle(SchedulerEvent::Can);
                self.execute_scheduler_actions(actions).await;
            },
            SerialItem::Corrupt(error) => {
                tracing::warn!(%error, "corrupt frame, answering NAK");
                self.write_control(ControlByte::Nak).await;
            },
            SerialItem::Frame(frame) => {
                self.write_control(ControlByte::Ack).await;
                match Message::from_frame(&frame) {
                    Ok(message) => self.route_message(message).await,
                    Err(error) => {
                        // Structurally sound frame, unknown content: the
                        // ACK stands, the message is dropped.
                        tracing::debug!(%error, "dropping undecodable frame");
                    },
                }
            },
        }
    }

    async fn route_message(&mut self, message: Message) {
        if message.function == FunctionType::SerialApiStarted {
            self.saw_serial_api_started = true;
        }
        if let Some(home_id) = message.home_id() {
            self.home_id = home_id;
            if let Some(&own) = message.payload.get(4) {
                self.own_node_id = NodeId(own);
                self.dispatcher.set_own_node_id(self.own_node_id);
            }
        }

        // Disposition 1: the scheduler's expected response/callback.
        let (consumed, actions) = self.scheduler.offer_message(&message);
        self.execute_scheduler_actions(actions).await;
        if consumed {
            return;
        }

        // Disposition 2: pending wait_for_* awaiters, insertion order.
        if let Some(position) =
            self.awaiters.iter().position(|awaiter| (awaiter.matcher)(&message))
        {
            let awaiter = self.awaiters.remove(position);
            self.timers.cancel(&TimerEvent::Awaiter(awaiter.id));
            let _ = awaiter.reply.send(Ok(message));
            return;
        }

        // Disposition 3: unsolicited.
        let actions = self.dispatcher.dispatch(
            message,
            &mut self.nodes,
            &mut self.security,
            &mut self.sessions,
            Instant::now().into_std(),
        );
        self.execute_dispatch_actions(actions).await;
    }

    // Timers

    async fn fire_timers(&mut self) {
        let due = self.timers.take_due(Instant::now());
        for event in due {
            match event {
                TimerEvent::Scheduler(kind) => {
                    let actions = self.scheduler.handle(SchedulerEvent::TimerElapsed(kind));
                    self.execute_scheduler_actions(actions).await;
                },
                TimerEvent::Transport(node_id, session_id) => {
                    let actions = self.dispatcher.transport_timeout(node_id, session_id);
                    self.execute_dispatch_actions(actions).await;
                },
                TimerEvent::Expire(id) => {
                    let actions = self.scheduler.reduce(&move |transaction: &Transaction| {
                        if transaction.id == id {
                            Reduction::Reject(SchedulerErrorKind::Expired)
                        } else {
                            Reduction::Keep
                        }
                    });
                    self.execute_scheduler_actions(actions).await;
                },
                TimerEvent::Awaiter(id) => {
                    if let Some(position) =
                        self.awaiters.iter().position(|awaiter| awaiter.id == id)
                    {
                        let awaiter = self.awaiters.remove(position);
                        let _ = awaiter.reply.send(Err(DriverError::WaitTimeout));
                    }
                },
                TimerEvent::CommandAwaiter(id) => {
                    if let Some(position) =
                        self.command_awaiters.iter().position(|awaiter| awaiter.id == id)
                    {
                        let awaiter = self.command_awaiters.remove(position);
                        let _ = awaiter.reply.send(Err(DriverError::WaitTimeout));
                    }
                },
                TimerEvent::StorageFlush => {
                    if let Err(error) = self.storage.flush() {
                        tracing::error!(%error, "cache flush failed");
                        let _ = self
                            .events
                            .send(DriverEvent::Error(format!("cache flush failed: {error}")));
                    }
                },
                TimerEvent::SleepDebounce(node_id) => self.sleep_debounce(node_id).await,
                TimerEvent::InterByte => {
                    tracing::debug!("inter-byte timeout, dropping partial frame");
                    self.framer.reset();
                    self.write_control(ControlByte::Nak).await;
                },
            }
        }
    }

    async fn sleep_debounce(&mut self, node_id: NodeId) {
        let ready = self.nodes.get(node_id).is_some_and(|node| {
            node.ready_for_sleep(Instant::now().into_std(), SLEEP_DEBOUNCE)
        });
        if !ready || self.scheduler.has_work_for(node_id) {
            return;
        }

        tracing::debug!(%node_id, "releasing node to sleep");
        let command = Command::new(cc::WAKE_UP, WAKE_UP_NO_MORE_INFORMATION, node_id, vec![]);
        let id = self.allocate_transaction_id();
        self.pending.insert(
            id,
            Pending {
                reply: None,
                node_id: Some(node_id),
                change_node_status: false,
                mark_asleep_on_success: true,
            },
        );
        let message =
            Message::send_data(node_id, &command.encode_to_vec(), tx_options::DEFAULT, 0);
        let transaction =
            Transaction::new(id, Priority::WakeUp, message).with_tag("no-more-info");
        let actions = self.scheduler.enqueue(transaction);
        self.execute_scheduler_actions(actions).await;
    }

    // Scheduler actions

    /// Execute scheduler actions. Settling a transaction can trigger
    /// further reductions (node demotion, sleep parking) whose actions
    /// feed back into the same work queue, so this is a loop rather than
    /// recursion.
    async fn execute_scheduler_actions(&mut self, actions: Vec<SchedulerAction>) {
        let mut queue = actions;
        while !queue.is_empty() {
            let mut follow_ups = Vec::new();
            for action in queue {
                match action {
                    SchedulerAction::Write(frame) => match frame.encode_to_vec() {
                        Ok(bytes) => {
                            if let Err(error) = self.transport.write_all(&bytes).await {
                                tracing::warn!(%error, "serial write failed");
                            }
                        },
                        Err(error) => tracing::error!(%error, "unencodable frame"),
                    },
                    SchedulerAction::SetTimer { kind, after } => {
                        self.timers.arm(Instant::now() + after, TimerEvent::Scheduler(kind));
                    },
                    SchedulerAction::ClearTimer(kind) => {
                        self.timers.cancel(&TimerEvent::Scheduler(kind));
                    },
                    SchedulerAction::Resolve { id, result } => {
                        self.timers.cancel(&TimerEvent::Expire(id));
                        if let Some(pending) = self.pending.remove(&id) {
                            if let Some(node_id) = pending.node_id {
                                follow_ups.extend(
                                    self.note_send_success(
                                        node_id,
                                        pending.mark_asleep_on_success,
                                    ),
                                );
                            }
                            if let Some(reply) = pending.reply {
                                let _ = reply.send(Ok(result));
                            }
                        }
                    },
                    SchedulerAction::Reject { id, error } => {
                        self.timers.cancel(&TimerEvent::Expire(id));
                        if let Some(pending) = self.pending.remove(&id) {
                            if error.is_node_failure() && pending.change_node_status {
                                if let Some(node_id) = pending.node_id {
                                    follow_ups.extend(self.demote_node(node_id));
                                }
                            }
                            if let Some(reply) = pending.reply {
                                let _ = reply.send(Err(error.into()));
                            }
                        }
                        // The scheduler held off dequeueing so the
                        // rejection could park the node's backlog first.
                        follow_ups.extend(self.scheduler.continue_sending());
                    },
                    SchedulerAction::EnteredPause => {
                        self.entered_pause = true;
                    },
                }
            }
            queue = follow_ups;
        }
    }

    fn note_send_success(&mut self, node_id: NodeId, mark_asleep: bool) -> Vec<SchedulerAction> {
        let now = Instant::now();
        let can_sleep = {
            let node = self.nodes.get_or_insert(node_id);
            node.last_activity = Some(now.into_std());
            if mark_asleep {
                node.status = NodeStatus::Asleep;
            }
            node.can_sleep
        };
        if mark_asleep {
            // The node was just released to sleep; park what remains.
            let mut actions = self.scheduler.set_node_blocked(node_id, true);
            actions.extend(self.sleep_reduce(node_id));
            actions
        } else {
            if can_sleep {
                self.timers.arm(now + SLEEP_DEBOUNCE, TimerEvent::SleepDebounce(node_id));
            }
            Vec::new()
        }
    }

    fn demote_node(&mut self, node_id: NodeId) -> Vec<SchedulerAction> {
        let status = match self.nodes.get_mut(node_id) {
            Some(node) => {
                let status = node.status_on_timeout();
                node.status = status;
                status
            },
            None => return Vec::new(),
        };
        tracing::info!(%node_id, ?status, "node failed to answer");

        match status {
            NodeStatus::Asleep => {
                let mut actions = self.scheduler.set_node_blocked(node_id, true);
                actions.extend(self.sleep_reduce(node_id));
                actions
            },
            _ => {
                // Dead: everything still queued for it is undeliverable.
                self.scheduler.reduce(&move |transaction: &Transaction| {
                    if transaction.node_id() == Some(node_id) {
                        Reduction::Reject(SchedulerErrorKind::Dropped)
                    } else {
                        Reduction::Keep
                    }
                })
            },
        }
    }

    /// Park a sleeping node's traffic: probes and reply-path messages are
    /// pointless now and drop; interview traffic is retagged; the rest
    /// moves to the WakeUp band in order.
    fn sleep_reduce(&mut self, node_id: NodeId) -> Vec<SchedulerAction> {
        self.scheduler.reduce(&move |transaction: &Transaction| {
            if transaction.node_id() != Some(node_id) {
                return Reduction::Keep;
            }
            if transaction.tag == Some("no-more-info") {
                return Reduction::Drop;
            }
            match transaction.priority {
                Priority::Ping | Priority::Nonce | Priority::Supervision => Reduction::Drop,
                Priority::NodeQuery => {
                    Reduction::Requeue { priority: Priority::WakeUp, tag: Some("interview") }
                },
                _ => Reduction::Requeue { priority: Priority::WakeUp, tag: None },
            }
        })
    }

    /// A sleeping node spoke: restore its parked traffic to its original
    /// band (jumping ahead of everything still waiting at WakeUp) and
    /// drop pings that are now moot.
    fn wake_reduce(&mut self, node_id: NodeId) -> Vec<SchedulerAction> {
        let mut actions = self.scheduler.set_node_blocked(node_id, false);
        actions.extend(self.scheduler.reduce(&move |transaction: &Transaction| {
            if transaction.node_id() != Some(node_id)
                || transaction.priority != Priority::WakeUp
            {
                return Reduction::Keep;
            }
            if transaction.tag == Some("ping") {
                return Reduction::Drop;
            }
            Reduction::Requeue { priority: transaction.original_priority, tag: None }
        }));
        actions
    }

    // Dispatch actions

    async fn execute_dispatch_actions(&mut self, actions: Vec<DispatchAction>) {
        for action in actions {
            match action {
                DispatchAction::NodeCommand { node_id, command } => {
                    // Pending wait_for_command awaiters claim the command
                    // before it reaches the application; first match wins.
                    if let Some(position) = self
                        .command_awaiters
                        .iter()
                        .position(|awaiter| (awaiter.matcher)(&command))
                    {
                        let awaiter = self.command_awaiters.remove(position);
                        self.timers.cancel(&TimerEvent::CommandAwaiter(awaiter.id));
                        let _ = awaiter.reply.send(Ok(command));
                    } else {
                        let _ = self.events.send(DriverEvent::NodeCommand { node_id, command });
                    }
                },
                DispatchAction::SupervisionUpdate(update) => {
                    let _ = self.events.send(DriverEvent::Supervision(update));
                },
                DispatchAction::SendSupervisionReport { node_id, session_id, flags } => {
                    self.send_supervision_report(node_id, session_id, flags).await;
                },
                DispatchAction::SendCommand { command, priority } => {
                    self.enqueue_plain_command(command, priority, None).await;
                },
                DispatchAction::SendS0NonceReport { node_id } => {
                    let Some(s0) = self.security.s0.as_mut() else {
                        continue;
                    };
                    let nonce = s0.issue_nonce(Instant::now().into_std());
                    let command = Command::new(
                        cc::SECURITY,
                        zwire_core::security::s0::NONCE_REPORT,
                        node_id,
                        nonce.to_vec(),
                    );
                    self.enqueue_plain_command(command, Priority::Nonce, None).await;
                },
                DispatchAction::SendS2NonceReport { node_id } => {
                    let Some(s2) = self.security.s2.as_mut() else {
                        continue;
                    };
                    let payload = s2.build_nonce_report(node_id);
                    let command = Command::new(
                        cc::SECURITY_2,
                        zwire_core::security::s2::NONCE_REPORT,
                        node_id,
                        payload,
                    );
                    self.enqueue_plain_command(command, Priority::Nonce, None).await;
                },
                DispatchAction::S0NonceStored { node_id }
                | DispatchAction::S2NonceReported { node_id } => {
                    self.retry_blocked_sends(node_id).await;
                },
                DispatchAction::AbortBootstrap { node_id, reason } => {
                    if let Some(s2) = self.security.s2.as_mut() {
                        s2.clear_bootstrap_key();
                        s2.purge_node(node_id);
                    }
                    let kex_fail = Command::new(
                        cc::SECURITY_2,
                        zwire_core::security::s2::KEX_FAIL,
                        node_id,
                        vec![reason as u8],
                    );
                    self.enqueue_plain_command(kex_fail, Priority::Handshake, None).await;
                    if let Some(callbacks) = &self.options.inclusion_user_callbacks {
                        (callbacks.abort)();
                    }
                    let _ = self.events.send(DriverEvent::BootstrapAborted { node_id });
                },
                DispatchAction::RemoveNode { node_id } => self.remove_node(node_id).await,
                DispatchAction::NodeAwoke { node_id } => {
                    let actions = self.wake_reduce(node_id);
                    self.execute_scheduler_actions(actions).await;
                },
                DispatchAction::NodeRevived { node_id } => {
                    let _ = self.events.send(DriverEvent::NodeRevived { node_id });
                },
                DispatchAction::Persist { file, record } => {
                    if let Err(error) = self.storage.append(file, record) {
                        tracing::error!(%error, "cache append failed");
                    }
                    let window = self.options.storage.throttle.window();
                    if window.is_zero() {
                        if let Err(error) = self.storage.flush() {
                            let _ = self
                                .events
                                .send(DriverEvent::Error(format!("cache flush failed: {error}")));
                        }
                    } else if self.storage.dirty() {
                        self.timers.arm(Instant::now() + window, TimerEvent::StorageFlush);
                    }
                },
                DispatchAction::SetTransportTimer { node_id, session_id, after } => {
                    self.timers
                        .arm(Instant::now() + after, TimerEvent::Transport(node_id, session_id));
                },
                DispatchAction::ClearTransportTimer { node_id, session_id } => {
                    self.timers.cancel(&TimerEvent::Transport(node_id, session_id));
                },
                DispatchAction::HandleRequest { message } => self.run_request_handlers(message),
                DispatchAction::TransportSenderFrame { node_id, frame } => {
                    self.service_transport_tx(node_id, frame).await;
                },
            }
        }
    }

    fn run_request_handlers(&mut self, message: Message) {
        let mut handled_at = None;
        for (index, (function, _, handler)) in self.request_handlers.iter_mut().enumerate() {
            if *function == message.function && handler(&message) {
                handled_at = Some(index);
                break;
            }
        }
        match handled_at {
            Some(index) => {
                if self.request_handlers[index].1 {
                    self.request_handlers.remove(index);
                }
            },
            None => {
                let _ = self.events.send(DriverEvent::Unhandled(message));
            },
        }
    }

    async fn service_transport_tx(&mut self, node_id: NodeId, frame: TsFrame) {
        match frame {
            TsFrame::SegmentRequest { offset, .. } => {
                let segment = self
                    .ts_sessions
                    .get(&node_id)
                    .and_then(|session| session.segment_at(offset));
                match segment {
                    Some(segment) => {
                        let command = segment.to_command(node_id);
                        self.enqueue_plain_command(command, Priority::Supervision, None).await;
                    },
                    None => tracing::debug!(%node_id, offset, "segment request for unknown session"),
                }
            },
            TsFrame::SegmentComplete { .. } => {
                self.ts_sessions.remove(&node_id);
            },
            TsFrame::SegmentWait { pending } => {
                tracing::debug!(%node_id, pending, "peer asks us to back off");
            },
            _ => {},
        }
    }

    async fn send_supervision_report(
        &mut self,
        node_id: NodeId,
        session_id: u8,
        flags: EncapsulationFlags,
    ) {
        let report = supervision::report(
            node_id,
            session_id,
            supervision::SupervisionStatus::Success,
            false,
        );

        // Mirror the sender's envelopes so the reply clears their stack.
        let scheme = if flags.contains(EncapsulationFlags::SECURITY) {
            self.scheme_for_node(node_id)
        } else {
            SecurityScheme::None
        };
        let profile = WrapProfile {
            own_node_id: self.own_node_id,
            supervision: None,
            scheme,
            crc16: flags.contains(EncapsulationFlags::CRC16),
        };

        match encap::encapsulate(
            report,
            &profile,
            &mut self.security,
            Instant::now().into_std(),
        ) {
            Ok(wrapped) => {
                self.enqueue_plain_command(wrapped, Priority::Supervision, None).await;
            },
            Err(error) => {
                tracing::warn!(%node_id, %error, "cannot build supervision report");
            },
        }
    }

    // Sending

    async fn handle_command(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::SendMessage { message, options, reply } => {
                let id = self.allocate_transaction_id();
                self.pending.insert(
                    id,
                    Pending {
                        reply: Some(reply),
                        node_id: message.node_id,
                        change_node_status: true,
                        mark_asleep_on_success: false,
                    },
                );
                let mut transaction = Transaction::new(id, options.priority, message);
                if let Some(tag) = options.tag {
                    transaction = transaction.with_tag(tag);
                }
                if let Some(expire) = options.expire {
                    transaction =
                        transaction.with_expiry(Instant::now().into_std() + expire);
                    self.timers.arm(Instant::now() + expire, TimerEvent::Expire(id));
                }
                let actions = self.scheduler.enqueue(transaction);
                self.execute_scheduler_actions(actions).await;
            },
            DriverCommand::SendCommand { command, options, reply } => {
                self.do_send_command(command, options, Some(reply)).await;
            },
            DriverCommand::WaitFor { matcher, timeout, reply } => {
                self.next_awaiter_id += 1;
                let id = self.next_awaiter_id;
                self.awaiters.push(Awaiter { id, matcher, reply });
                self.timers.arm(Instant::now() + timeout, TimerEvent::Awaiter(id));
            },
            DriverCommand::WaitForCommand { matcher, timeout, reply } => {
                self.next_awaiter_id += 1;
                let id = self.next_awaiter_id;
                self.command_awaiters.push(CommandAwaiter { id, matcher, reply });
                self.timers.arm(Instant::now() + timeout, TimerEvent::CommandAwaiter(id));
            },
            DriverCommand::CancelInterview { node_id, reply } => {
                let actions = self.scheduler.reduce(&move |transaction: &Transaction| {
                    if transaction.node_id() == Some(node_id)
                        && transaction.tag == Some("interview")
                    {
                        Reduction::Reject(SchedulerErrorKind::InterviewRestarted)
                    } else {
                        Reduction::Keep
                    }
                });
                self.execute_scheduler_actions(actions).await;
                let _ = reply.send(());
            },
            DriverCommand::RegisterRequestHandler { function, once, handler } => {
                self.request_handlers.push((function, once, handler));
            },
            DriverCommand::SetBootstrapKey { key, reply } => {
                if let Some(s2) = self.security.s2.as_mut() {
                    match key {
                        Some(key) => s2.set_bootstrap_key(key),
                        None => s2.clear_bootstrap_key(),
                    }
                } else {
                    tracing::warn!("bootstrap key set without S2 keys configured");
                }
                let _ = reply.send(());
            },
            DriverCommand::ConfigureNode { node, reply } => {
                let node_id = node.id;
                let asleep = node.status == NodeStatus::Asleep;
                self.persist_node_record(&node);
                self.nodes.insert(node);
                let actions = self.scheduler.set_node_blocked(node_id, asleep);
                self.execute_scheduler_actions(actions).await;
                let _ = reply.send(());
            },
            DriverCommand::RemoveNode { node_id, reply } => {
                self.remove_node(node_id).await;
                let _ = reply.send(());
            },
            DriverCommand::Destroy { .. } => unreachable!("handled by the run loop"),
        }
    }

    async fn do_send_command(
        &mut self,
        command: Command,
        options: SendOptions,
        reply: Option<SendReply>,
    ) {
        let node_id = command.node_id;
        let now = Instant::now().into_std();

        // Supervision applies when the caller asked for it or the node is
        // known to support it; CRC-16 likewise derives from capability.
        let supervision_supported = self
            .nodes
            .get(node_id)
            .is_some_and(|node| node.cc_versions.contains_key(&cc::SUPERVISION));
        let supervision =
            (options.supervision || supervision_supported).then(|| SupervisionRequest {
                session_id: self.sessions.open(node_id, now),
                request_updates: false,
            });
        let scheme = self.scheme_for_node(node_id);
        let crc16 = self
            .nodes
            .get(node_id)
            .is_some_and(|node| node.cc_versions.contains_key(&cc::CRC16));
        let profile =
            WrapProfile { own_node_id: self.own_node_id, supervision, scheme, crc16 };

        let wrapped = match encap::encapsulate(command.clone(), &profile, &mut self.security, now)
        {
            Ok(wrapped) => wrapped,
            Err(EncapError::Security(SecurityError::NoNonce { .. })) => {
                self.begin_s0_handshake(node_id, command, options, reply).await;
                return;
            },
            Err(EncapError::Security(SecurityError::NoSpan { .. })) => {
                self.begin_s2_handshake(node_id, command, options, reply).await;
                return;
            },
            Err(error) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(match error {
                        EncapError::Security(error) => error.into(),
                        other => DriverError::Failed(other.to_string()),
                    }));
                }
                return;
            },
        };

        let pdu = wrapped.encode_to_vec();
        let priority = self.effective_priority(node_id, options.priority);
        let id = self.allocate_transaction_id();
        self.pending.insert(
            id,
            Pending {
                reply,
                node_id: Some(node_id),
                change_node_status: true,
                mark_asleep_on_success: false,
            },
        );

        let mut transaction = if pdu.len() > RADIO_MTU {
            self.build_fragmented_transaction(id, node_id, priority, pdu)
        } else {
            let message = Message::send_data(node_id, &pdu, tx_options::DEFAULT, 0);
            Transaction::new(id, priority, message)
        };

        if let Some(tag) = options.tag {
            transaction = transaction.with_tag(tag);
        }
        if let Some(expire) = options.expire {
            transaction = transaction.with_expiry(now + expire);
            self.timers.arm(Instant::now() + expire, TimerEvent::Expire(id));
        }

        let actions = self.scheduler.enqueue(transaction);
        self.execute_scheduler_actions(actions).await;
    }

    /// Oversized PDUs ride Transport Service: the transaction's parts
    /// generator walks the segments, and the TX session is retained to
    /// answer segment requests.
    fn build_fragmented_transaction(
        &mut self,
        id: TransactionId,
        node_id: NodeId,
        priority: Priority,
        pdu: Vec<u8>,
    ) -> Transaction {
        self.next_ts_session = (self.next_ts_session + 1) & 0x0F;
        let session = TransportServiceTx::new(
            self.next_ts_session,
            bytes::Bytes::from(pdu),
            FRAGMENT_SIZE,
        )
        .expect("PDU length bounded by encapsulation limits");

        let mut segments: std::collections::VecDeque<Message> = session
            .segments()
            .into_iter()
            .map(|segment| {
                Message::send_data(
                    node_id,
                    &segment.to_command(node_id).encode_to_vec(),
                    tx_options::DEFAULT,
                    0,
                )
            })
            .collect();
        self.ts_sessions.insert(node_id, session);

        let head = segments.pop_front().expect("a datagram has at least one segment");
        Transaction::new(id, priority, head).with_parts(Box::new(
            move |_previous: Option<&Message>| segments.pop_front(),
        ))
    }

    async fn begin_s0_handshake(
        &mut self,
        node_id: NodeId,
        command: Command,
        options: SendOptions,
        reply: Option<SendReply>,
    ) {
        tracing::debug!(%node_id, "S0 nonce handshake before secure send");
        self.blocked_secure.push(BlockedSend { node_id, command, options, reply });
        let nonce_get =
            Command::new(cc::SECURITY, zwire_core::security::s0::NONCE_GET, node_id, vec![]);
        self.enqueue_plain_command(nonce_get, Priority::PreTransmitHandshake, Some("nonce-get"))
            .await;
    }

    async fn begin_s2_handshake(
        &mut self,
        node_id: NodeId,
        command: Command,
        options: SendOptions,
        reply: Option<SendReply>,
    ) {
        tracing::debug!(%node_id, "S2 nonce handshake before secure send");
        self.blocked_secure.push(BlockedSend { node_id, command, options, reply });
        let payload = match self.security.s2.as_mut() {
            Some(s2) => s2.nonce_get(),
            None => return,
        };
        let nonce_get =
            Command::new(cc::SECURITY_2, zwire_core::security::s2::NONCE_GET, node_id, payload);
        self.enqueue_plain_command(nonce_get, Priority::PreTransmitHandshake, Some("nonce-get"))
            .await;
    }

    async fn retry_blocked_sends(&mut self, node_id: NodeId) {
        let blocked: Vec<BlockedSend> = {
            let (matching, rest): (Vec<_>, Vec<_>) = self
                .blocked_secure
                .drain(..)
                .partition(|blocked| blocked.node_id == node_id);
            self.blocked_secure = rest;
            matching
        };
        for send in blocked {
            self.do_send_command(send.command, send.options, send.reply).await;
        }
    }

    /// Queue a command as-is (no encapsulation): nonce plumbing,
    /// transport-service frames, already-wrapped replies.
    async fn enqueue_plain_command(
        &mut self,
        command: Command,
        priority: Priority,
        tag: Option<&'static str>,
    ) {
        let node_id = command.node_id;
        let message =
            Message::send_data(node_id, &command.encode_to_vec(), tx_options::DEFAULT, 0);
        let id = self.allocate_transaction_id();
        self.pending.insert(
            id,
            Pending {
                reply: None,
                node_id: Some(node_id),
                change_node_status: false,
                mark_asleep_on_success: false,
            },
        );
        let mut transaction = Transaction::new(id, priority, message);
        if let Some(tag) = tag {
            transaction = transaction.with_tag(tag);
        }
        let actions = self.scheduler.enqueue(transaction);
        self.execute_scheduler_actions(actions).await;
    }

    fn scheme_for_node(&self, node_id: NodeId) -> SecurityScheme {
        let bootstrap = self.security.s2.as_ref().is_some_and(|s2| s2.has_bootstrap_key());
        let class = self.nodes.get(node_id).and_then(|node| node.highest_security_class);
        scheme_for(class, bootstrap)
    }

    fn effective_priority(&self, node_id: NodeId, requested: Priority) -> Priority {
        let asleep = self
            .nodes
            .get(node_id)
            .is_some_and(|node| node.status == NodeStatus::Asleep && node.can_sleep);
        if asleep && requested == Priority::Normal { Priority::WakeUp } else { requested }
    }

    // Node removal and shutdown

    async fn remove_node(&mut self, node_id: NodeId) {
        tracing::info!(%node_id, "removing node");
        let actions = self.scheduler.reduce(&move |transaction: &Transaction| {
            if transaction.node_id() == Some(node_id) {
                Reduction::Reject(SchedulerErrorKind::NodeRemoved)
            } else {
                Reduction::Keep
            }
        });
        self.execute_scheduler_actions(actions).await;
        // Nothing of the node's remains queued; drop the parking flag too.
        let unblock = self.scheduler.set_node_blocked(node_id, false);
        self.execute_scheduler_actions(unblock).await;

        self.nodes.remove(node_id);
        if let Err(error) = self.storage.append(
            CacheFile::Network,
            CacheRecord::new(format!("node.{}", node_id.0), serde_json::Value::Null),
        ) {
            tracing::error!(%error, "cannot persist node removal");
        }
        self.security.purge_node(node_id);
        self.sessions.purge_node(node_id);
        self.dispatcher.purge_node(node_id);
        self.ts_sessions.remove(&node_id);
        self.blocked_secure.retain(|blocked| blocked.node_id != node_id);
        self.timers.cancel_if(|event| {
            matches!(event, TimerEvent::SleepDebounce(id) | TimerEvent::Transport(id, _) if *id == node_id)
        });

        let _ = self.events.send(DriverEvent::NodeRemoved { node_id });
    }

    async fn shutdown(&mut self) {
        tracing::info!("driver shutting down");
        self.destroyed = true;

        // Scheduler first: settle everything still queued or in flight.
        let actions = self.scheduler.reduce(&|_: &Transaction| {
            Reduction::Reject(SchedulerErrorKind::Dropped)
        });
        for action in actions {
            if let SchedulerAction::Reject { id, .. } | SchedulerAction::Resolve { id, .. } =
                action
            {
                if let Some(pending) = self.pending.remove(&id) {
                    if let Some(reply) = pending.reply {
                        let _ = reply.send(Err(DriverError::Destroyed));
                    }
                }
            }
        }
        for pending in std::mem::take(&mut self.pending).into_values() {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(DriverError::Destroyed));
            }
        }
        for awaiter in std::mem::take(&mut self.awaiters) {
            let _ = awaiter.reply.send(Err(DriverError::Destroyed));
        }
        for awaiter in std::mem::take(&mut self.command_awaiters) {
            let _ = awaiter.reply.send(Err(DriverError::Destroyed));
        }

        // Then persistence, before the port goes away.
        if let Err(error) = self.storage.flush() {
            tracing::error!(%error, "final cache flush failed");
        }
        self.release_lock();
    }

    fn persist_node_record(&mut self, node: &zwire_core::node::Node) {
        let record = match serde_json::to_value(node) {
            Ok(value) => CacheRecord::new(format!("node.{}", node.id.0), value),
            Err(error) => {
                tracing::error!(%error, "cannot serialize node record");
                return;
            },
        };
        if let Err(error) = self.storage.append(CacheFile::Network, record) {
            tracing::error!(%error, "cannot persist node record");
        }
        let window = self.options.storage.throttle.window();
        if window.is_zero() {
            let _ = self.storage.flush();
        } else if self.storage.dirty() {
            self.timers.arm(Instant::now() + window, TimerEvent::StorageFlush);
        }
    }

    fn allocate_transaction_id(&mut self) -> TransactionId {
        self.next_transaction_id += 1;
        TransactionId(self.next_transaction_id)
    }

    async fn write_control(&mut self, control: ControlByte) {
        if let Err(error) = self.transport.write_all(&[control as u8]).await {
            tracing::warn!(%error, "failed to write control byte");
        }
    }

    fn release_lock(&mut self) {
        if let Some(path) = self.lock_file.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Take the single-instance lock. The lock directory defaults to the
/// cache directory; with neither configured the driver runs unlocked.
fn acquire_lock(options: &DriverOptions) -> Result<Option<PathBuf>, DriverError> {
    let dir = options
        .lock_directory
        .clone()
        .or_else(|| options.storage.cache_dir.clone());
    let Some(dir) = dir else {
        return Ok(None);
    };

    std::fs::create_dir_all(&dir)
        .map_err(|error| DriverError::Failed(format!("cannot create lock directory: {error}")))?;
    let path = dir.join("zwire.lock");
    match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(_) => Ok(Some(path)),
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => Err(DriverError::Failed(
            format!("another instance owns {}", path.display()),
        )),
        Err(error) => Err(DriverError::Failed(format!("cannot take lock: {error}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = DriverOptions::default();
        options.lock_directory = Some(dir.path().to_path_buf());

        let first = acquire_lock(&options).unwrap();
        assert!(first.is_some());
        assert!(matches!(acquire_lock(&options), Err(DriverError::Failed(_))));

        std::fs::remove_file(first.unwrap()).unwrap();
        assert!(acquire_lock(&options).unwrap().is_some());
    }

    #[test]
    fn timers_replace_by_identity() {
        let mut timers = Timers::default();
        let now = Instant::now();
        timers.arm(now + Duration::from_millis(100), TimerEvent::Scheduler(TimerKind::Ack));
        timers.arm(now + Duration::from_millis(200), TimerEvent::Scheduler(TimerKind::Ack));
        assert_eq!(timers.entries.len(), 1);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(200)));

        timers.arm(now + Duration::from_millis(50), TimerEvent::InterByte);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(50)));

        let due = timers.take_due(now + Duration::from_millis(60));
        assert_eq!(due, vec![TimerEvent::InterByte]);
        assert_eq!(timers.entries.len(), 1);
    }

}
