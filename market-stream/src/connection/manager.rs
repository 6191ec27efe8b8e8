//! Tokio driver for the connection state machine.
//!
//! A [`ConnectionManager`] is a cheap handle: every operation is a message to one driver task
//! that owns the [`ConnectionMachine`], the live socket, the reconnect sleep and the heartbeat
//! interval. The driver feeds commands, socket callbacks, probe verdicts and timer ticks through
//! the machine one at a time and executes the resulting [`Effect`]s.

use super::machine::{ConnectionMachine, Effect, Event, Generation, StatusChange};
use super::socket::{Inbound, Outbound, SocketTask};
use super::state::ConnectionState;
use crate::config::StreamConfig;
use crate::dispatcher::MessageDispatcher;
use crate::error::StreamError;
use crate::probe::{AvailabilityCache, BackendProbe};
use crate::reconnect::ReconnectPolicy;
use crate::store::SharedStore;
use crate::types::{ControlFrame, Symbol};
use parking_lot::Mutex;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long `disconnect()` waits for a closing socket task before giving up on it.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect(oneshot::Sender<()>),
    Retry,
}

type OutboundSlot = Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>>;

/// Handle to a managed market data connection.
///
/// Must be created inside a tokio runtime. Dropping the handle cancels the driver and any live
/// socket.
#[derive(Debug)]
pub struct ConnectionManager {
    config: StreamConfig,
    store: SharedStore,
    commands: mpsc::UnboundedSender<Command>,
    outbound: OutboundSlot,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager with a private availability cache. Connects immediately when
    /// `config.auto_connect` is set.
    ///
    /// Probe verdicts are not shared with any other manager; use [`Self::with_cache`] for that.
    pub fn new(config: StreamConfig, store: SharedStore) -> Self {
        let cache = AvailabilityCache::shared(config.probe_cache_ttl);
        Self::with_cache(config, store, cache)
    }

    /// Create a manager whose probe reads and writes `cache`, so managers pointing at the same
    /// backend reuse one health check verdict.
    pub fn with_cache(
        config: StreamConfig,
        store: SharedStore,
        cache: Arc<AvailabilityCache>,
    ) -> Self {
        let probe = BackendProbe::from_config(&config, cache);
        Self::with_probe(config, store, probe)
    }

    /// Create a manager using `probe`.
    ///
    /// Values the driver cannot run with are replaced first, see [`StreamConfig::sanitized`].
    pub fn with_probe(config: StreamConfig, store: SharedStore, probe: BackendProbe) -> Self {
        let config = config.sanitized();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let outbound = OutboundSlot::default();
        let shutdown = CancellationToken::new();

        let driver = Driver {
            machine: ConnectionMachine::new(
                ReconnectPolicy::from(&config),
                config.reconnect_on_error,
                config.probe_backend,
            ),
            config: config.clone(),
            store: store.clone(),
            dispatcher: MessageDispatcher::new(store.clone()),
            probe,
            commands: command_rx,
            inbound_tx,
            inbound_rx,
            state_tx,
            outbound: Arc::clone(&outbound),
            socket: None,
            closing: Vec::new(),
            probe_task: None,
            reconnect: None,
            heartbeat: None,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(driver.run());

        let manager = Self {
            config,
            store,
            commands: command_tx,
            outbound,
            state: state_rx,
            shutdown,
        };

        if manager.config.auto_connect {
            manager.connect();
        }
        manager
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `predicate`, returning the matching state.
    pub async fn wait_for<F>(&self, predicate: F) -> ConnectionState
    where
        F: Fn(ConnectionState) -> bool,
    {
        let mut receiver = self.state.clone();
        receiver
            .wait_for(|state| predicate(*state))
            .await
            .map(|state| *state)
            .unwrap_or_else(|_| self.state())
    }

    /// Start connecting. No-op unless the manager is idle or closed.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Leave degraded mode: clear the attempt counter and availability cache, then connect.
    pub fn retry_connection(&self) {
        self.command(Command::Retry);
    }

    /// Manually close the connection. Resolves once timers are cancelled, the socket has been
    /// closed and the store's connection flags are reset. A degraded verdict survives, so a
    /// later `connect()` stays a no-op until [`Self::retry_connection`].
    pub async fn disconnect(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command(Command::Disconnect(ack_tx));
        let _ = ack_rx.await;
    }

    /// Serialise `payload` as JSON and send it. Returns `false` unless the socket is open.
    pub fn send<T>(&self, payload: &T) -> bool
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_string(payload) {
            Ok(text) => self.send_text(text),
            Err(error) => {
                let error = StreamError::from(error);
                warn!(%error, "dropping outbound frame");
                false
            }
        }
    }

    pub fn subscribe_symbols<I, S>(&self, symbols: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        self.send(&ControlFrame::Subscribe {
            symbols: symbols.into_iter().map(Into::into).collect(),
        })
    }

    pub fn unsubscribe_symbols<I, S>(&self, symbols: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        self.send(&ControlFrame::Unsubscribe {
            symbols: symbols.into_iter().map(Into::into).collect(),
        })
    }

    fn send_text(&self, text: String) -> bool {
        match self.outbound.lock().as_ref() {
            Some(outbound) => outbound.send(Outbound::Text(text)).is_ok(),
            None => {
                debug!(state = %self.state(), "not connected, outbound frame dropped");
                false
            }
        }
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("connection driver stopped, command ignored");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug)]
struct SocketHandle {
    generation: Generation,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct ReconnectTimer {
    generation: Generation,
    sleep: Pin<Box<Sleep>>,
}

struct Driver {
    config: StreamConfig,
    machine: ConnectionMachine,
    store: SharedStore,
    dispatcher: MessageDispatcher,
    probe: BackendProbe,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    state_tx: watch::Sender<ConnectionState>,
    outbound: OutboundSlot,
    socket: Option<SocketHandle>,
    closing: Vec<JoinHandle<()>>,
    probe_task: Option<JoinHandle<()>>,
    reconnect: Option<ReconnectTimer>,
    heartbeat: Option<Interval>,
    shutdown: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        debug!(url = %self.config.url, "connection driver started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Connect) => self.apply(Event::Connect),
                    Some(Command::Retry) => {
                        info!(url = %self.config.url, "retrying market data connection");
                        self.apply(Event::Retry);
                    }
                    Some(Command::Disconnect(ack)) => {
                        self.apply(Event::Disconnect);
                        self.await_closing().await;
                        let _ = ack.send(());
                    }
                    None => break,
                },
                Some(inbound) = self.inbound_rx.recv() => match inbound {
                    Inbound::Machine(event) => self.apply(event),
                    Inbound::Frame { generation, text } => self.dispatch(generation, &text),
                },
                generation = reconnect_due(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.apply(Event::ReconnectTimerFired { generation });
                }
                _ = heartbeat_tick(&mut self.heartbeat) => self.apply(Event::HeartbeatTick),
            }
        }

        self.shutdown_all();
        debug!(url = %self.config.url, "connection driver stopped");
    }

    fn apply(&mut self, event: Event) {
        for effect in self.machine.handle(event) {
            self.execute(effect);
        }
        self.publish();
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::StartProbe { generation } => self.start_probe(generation),
            Effect::CancelProbe => {
                if let Some(task) = self.probe_task.take() {
                    task.abort();
                }
            }
            Effect::OpenSocket { generation } => self.open_socket(generation),
            Effect::CloseSocket => self.close_socket(),
            Effect::StartHeartbeat => {
                let period = self.config.heartbeat_interval;
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(interval);
            }
            Effect::StopHeartbeat => self.heartbeat = None,
            Effect::ArmReconnect { generation, delay } => {
                info!(
                    url = %self.config.url,
                    attempt = self.machine.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling market data reconnect"
                );
                self.reconnect = Some(ReconnectTimer {
                    generation,
                    sleep: Box::pin(tokio::time::sleep(delay)),
                });
            }
            Effect::CancelReconnect => self.reconnect = None,
            Effect::SendPing => {
                if let Some(socket) = &self.socket {
                    match serde_json::to_string(&ControlFrame::Ping) {
                        Ok(ping) => {
                            let _ = socket.outbound.send(Outbound::Text(ping));
                        }
                        Err(error) => warn!(%error, "failed to encode heartbeat"),
                    }
                    let _ = socket.outbound.send(Outbound::Ping);
                }
            }
            Effect::ReplaySubscriptions => self.replay_subscriptions(),
            Effect::ResetProbeCache => self.probe.reset(),
            Effect::Status(change) => self.record_status(change),
        }
    }

    fn start_probe(&mut self, generation: Generation) {
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }

        let probe = self.probe.clone();
        let url = self.config.url.clone();
        let inbound = self.inbound_tx.clone();
        debug!(%url, generation, "probing market data backend");

        self.probe_task = Some(tokio::spawn(async move {
            let available = probe.check_available(&url).await;
            let _ = inbound.send(Inbound::Machine(Event::ProbeCompleted {
                generation,
                available,
            }));
        }));
    }

    fn open_socket(&mut self, generation: Generation) {
        self.close_socket();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();
        let task = SocketTask {
            generation,
            url: self.config.url.clone(),
            idle_timeout: self.config.idle_timeout,
            inbound: self.inbound_tx.clone(),
            outbound: outbound_rx,
            cancel: cancel.clone(),
        };

        info!(url = %self.config.url, generation, "connecting to market data stream");
        self.socket = Some(SocketHandle {
            generation,
            outbound: outbound_tx,
            cancel,
            task: tokio::spawn(task.run()),
        });
    }

    fn close_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            debug!(generation = socket.generation, "closing market data socket");
            socket.cancel.cancel();
            self.closing.push(socket.task);
        }
        self.closing.retain(|task| !task.is_finished());
        *self.outbound.lock() = None;
    }

    async fn await_closing(&mut self) {
        for task in self.closing.drain(..) {
            if tokio::time::timeout(DISCONNECT_TIMEOUT, task).await.is_err() {
                warn!("socket task did not finish closing in time");
            }
        }
    }

    fn replay_subscriptions(&mut self) {
        self.publish_outbound();

        let symbols = self.store.subscriptions();
        if symbols.is_empty() {
            return;
        }
        let Some(socket) = &self.socket else {
            return;
        };

        match serde_json::to_string(&ControlFrame::Subscribe { symbols }) {
            Ok(frame) => {
                debug!(generation = socket.generation, "replaying subscriptions");
                let _ = socket.outbound.send(Outbound::Text(frame));
            }
            Err(error) => warn!(%error, "failed to encode subscription replay"),
        }
    }

    fn dispatch(&mut self, generation: Generation, text: &str) {
        let current = self
            .socket
            .as_ref()
            .is_some_and(|socket| socket.generation == generation);
        if !current {
            debug!(generation, "dropping frame from superseded socket");
            return;
        }
        self.dispatcher.handle(text);
    }

    fn record_status(&mut self, change: StatusChange) {
        let url = &self.config.url;
        match change {
            StatusChange::Connecting => self.store.write(|store| store.mark_connecting()),
            StatusChange::Connected => {
                info!(%url, "market data stream open");
                self.store.write(|store| store.mark_connected());
            }
            StatusChange::Reconnecting { attempt } => {
                warn!(
                    %url,
                    attempt,
                    max_attempts = self.config.max_reconnect_attempts,
                    "market data stream lost, reconnecting"
                );
                self.store.write(|store| store.mark_reconnecting(attempt));
            }
            StatusChange::Degraded(fault) => {
                if self.config.silent_degraded {
                    debug!(%url, message = %fault.message, "market data stream degraded");
                } else {
                    warn!(%url, message = %fault.message, "market data stream degraded");
                }
                self.store.write(|store| store.mark_degraded(fault));
            }
            StatusChange::Failed(fault) => {
                warn!(
                    %url,
                    message = %fault.message,
                    "market data stream closed, reconnect disabled"
                );
                self.store.write(|store| {
                    store.reset_connection_status();
                    store.set_error(fault);
                });
            }
            StatusChange::RetryRequested => self.store.write(|store| store.clear_degraded()),
            StatusChange::Reset { degraded } => {
                info!(%url, degraded, "market data stream disconnected");
                self.store.write(|store| {
                    let fault = store.status().last_error.clone();
                    store.reset_connection_status();
                    if let Some(fault) = fault.filter(|_| degraded) {
                        store.mark_degraded(fault);
                    }
                });
            }
        }
    }

    fn publish(&mut self) {
        self.publish_outbound();
        let state = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Expose the live socket's sender to `send()` only while open.
    fn publish_outbound(&mut self) {
        let sender = match (&self.socket, self.machine.state()) {
            (Some(socket), ConnectionState::Open) => Some(socket.outbound.clone()),
            _ => None,
        };
        *self.outbound.lock() = sender;
    }

    fn shutdown_all(&mut self) {
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
        if let Some(socket) = self.socket.take() {
            socket.cancel.cancel();
        }
        self.reconnect = None;
        self.heartbeat = None;
        *self.outbound.lock() = None;
    }
}

async fn reconnect_due(timer: &mut Option<ReconnectTimer>) -> Generation {
    match timer {
        Some(timer) => {
            timer.sleep.as_mut().await;
            timer.generation
        }
        None => std::future::pending().await,
    }
}

async fn heartbeat_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
