//! Table-driven connection state machine.
//!
//! [`ConnectionMachine::handle`] takes one [`Event`] (a user command, a socket callback, a
//! probe verdict or a timer firing) and returns the [`Effect`]s the driver must perform. It owns
//! no sockets, timers or clocks, so every transition is testable in isolation.
//!
//! Socket, probe and timer events carry the [`Generation`] they were started under. Starting a
//! new attempt or disconnecting bumps the generation, which turns every late callback from an
//! older attempt into a no-op.

use super::state::ConnectionState;
use crate::error::StreamError;
use crate::reconnect::ReconnectPolicy;
use crate::store::{FaultKind, StreamFault};
use std::time::Duration;
use tracing::debug;

pub type Generation = u64;

pub const BACKEND_UNAVAILABLE_MESSAGE: &str =
    "Market data backend is unavailable. Running in frontend-only mode.";
pub const RETRIES_EXHAUSTED_MESSAGE: &str =
    "Market data backend is unreachable after repeated attempts. Running in frontend-only mode.";

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect,
    Disconnect,
    Retry,
    ProbeCompleted { generation: Generation, available: bool },
    SocketOpened { generation: Generation },
    SocketClosed { generation: Generation, error: StreamError },
    ReconnectTimerFired { generation: Generation },
    HeartbeatTick,
}

/// Store-visible status changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Degraded(StreamFault),
    /// Closed by failure with reconnect disabled
    Failed(StreamFault),
    /// Leaving degraded mode on an explicit retry
    RetryRequested,
    /// Manual disconnect. `degraded` keeps the calm offline state visible when the backend is
    /// still known to be unavailable.
    Reset { degraded: bool },
}

/// Work the driver performs on behalf of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StartProbe { generation: Generation },
    /// Abandon an in-flight probe
    CancelProbe,
    OpenSocket { generation: Generation },
    /// Close the live socket (if any) with a normal closure code
    CloseSocket,
    StartHeartbeat,
    StopHeartbeat,
    /// Arm the single-shot reconnect timer, replacing any pending one
    ArmReconnect { generation: Generation, delay: Duration },
    CancelReconnect,
    SendPing,
    /// Send the store's subscription set as one subscribe frame
    ReplaySubscriptions,
    ResetProbeCache,
    Status(StatusChange),
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempt: u32,
    manual_close: bool,
    /// Set on entering Degraded, cleared only by a successful open or an explicit retry
    backend_unavailable: bool,
    generation: Generation,
    policy: ReconnectPolicy,
    reconnect_on_error: bool,
    probe_backend: bool,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy, reconnect_on_error: bool, probe_backend: bool) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            manual_close: false,
            backend_unavailable: false,
            generation: 0,
            policy,
            reconnect_on_error,
            probe_backend,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of reconnects scheduled since the last successful open or manual retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn last_close_was_manual(&self) -> bool {
        self.manual_close
    }

    /// Whether `connect()` is blocked until `retry_connection()` or a successful open.
    pub fn backend_unavailable(&self) -> bool {
        self.backend_unavailable
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Connect => self.on_connect(),
            Event::Disconnect => self.on_disconnect(),
            Event::Retry => self.on_retry(),
            Event::ProbeCompleted {
                generation,
                available,
            } => self.on_probe_completed(generation, available),
            Event::SocketOpened { generation } => self.on_socket_opened(generation),
            Event::SocketClosed { generation, error } => self.on_socket_closed(generation, error),
            Event::ReconnectTimerFired { generation } => self.on_reconnect_timer(generation),
            Event::HeartbeatTick => self.on_heartbeat(),
        }
    }

    fn on_connect(&mut self) -> Vec<Effect> {
        if !self.state.accepts_connect() {
            debug!(state = %self.state, "connect ignored");
            return Vec::new();
        }
        if self.backend_unavailable {
            debug!(state = %self.state, "connect ignored, backend unavailable until retried");
            return Vec::new();
        }
        self.manual_close = false;
        self.begin_attempt()
    }

    fn on_disconnect(&mut self) -> Vec<Effect> {
        self.manual_close = true;
        self.generation += 1;
        self.transition(ConnectionState::Closed);
        vec![
            Effect::CancelProbe,
            Effect::CancelReconnect,
            Effect::StopHeartbeat,
            Effect::CloseSocket,
            Effect::Status(StatusChange::Reset {
                degraded: self.backend_unavailable,
            }),
        ]
    }

    fn on_retry(&mut self) -> Vec<Effect> {
        self.attempt = 0;
        self.backend_unavailable = false;
        self.manual_close = false;

        let mut effects = vec![
            Effect::ResetProbeCache,
            Effect::Status(StatusChange::RetryRequested),
        ];
        match self.state {
            ConnectionState::Probing | ConnectionState::Connecting | ConnectionState::Open => {
                debug!(state = %self.state, "retry while active, counters cleared only");
            }
            ConnectionState::Reconnecting => {
                effects.push(Effect::CancelReconnect);
                effects.extend(self.begin_attempt());
            }
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Degraded => {
                effects.extend(self.begin_attempt());
            }
        }
        effects
    }

    fn on_probe_completed(&mut self, generation: Generation, available: bool) -> Vec<Effect> {
        if !self.is_current(generation, ConnectionState::Probing) {
            return Vec::new();
        }
        if available {
            self.begin_connecting()
        } else {
            self.enter_degraded(BACKEND_UNAVAILABLE_MESSAGE)
        }
    }

    fn on_socket_opened(&mut self, generation: Generation) -> Vec<Effect> {
        if !self.is_current(generation, ConnectionState::Connecting) {
            return Vec::new();
        }
        self.attempt = 0;
        self.backend_unavailable = false;
        self.transition(ConnectionState::Open);
        vec![
            Effect::Status(StatusChange::Connected),
            Effect::StartHeartbeat,
            Effect::ReplaySubscriptions,
        ]
    }

    fn on_socket_closed(&mut self, generation: Generation, error: StreamError) -> Vec<Effect> {
        if generation != self.generation || !self.state.has_socket() {
            return Vec::new();
        }

        let mut effects = vec![Effect::StopHeartbeat, Effect::CloseSocket];

        if self.manual_close || !self.reconnect_on_error {
            self.transition(ConnectionState::Closed);
            effects.push(Effect::Status(StatusChange::Failed(StreamFault::new(
                FaultKind::Connection,
                error.to_string(),
            ))));
            return effects;
        }

        self.transition(ConnectionState::Reconnecting);
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if self.policy.is_exhausted(self.attempt) {
            effects.extend(self.enter_degraded(RETRIES_EXHAUSTED_MESSAGE));
            return effects;
        }

        effects.push(Effect::Status(StatusChange::Reconnecting {
            attempt: self.attempt,
        }));
        effects.push(Effect::ArmReconnect {
            generation: self.generation,
            delay,
        });
        effects
    }

    fn on_reconnect_timer(&mut self, generation: Generation) -> Vec<Effect> {
        if !self.is_current(generation, ConnectionState::Reconnecting) {
            return Vec::new();
        }
        self.begin_connecting()
    }

    fn on_heartbeat(&mut self) -> Vec<Effect> {
        if self.state.is_open() {
            vec![Effect::SendPing]
        } else {
            Vec::new()
        }
    }

    /// First step of a fresh attempt: probe when enabled, otherwise straight to the socket.
    fn begin_attempt(&mut self) -> Vec<Effect> {
        if self.probe_backend {
            self.generation += 1;
            self.transition(ConnectionState::Probing);
            vec![Effect::StartProbe {
                generation: self.generation,
            }]
        } else {
            self.begin_connecting()
        }
    }

    fn begin_connecting(&mut self) -> Vec<Effect> {
        self.generation += 1;
        self.transition(ConnectionState::Connecting);
        vec![
            Effect::Status(StatusChange::Connecting),
            Effect::OpenSocket {
                generation: self.generation,
            },
        ]
    }

    fn enter_degraded(&mut self, message: &str) -> Vec<Effect> {
        self.backend_unavailable = true;
        self.transition(ConnectionState::Degraded);
        vec![
            Effect::StopHeartbeat,
            Effect::CancelReconnect,
            Effect::Status(StatusChange::Degraded(StreamFault::backend_unavailable(
                message,
            ))),
        ]
    }

    fn is_current(&self, generation: Generation, expected: ConnectionState) -> bool {
        let current = generation == self.generation && self.state == expected;
        if !current {
            debug!(
                generation,
                current_generation = self.generation,
                state = %self.state,
                "ignoring stale connection event"
            );
        }
        current
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "connection state transition");
        }
        self.state = next;
    }
}
