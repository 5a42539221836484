//! Connection lifecycle state machine.
//!
//! Pure bookkeeping: the machine never touches a socket or a clock.
//! Each input returns the [`Action`]s its caller must carry out (open a
//! transport, arm or cancel the reconnect timer, transmit a frame).
//! Inputs from a transport attempt other than the current one are
//! ignored, which keeps at most one attempt alive.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::message::{self, ApplicationMessage};
use super::transport::ConnectionId;
use crate::backoff::Backoff;

/// Consecutive reconnects allowed before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Constructed, never started.
    Idle,
    Connecting,
    Open,
    /// Stopped, or momentarily between a close and the retry decision.
    Closed,
    /// Waiting for the reconnect timer.
    Reconnecting,
    /// Retry budget consumed. Only an explicit `start()` leaves this state.
    Exhausted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Side effects requested by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    OpenTransport(ConnectionId),
    CloseTransport(ConnectionId),
    ScheduleReconnect { timer: u64, delay: Duration },
    CancelReconnect(u64),
    Transmit { id: ConnectionId, frame: String },
}

pub struct ConnectionMachine {
    state: ConnectionState,
    backoff: Backoff,
    max_retries: u32,
    /// Reconnects scheduled since the last successful open.
    retries: u32,
    /// Attempt whose events are currently accepted.
    current: Option<ConnectionId>,
    next_connection: u64,
    pending_timer: Option<u64>,
    next_timer: u64,
}

impl ConnectionMachine {
    pub fn new(backoff: Backoff, max_retries: u32) -> Self {
        Self {
            state: ConnectionState::Idle,
            backoff,
            max_retries,
            retries: 0,
            current: None,
            next_connection: 0,
            pending_timer: None,
            next_timer: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Attempt whose events are currently accepted, if any.
    pub fn current_connection(&self) -> Option<ConnectionId> {
        self.current
    }

    /// Opens a new attempt from `Idle`, `Closed` or `Exhausted`.
    /// No-op while connecting, open or waiting to reconnect.
    pub fn start(&mut self) -> Vec<Action> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Exhausted => {
                vec![self.open_transport()]
            }
            ConnectionState::Connecting
            | ConnectionState::Open
            | ConnectionState::Reconnecting => {
                debug!("start() ignored while {}", self.state);
                vec![]
            }
        }
    }

    /// The reconnect timer fired. Stale timers (cancelled, superseded, or
    /// firing after `stop()`) are ignored.
    pub fn reconnect_due(&mut self, timer: u64) -> Vec<Action> {
        if self.pending_timer != Some(timer) || self.state != ConnectionState::Reconnecting {
            debug!("Ignoring stale reconnect timer {timer}");
            return vec![];
        }
        self.pending_timer = None;
        info!(
            "Reconnecting (attempt {}/{})...",
            self.retries, self.max_retries
        );
        vec![self.open_transport()]
    }

    pub fn on_opened(&mut self, id: ConnectionId) {
        if !self.is_current(id) {
            debug!("Ignoring open of stale connection {id}");
            return;
        }
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring open of {id} while {}", self.state);
            return;
        }
        info!("Connection {id} open");
        self.state = ConnectionState::Open;
        self.retries = 0;
    }

    /// The current attempt ended, either before or after opening.
    /// Schedules the next retry or gives up once the budget is spent.
    pub fn on_closed(&mut self, id: ConnectionId, reason: &str) -> Vec<Action> {
        if !self.is_current(id)
            || !matches!(self.state, ConnectionState::Open | ConnectionState::Connecting)
        {
            debug!("Ignoring close of {id} while {} ({reason})", self.state);
            return vec![];
        }

        warn!("Connection {id} closed: {reason}");
        self.current = None;
        self.state = ConnectionState::Closed;

        if self.retries >= self.max_retries {
            error!(
                "Exceeded {} reconnection attempts, giving up",
                self.max_retries
            );
            self.state = ConnectionState::Exhausted;
            return vec![];
        }

        let delay = self.backoff.delay(self.retries);
        self.retries += 1;
        self.state = ConnectionState::Reconnecting;

        let timer = self.next_timer;
        self.next_timer += 1;
        self.pending_timer = Some(timer);

        info!(
            "Reconnecting in {}ms (attempt {}/{})",
            delay.as_millis(),
            self.retries,
            self.max_retries
        );
        vec![Action::ScheduleReconnect { timer, delay }]
    }

    /// Errors are only reported; the close that follows drives the state.
    pub fn on_error(&mut self, id: ConnectionId, err: &str) {
        if self.is_current(id) {
            error!("Transport error on {id}: {err}");
        } else {
            debug!("Transport error on stale connection {id}: {err}");
        }
    }

    /// Decodes an inbound frame. Malformed frames are reported and dropped.
    pub fn on_frame(&mut self, id: ConnectionId, text: &str) -> Option<ApplicationMessage> {
        if !self.is_current(id) {
            debug!("Dropping frame from stale connection {id}");
            return None;
        }
        match message::decode(text) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("Discarding inbound frame on {id}: {e}");
                None
            }
        }
    }

    /// Builds the outbound frame for `content` if the connection is open.
    /// Nothing is queued otherwise.
    pub fn send(&mut self, content: &str, now: DateTime<Utc>) -> Option<Action> {
        let id = match (self.state, self.current) {
            (ConnectionState::Open, Some(id)) => id,
            _ => {
                debug!("Cannot send message while {}", self.state);
                return None;
            }
        };
        match message::encode(content, now) {
            Ok(frame) => Some(Action::Transmit { id, frame }),
            Err(e) => {
                error!("Failed to encode outbound message: {e}");
                None
            }
        }
    }

    /// Cancels any pending retry, closes the current attempt and stays
    /// `Closed` until started again.
    pub fn stop(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(timer) = self.pending_timer.take() {
            actions.push(Action::CancelReconnect(timer));
        }
        if let Some(id) = self.current.take() {
            actions.push(Action::CloseTransport(id));
        }
        if self.state != ConnectionState::Closed {
            info!("Connection stopped (was {})", self.state);
        }
        self.state = ConnectionState::Closed;
        actions
    }

    fn open_transport(&mut self) -> Action {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        self.current = Some(id);
        self.state = ConnectionState::Connecting;
        Action::OpenTransport(id)
    }

    fn is_current(&self, id: ConnectionId) -> bool {
        self.current == Some(id)
    }
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(Backoff::default(), DEFAULT_MAX_RETRIES)
    }
}
