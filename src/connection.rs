//! Connection lifecycle of an out-of-process collaborator
//!
//! Transitions are a pure function of (state, event); [`ConnectionTracker`]
//! applies them atomically so request tasks can read the state lock-free.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectStarted,
    ConnectSucceeded,
    ConnectFailed,
    HealthCheckPassed,
    HealthCheckFailed,
}

impl ConnectionState {
    /// State after `event` is observed in this state
    pub fn on(self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (_, ConnectFailed) | (_, HealthCheckFailed) => Disconnected,
            (Connected, ConnectStarted) => Connected,
            (_, ConnectStarted) => Connecting,
            (_, ConnectSucceeded) | (_, HealthCheckPassed) => Connected,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Thread-safe holder of a [`ConnectionState`]
#[derive(Debug)]
pub struct ConnectionTracker {
    name: &'static str,
    state: AtomicU8,
}

impl ConnectionTracker {
    pub fn new(name: &'static str) -> Self {
        ConnectionTracker {
            name,
            state: AtomicU8::new(ConnectionState::Disconnected.to_u8()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Apply an event and return the resulting state
    pub fn apply(&self, event: ConnectionEvent) -> ConnectionState {
        let mut previous = ConnectionState::Disconnected;
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                previous = ConnectionState::from_u8(current);
                Some(previous.on(event).to_u8())
            });
        let next = previous.on(event);

        if previous != next {
            match next {
                ConnectionState::Disconnected => {
                    warn!("{} connection {} -> {} ({:?})", self.name, previous, next, event)
                }
                _ => info!("{} connection {} -> {} ({:?})", self.name, previous, next, event),
            }
        }
        next
    }
}
