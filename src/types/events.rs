use std::time::Duration;

use chrono::{DateTime, Utc};

/// Where the connection manager is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the delay before reconnect attempt `attempt`.
    Reconnecting { attempt: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Connecting { attempt: usize },
    Connected,
    Error(String),
    Closed,
    ReconnectScheduled { attempt: usize, delay: Duration },
    /// The retry budget is exhausted; the manager stays disconnected.
    GaveUp { attempts: usize },
}

/// Lifecycle transition published for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub at: DateTime<Utc>,
    pub kind: ConnectionEventKind,
}

impl ConnectionEvent {
    pub fn now(kind: ConnectionEventKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
        }
    }
}
