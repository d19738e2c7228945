//! Per-connection session state, the outbound transport handle, and the
//! session table owned by the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Capacity of a session's outbound queue. A client that falls this far
/// behind starts losing broadcast frames.
pub const OUTBOUND_BUFFER: usize = 256;

/// A frame queued for the session's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The writer task is gone; the socket is closed or closing.
    Closed,
    /// The outbound queue is full.
    Full,
}

/// Write side of a session. Sends never block.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Outbound>,
}

impl SessionHandle {
    /// Create a handle plus the receiver its socket writer drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn send(&self, frame: Outbound) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One live transport connection.
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    handle: SessionHandle,
    last_pong: Mutex<Instant>,
}

impl Session {
    pub fn new(session_id: String, user_id: String, handle: SessionHandle) -> Self {
        Self {
            session_id,
            user_id,
            handle,
            last_pong: Mutex::new(Instant::now()),
        }
    }

    pub fn send(&self, frame: Outbound) -> Result<(), SendError> {
        self.handle.send(frame)
    }

    pub fn is_open(&self) -> bool {
        !self.handle.is_closed()
    }

    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock()
    }

    pub fn record_pong_at(&self, at: Instant) {
        *self.last_pong.lock() = at;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// Session table keyed by session id. Only ever touched under the
/// registry lock.
#[derive(Default)]
pub(crate) struct SessionStore {
    sessions: HashMap<String, Arc<Session>>,
}

impl SessionStore {
    pub fn insert(&mut self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.insert(session.session_id.clone(), session)
    }

    pub fn remove(&mut self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<&Arc<Session>> {
        self.sessions.get(session_id)
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Connecting, Closed)
                | (Authenticated, Active)
                | (Authenticated, Closing)
                | (Authenticated, Closed)
                | (Active, Closing)
                | (Active, Closed)
                | (Closing, Closed)
        )
    }
}

/// Tracks one connection's state; CLOSED is terminal.
#[derive(Debug)]
pub struct ConnectionLifecycle {
    state: ConnectionState,
}

impl ConnectionLifecycle {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`. Returns false and leaves the state untouched when the
    /// transition is not allowed.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::debug!(from = ?self.state, to = ?next, "ignored invalid connection transition");
            return false;
        }
        self.state = next;
        true
    }
}

impl Default for ConnectionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
