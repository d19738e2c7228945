//! Periodic liveness probing of chat sessions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::registry::ConnectionRegistry;
use super::session::Outbound;

/// WebSocket close code sent to sessions that stopped answering pings.
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    /// A session with no pong for longer than this is evicted.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<ConnectionRegistry>, config: HeartbeatConfig) -> Self {
        Self { registry, config }
    }

    pub fn tick(&self) -> Vec<String> {
        self.tick_at(Instant::now())
    }

    /// One monitor pass: ping every live session, evict the ones that timed
    /// out or whose ping could not be queued. Returns the evicted session ids.
    pub fn tick_at(&self, now: Instant) -> Vec<String> {
        let mut evicted = Vec::new();

        for session in self.registry.sessions() {
            let idle = now.saturating_duration_since(session.last_pong());
            if idle > self.config.pong_timeout {
                tracing::warn!(
                    session_id = %session.session_id,
                    user_id = %session.user_id,
                    idle_secs = idle.as_secs(),
                    "session timed out, closing"
                );
                // The writer may already be gone; eviction happens either way.
                let _ = session.send(Outbound::Close {
                    code: CLOSE_GOING_AWAY,
                    reason: "Ping timeout".to_string(),
                });
                evicted.push(session.session_id.clone());
                continue;
            }

            match session.send(Outbound::Ping) {
                Ok(()) => tracing::debug!(session_id = %session.session_id, "sent ping"),
                Err(e) => {
                    tracing::warn!(
                        session_id = %session.session_id,
                        error = ?e,
                        "could not ping session, evicting"
                    );
                    evicted.push(session.session_id.clone());
                }
            }
        }

        for session_id in &evicted {
            self.registry.disconnect(session_id);
        }
        evicted
    }

    /// Run the monitor on its own task for the life of the process.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.ping_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = self.tick();
                if !evicted.is_empty() {
                    tracing::info!(count = evicted.len(), "heartbeat evicted sessions");
                }
            }
        })
    }
}
