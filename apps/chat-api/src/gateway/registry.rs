//! Connection registry: the session table plus the derived membership
//! indexes, guarded by one reader-writer lock.
//!
//! Mutations (connect, disconnect, membership changes) take the write lock
//! for their whole multi-map update. Reads and broadcasts take the read lock
//! only long enough to snapshot the target sessions; frames are written after
//! the lock is released.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::db::chats::ChatMembershipSource;

use super::events::OutgoingEvent;
use super::membership::MembershipIndex;
use super::session::{Outbound, SendError, Session, SessionHandle, SessionStore};

/// How many times a membership fetch is re-run when what it raced with
/// (a membership event, a last disconnect) lands while it is in flight.
const MEMBERSHIP_FETCH_ATTEMPTS: usize = 3;

#[derive(Default)]
struct RegistryState {
    sessions: SessionStore,
    index: MembershipIndex,
    /// Bumped by every membership event; lets `connect` notice that a fetch
    /// may have raced with one.
    membership_epoch: u64,
}

pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
    membership: Arc<dyn ChatMembershipSource>,
}

impl ConnectionRegistry {
    pub fn new(membership: Arc<dyn ChatMembershipSource>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            membership,
        }
    }

    /// Register a live session and index it under its user's chats.
    ///
    /// The user's chat set is fetched once (outside the lock) and memoized.
    /// A failed fetch is logged and the session is registered with no chats;
    /// the next connect of that user, or a join event for them, tries again.
    pub async fn connect(
        &self,
        session_id: String,
        user_id: String,
        handle: SessionHandle,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(session_id, user_id, handle));
        let user_id = session.user_id.as_str();

        for attempt in 1..=MEMBERSHIP_FETCH_ATTEMPTS {
            let (cached, epoch) = {
                let state = self.state.read();
                (state.index.has_cached_chats(user_id), state.membership_epoch)
            };
            let fetched = if cached {
                None
            } else {
                self.fetch_user_chats(user_id).await
            };

            let last_attempt = attempt == MEMBERSHIP_FETCH_ATTEMPTS;
            if self.register(&session, cached, epoch, fetched, last_attempt) {
                break;
            }
            tracing::debug!(user_id = %user_id, attempt, "membership changed during fetch, refetching");
        }

        tracing::info!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            "chat session connected"
        );
        session
    }

    /// Write phase of `connect`. Returns false, leaving the registry
    /// untouched, when what was read before the fetch no longer holds: a
    /// membership event bumped the epoch, or the cache seen then was dropped
    /// by the user's last disconnect. On the last attempt it registers anyway.
    fn register(
        &self,
        session: &Arc<Session>,
        cached_at_read: bool,
        epoch: u64,
        fetched: Option<HashSet<String>>,
        last_attempt: bool,
    ) -> bool {
        let user_id = session.user_id.as_str();
        let mut state = self.state.write();
        let raced = fetched.is_some() && state.membership_epoch != epoch;
        let dropped = cached_at_read && !state.index.has_cached_chats(user_id);
        if (raced || dropped) && !last_attempt {
            return false;
        }

        if let Some(previous) = state.sessions.remove(&session.session_id) {
            state
                .index
                .detach_session(&previous.user_id, &previous.session_id);
        }
        state.sessions.insert(session.clone());
        state.index.attach_session(user_id, &session.session_id);
        if let Some(chats) = fetched {
            state.index.seed_user_chats(user_id, chats);
        }
        true
    }

    async fn fetch_user_chats(&self, user_id: &str) -> Option<HashSet<String>> {
        match self.membership.find_chats_for_user(user_id).await {
            Ok(chats) => Some(chats),
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "chat membership lookup failed, connecting without chats"
                );
                None
            }
        }
    }

    /// Fetch and cache the chats of a user who is online but uncached, which
    /// happens when the fetch at connect failed. Returns true when the cache
    /// was seeded. A user who went offline or got cached meanwhile is left
    /// alone.
    pub async fn refresh_user_chats(&self, user_id: &str) -> bool {
        for attempt in 1..=MEMBERSHIP_FETCH_ATTEMPTS {
            let epoch = {
                let state = self.state.read();
                if state.index.has_cached_chats(user_id) || !state.index.has_sessions(user_id) {
                    return false;
                }
                state.membership_epoch
            };
            let Some(chats) = self.fetch_user_chats(user_id).await else {
                return false;
            };

            let mut state = self.state.write();
            if state.membership_epoch != epoch && attempt < MEMBERSHIP_FETCH_ATTEMPTS {
                continue;
            }
            if !state.index.has_sessions(user_id) {
                return false;
            }
            return state.index.seed_user_chats(user_id, chats);
        }
        false
    }

    /// Remove a session from every index. Safe to call more than once.
    pub fn disconnect(&self, session_id: &str) -> Option<Arc<Session>> {
        let mut state = self.state.write();
        let session = state.sessions.remove(session_id)?;
        let last = state.index.detach_session(&session.user_id, session_id);
        drop(state);

        tracing::info!(
            session_id = %session_id,
            user_id = %session.user_id,
            last_session = last,
            "chat session disconnected"
        );
        Some(session)
    }

    /// Apply a participants-joined event, then tell the chat to re-fetch its
    /// participants. Online users whose chats are not cached get a fresh
    /// fetch, which already includes the chat; offline users are left to
    /// their next connect.
    pub async fn on_membership_joined(&self, chat_id: &str, user_ids: &[String]) -> usize {
        let mut uncached = Vec::new();
        {
            let mut state = self.state.write();
            state.membership_epoch += 1;
            for user_id in user_ids {
                if !state.index.join_chat(chat_id, user_id) && state.index.has_sessions(user_id) {
                    uncached.push(user_id);
                }
            }
        }
        for user_id in uncached {
            if self.refresh_user_chats(user_id).await {
                tracing::debug!(user_id = %user_id, chat_id = %chat_id, "refetched chats on join");
            }
        }
        tracing::info!(chat_id = %chat_id, users = user_ids.len(), "participants joined chat");
        self.broadcast_to_chat(chat_id, &OutgoingEvent::participant_changed(chat_id))
    }

    /// Apply a participant-left event, then notify the remaining sessions.
    pub fn on_membership_left(&self, chat_id: &str, user_id: &str) -> usize {
        {
            let mut state = self.state.write();
            state.membership_epoch += 1;
            state.index.leave_chat(chat_id, user_id);
        }
        tracing::info!(chat_id = %chat_id, user_id = %user_id, "participant left chat");
        self.broadcast_to_chat(chat_id, &OutgoingEvent::participant_changed(chat_id))
    }

    pub fn resolve_chat_sessions(&self, chat_id: &str) -> HashSet<String> {
        self.state.read().index.chat_sessions(chat_id)
    }

    pub fn resolve_user_sessions(&self, user_id: &str) -> HashSet<String> {
        self.state.read().index.user_sessions(user_id)
    }

    pub fn is_user_in_chat(&self, user_id: &str, chat_id: &str) -> bool {
        self.state.read().index.user_in_chat(user_id, chat_id)
    }

    /// `None` when the user's chats have not been fetched (or were dropped
    /// with their last session).
    pub fn cached_chats(&self, user_id: &str) -> Option<HashSet<String>> {
        self.state.read().index.cached_chats(user_id)
    }

    /// Update a session's liveness timestamp. Returns false for unknown ids.
    pub fn record_pong(&self, session_id: &str) -> bool {
        self.record_pong_at(session_id, Instant::now())
    }

    pub fn record_pong_at(&self, session_id: &str, at: Instant) -> bool {
        let state = self.state.read();
        match state.sessions.get(session_id) {
            Some(session) => {
                session.record_pong_at(at);
                true
            }
            None => false,
        }
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.state.read().sessions.snapshot()
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.state.read().sessions.get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.state.read().sessions.len()
    }

    // -- Delivery ----------------------------------------------------------

    /// Send an event to every session in the chat. Returns how many sessions
    /// accepted the frame.
    pub fn broadcast_to_chat(&self, chat_id: &str, event: &OutgoingEvent) -> usize {
        let targets = {
            let state = self.state.read();
            collect_sessions(&state, state.index.chat_session_ids(chat_id))
        };
        self.deliver(targets, event)
    }

    /// Send one event to the union of several chats' sessions; a session in
    /// more than one of the chats gets it once.
    pub fn broadcast_to_chats<'a, I>(&self, chat_ids: I, event: &OutgoingEvent) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.broadcast_to_union(chat_ids, None, event)
    }

    /// Like `broadcast_to_chats`, but also reaches every session of
    /// `user_id`, even one that shares none of the chats.
    pub fn broadcast_to_chats_and_user<'a, I>(
        &self,
        chat_ids: I,
        user_id: &str,
        event: &OutgoingEvent,
    ) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.broadcast_to_union(chat_ids, Some(user_id), event)
    }

    fn broadcast_to_union<'a, I>(&self, chat_ids: I, user_id: Option<&str>, event: &OutgoingEvent) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        let targets = {
            let state = self.state.read();
            let mut seen = HashSet::new();
            let user_sessions = user_id
                .into_iter()
                .flat_map(|user_id| state.index.user_session_ids(user_id));
            let ids: Vec<&String> = chat_ids
                .into_iter()
                .flat_map(|chat_id| state.index.chat_session_ids(chat_id))
                .chain(user_sessions)
                .filter(|session_id| seen.insert(*session_id))
                .collect();
            collect_sessions(&state, ids)
        };
        self.deliver(targets, event)
    }

    pub fn send_to_user(&self, user_id: &str, event: &OutgoingEvent) -> usize {
        let targets = {
            let state = self.state.read();
            collect_sessions(&state, state.index.user_session_ids(user_id))
        };
        self.deliver(targets, event)
    }

    pub fn send_to_session(&self, session_id: &str, event: &OutgoingEvent) -> bool {
        match self.session(session_id) {
            Some(session) => self.deliver(vec![session], event) == 1,
            None => false,
        }
    }

    /// Serialize once and hand the frame to each session without blocking.
    /// Sessions whose writer is gone are disconnected; a full queue only
    /// drops this frame.
    fn deliver(&self, targets: Vec<Arc<Session>>, event: &OutgoingEvent) -> usize {
        if targets.is_empty() {
            return 0;
        }
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, event = ?event.event_type(), "failed to serialize event");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for session in &targets {
            match session.send(Outbound::Text(frame.clone())) {
                Ok(()) => delivered += 1,
                Err(SendError::Full) => {
                    tracing::warn!(
                        session_id = %session.session_id,
                        event = ?event.event_type(),
                        "outbound queue full, dropping frame"
                    );
                }
                Err(SendError::Closed) => closed.push(session.session_id.clone()),
            }
        }

        for session_id in closed {
            self.disconnect(&session_id);
        }

        tracing::debug!(
            event = ?event.event_type(),
            targets = targets.len(),
            delivered,
            "event delivered"
        );
        delivered
    }
}

fn collect_sessions<'a>(
    state: &RegistryState,
    ids: impl IntoIterator<Item = &'a String>,
) -> Vec<Arc<Session>> {
    ids.into_iter()
        .filter_map(|session_id| state.sessions.get(session_id).cloned())
        .collect()
}
