//! Derived session indexes: user → sessions, chat → sessions, and the
//! user → chats cache they are built from.
//!
//! The index has no locking of its own. The registry owns it behind its
//! single writer lock, so every method here runs as part of one atomic
//! registry operation.
//!
//! Invariant (holds between calls): for every session `s` of user `u` and
//! every chat `c` in `user_chats[u]`, `s ∈ chat_sessions[c]`; and every id in
//! `chat_sessions[c]` is such a session. Session buckets are never left
//! empty, they are removed.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub(crate) struct MembershipIndex {
    user_sessions: HashMap<String, HashSet<String>>,
    chat_sessions: HashMap<String, HashSet<String>>,
    /// Present only once the user's chats have been fetched.
    user_chats: HashMap<String, HashSet<String>>,
}

impl MembershipIndex {
    pub fn has_cached_chats(&self, user_id: &str) -> bool {
        self.user_chats.contains_key(user_id)
    }

    pub fn has_sessions(&self, user_id: &str) -> bool {
        self.user_sessions.contains_key(user_id)
    }

    /// Add a session to its user's bucket and to every cached chat.
    pub fn attach_session(&mut self, user_id: &str, session_id: &str) {
        self.user_sessions
            .entry(user_id.to_string())
            .or_default()
            .insert(session_id.to_string());

        if let Some(chats) = self.user_chats.get(user_id) {
            for chat_id in chats {
                self.chat_sessions
                    .entry(chat_id.clone())
                    .or_default()
                    .insert(session_id.to_string());
            }
        }
    }

    /// Cache a freshly fetched chat set and index every current session of
    /// the user under it. No-op (returns false) when already cached.
    pub fn seed_user_chats(&mut self, user_id: &str, chats: HashSet<String>) -> bool {
        if self.user_chats.contains_key(user_id) {
            return false;
        }

        if let Some(sessions) = self.user_sessions.get(user_id) {
            for chat_id in &chats {
                self.chat_sessions
                    .entry(chat_id.clone())
                    .or_default()
                    .extend(sessions.iter().cloned());
            }
        }
        self.user_chats.insert(user_id.to_string(), chats);
        true
    }

    /// Pull a session out of every bucket. Returns true when this was the
    /// user's last session, in which case the chat cache is dropped too.
    pub fn detach_session(&mut self, user_id: &str, session_id: &str) -> bool {
        remove_from_bucket(&mut self.user_sessions, user_id, session_id);

        if let Some(chats) = self.user_chats.get(user_id) {
            for chat_id in chats {
                remove_from_bucket(&mut self.chat_sessions, chat_id, session_id);
            }
        }

        let last = !self.user_sessions.contains_key(user_id);
        if last {
            self.user_chats.remove(user_id);
        }
        last
    }

    /// Record that `user_id` joined `chat_id`. Applies only to users whose
    /// chats are cached; returns false otherwise so the caller can refetch.
    /// Idempotent.
    pub fn join_chat(&mut self, chat_id: &str, user_id: &str) -> bool {
        let Some(chats) = self.user_chats.get_mut(user_id) else {
            return false;
        };
        chats.insert(chat_id.to_string());

        if let Some(sessions) = self.user_sessions.get(user_id) {
            self.chat_sessions
                .entry(chat_id.to_string())
                .or_default()
                .extend(sessions.iter().cloned());
        }
        true
    }

    /// Record that `user_id` left `chat_id`. Idempotent.
    pub fn leave_chat(&mut self, chat_id: &str, user_id: &str) -> bool {
        let Some(chats) = self.user_chats.get_mut(user_id) else {
            return false;
        };
        chats.remove(chat_id);

        if let Some(sessions) = self.user_sessions.get(user_id) {
            for session_id in sessions {
                remove_from_bucket(&mut self.chat_sessions, chat_id, session_id);
            }
        }
        true
    }

    pub fn chat_sessions(&self, chat_id: &str) -> HashSet<String> {
        self.chat_sessions.get(chat_id).cloned().unwrap_or_default()
    }

    pub fn user_sessions(&self, user_id: &str) -> HashSet<String> {
        self.user_sessions.get(user_id).cloned().unwrap_or_default()
    }

    pub fn chat_session_ids<'a>(&'a self, chat_id: &str) -> impl Iterator<Item = &'a String> + 'a {
        self.chat_sessions.get(chat_id).into_iter().flatten()
    }

    pub fn user_session_ids<'a>(&'a self, user_id: &str) -> impl Iterator<Item = &'a String> + 'a {
        self.user_sessions.get(user_id).into_iter().flatten()
    }

    pub fn user_in_chat(&self, user_id: &str, chat_id: &str) -> bool {
        self.user_chats
            .get(user_id)
            .map(|chats| chats.contains(chat_id))
            .unwrap_or(false)
    }

    pub fn cached_chats(&self, user_id: &str) -> Option<HashSet<String>> {
        self.user_chats.get(user_id).cloned()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let mut owner: HashMap<&str, &str> = HashMap::new();
        for (user_id, sessions) in &self.user_sessions {
            assert!(!sessions.is_empty(), "empty session bucket for {user_id}");
            for session_id in sessions {
                owner.insert(session_id, user_id);
                for chat_id in self.user_chats.get(user_id).into_iter().flatten() {
                    assert!(
                        self.chat_sessions
                            .get(chat_id)
                            .is_some_and(|s| s.contains(session_id)),
                        "{session_id} missing from chat {chat_id}"
                    );
                }
            }
        }
        for (chat_id, sessions) in &self.chat_sessions {
            assert!(!sessions.is_empty(), "empty chat bucket for {chat_id}");
            for session_id in sessions {
                let user_id = owner
                    .get(session_id.as_str())
                    .unwrap_or_else(|| panic!("stale session {session_id} in chat {chat_id}"));
                assert!(self.user_in_chat(user_id, chat_id));
            }
        }
    }
}

fn remove_from_bucket(map: &mut HashMap<String, HashSet<String>>, key: &str, value: &str) {
    if let Some(bucket) = map.get_mut(key) {
        bucket.remove(value);
        if bucket.is_empty() {
            map.remove(key);
        }
    }
}
