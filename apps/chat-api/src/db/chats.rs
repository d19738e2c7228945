//! Chat membership and message persistence, as consumed by the realtime core.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chirp_common::id::{prefix, prefixed_ulid};
use chrono::Utc;
use dashmap::DashMap;
use diesel::prelude::*;
use diesel::result::OptionalExtension;
use parking_lot::Mutex;

use crate::db::pool::DbPool;
use crate::db::schema::{chat_members, chat_messages, chat_participants};
use crate::error::ApiError;
use crate::models::chat_message::{ChatMessage, NewChatMessage};
use crate::models::chat_participant::ChatParticipant;

/// Read side of chat membership.
#[async_trait]
pub trait ChatMembershipSource: Send + Sync {
    async fn find_chats_for_user(&self, user_id: &str) -> Result<HashSet<String>, ApiError>;
    async fn is_member(&self, user_id: &str, chat_id: &str) -> Result<bool, ApiError>;
    async fn find_participants(&self, chat_id: &str) -> Result<Vec<ChatParticipant>, ApiError>;
}

/// Durable message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a message. Fails with `NOT_FOUND` when the chat does not exist or
    /// the sender is not one of its participants. A repeated `message_id`
    /// returns the already-stored message.
    async fn persist_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        content: &str,
        message_id: Option<&str>,
    ) -> Result<ChatMessage, ApiError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgChatStore {
    db: DbPool,
}

impl PgChatStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ChatMembershipSource for PgChatStore {
    async fn find_chats_for_user(&self, user_id: &str) -> Result<HashSet<String>, ApiError> {
        let mut conn = self.db.get().await?;
        let chat_ids: Vec<String> = diesel_async::RunQueryDsl::load(
            chat_members::table
                .filter(chat_members::user_id.eq(user_id))
                .select(chat_members::chat_id),
            &mut conn,
        )
        .await?;
        Ok(chat_ids.into_iter().collect())
    }

    async fn is_member(&self, user_id: &str, chat_id: &str) -> Result<bool, ApiError> {
        let mut conn = self.db.get().await?;
        let exists: bool = diesel_async::RunQueryDsl::get_result(
            diesel::select(diesel::dsl::exists(
                chat_members::table
                    .filter(chat_members::chat_id.eq(chat_id))
                    .filter(chat_members::user_id.eq(user_id)),
            )),
            &mut conn,
        )
        .await?;
        Ok(exists)
    }

    async fn find_participants(&self, chat_id: &str) -> Result<Vec<ChatParticipant>, ApiError> {
        let mut conn = self.db.get().await?;
        let participants: Vec<ChatParticipant> = diesel_async::RunQueryDsl::load(
            chat_members::table
                .inner_join(chat_participants::table)
                .filter(chat_members::chat_id.eq(chat_id))
                .select((chat_participants::user_id, chat_participants::username)),
            &mut conn,
        )
        .await?;
        Ok(participants)
    }
}

#[async_trait]
impl MessageStore for PgChatStore {
    async fn persist_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        content: &str,
        message_id: Option<&str>,
    ) -> Result<ChatMessage, ApiError> {
        if !self.is_member(sender_id, chat_id).await? {
            return Err(ApiError::not_found("Chat not found"));
        }

        let mut conn = self.db.get().await?;
        let id = message_id
            .map(str::to_string)
            .unwrap_or_else(|| prefixed_ulid(prefix::MESSAGE));

        let new_message = NewChatMessage {
            id: &id,
            chat_id,
            sender_id,
            content: content.trim(),
            created_at: Utc::now(),
        };

        let inserted: Option<ChatMessage> = diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(chat_messages::table)
                .values(&new_message)
                .on_conflict(chat_messages::id)
                .do_nothing()
                .returning(ChatMessage::as_returning()),
            &mut conn,
        )
        .await
        .optional()?;

        if let Some(message) = inserted {
            return Ok(message);
        }

        // Client resent a message id we already stored.
        let existing: ChatMessage = diesel_async::RunQueryDsl::get_result(
            chat_messages::table
                .find(&id)
                .select(ChatMessage::as_select()),
            &mut conn,
        )
        .await?;
        ensure_same_origin(&existing, chat_id, sender_id)?;
        Ok(existing)
    }
}

fn ensure_same_origin(existing: &ChatMessage, chat_id: &str, sender_id: &str) -> Result<(), ApiError> {
    if existing.chat_id != chat_id || existing.sender_id != sender_id {
        return Err(ApiError::conflict("Message id already in use"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory implementation (for tests / local development)
// ---------------------------------------------------------------------------

pub struct MemoryChatStore {
    /// chat_id -> member user ids
    members: DashMap<String, HashSet<String>>,
    /// user_id -> username
    usernames: DashMap<String, String>,
    messages: Mutex<Vec<ChatMessage>>,
    unavailable: AtomicBool,
    membership_queries: AtomicUsize,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self {
            members: DashMap::new(),
            usernames: DashMap::new(),
            messages: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
            membership_queries: AtomicUsize::new(0),
        }
    }

    pub fn add_member(&self, chat_id: &str, user_id: &str, username: &str) {
        self.members
            .entry(chat_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        self.usernames
            .insert(user_id.to_string(), username.to_string());
    }

    pub fn remove_member(&self, chat_id: &str, user_id: &str) {
        if let Some(mut members) = self.members.get_mut(chat_id) {
            members.remove(user_id);
        }
    }

    /// Make every subsequent call fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `find_chats_for_user` calls served so far.
    pub fn membership_queries(&self) -> usize {
        self.membership_queries.load(Ordering::SeqCst)
    }

    pub fn persisted(&self) -> Vec<ChatMessage> {
        self.messages.lock().clone()
    }

    fn check_available(&self) -> Result<(), ApiError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ApiError::unavailable("Database unavailable"));
        }
        Ok(())
    }

    fn member_of(&self, user_id: &str, chat_id: &str) -> bool {
        self.members
            .get(chat_id)
            .map(|members| members.contains(user_id))
            .unwrap_or(false)
    }
}

impl Default for MemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatMembershipSource for MemoryChatStore {
    async fn find_chats_for_user(&self, user_id: &str) -> Result<HashSet<String>, ApiError> {
        self.membership_queries.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self
            .members
            .iter()
            .filter(|entry| entry.value().contains(user_id))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn is_member(&self, user_id: &str, chat_id: &str) -> Result<bool, ApiError> {
        self.check_available()?;
        Ok(self.member_of(user_id, chat_id))
    }

    async fn find_participants(&self, chat_id: &str) -> Result<Vec<ChatParticipant>, ApiError> {
        self.check_available()?;
        let Some(members) = self.members.get(chat_id) else {
            return Ok(Vec::new());
        };
        Ok(members
            .iter()
            .map(|user_id| ChatParticipant {
                user_id: user_id.clone(),
                username: self
                    .usernames
                    .get(user_id)
                    .map(|name| name.clone())
                    .unwrap_or_default(),
            })
            .collect())
    }
}

#[async_trait]
impl MessageStore for MemoryChatStore {
    async fn persist_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        content: &str,
        message_id: Option<&str>,
    ) -> Result<ChatMessage, ApiError> {
        self.check_available()?;
        if !self.member_of(sender_id, chat_id) {
            return Err(ApiError::not_found("Chat not found"));
        }

        let mut messages = self.messages.lock();
        if let Some(id) = message_id {
            if let Some(existing) = messages.iter().find(|m| m.id == id) {
                ensure_same_origin(existing, chat_id, sender_id)?;
                return Ok(existing.clone());
            }
        }

        let message = ChatMessage {
            id: message_id
                .map(str::to_string)
                .unwrap_or_else(|| prefixed_ulid(prefix::MESSAGE)),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.trim().to_string(),
            created_at: Utc::now(),
        };
        messages.push(message.clone());
        Ok(message)
    }
}
