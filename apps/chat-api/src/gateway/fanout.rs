//! Event fan-out: inbound client frames in, persisted effects and outbound
//! broadcasts out.
//!
//! Sends to one chat are serialized by a per-chat async lock so broadcasts
//! leave in persistence order. Sends to different chats run concurrently.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::db::chats::{ChatMembershipSource, MessageStore};
use crate::error::ApiError;
use crate::models::chat_message::ChatMessage;
use crate::push::PushNotifier;

use super::events::{
    ChatMessagePayload, InboundFrame, MessageDeletedPayload, OutgoingEvent,
    ProfilePictureUpdatedPayload, SendMessagePayload, ERROR_INVALID_JSON, ERROR_NOT_A_MEMBER,
    ERROR_SEND_FAILED,
};
use super::registry::ConnectionRegistry;
use super::session::Session;

/// What happened to one inbound send.
#[derive(Debug)]
pub enum MessageDispatch {
    /// Persisted and broadcast to `recipients` sessions.
    Delivered { message: ChatMessage, recipients: usize },
    /// The sender is not in the chat; nothing was persisted.
    NotAMember,
    /// Persistence failed; nothing was broadcast.
    Failed(ApiError),
}

pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
    messages: Arc<dyn MessageStore>,
    chats: Arc<dyn ChatMembershipSource>,
    push: Option<Arc<PushNotifier>>,
    chat_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EventRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        messages: Arc<dyn MessageStore>,
        chats: Arc<dyn ChatMembershipSource>,
        push: Option<Arc<PushNotifier>>,
    ) -> Self {
        Self {
            registry,
            messages,
            chats,
            push,
            chat_locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Handle one text frame from a session. Malformed frames are answered
    /// with an ERROR frame to that session only.
    pub async fn handle_frame(&self, session: &Session, text: &str) -> Option<MessageDispatch> {
        tracing::debug!(session_id = %session.session_id, len = text.len(), "inbound frame");

        match InboundFrame::parse(text) {
            Ok(InboundFrame::SendMessage(payload)) => {
                Some(self.send_message(&session.session_id, &session.user_id, payload).await)
            }
            Err(e) => {
                tracing::warn!(session_id = %session.session_id, error = %e, "malformed inbound frame");
                self.registry.send_to_session(
                    &session.session_id,
                    &OutgoingEvent::error(ERROR_INVALID_JSON, "Incoming JSON is invalid"),
                );
                None
            }
        }
    }

    /// Authorize, persist, then broadcast a chat message.
    ///
    /// A sender outside the chat gets a NOT_A_MEMBER error frame on the
    /// originating session and the message is dropped.
    pub async fn send_message(
        &self,
        origin_session: &str,
        sender_id: &str,
        payload: SendMessagePayload,
    ) -> MessageDispatch {
        let chat_id = payload.chat_id.as_str();

        if !self.registry.is_user_in_chat(sender_id, chat_id) {
            tracing::warn!(
                user_id = %sender_id,
                chat_id = %chat_id,
                "user attempted to send to a chat they do not belong to"
            );
            self.registry.send_to_session(
                origin_session,
                &OutgoingEvent::error(ERROR_NOT_A_MEMBER, "You are not a member of this chat"),
            );
            return MessageDispatch::NotAMember;
        }

        // Declared first so it runs after `lock` drops, even on cancellation.
        let release = ChatLockRelease {
            locks: &self.chat_locks,
            chat_id,
        };
        let lock = self.chat_lock(chat_id);
        let dispatch = {
            let _guard = lock.lock().await;
            match self
                .messages
                .persist_message(chat_id, sender_id, &payload.content, payload.message_id.as_deref())
                .await
            {
                Ok(message) => {
                    let event = OutgoingEvent::NewMessage(ChatMessagePayload::from(&message));
                    let recipients = self.registry.broadcast_to_chat(chat_id, &event);
                    MessageDispatch::Delivered { message, recipients }
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %sender_id,
                        chat_id = %chat_id,
                        error = %e,
                        "failed to persist message"
                    );
                    self.registry.send_to_session(
                        origin_session,
                        &OutgoingEvent::error(ERROR_SEND_FAILED, "Message could not be sent"),
                    );
                    MessageDispatch::Failed(e)
                }
            }
        };
        drop(lock);
        drop(release);

        if let MessageDispatch::Delivered { message, .. } = &dispatch {
            self.spawn_offline_push(message.clone());
        }
        dispatch
    }

    pub fn on_message_deleted(&self, chat_id: &str, message_id: &str) -> usize {
        let event = OutgoingEvent::MessageDeleted(MessageDeletedPayload {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
        });
        self.registry.broadcast_to_chat(chat_id, &event)
    }

    /// Tell everyone who shares a chat with the user, and the user's own
    /// devices, about the new picture.
    pub async fn on_profile_picture_updated(&self, user_id: &str, new_url: Option<String>) -> usize {
        let chats = match self.registry.cached_chats(user_id) {
            Some(chats) => chats,
            None => self.chats.find_chats_for_user(user_id).await.unwrap_or_else(|e| {
                tracing::warn!(user_id = %user_id, error = %e, "chat lookup failed for profile update");
                HashSet::new()
            }),
        };

        let event = OutgoingEvent::ProfilePictureUpdated(ProfilePictureUpdatedPayload {
            user_id: user_id.to_string(),
            new_url,
        });
        self.registry.broadcast_to_chats_and_user(&chats, user_id, &event)
    }

    pub async fn on_participants_joined(&self, chat_id: &str, user_ids: &[String]) -> usize {
        self.registry.on_membership_joined(chat_id, user_ids).await
    }

    pub fn on_participant_left(&self, chat_id: &str, user_id: &str) -> usize {
        self.registry.on_membership_left(chat_id, user_id)
    }

    /// Push the message to chat participants with no live session.
    pub async fn notify_offline_recipients(&self, message: &ChatMessage) {
        if let Some(push) = &self.push {
            push_to_offline(&self.registry, self.chats.as_ref(), push, message).await;
        }
    }

    fn spawn_offline_push(&self, message: ChatMessage) {
        let Some(push) = self.push.clone() else {
            return;
        };
        let registry = self.registry.clone();
        let chats = self.chats.clone();
        tokio::spawn(async move {
            push_to_offline(&registry, chats.as_ref(), &push, &message).await;
        });
    }

    fn chat_lock(&self, chat_id: &str) -> Arc<Mutex<()>> {
        self.chat_locks
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Removes a chat's lock from the map once nobody else holds or waits on
/// it. Runs on drop, so a cancelled send still cleans up.
struct ChatLockRelease<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    chat_id: &'a str,
}

impl Drop for ChatLockRelease<'_> {
    fn drop(&mut self) {
        self.locks
            .remove_if(self.chat_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

async fn push_to_offline(
    registry: &ConnectionRegistry,
    chats: &dyn ChatMembershipSource,
    push: &PushNotifier,
    message: &ChatMessage,
) {
    let participants = match chats.find_participants(&message.chat_id).await {
        Ok(participants) => participants,
        Err(e) => {
            tracing::warn!(chat_id = %message.chat_id, error = %e, "participant lookup failed, skipping push");
            return;
        }
    };

    let sender_name = participants
        .iter()
        .find(|p| p.user_id == message.sender_id)
        .map(|p| p.username.clone())
        .unwrap_or_else(|| message.sender_id.clone());

    let offline: Vec<String> = participants
        .into_iter()
        .map(|p| p.user_id)
        .filter(|user_id| *user_id != message.sender_id)
        .filter(|user_id| registry.resolve_user_sessions(user_id).is_empty())
        .collect();

    if offline.is_empty() {
        return;
    }

    if let Err(e) = push
        .send_new_message_notification(
            &offline,
            &message.sender_id,
            &sender_name,
            &message.content,
            &message.chat_id,
        )
        .await
    {
        tracing::warn!(chat_id = %message.chat_id, error = %e, "push notification failed");
    }
}
