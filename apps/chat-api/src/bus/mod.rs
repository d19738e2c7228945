//! Chat domain events delivered out of band (after the originating
//! transaction commits) and their handlers.
//!
//! Delivery is at-least-once, so every handler must tolerate duplicates.

pub mod subscriber;

use serde::{Deserialize, Serialize};

use crate::gateway::fanout::EventRouter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChatEvent {
    ParticipantJoined {
        chat_id: String,
        user_ids: Vec<String>,
    },
    ParticipantLeft {
        chat_id: String,
        user_id: String,
    },
    MessageDeleted {
        chat_id: String,
        message_id: String,
    },
    ProfilePictureUpdated {
        user_id: String,
        #[serde(default)]
        new_url: Option<String>,
    },
}

impl ChatEvent {
    /// Apply the event and return how many sessions were notified.
    pub async fn dispatch(self, router: &EventRouter) -> usize {
        match self {
            ChatEvent::ParticipantJoined { chat_id, user_ids } => {
                router.on_participants_joined(&chat_id, &user_ids).await
            }
            ChatEvent::ParticipantLeft { chat_id, user_id } => {
                router.on_participant_left(&chat_id, &user_id)
            }
            ChatEvent::MessageDeleted {
                chat_id,
                message_id,
            } => router.on_message_deleted(&chat_id, &message_id),
            ChatEvent::ProfilePictureUpdated { user_id, new_url } => {
                router.on_profile_picture_updated(&user_id, new_url).await
            }
        }
    }
}

/// Decode and apply one raw event payload. Malformed payloads are logged
/// and skipped.
pub async fn handle_payload(router: &EventRouter, payload: &str) -> Option<usize> {
    match serde_json::from_str::<ChatEvent>(payload) {
        Ok(event) => {
            tracing::debug!(?event, "chat event received");
            Some(event.dispatch(router).await)
        }
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed chat event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::chats::MemoryChatStore;
    use crate::gateway::registry::ConnectionRegistry;
    use crate::gateway::session::SessionHandle;

    #[test]
    fn decodes_tagged_events() {
        let joined: ChatEvent =
            serde_json::from_str(r#"{"type":"participant_joined","chatId":"c1","userIds":["u1","u2"]}"#)
                .unwrap();
        assert_eq!(
            joined,
            ChatEvent::ParticipantJoined {
                chat_id: "c1".into(),
                user_ids: vec!["u1".into(), "u2".into()],
            }
        );

        let picture: ChatEvent =
            serde_json::from_str(r#"{"type":"profile_picture_updated","userId":"u1"}"#).unwrap();
        assert_eq!(
            picture,
            ChatEvent::ProfilePictureUpdated {
                user_id: "u1".into(),
                new_url: None,
            }
        );
    }

    #[test]
    fn encodes_with_type_tag() {
        let event = ChatEvent::MessageDeleted {
            chat_id: "c1".into(),
            message_id: "m1".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "message_deleted");
        assert_eq!(value["messageId"], "m1");
    }

    #[tokio::test]
    async fn duplicate_join_delivery_is_harmless() {
        let store = Arc::new(MemoryChatStore::new());
        store.add_member("c1", "u1", "alice");
        let registry = Arc::new(ConnectionRegistry::new(store.clone()));
        let router = EventRouter::new(registry.clone(), store.clone(), store, None);

        let (handle, _rx) = SessionHandle::channel(16);
        registry.connect("s1".into(), "u1".into(), handle).await;

        let payload = r#"{"type":"participant_joined","chatId":"c2","userIds":["u1"]}"#;
        assert_eq!(handle_payload(&router, payload).await, Some(1));
        assert_eq!(handle_payload(&router, payload).await, Some(1));
        assert_eq!(registry.resolve_chat_sessions("c2").len(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped() {
        let store = Arc::new(MemoryChatStore::new());
        let registry = Arc::new(ConnectionRegistry::new(store.clone()));
        let router = EventRouter::new(registry, store.clone(), store, None);

        assert_eq!(handle_payload(&router, r#"{"type":"unknown"}"#).await, None);
        assert_eq!(handle_payload(&router, "garbage").await, None);
    }
}
