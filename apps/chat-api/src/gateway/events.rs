//! Chat websocket envelopes, event types, and payloads.
//!
//! Every frame in either direction is `{"type": ..., "payload": ...}`.
//! Outbound payloads are JSON-encoded strings; inbound payloads are accepted
//! either as a JSON-encoded string or as an inline object.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::chat_message::ChatMessage;

// ---------------------------------------------------------------------------
// Error codes carried by ERROR frames
// ---------------------------------------------------------------------------

pub const ERROR_INVALID_JSON: &str = "INVALID_JSON";
pub const ERROR_NOT_A_MEMBER: &str = "NOT_A_MEMBER";
pub const ERROR_SEND_FAILED: &str = "SEND_FAILED";

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomingEventType {
    NewMessage,
}

/// Raw inbound envelope.
#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    #[serde(rename = "type")]
    pub event_type: IncomingEventType,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub chat_id: String,
    pub content: String,
    /// Client-chosen id, used to make resends idempotent.
    #[serde(default)]
    pub message_id: Option<String>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    SendMessage(SendMessagePayload),
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let envelope: IncomingMessage = serde_json::from_str(text)?;
        match envelope.event_type {
            IncomingEventType::NewMessage => {
                Ok(InboundFrame::SendMessage(decode_payload(envelope.payload)?))
            }
        }
    }
}

fn decode_payload<T: DeserializeOwned>(payload: Value) -> Result<T, serde_json::Error> {
    match payload {
        Value::String(encoded) => serde_json::from_str(&encoded),
        other => serde_json::from_value(other),
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutgoingEventType {
    NewMessage,
    MessageDeleted,
    ProfilePictureUpdated,
    ChatParticipantChanged,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    pub id: String,
    pub chat_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub sender_id: String,
}

impl From<&ChatMessage> for ChatMessagePayload {
    fn from(message: &ChatMessage) -> Self {
        Self {
            id: message.id.clone(),
            chat_id: message.chat_id.clone(),
            content: message.content.clone(),
            created_at: message.created_at,
            sender_id: message.sender_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletedPayload {
    pub chat_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePictureUpdatedPayload {
    pub user_id: String,
    pub new_url: Option<String>,
}

/// Tells clients to re-fetch a chat's participants; carries no diff.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantChangedPayload {
    pub chat_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// The closed set of events pushed to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingEvent {
    NewMessage(ChatMessagePayload),
    MessageDeleted(MessageDeletedPayload),
    ProfilePictureUpdated(ProfilePictureUpdatedPayload),
    ChatParticipantChanged(ParticipantChangedPayload),
    Error(ErrorPayload),
}

/// Wire envelope for an outbound event.
#[derive(Debug, Serialize)]
struct OutgoingMessage<'a> {
    #[serde(rename = "type")]
    event_type: OutgoingEventType,
    payload: &'a str,
}

impl OutgoingEvent {
    pub fn participant_changed(chat_id: &str) -> Self {
        OutgoingEvent::ChatParticipantChanged(ParticipantChangedPayload {
            chat_id: chat_id.to_string(),
        })
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        OutgoingEvent::Error(ErrorPayload {
            code: code.to_string(),
            message: message.into(),
        })
    }

    pub fn event_type(&self) -> OutgoingEventType {
        match self {
            OutgoingEvent::NewMessage(_) => OutgoingEventType::NewMessage,
            OutgoingEvent::MessageDeleted(_) => OutgoingEventType::MessageDeleted,
            OutgoingEvent::ProfilePictureUpdated(_) => OutgoingEventType::ProfilePictureUpdated,
            OutgoingEvent::ChatParticipantChanged(_) => OutgoingEventType::ChatParticipantChanged,
            OutgoingEvent::Error(_) => OutgoingEventType::Error,
        }
    }

    /// Serialize to the text frame sent over the socket.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        let payload = match self {
            OutgoingEvent::NewMessage(p) => serde_json::to_string(p)?,
            OutgoingEvent::MessageDeleted(p) => serde_json::to_string(p)?,
            OutgoingEvent::ProfilePictureUpdated(p) => serde_json::to_string(p)?,
            OutgoingEvent::ChatParticipantChanged(p) => serde_json::to_string(p)?,
            OutgoingEvent::Error(p) => serde_json::to_string(p)?,
        };
        serde_json::to_string(&OutgoingMessage {
            event_type: self.event_type(),
            payload: &payload,
        })
    }
}
