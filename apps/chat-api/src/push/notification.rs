//! Push notification payloads, per-recipient send outcomes, and FCM error
//! classification.

use std::collections::HashMap;

use chirp_common::id::prefix;
use chirp_common::PrefixedId;

use crate::models::device_token::DeviceToken;

/// One logical notification. Retries keep the id and narrow `recipients`
/// to the devices that still need it.
#[derive(Debug, Clone, PartialEq)]
pub struct PushNotification {
    pub id: String,
    pub title: String,
    pub body: String,
    pub chat_id: String,
    pub recipients: Vec<DeviceToken>,
    pub data: HashMap<String, String>,
}

impl PrefixedId for PushNotification {
    const PREFIX: &'static str = prefix::NOTIFICATION;
}

impl PushNotification {
    pub fn new_message(
        sender_name: &str,
        content: &str,
        chat_id: &str,
        recipients: Vec<DeviceToken>,
    ) -> Self {
        let data = HashMap::from([
            ("chatId".to_string(), chat_id.to_string()),
            ("type".to_string(), "new_message".to_string()),
        ]);
        Self {
            id: Self::generate(),
            title: format!("New message from {sender_name}"),
            body: content.to_string(),
            chat_id: chat_id.to_string(),
            recipients,
            data,
        }
    }

    /// Same notification, addressed to a subset of devices.
    pub fn with_recipients(&self, recipients: Vec<DeviceToken>) -> Self {
        Self {
            recipients,
            ..self.clone()
        }
    }
}

/// FCM `errorCode` values we act on. Anything unrecognised is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushErrorCode {
    Unregistered,
    SenderIdMismatch,
    InvalidArgument,
    ThirdPartyAuthError,
    Internal,
    QuotaExceeded,
    Unavailable,
    Unknown,
}

impl PushErrorCode {
    /// Parse an FCM `errorCode` (the `FcmError` detail of a v1 error).
    pub fn parse(code: &str) -> Self {
        match code {
            "UNREGISTERED" => Self::Unregistered,
            "SENDER_ID_MISMATCH" => Self::SenderIdMismatch,
            "INVALID_ARGUMENT" => Self::InvalidArgument,
            "THIRD_PARTY_AUTH_ERROR" => Self::ThirdPartyAuthError,
            "INTERNAL" => Self::Internal,
            "QUOTA_EXCEEDED" => Self::QuotaExceeded,
            "UNAVAILABLE" => Self::Unavailable,
            _ => Self::Unknown,
        }
    }

    /// Map a bare gRPC `error.status`. A status alone never marks a token
    /// dead: `UNAUTHENTICATED`, `PERMISSION_DENIED` and `NOT_FOUND` without
    /// an FCM detail come from our own credentials or project, not the device.
    pub fn from_status(status: &str) -> Self {
        match status {
            "INTERNAL" => Self::Internal,
            "RESOURCE_EXHAUSTED" => Self::QuotaExceeded,
            "UNAVAILABLE" => Self::Unavailable,
            _ => Self::Unknown,
        }
    }

    /// Permanent failures mean the token itself is dead.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            Self::Unregistered
                | Self::SenderIdMismatch
                | Self::InvalidArgument
                | Self::ThirdPartyAuthError
        )
    }
}

/// Recipients of one send, partitioned by result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOutcome {
    pub succeeded: Vec<DeviceToken>,
    pub temporary_failures: Vec<DeviceToken>,
    pub permanent_failures: Vec<DeviceToken>,
}

impl SendOutcome {
    /// Used when the transport itself failed before any device was tried.
    pub fn all_temporary(recipients: &[DeviceToken]) -> Self {
        Self {
            temporary_failures: recipients.to_vec(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, recipient: DeviceToken, result: Result<(), PushErrorCode>) {
        match result {
            Ok(()) => self.succeeded.push(recipient),
            Err(code) if code.is_permanent() => self.permanent_failures.push(recipient),
            Err(_) => self.temporary_failures.push(recipient),
        }
    }
}
