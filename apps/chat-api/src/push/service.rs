use std::sync::Arc;

use crate::db::device_tokens::DeviceTokenStore;
use crate::error::{ApiError, FieldError};
use crate::models::device_token::{DeviceToken, Platform};

use super::notification::{PushNotification, SendOutcome};
use super::retry::RetryScheduler;

/// Device registration plus the "new message" notification path.
pub struct PushNotifier {
    tokens: Arc<dyn DeviceTokenStore>,
    scheduler: Arc<RetryScheduler>,
}

impl PushNotifier {
    pub fn new(tokens: Arc<dyn DeviceTokenStore>, scheduler: Arc<RetryScheduler>) -> Self {
        Self { tokens, scheduler }
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler> {
        &self.scheduler
    }

    /// Register a device for `user_id`. A token already registered to
    /// another user moves to this one.
    pub async fn register_device(
        &self,
        user_id: &str,
        token: &str,
        platform: Platform,
    ) -> Result<DeviceToken, ApiError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ApiError::validation(vec![FieldError {
                field: "token".to_string(),
                message: "must not be blank".to_string(),
            }]));
        }

        let device = self.tokens.upsert_token(user_id, token, platform).await?;
        tracing::info!(user_id = %user_id, platform = platform.as_str(), "device registered");
        Ok(device)
    }

    pub async fn unregister_device(&self, token: &str) -> Result<(), ApiError> {
        self.tokens.delete_token(token.trim()).await
    }

    /// Notify `recipients` about a new chat message. Returns `None` when
    /// none of them has a registered device.
    pub async fn send_new_message_notification(
        &self,
        recipients: &[String],
        sender_id: &str,
        sender_name: &str,
        content: &str,
        chat_id: &str,
    ) -> Result<Option<SendOutcome>, ApiError> {
        let devices: Vec<DeviceToken> = self
            .tokens
            .find_tokens_for_users(recipients)
            .await?
            .into_iter()
            .filter(|device| device.user_id != sender_id)
            .collect();

        if devices.is_empty() {
            tracing::debug!(chat_id = %chat_id, users = recipients.len(), "no device tokens for recipients");
            return Ok(None);
        }

        let notification = PushNotification::new_message(sender_name, content, chat_id, devices);
        Ok(Some(self.scheduler.send_with_retry(notification, 0).await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::device_tokens::MemoryDeviceTokenStore;
    use crate::push::retry::RetryPolicy;
    use crate::push::MemoryPushTransport;

    fn notifier() -> (Arc<MemoryPushTransport>, Arc<MemoryDeviceTokenStore>, PushNotifier) {
        let transport = Arc::new(MemoryPushTransport::new());
        let tokens = Arc::new(MemoryDeviceTokenStore::new());
        let scheduler = Arc::new(RetryScheduler::new(
            transport.clone(),
            tokens.clone(),
            RetryPolicy::default(),
        ));
        (transport, tokens.clone(), PushNotifier::new(tokens, scheduler))
    }

    #[tokio::test]
    async fn register_trims_and_rejects_blank_tokens() {
        let (_t, tokens, notifier) = notifier();
        let device = notifier
            .register_device("u1", "  tok-1 ", Platform::Ios)
            .await
            .unwrap();
        assert_eq!(device.token, "tok-1");
        assert!(tokens.contains("tok-1"));

        let err = notifier.register_device("u1", "   ", Platform::Ios).await.unwrap_err();
        assert_eq!(err.code, "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn sender_devices_are_excluded() {
        let (transport, _tokens, notifier) = notifier();
        notifier.register_device("u1", "mine", Platform::Android).await.unwrap();
        notifier.register_device("u2", "theirs", Platform::Android).await.unwrap();

        let outcome = notifier
            .send_new_message_notification(
                &["u1".to_string(), "u2".to_string()],
                "u1",
                "alice",
                "hi",
                "c1",
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.succeeded[0].token, "theirs");
        assert_eq!(transport.sent()[0].title, "New message from alice");
    }

    #[tokio::test]
    async fn no_devices_means_no_send() {
        let (transport, _tokens, notifier) = notifier();
        let outcome = notifier
            .send_new_message_notification(&["u2".to_string()], "u1", "alice", "hi", "c1")
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(transport.sent().is_empty());
    }
}
