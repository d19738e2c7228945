//! Mobile push delivery for recipients without a live chat session.

pub mod fcm;
pub mod notification;
pub mod retry;
pub mod service;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use notification::{PushErrorCode, PushNotification, SendOutcome};

pub use service::PushNotifier;

/// Sends one notification to each of its recipients.
///
/// Never fails as a whole: a transport-level problem is reported as every
/// recipient failing temporarily.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, notification: &PushNotification) -> SendOutcome;
}

// ---------------------------------------------------------------------------
// In-memory implementation (for tests / local development)
// ---------------------------------------------------------------------------

/// Succeeds for every token unless told otherwise, and records every send.
#[derive(Default)]
pub struct MemoryPushTransport {
    failures: Mutex<HashMap<String, PushErrorCode>>,
    sent: Mutex<Vec<PushNotification>>,
}

impl MemoryPushTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future send to `token` fail with `code`.
    pub fn fail_with(&self, token: &str, code: PushErrorCode) {
        self.failures.lock().insert(token.to_string(), code);
    }

    pub fn clear_failure(&self, token: &str) {
        self.failures.lock().remove(token);
    }

    pub fn sent(&self) -> Vec<PushNotification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl PushTransport for MemoryPushTransport {
    async fn send(&self, notification: &PushNotification) -> SendOutcome {
        self.sent.lock().push(notification.clone());

        let failures = self.failures.lock();
        let mut outcome = SendOutcome::default();
        for recipient in &notification.recipients {
            let result = match failures.get(&recipient.token) {
                Some(code) => Err(*code),
                None => Ok(()),
            };
            outcome.record(recipient.clone(), result);
        }
        outcome
    }
}
