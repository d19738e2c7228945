//! Delayed re-delivery of push notifications that failed transiently.
//!
//! Pending retries live in a map keyed by absolute due time. A background
//! tick pulls everything due, drops entries older than the policy's max age,
//! and re-sends the rest; a re-send can schedule itself again until the
//! backoff schedule is exhausted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::db::device_tokens::DeviceTokenStore;

use super::notification::{PushNotification, SendOutcome};
use super::PushTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before retry N is `backoff[N - 1]`; also bounds the number of
    /// retries.
    pub backoff: Vec<Duration>,
    pub max_age: Duration,
    pub poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: [30, 60, 120, 300, 600]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            max_age: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Past the end of the schedule the last delay is reused.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or(self.backoff.last())
            .copied()
            .unwrap_or_default()
    }

    pub fn max_retries(&self) -> u32 {
        self.backoff.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryEntry {
    pub notification: PushNotification,
    pub attempt: u32,
    /// When the notification first entered the schedule.
    pub created_at: DateTime<Utc>,
}

pub struct RetryScheduler {
    transport: Arc<dyn PushTransport>,
    tokens: Arc<dyn DeviceTokenStore>,
    policy: RetryPolicy,
    queue: Mutex<BTreeMap<DateTime<Utc>, Vec<RetryEntry>>>,
}

impl RetryScheduler {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        tokens: Arc<dyn DeviceTokenStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            tokens,
            policy,
            queue: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn send_with_retry(&self, notification: PushNotification, attempt: u32) -> SendOutcome {
        let now = Utc::now();
        self.attempt_delivery(notification, attempt, now, now).await
    }

    /// Send once and act on the outcome: delete tokens that failed
    /// permanently, reschedule the transient failures if attempts remain.
    pub async fn attempt_delivery(
        &self,
        notification: PushNotification,
        attempt: u32,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SendOutcome {
        let outcome = self.transport.send(&notification).await;

        for recipient in &outcome.permanent_failures {
            tracing::warn!(
                notification_id = %notification.id,
                user_id = %recipient.user_id,
                "device token rejected permanently, deleting"
            );
            if let Err(e) = self.tokens.delete_token(&recipient.token).await {
                tracing::warn!(error = %e, "failed to delete device token");
            }
        }

        if !outcome.temporary_failures.is_empty() {
            if attempt < self.policy.max_retries() {
                let retry = notification.with_recipients(outcome.temporary_failures.clone());
                self.schedule(retry, attempt + 1, created_at, now);
            } else {
                tracing::warn!(
                    notification_id = %notification.id,
                    devices = outcome.temporary_failures.len(),
                    attempt,
                    "push retries exhausted"
                );
            }
        }

        if !outcome.succeeded.is_empty() {
            tracing::info!(
                notification_id = %notification.id,
                devices = outcome.succeeded.len(),
                "push notification sent"
            );
        }
        outcome
    }

    fn schedule(
        &self,
        notification: PushNotification,
        attempt: u32,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let delay = self.policy.delay_for(attempt);
        let due_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        tracing::info!(
            notification_id = %notification.id,
            devices = notification.recipients.len(),
            attempt,
            delay_secs = delay.as_secs(),
            "scheduled push retry"
        );

        self.queue.lock().entry(due_at).or_default().push(RetryEntry {
            notification,
            attempt,
            created_at,
        });
        due_at
    }

    /// Pull and re-attempt every entry due at or before `now`. Returns the
    /// number of entries taken off the queue.
    pub async fn process_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<RetryEntry> = {
            let mut queue = self.queue.lock();
            let keys: Vec<DateTime<Utc>> = queue.range(..=now).map(|(at, _)| *at).collect();
            keys.iter()
                .filter_map(|at| queue.remove(at))
                .flatten()
                .collect()
        };

        let count = due.len();
        for entry in due {
            let age = (now - entry.created_at).to_std().unwrap_or_default();
            if age > self.policy.max_age {
                tracing::info!(
                    notification_id = %entry.notification.id,
                    age_mins = age.as_secs() / 60,
                    "discarding stale push retry"
                );
                continue;
            }
            self.attempt_delivery(entry.notification, entry.attempt, entry.created_at, now)
                .await;
        }
        count
    }

    /// Pending retries ordered by due time.
    pub fn pending(&self) -> Vec<(DateTime<Utc>, RetryEntry)> {
        self.queue
            .lock()
            .iter()
            .flat_map(|(at, entries)| entries.iter().map(move |e| (*at, e.clone())))
            .collect()
    }

    /// Queue an entry directly; used to restore or inject retries.
    pub fn enqueue(&self, due_at: DateTime<Utc>, entry: RetryEntry) {
        self.queue.lock().entry(due_at).or_default().push(entry);
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.policy.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let processed = self.process_due(Utc::now()).await;
                if processed > 0 {
                    tracing::debug!(processed, "processed push retries");
                }
            }
        })
    }
}
