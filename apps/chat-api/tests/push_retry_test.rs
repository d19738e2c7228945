mod common;

use std::sync::Arc;

use chat_api::db::device_tokens::{DeviceTokenStore, MemoryDeviceTokenStore};
use chat_api::models::device_token::{DeviceToken, Platform};
use chat_api::push::notification::{PushErrorCode, PushNotification};
use chat_api::push::retry::{RetryEntry, RetryPolicy, RetryScheduler};
use chat_api::push::MemoryPushTransport;
use chrono::{Duration, Utc};

struct Harness {
    transport: Arc<MemoryPushTransport>,
    tokens: Arc<MemoryDeviceTokenStore>,
    scheduler: RetryScheduler,
}

fn harness() -> Harness {
    let transport = Arc::new(MemoryPushTransport::new());
    let tokens = Arc::new(MemoryDeviceTokenStore::new());
    let scheduler = RetryScheduler::new(transport.clone(), tokens.clone(), RetryPolicy::default());
    Harness {
        transport,
        tokens,
        scheduler,
    }
}

async fn register(tokens: &MemoryDeviceTokenStore, user_id: &str, token: &str) -> DeviceToken {
    tokens
        .upsert_token(user_id, token, Platform::Android)
        .await
        .expect("register token")
}

#[tokio::test]
async fn mixed_outcome_deletes_dead_tokens_and_schedules_transient_ones() {
    let h = harness();
    let ok = register(&h.tokens, "u1", "tok-ok").await;
    let dead = register(&h.tokens, "u2", "tok-dead").await;
    let flaky = register(&h.tokens, "u3", "tok-flaky").await;
    h.transport.fail_with("tok-dead", PushErrorCode::Unregistered);
    h.transport.fail_with("tok-flaky", PushErrorCode::Unavailable);

    let notification = PushNotification::new_message(
        "alice",
        "hi",
        "c1",
        vec![ok.clone(), dead.clone(), flaky.clone()],
    );
    let now = Utc::now();
    let outcome = h
        .scheduler
        .attempt_delivery(notification.clone(), 0, now, now)
        .await;

    assert_eq!(outcome.succeeded, vec![ok]);
    assert_eq!(outcome.permanent_failures, vec![dead]);
    assert_eq!(outcome.temporary_failures, vec![flaky.clone()]);

    assert_eq!(h.tokens.deleted_tokens(), vec!["tok-dead".to_string()]);
    assert!(!h.tokens.contains("tok-dead"));
    assert!(h.tokens.contains("tok-flaky"));

    let pending = h.scheduler.pending();
    assert_eq!(pending.len(), 1);
    let (due_at, entry) = &pending[0];
    assert_eq!(*due_at, now + Duration::seconds(30));
    assert_eq!(entry.attempt, 1);
    assert_eq!(entry.created_at, now);
    assert_eq!(entry.notification.id, notification.id);
    assert_eq!(entry.notification.recipients, vec![flaky]);
}

#[tokio::test]
async fn stale_retry_is_discarded_without_sending() {
    let h = harness();
    let device = register(&h.tokens, "u1", "tok-1").await;
    let now = Utc::now();

    h.scheduler.enqueue(
        now - Duration::seconds(1),
        RetryEntry {
            notification: PushNotification::new_message("alice", "old", "c1", vec![device]),
            attempt: 3,
            created_at: now - Duration::minutes(31),
        },
    );

    assert_eq!(h.scheduler.process_due(now).await, 1);
    assert!(h.transport.sent().is_empty());
    assert!(h.scheduler.pending().is_empty());
}

#[tokio::test]
async fn retry_recovers_once_the_device_is_reachable() {
    let h = harness();
    let device = register(&h.tokens, "u1", "tok-1").await;
    h.transport.fail_with("tok-1", PushErrorCode::Internal);

    let start = Utc::now();
    h.scheduler
        .attempt_delivery(
            PushNotification::new_message("alice", "hi", "c1", vec![device.clone()]),
            0,
            start,
            start,
        )
        .await;

    // Not due yet.
    assert_eq!(h.scheduler.process_due(start + Duration::seconds(29)).await, 0);

    h.transport.clear_failure("tok-1");
    assert_eq!(h.scheduler.process_due(start + Duration::seconds(30)).await, 1);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].recipients, vec![device]);
    assert!(h.scheduler.pending().is_empty());
}

#[tokio::test]
async fn backoff_walks_the_schedule_until_exhausted() {
    let h = harness();
    let device = register(&h.tokens, "u1", "tok-1").await;
    h.transport.fail_with("tok-1", PushErrorCode::QuotaExceeded);

    let start = Utc::now();
    h.scheduler
        .attempt_delivery(
            PushNotification::new_message("alice", "hi", "c1", vec![device]),
            0,
            start,
            start,
        )
        .await;

    let mut now = start;
    let mut delays = Vec::new();
    while let Some((due_at, entry)) = h.scheduler.pending().into_iter().next() {
        delays.push(((due_at - now).num_seconds(), entry.attempt));
        now = due_at;
        h.scheduler.process_due(now).await;
    }

    assert_eq!(
        delays,
        vec![(30, 1), (60, 2), (120, 3), (300, 4), (600, 5)]
    );
    // Initial send plus five retries.
    assert_eq!(h.transport.sent().len(), 6);
}

#[tokio::test]
async fn notifier_skips_the_sender_and_users_without_devices() {
    let ctx = common::test_context();
    ctx.state
        .push
        .register_device("alice", "alice-phone", Platform::Ios)
        .await
        .expect("register alice");

    let outcome = ctx
        .state
        .push
        .send_new_message_notification(
            &["alice".to_string(), "bob".to_string()],
            "alice",
            "Alice",
            "hi",
            "c1",
        )
        .await
        .expect("notify");

    assert!(outcome.is_none());
    assert!(ctx.transport.sent().is_empty());
}
