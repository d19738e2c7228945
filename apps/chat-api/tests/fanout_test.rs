mod common;

use std::time::Duration;

use chat_api::gateway::events::SendMessagePayload;
use chat_api::gateway::fanout::MessageDispatch;
use chat_api::models::device_token::Platform;
use tokio::time;

fn send_frame(chat_id: &str, content: &str) -> String {
    let payload = serde_json::json!({ "chatId": chat_id, "content": content }).to_string();
    serde_json::json!({ "type": "NEW_MESSAGE", "payload": payload }).to_string()
}

#[tokio::test]
async fn message_reaches_every_member_session_once() {
    let ctx = common::test_context();
    ctx.chats.add_member("c1", "alice", "alice");
    ctx.chats.add_member("c1", "bob", "bob");

    let mut alice_rx = common::connect_session(&ctx, "s-alice", "alice").await;
    let mut bob_rx = common::connect_session(&ctx, "s-bob", "bob").await;

    let session = ctx.registry().session("s-alice").expect("alice session");
    let dispatch = ctx
        .router()
        .handle_frame(&session, &send_frame("c1", "hello"))
        .await
        .expect("frame handled");

    match dispatch {
        MessageDispatch::Delivered { recipients, .. } => assert_eq!(recipients, 2),
        other => panic!("expected delivery, got {other:?}"),
    }
    assert_eq!(ctx.chats.persisted().len(), 1);

    for rx in [&mut alice_rx, &mut bob_rx] {
        let events = common::drain_events(rx);
        assert_eq!(events.len(), 1);
        let (event_type, payload) = &events[0];
        assert_eq!(event_type, "NEW_MESSAGE");
        assert_eq!(payload["content"], "hello");
        assert_eq!(payload["chatId"], "c1");
        assert_eq!(payload["senderId"], "alice");
    }
}

#[tokio::test]
async fn non_member_send_is_rejected_without_side_effects() {
    let ctx = common::test_context();
    ctx.chats.add_member("c1", "alice", "alice");
    ctx.chats.add_member("c2", "mallory", "mallory");

    let mut alice_rx = common::connect_session(&ctx, "s-alice", "alice").await;
    let mut mallory_rx = common::connect_session(&ctx, "s-mallory", "mallory").await;

    let dispatch = ctx
        .router()
        .send_message(
            "s-mallory",
            "mallory",
            SendMessagePayload {
                chat_id: "c1".into(),
                content: "let me in".into(),
                message_id: None,
            },
        )
        .await;

    assert!(matches!(dispatch, MessageDispatch::NotAMember));
    assert!(ctx.chats.persisted().is_empty());
    assert!(common::drain_events(&mut alice_rx).is_empty());

    let errors = common::drain_events(&mut mallory_rx);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "ERROR");
    assert_eq!(errors[0].1["code"], "NOT_A_MEMBER");
}

#[tokio::test]
async fn invalid_json_only_answers_the_sender() {
    let ctx = common::test_context();
    ctx.chats.add_member("c1", "alice", "alice");
    ctx.chats.add_member("c1", "bob", "bob");

    let mut alice_rx = common::connect_session(&ctx, "s-alice", "alice").await;
    let mut bob_rx = common::connect_session(&ctx, "s-bob", "bob").await;

    let session = ctx.registry().session("s-alice").expect("alice session");
    assert!(ctx.router().handle_frame(&session, "{not json").await.is_none());

    let errors = common::drain_events(&mut alice_rx);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].1["code"], "INVALID_JSON");
    assert!(common::drain_events(&mut bob_rx).is_empty());
    assert!(ctx.chats.persisted().is_empty());
}

#[tokio::test]
async fn inline_object_payload_is_accepted() {
    let ctx = common::test_context();
    ctx.chats.add_member("c1", "alice", "alice");
    let mut rx = common::connect_session(&ctx, "s-alice", "alice").await;

    let frame = serde_json::json!({
        "type": "NEW_MESSAGE",
        "payload": { "chatId": "c1", "content": "inline", "messageId": "msg_client_1" }
    })
    .to_string();
    let session = ctx.registry().session("s-alice").expect("session");
    ctx.router().handle_frame(&session, &frame).await;

    let events = common::drain_events(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1["id"], "msg_client_1");
}

#[tokio::test]
async fn sends_to_one_chat_broadcast_in_persistence_order() {
    let ctx = common::test_context();
    ctx.chats.add_member("c1", "alice", "alice");
    ctx.chats.add_member("c1", "bob", "bob");
    let _alice_rx = common::connect_session(&ctx, "s-alice", "alice").await;
    let mut bob_rx = common::connect_session(&ctx, "s-bob", "bob").await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let router = ctx.router().clone();
        tasks.push(tokio::spawn(async move {
            router
                .send_message(
                    "s-alice",
                    "alice",
                    SendMessagePayload {
                        chat_id: "c1".into(),
                        content: format!("m{i}"),
                        message_id: None,
                    },
                )
                .await
        }));
    }
    for task in tasks {
        task.await.expect("send task");
    }

    let persisted: Vec<String> = ctx.chats.persisted().into_iter().map(|m| m.id).collect();
    let received: Vec<String> = common::drain_events(&mut bob_rx)
        .into_iter()
        .map(|(_, payload)| payload["id"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(received, persisted);
}

#[tokio::test]
async fn offline_participants_get_a_push() {
    let ctx = common::test_context();
    ctx.chats.add_member("c1", "alice", "Alice");
    ctx.chats.add_member("c1", "bob", "Bob");
    ctx.state
        .push
        .register_device("bob", "bob-phone", Platform::Android)
        .await
        .expect("register bob");
    ctx.state
        .push
        .register_device("alice", "alice-phone", Platform::Ios)
        .await
        .expect("register alice");

    let _alice_rx = common::connect_session(&ctx, "s-alice", "alice").await;

    ctx.router()
        .send_message(
            "s-alice",
            "alice",
            SendMessagePayload {
                chat_id: "c1".into(),
                content: "you there?".into(),
                message_id: None,
            },
        )
        .await;

    let sent = time::timeout(Duration::from_secs(2), async {
        loop {
            let sent = ctx.transport.sent();
            if !sent.is_empty() {
                return sent;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("push was not sent");

    assert_eq!(sent.len(), 1);
    let tokens: Vec<&str> = sent[0].recipients.iter().map(|d| d.token.as_str()).collect();
    assert_eq!(tokens, vec!["bob-phone"]);
    assert_eq!(sent[0].title, "New message from Alice");
    assert_eq!(sent[0].chat_id, "c1");
}

#[tokio::test]
async fn online_participants_are_not_pushed() {
    let ctx = common::test_context();
    ctx.chats.add_member("c1", "alice", "Alice");
    ctx.chats.add_member("c1", "bob", "Bob");
    ctx.state
        .push
        .register_device("bob", "bob-phone", Platform::Android)
        .await
        .expect("register bob");

    let _alice_rx = common::connect_session(&ctx, "s-alice", "alice").await;
    let _bob_rx = common::connect_session(&ctx, "s-bob", "bob").await;

    let message = match ctx
        .router()
        .send_message(
            "s-alice",
            "alice",
            SendMessagePayload {
                chat_id: "c1".into(),
                content: "hi".into(),
                message_id: None,
            },
        )
        .await
    {
        MessageDispatch::Delivered { message, .. } => message,
        other => panic!("expected delivery, got {other:?}"),
    };

    ctx.router().notify_offline_recipients(&message).await;
    assert!(ctx.transport.sent().is_empty());
}

#[tokio::test]
async fn membership_events_update_routing() {
    let ctx = common::test_context();
    ctx.chats.add_member("c1", "alice", "alice");
    let mut alice_rx = common::connect_session(&ctx, "s-alice", "alice").await;
    let mut bob_rx = common::connect_session(&ctx, "s-bob", "bob").await;

    assert!(!ctx.registry().is_user_in_chat("bob", "c1"));
    ctx.chats.add_member("c1", "bob", "bob");
    assert_eq!(ctx.router().on_participants_joined("c1", &["bob".to_string()]).await, 2);
    assert!(ctx.registry().is_user_in_chat("bob", "c1"));

    for rx in [&mut alice_rx, &mut bob_rx] {
        let events = common::drain_events(rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "CHAT_PARTICIPANT_CHANGED");
        assert_eq!(events[0].1["chatId"], "c1");
    }

    assert_eq!(ctx.router().on_participant_left("c1", "bob"), 1);
    assert!(!ctx.registry().is_user_in_chat("bob", "c1"));
    assert_eq!(common::drain_events(&mut alice_rx).len(), 1);
    assert!(common::drain_events(&mut bob_rx).is_empty());
}

#[tokio::test]
async fn profile_picture_reaches_chat_peers_and_own_devices() {
    let ctx = common::test_context();
    ctx.chats.add_member("c1", "alice", "alice");
    ctx.chats.add_member("c1", "bob", "bob");
    ctx.chats.add_member("c2", "carol", "carol");

    let mut alice_phone = common::connect_session(&ctx, "s-alice-1", "alice").await;
    let mut alice_web = common::connect_session(&ctx, "s-alice-2", "alice").await;
    let mut bob_rx = common::connect_session(&ctx, "s-bob", "bob").await;
    let mut carol_rx = common::connect_session(&ctx, "s-carol", "carol").await;

    let notified = ctx
        .router()
        .on_profile_picture_updated("alice", Some("https://cdn.example/a.png".into()))
        .await;
    assert_eq!(notified, 3);

    for rx in [&mut alice_phone, &mut alice_web, &mut bob_rx] {
        let events = common::drain_events(rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "PROFILE_PICTURE_UPDATED");
        assert_eq!(events[0].1["newUrl"], "https://cdn.example/a.png");
    }
    assert!(common::drain_events(&mut carol_rx).is_empty());
}
