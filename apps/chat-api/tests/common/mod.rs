#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use tokio::sync::mpsc;

use chat_api::auth::jwt::{JwtVerifier, ACCESS_TOKEN_TYPE};
use chat_api::config::Config;
use chat_api::db::chats::MemoryChatStore;
use chat_api::db::device_tokens::MemoryDeviceTokenStore;
use chat_api::gateway::fanout::EventRouter;
use chat_api::gateway::heartbeat::HeartbeatConfig;
use chat_api::gateway::registry::ConnectionRegistry;
use chat_api::gateway::session::{Outbound, SessionHandle};
use chat_api::push::retry::{RetryPolicy, RetryScheduler};
use chat_api::push::{MemoryPushTransport, PushNotifier};
use chat_api::AppState;

pub const TEST_SECRET: &[u8] = b"chirp-test-secret-do-not-use-in-production";

/// Everything a test needs to poke at behind an `AppState`.
pub struct TestContext {
    pub state: AppState,
    pub chats: Arc<MemoryChatStore>,
    pub tokens: Arc<MemoryDeviceTokenStore>,
    pub transport: Arc<MemoryPushTransport>,
}

impl TestContext {
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.state.router
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler> {
        self.state.push.scheduler()
    }

    /// Mint a valid access token for `user_id`.
    pub fn access_token(&self, user_id: &str) -> String {
        self.state
            .verifier
            .issue(user_id, ACCESS_TOKEN_TYPE, chrono::Duration::minutes(15))
            .expect("mint access token")
    }
}

pub fn test_config() -> Config {
    Config {
        database_url: "postgres://localhost/chirp_test".to_string(),
        jwt_secret: String::new(),
        port: 0,
        redis_url: None,
        chat_events_channel: "chirp.chat-events".to_string(),
        heartbeat: HeartbeatConfig::default(),
        push_retry: RetryPolicy::default(),
        fcm_credentials_path: None,
        android_package_name: "com.example.chirp".to_string(),
    }
}

/// Build an `AppState` backed by in-memory stores and transport. Push is
/// wired into the router so offline recipients get notifications.
pub fn test_context() -> TestContext {
    let config = test_config();
    let chats = Arc::new(MemoryChatStore::new());
    let tokens = Arc::new(MemoryDeviceTokenStore::new());
    let transport = Arc::new(MemoryPushTransport::new());

    let scheduler = Arc::new(RetryScheduler::new(
        transport.clone(),
        tokens.clone(),
        config.push_retry.clone(),
    ));
    let push = Arc::new(PushNotifier::new(tokens.clone(), scheduler));

    let registry = Arc::new(ConnectionRegistry::new(chats.clone()));
    let router = Arc::new(EventRouter::new(
        registry.clone(),
        chats.clone(),
        chats.clone(),
        Some(push.clone()),
    ));

    let state = AppState {
        config: Arc::new(config),
        verifier: JwtVerifier::from_secret(TEST_SECRET),
        registry,
        router,
        push,
    };

    TestContext {
        state,
        chats,
        tokens,
        transport,
    }
}

/// Build the full application router wired to a fresh test context.
pub fn test_app() -> (Router, TestContext) {
    let ctx = test_context();
    let app = chat_api::routes::router().with_state(ctx.state.clone());
    (app, ctx)
}

/// Register a session directly with the registry and hand back its
/// outbound receiver.
pub async fn connect_session(
    ctx: &TestContext,
    session_id: &str,
    user_id: &str,
) -> mpsc::Receiver<Outbound> {
    let (handle, rx) = SessionHandle::channel(64);
    ctx.registry()
        .connect(session_id.to_string(), user_id.to_string(), handle)
        .await;
    rx
}

/// Drain every queued text frame, decoding the envelope and its string
/// payload.
pub fn drain_events(rx: &mut mpsc::Receiver<Outbound>) -> Vec<(String, serde_json::Value)> {
    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Outbound::Text(text) = frame {
            events.push(decode_frame(&text));
        }
    }
    events
}

pub fn decode_frame(text: &str) -> (String, serde_json::Value) {
    let envelope: serde_json::Value = serde_json::from_str(text).expect("frame is JSON");
    let event_type = envelope["type"].as_str().expect("type").to_string();
    let payload = envelope["payload"].as_str().expect("payload is a string");
    (event_type, serde_json::from_str(payload).expect("payload is JSON"))
}
