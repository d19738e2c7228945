use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_api::auth::jwt::JwtVerifier;
use chat_api::config::Config;
use chat_api::db::chats::PgChatStore;
use chat_api::db::device_tokens::{DeviceTokenStore, PgDeviceTokenStore};
use chat_api::gateway::fanout::EventRouter;
use chat_api::gateway::heartbeat::HeartbeatMonitor;
use chat_api::gateway::registry::ConnectionRegistry;
use chat_api::push::fcm::FcmTransport;
use chat_api::push::retry::RetryScheduler;
use chat_api::push::{MemoryPushTransport, PushNotifier, PushTransport};
use chat_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env if present; env vars may also be set externally.
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let db = chat_api::db::pool::connect(&config.database_url);
    let chats = Arc::new(PgChatStore::new(db.clone()));
    let tokens: Arc<dyn DeviceTokenStore> = Arc::new(PgDeviceTokenStore::new(db));

    let verifier =
        JwtVerifier::from_base64_secret(&config.jwt_secret).expect("JWT_SECRET must be base64");

    // Without FCM credentials devices can still register; nothing is pushed.
    let fcm = config.fcm_credentials_path.as_deref().map(|path| {
        FcmTransport::from_credentials_file(path, &config.android_package_name)
            .expect("failed to load FCM credentials")
    });
    let push_enabled = fcm.is_some();
    let transport: Arc<dyn PushTransport> = match fcm {
        Some(fcm) => Arc::new(fcm),
        None => {
            tracing::warn!("FCM_CREDENTIALS_PATH not set, push notifications disabled");
            Arc::new(MemoryPushTransport::new())
        }
    };
    let scheduler = Arc::new(RetryScheduler::new(
        transport,
        tokens.clone(),
        config.push_retry.clone(),
    ));
    let push = Arc::new(PushNotifier::new(tokens, scheduler.clone()));

    let registry = Arc::new(ConnectionRegistry::new(chats.clone()));
    let router = Arc::new(EventRouter::new(
        registry.clone(),
        chats.clone(),
        chats,
        push_enabled.then(|| push.clone()),
    ));

    Arc::new(HeartbeatMonitor::new(registry.clone(), config.heartbeat)).spawn();
    if push_enabled {
        scheduler.spawn();
    }
    match &config.redis_url {
        Some(url) => {
            chat_api::bus::subscriber::spawn_listener(
                url.clone(),
                config.chat_events_channel.clone(),
                router.clone(),
            );
        }
        None => tracing::warn!("REDIS_URL not set, chat events will not be consumed"),
    }

    tracing::info!(
        ping_interval_secs = config.heartbeat.ping_interval.as_secs(),
        push_enabled,
        "chat-api configured"
    );

    let state = AppState {
        config: Arc::new(config),
        verifier,
        registry,
        router,
        push,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(chat_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "chat-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");
    tracing::info!("shutting down");
}
