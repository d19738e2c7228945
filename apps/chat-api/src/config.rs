use std::time::Duration;

use crate::gateway::heartbeat::HeartbeatConfig;
use crate::push::retry::RetryPolicy;

/// Chat realtime service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Base64-encoded HMAC secret shared with the auth service.
    pub jwt_secret: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Redis URL for the chat event subscription. `None` disables the consumer.
    pub redis_url: Option<String>,
    /// Pub/sub channel carrying chat membership and message events.
    pub chat_events_channel: String,
    pub heartbeat: HeartbeatConfig,
    pub push_retry: RetryPolicy,
    /// Path to a Firebase service-account JSON file. `None` disables push.
    pub fcm_credentials_path: Option<String>,
    /// Android package allowed to receive our notifications.
    pub android_package_name: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let heartbeat_defaults = HeartbeatConfig::default();
        let retry_defaults = RetryPolicy::default();

        Self {
            database_url: required_var("DATABASE_URL"),
            jwt_secret: required_var("JWT_SECRET"),
            port: parsed_var("PORT").unwrap_or(8080),
            redis_url: optional_var("REDIS_URL"),
            chat_events_channel: optional_var("CHAT_EVENTS_CHANNEL")
                .unwrap_or_else(|| "chirp.chat-events".to_string()),
            heartbeat: HeartbeatConfig {
                ping_interval: secs_var("HEARTBEAT_INTERVAL_SECS")
                    .unwrap_or(heartbeat_defaults.ping_interval),
                pong_timeout: secs_var("HEARTBEAT_TIMEOUT_SECS")
                    .unwrap_or(heartbeat_defaults.pong_timeout),
            },
            push_retry: RetryPolicy {
                poll_interval: secs_var("PUSH_RETRY_POLL_SECS")
                    .unwrap_or(retry_defaults.poll_interval),
                max_age: secs_var("PUSH_MAX_RETRY_AGE_SECS").unwrap_or(retry_defaults.max_age),
                ..retry_defaults
            },
            fcm_credentials_path: optional_var("FCM_CREDENTIALS_PATH"),
            android_package_name: optional_var("ANDROID_PACKAGE_NAME")
                .unwrap_or_else(|| "com.juandgaines.chirp".to_string()),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn secs_var(name: &str) -> Option<Duration> {
    parsed_var::<u64>(name).map(Duration::from_secs)
}
