//! Redis pub/sub consumer for chat events.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;

use crate::gateway::fanout::EventRouter;

/// Wait between a dropped subscription and the next connect attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Consume `channel` for the life of the process, reconnecting on failure.
pub fn spawn_listener(redis_url: String, channel: String, router: Arc<EventRouter>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listen(&redis_url, &channel, &router).await {
                Ok(()) => tracing::warn!(%channel, "chat event subscription ended"),
                Err(e) => tracing::error!(?e, %channel, "chat event subscription failed"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}

async fn listen(redis_url: &str, channel: &str, router: &EventRouter) -> redis::RedisResult<()> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    tracing::info!(%channel, "subscribed to chat events");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(?e, "non-text chat event payload");
                continue;
            }
        };
        super::handle_payload(router, &payload).await;
    }
    Ok(())
}
