//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chirp_common::id::{prefix, prefixed_ulid};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::middleware::AuthUser;
use crate::AppState;

use super::session::{
    ConnectionLifecycle, ConnectionState, Outbound, Session, SessionHandle, OUTBOUND_BUFFER,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/chat", get(ws_upgrade))
}

/// The bearer token is checked by the extractor, so unauthenticated
/// clients get a 401 and never reach the upgrade.
async fn ws_upgrade(
    AuthUser { user_id }: AuthUser,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let mut lifecycle = ConnectionLifecycle::new();
    lifecycle.transition(ConnectionState::Authenticated);
    ws.on_upgrade(move |socket| handle_connection(socket, state, user_id, lifecycle))
}

async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    user_id: String,
    mut lifecycle: ConnectionLifecycle,
) {
    let (ws_tx, ws_rx) = socket.split();
    let (handle, outbound_rx) = SessionHandle::channel(OUTBOUND_BUFFER);

    let session = state
        .registry
        .connect(prefixed_ulid(prefix::SESSION), user_id, handle)
        .await;
    lifecycle.transition(ConnectionState::Active);

    let writer = spawn_writer(ws_tx, outbound_rx);
    run_session(&state, &session, ws_rx, writer).await;

    lifecycle.transition(ConnectionState::Closing);
    state.registry.disconnect(&session.session_id);
    lifecycle.transition(ConnectionState::Closed);

    tracing::info!(
        session_id = %session.session_id,
        user_id = %session.user_id,
        "chat connection closed"
    );
}

/// Drain the session's outbound queue onto the socket. Ends after a Close
/// frame, a write error, or once every handle to the session is gone.
fn spawn_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let (message, closing) = match frame {
                Outbound::Text(text) => (Message::Text(text.into()), false),
                Outbound::Ping => (Message::Ping(Default::default()), false),
                Outbound::Close { code, reason } => (
                    Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })),
                    true,
                ),
            };
            if ws_tx.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    })
}

/// Read loop: text frames go to the router, pongs refresh liveness. Stops
/// when the client goes away or the writer ends (e.g. after an eviction).
async fn run_session(
    state: &AppState,
    session: &Arc<Session>,
    mut ws_rx: SplitStream<WebSocket>,
    mut writer: JoinHandle<()>,
) {
    loop {
        tokio::select! {
            _ = &mut writer => {
                tracing::debug!(session_id = %session.session_id, "writer finished");
                break;
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.router.handle_frame(session, text.as_str()).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.registry.record_pong(&session.session_id);
                        tracing::debug!(session_id = %session.session_id, "received pong");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, session_id = %session.session_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }
        }
    }
}
