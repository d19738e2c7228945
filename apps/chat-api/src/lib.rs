pub mod auth;
pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod push;
pub mod routes;

use std::sync::Arc;

use auth::jwt::JwtVerifier;
use config::Config;
use gateway::fanout::EventRouter;
use gateway::registry::ConnectionRegistry;
use push::PushNotifier;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub verifier: JwtVerifier,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<EventRouter>,
    pub push: Arc<PushNotifier>,
}
