//! Push device registration endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiErrorBody};
use crate::models::device_token::{DeviceToken, Platform};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notification/register", post(register_device))
        .route("/notification/{token}", delete(unregister_device))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterDeviceRequest {
    pub token: String,
    pub platform: Platform,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTokenResponse {
    pub user_id: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

impl From<DeviceToken> for DeviceTokenResponse {
    fn from(device: DeviceToken) -> Self {
        Self {
            user_id: device.user_id,
            token: device.token,
            created_at: device.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// POST /api/v1/notification/register
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/notification/register",
    tag = "Notifications",
    security(("bearer" = [])),
    request_body = RegisterDeviceRequest,
    responses(
        (status = 200, description = "Device registered", body = DeviceTokenResponse),
        (status = 400, description = "Blank token", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn register_device(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<RegisterDeviceRequest>,
) -> Result<Json<DeviceTokenResponse>, ApiError> {
    let device = state
        .push
        .register_device(&user_id, &body.token, body.platform)
        .await?;
    Ok(Json(device.into()))
}

// ---------------------------------------------------------------------------
// DELETE /api/v1/notification/:token
// ---------------------------------------------------------------------------

#[utoipa::path(
    delete,
    path = "/api/v1/notification/{token}",
    tag = "Notifications",
    security(("bearer" = [])),
    params(
        ("token" = String, Path, description = "Device push token"),
    ),
    responses(
        (status = 204, description = "Device unregistered"),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn unregister_device(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.push.unregister_device(&token).await?;
    tracing::info!(user_id = %user_id, "device unregistered");
    Ok(StatusCode::NO_CONTENT)
}
