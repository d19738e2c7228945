//! Firebase Cloud Messaging (HTTP v1) push transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::error::ApiError;
use crate::models::device_token::{DeviceToken, Platform};

use super::notification::{PushErrorCode, PushNotification, SendOutcome};
use super::PushTransport;

const MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const FCM_ERROR_TYPE: &str = "type.googleapis.com/google.firebase.fcm.v1.FcmError";

/// Lifetime requested for the signed assertion.
const ASSERTION_TTL_SECS: i64 = 3600;

/// Refresh the access token this long before it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// The fields of a Google service-account key file we need.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccount {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct FcmTransport {
    account: Arc<ServiceAccount>,
    signing_key: Arc<EncodingKey>,
    android_package: String,
    http: reqwest::Client,
    token: Arc<RwLock<Option<CachedToken>>>,
}

impl FcmTransport {
    pub fn new(account: ServiceAccount, android_package: &str) -> Result<Self, ApiError> {
        let signing_key = EncodingKey::from_rsa_pem(account.private_key.as_bytes()).map_err(|e| {
            tracing::error!(?e, "invalid service account private key");
            ApiError::internal("Invalid FCM service account key")
        })?;
        Ok(Self {
            account: Arc::new(account),
            signing_key: Arc::new(signing_key),
            android_package: android_package.to_string(),
            http: reqwest::Client::new(),
            token: Arc::new(RwLock::new(None)),
        })
    }

    /// Load a service-account JSON file from disk.
    pub fn from_credentials_file(path: &str, android_package: &str) -> Result<Self, ApiError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(?e, %path, "failed to read FCM credentials");
            ApiError::internal("Failed to read FCM credentials")
        })?;
        let account: ServiceAccount = serde_json::from_str(&raw).map_err(|e| {
            tracing::error!(?e, %path, "failed to parse FCM credentials");
            ApiError::internal("Failed to parse FCM credentials")
        })?;
        let transport = Self::new(account, android_package)?;
        tracing::info!(project_id = %transport.account.project_id, "FCM transport initialized");
        Ok(transport)
    }

    async fn access_token(&self) -> Result<String, ApiError> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if Instant::now() + TOKEN_REFRESH_MARGIN < token.expires_at {
                    return Ok(token.value.clone());
                }
            }
        }

        let fresh = self.fetch_access_token().await?;
        let value = fresh.value.clone();
        *self.token.write().await = Some(fresh);
        Ok(value)
    }

    async fn fetch_access_token(&self) -> Result<CachedToken, ApiError> {
        let now = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.account.client_email,
            scope: MESSAGING_SCOPE,
            aud: &self.account.token_uri,
            iat: now,
            exp: now + ASSERTION_TTL_SECS,
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(|e| {
                tracing::error!(?e, "failed to sign FCM assertion");
                ApiError::internal("Failed to sign FCM assertion")
            })?;

        let resp: TokenResponse = self
            .http
            .post(&self.account.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                tracing::error!(?e, "FCM token exchange failed");
                ApiError::unavailable("FCM token exchange failed")
            })?
            .json()
            .await
            .map_err(|e| {
                tracing::error!(?e, "FCM token response parse failed");
                ApiError::unavailable("Failed to parse FCM token response")
            })?;

        Ok(CachedToken {
            value: resp.access_token,
            expires_at: Instant::now() + Duration::from_secs(resp.expires_in),
        })
    }

    async fn send_one(
        &self,
        access_token: &str,
        notification: &PushNotification,
        recipient: &DeviceToken,
    ) -> Result<(), PushErrorCode> {
        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            self.account.project_id
        );
        let body = build_message(notification, recipient, &self.android_package);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(?e, notification_id = %notification.id, "FCM request failed");
                PushErrorCode::Unavailable
            })?;

        if resp.status().is_success() {
            return Ok(());
        }

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            // Our access token was rejected; mint a fresh one next send.
            *self.token.write().await = None;
        }
        let error_body: Value = resp.json().await.unwrap_or(Value::Null);
        let code = parse_error_code(&error_body);
        tracing::warn!(
            notification_id = %notification.id,
            user_id = %recipient.user_id,
            %status,
            ?code,
            "FCM rejected push"
        );
        Err(code)
    }
}

#[async_trait]
impl PushTransport for FcmTransport {
    async fn send(&self, notification: &PushNotification) -> SendOutcome {
        let access_token = match self.access_token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "no FCM access token, treating send as transient failure");
                return SendOutcome::all_temporary(&notification.recipients);
            }
        };

        let results = join_all(
            notification
                .recipients
                .iter()
                .map(|recipient| self.send_one(&access_token, notification, recipient)),
        )
        .await;

        let mut outcome = SendOutcome::default();
        for (recipient, result) in notification.recipients.iter().zip(results) {
            outcome.record(recipient.clone(), result);
        }
        tracing::debug!(
            succeeded = outcome.succeeded.len(),
            temporary = outcome.temporary_failures.len(),
            permanent = outcome.permanent_failures.len(),
            "FCM send result"
        );
        outcome
    }
}

/// Build the v1 `messages:send` request body for one device.
fn build_message(notification: &PushNotification, recipient: &DeviceToken, android_package: &str) -> Value {
    let mut message = json!({
        "token": recipient.token,
        "notification": {
            "title": notification.title,
            "body": notification.body,
        },
        "data": notification.data,
    });

    match recipient.platform {
        Platform::Android => {
            message["android"] = json!({
                "priority": "HIGH",
                "collapse_key": notification.chat_id,
                "restricted_package_name": android_package,
            });
        }
        Platform::Ios => {
            message["apns"] = json!({
                "payload": {
                    "aps": {
                        "sound": "default",
                        "thread-id": notification.chat_id,
                    }
                }
            });
        }
    }

    json!({ "message": message })
}

/// Pull the FCM error code out of an error response. Only the `FcmError`
/// detail can mark a token permanently bad; a bare status is mapped to a
/// transient code.
fn parse_error_code(body: &Value) -> PushErrorCode {
    let error = &body["error"];
    let fcm_code = error["details"].as_array().and_then(|details| {
        details
            .iter()
            .find(|d| d["@type"] == FCM_ERROR_TYPE)
            .and_then(|d| d["errorCode"].as_str())
    });

    match (fcm_code, error["status"].as_str()) {
        (Some(code), _) => PushErrorCode::parse(code),
        (None, Some(status)) => PushErrorCode::from_status(status),
        (None, None) => PushErrorCode::Unknown,
    }
}
