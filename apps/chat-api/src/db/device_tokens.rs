//! Device token storage for push notifications.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use diesel::prelude::*;
use parking_lot::Mutex;

use crate::db::pool::DbPool;
use crate::db::schema::device_tokens;
use crate::error::ApiError;
use crate::models::device_token::{DeviceToken, DeviceTokenRow, NewDeviceToken, Platform};

#[async_trait]
pub trait DeviceTokenStore: Send + Sync {
    async fn find_tokens_for_users(&self, user_ids: &[String]) -> Result<Vec<DeviceToken>, ApiError>;
    /// Insert a token, or hand an existing token over to `user_id`.
    async fn upsert_token(
        &self,
        user_id: &str,
        token: &str,
        platform: Platform,
    ) -> Result<DeviceToken, ApiError>;
    async fn delete_token(&self, token: &str) -> Result<(), ApiError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgDeviceTokenStore {
    db: DbPool,
}

impl PgDeviceTokenStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DeviceTokenStore for PgDeviceTokenStore {
    async fn find_tokens_for_users(&self, user_ids: &[String]) -> Result<Vec<DeviceToken>, ApiError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.db.get().await?;
        let rows: Vec<DeviceTokenRow> = diesel_async::RunQueryDsl::load(
            device_tokens::table
                .filter(device_tokens::user_id.eq_any(user_ids))
                .select(DeviceTokenRow::as_select()),
            &mut conn,
        )
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(DeviceTokenRow::into_device_token)
            .collect())
    }

    async fn upsert_token(
        &self,
        user_id: &str,
        token: &str,
        platform: Platform,
    ) -> Result<DeviceToken, ApiError> {
        let mut conn = self.db.get().await?;
        let new_token = NewDeviceToken {
            user_id,
            token,
            platform: platform.as_str(),
            created_at: Utc::now(),
        };
        let row: DeviceTokenRow = diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(device_tokens::table)
                .values(&new_token)
                .on_conflict(device_tokens::token)
                .do_update()
                .set((
                    device_tokens::user_id.eq(user_id),
                    device_tokens::platform.eq(platform.as_str()),
                ))
                .returning(DeviceTokenRow::as_returning()),
            &mut conn,
        )
        .await?;
        row.into_device_token()
            .ok_or_else(|| ApiError::internal("Stored device token has an unknown platform"))
    }

    async fn delete_token(&self, token: &str) -> Result<(), ApiError> {
        let mut conn = self.db.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::delete(device_tokens::table.filter(device_tokens::token.eq(token))),
            &mut conn,
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (for tests / local development)
// ---------------------------------------------------------------------------

pub struct MemoryDeviceTokenStore {
    tokens: DashMap<String, DeviceToken>,
    deletions: Mutex<Vec<String>>,
}

impl MemoryDeviceTokenStore {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
            deletions: Mutex::new(Vec::new()),
        }
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains_key(token)
    }

    /// Every token passed to `delete_token`, in call order.
    pub fn deleted_tokens(&self) -> Vec<String> {
        self.deletions.lock().clone()
    }
}

impl Default for MemoryDeviceTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceTokenStore for MemoryDeviceTokenStore {
    async fn find_tokens_for_users(&self, user_ids: &[String]) -> Result<Vec<DeviceToken>, ApiError> {
        Ok(self
            .tokens
            .iter()
            .filter(|entry| user_ids.contains(&entry.value().user_id))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn upsert_token(
        &self,
        user_id: &str,
        token: &str,
        platform: Platform,
    ) -> Result<DeviceToken, ApiError> {
        let mut entry = self
            .tokens
            .entry(token.to_string())
            .or_insert_with(|| DeviceToken {
                user_id: user_id.to_string(),
                token: token.to_string(),
                platform,
                created_at: Utc::now(),
            });
        entry.user_id = user_id.to_string();
        entry.platform = platform;
        Ok(entry.clone())
    }

    async fn delete_token(&self, token: &str) -> Result<(), ApiError> {
        self.tokens.remove(token);
        self.deletions.lock().push(token.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_reassigns_existing_token() {
        let store = MemoryDeviceTokenStore::new();
        store.upsert_token("u1", "tok", Platform::Android).await.unwrap();
        store.upsert_token("u2", "tok", Platform::Android).await.unwrap();

        let u1 = store.find_tokens_for_users(&["u1".to_string()]).await.unwrap();
        let u2 = store.find_tokens_for_users(&["u2".to_string()]).await.unwrap();
        assert!(u1.is_empty());
        assert_eq!(u2.len(), 1);
    }

    #[tokio::test]
    async fn delete_is_recorded() {
        let store = MemoryDeviceTokenStore::new();
        store.upsert_token("u1", "tok", Platform::Ios).await.unwrap();
        store.delete_token("tok").await.unwrap();
        assert!(!store.contains("tok"));
        assert_eq!(store.deleted_tokens(), vec!["tok".to_string()]);
    }
}
