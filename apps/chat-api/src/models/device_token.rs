use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::schema::device_tokens;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "ANDROID",
            Platform::Ios => "IOS",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ANDROID" => Some(Platform::Android),
            "IOS" => Some(Platform::Ios),
            _ => None,
        }
    }
}

/// A registered push target for one of a user's devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceToken {
    pub user_id: String,
    pub token: String,
    pub platform: Platform,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = device_tokens)]
pub struct DeviceTokenRow {
    pub id: i64,
    pub user_id: String,
    pub token: String,
    pub platform: String,
    pub created_at: DateTime<Utc>,
}

impl DeviceTokenRow {
    /// Rows with a platform we no longer recognise are skipped.
    pub fn into_device_token(self) -> Option<DeviceToken> {
        let platform = Platform::parse(&self.platform)?;
        Some(DeviceToken {
            user_id: self.user_id,
            token: self.token,
            platform,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = device_tokens)]
pub struct NewDeviceToken<'a> {
    pub user_id: &'a str,
    pub token: &'a str,
    pub platform: &'a str,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trips_through_db_text() {
        for platform in [Platform::Android, Platform::Ios] {
            assert_eq!(Platform::parse(platform.as_str()), Some(platform));
        }
        assert_eq!(Platform::parse("WEB"), None);
    }

    #[test]
    fn unknown_platform_rows_are_skipped() {
        let row = DeviceTokenRow {
            id: 1,
            user_id: "u1".into(),
            token: "t1".into(),
            platform: "WINDOWS".into(),
            created_at: Utc::now(),
        };
        assert!(row.into_device_token().is_none());
    }
}
