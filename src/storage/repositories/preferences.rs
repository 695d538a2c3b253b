/*!
 * 偏好设置Repository
 *
 * 工作区级 key/value；set 是幂等 upsert。
 */

use crate::error::{CoreError, CoreResult};
use crate::storage::database::StateStore;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::sync::Arc;

pub struct PreferenceRepository {
    store: Arc<StateStore>,
}

impl PreferenceRepository {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub async fn set(&self, key: &str, value: &str, now: DateTime<Utc>) -> CoreResult<()> {
        if key.trim().is_empty() {
            return Err(CoreError::validation("偏好键不能为空"));
        }
        sqlx::query(
            r#"
            INSERT INTO preferences (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM preferences WHERE key = ?")
            .bind(key)
            .fetch_optional(self.store.pool())
            .await?;
        row.map(|r| r.try_get("value").map_err(Into::into)).transpose()
    }
}
