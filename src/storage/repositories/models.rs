/*!
 * 模型配置Repository
 *
 * 注册表语义：至多一行 is_default=1，设置默认时在同一事务内清除其他行。
 */

use super::RowMapper;
use crate::error::{CoreError, CoreResult};
use crate::storage::database::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::sync::Arc;

/// 模型配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub id: String,
    pub display_name: String,
    pub provider: String,
    pub is_enabled: bool,
    pub is_default: bool,
    pub config_json: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl RowMapper<ModelConfig> for ModelConfig {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Self> {
        let config_json: Option<String> = row.try_get("config_json")?;
        Ok(Self {
            id: row.try_get("id")?,
            display_name: row.try_get("display_name")?,
            provider: row.try_get("provider")?,
            is_enabled: row.try_get("is_enabled")?,
            is_default: row.try_get("is_default")?,
            config_json: config_json.and_then(|raw| serde_json::from_str(&raw).ok()),
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// 模型配置Repository
pub struct ModelConfigRepository {
    store: Arc<StateStore>,
}

impl ModelConfigRepository {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// upsert 模型配置；is_default=true 时清除其他行的默认标记
    pub async fn upsert(&self, config: &ModelConfig, now: DateTime<Utc>) -> CoreResult<()> {
        if config.id.trim().is_empty() {
            return Err(CoreError::validation("模型ID不能为空"));
        }
        if config.display_name.trim().is_empty() {
            return Err(CoreError::validation("模型名称不能为空"));
        }
        let config_json = config.config_json.as_ref().map(|v| v.to_string());

        let mut tx = self.store.pool().begin().await?;

        if config.is_default {
            sqlx::query("UPDATE model_configs SET is_default = 0 WHERE id != ?")
                .bind(&config.id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO model_configs (id, display_name, provider, is_enabled, is_default, config_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                display_name = excluded.display_name,
                provider = excluded.provider,
                is_enabled = excluded.is_enabled,
                is_default = excluded.is_default,
                config_json = excluded.config_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&config.id)
        .bind(&config.display_name)
        .bind(&config.provider)
        .bind(config.is_enabled)
        .bind(config.is_default)
        .bind(&config_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> CoreResult<Option<ModelConfig>> {
        let row = sqlx::query(
            "SELECT id, display_name, provider, is_enabled, is_default, config_json, updated_at \
             FROM model_configs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.store.pool())
        .await?;
        row.map(|r| ModelConfig::from_row(&r)).transpose()
    }

    pub async fn list(&self) -> CoreResult<Vec<ModelConfig>> {
        let rows = sqlx::query(
            "SELECT id, display_name, provider, is_enabled, is_default, config_json, updated_at \
             FROM model_configs ORDER BY display_name ASC",
        )
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(ModelConfig::from_row).collect()
    }

    /// 当前默认模型
    pub async fn get_default(&self) -> CoreResult<Option<ModelConfig>> {
        let row = sqlx::query(
            "SELECT id, display_name, provider, is_enabled, is_default, config_json, updated_at \
             FROM model_configs WHERE is_default = 1 LIMIT 1",
        )
        .fetch_optional(self.store.pool())
        .await?;
        row.map(|r| ModelConfig::from_row(&r)).transpose()
    }

    pub async fn delete(&self, id: &str) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM model_configs WHERE id = ?")
            .bind(id)
            .execute(self.store.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("模型配置", id));
        }
        Ok(())
    }
}
