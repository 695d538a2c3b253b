/*!
 * 会话Repository
 *
 * 会话是跨任务的记录线程（thread_id 即会话 id）。写入会话消息会
 * 隐式 upsert 父会话，并把 updated_at 对齐到消息时间。
 */

use super::RowMapper;
use crate::error::{CoreError, CoreResult};
use crate::storage::database::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            _ => Err(CoreError::validation(format!("无效的会话状态: {}", s))),
        }
    }
}

/// 会话实体
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub task_id: Option<String>,
    pub title: Option<String>,
    pub total_tokens: i64,
    pub last_model: Option<String>,
    pub model_response_ids: Option<HashMap<String, String>>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RowMapper<Conversation> for Conversation {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Self> {
        let status_str: String = row.try_get("status")?;
        let response_ids: Option<String> = row.try_get("model_response_ids")?;
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            title: row.try_get("title")?,
            total_tokens: row.try_get("total_tokens")?,
            last_model: row.try_get("last_model")?,
            model_response_ids: response_ids.and_then(|raw| serde_json::from_str(&raw).ok()),
            status: ConversationStatus::parse(&status_str)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// 会话 upsert 输入
#[derive(Debug, Clone, Default)]
pub struct ConversationUpsert {
    pub task_id: Option<String>,
    pub title: Option<String>,
    pub total_tokens: Option<i64>,
    pub last_model: Option<String>,
    pub model_response_ids: Option<HashMap<String, String>>,
    pub status: Option<ConversationStatus>,
}

/// 会话消息实体
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: i64,
    pub conversation_id: String,
    pub role: super::MessageRole,
    pub content: String,
    pub message_type: String,
    pub model_id: Option<String>,
    pub token_count: Option<i64>,
    pub metadata: Option<serde_json::Value>,
    pub plan_step_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl RowMapper<ConversationMessage> for ConversationMessage {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Self> {
        let role_str: String = row.try_get("role")?;
        let metadata: Option<String> = row.try_get("metadata")?;
        Ok(Self {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            role: super::MessageRole::parse(&role_str)?,
            content: row.try_get("content")?,
            message_type: row.try_get("message_type")?,
            model_id: row.try_get("model_id")?,
            token_count: row.try_get("token_count")?,
            metadata: metadata.and_then(|raw| serde_json::from_str(&raw).ok()),
            plan_step_id: row.try_get("plan_step_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// 会话消息输入
#[derive(Debug, Clone)]
pub struct ConversationMessageInput {
    pub conversation_id: String,
    pub role: super::MessageRole,
    pub content: String,
    pub message_type: String,
    pub model_id: Option<String>,
    pub token_count: Option<i64>,
    pub metadata: Option<serde_json::Value>,
    pub plan_step_id: Option<i64>,
}

impl ConversationMessageInput {
    pub fn new(
        conversation_id: impl Into<String>,
        role: super::MessageRole,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            message_type: "text".to_string(),
            model_id: None,
            token_count: None,
            metadata: None,
            plan_step_id: None,
        }
    }

    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = message_type.into();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_step(mut self, plan_step_id: i64) -> Self {
        self.plan_step_id = Some(plan_step_id);
        self
    }
}

/// 会话Repository
pub struct ConversationRepository {
    store: Arc<StateStore>,
}

impl ConversationRepository {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// upsert 会话：已存在时保留 created_at，任何写入都会刷新 updated_at
    pub async fn upsert_conversation(
        &self,
        id: &str,
        upsert: ConversationUpsert,
        now: DateTime<Utc>,
    ) -> CoreResult<Conversation> {
        if id.trim().is_empty() {
            return Err(CoreError::validation("会话ID不能为空"));
        }
        let response_ids = upsert
            .model_response_ids
            .as_ref()
            .map(|m| serde_json::to_string(m))
            .transpose()
            .map_err(|e| CoreError::validation(format!("model_response_ids 序列化失败: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO conversations (id, task_id, title, total_tokens, last_model, model_response_ids, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                task_id = COALESCE(excluded.task_id, conversations.task_id),
                title = COALESCE(excluded.title, conversations.title),
                total_tokens = COALESCE(?, conversations.total_tokens),
                last_model = COALESCE(excluded.last_model, conversations.last_model),
                model_response_ids = COALESCE(excluded.model_response_ids, conversations.model_response_ids),
                status = COALESCE(?, conversations.status),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(&upsert.task_id)
        .bind(&upsert.title)
        .bind(upsert.total_tokens.unwrap_or(0))
        .bind(&upsert.last_model)
        .bind(&response_ids)
        .bind(upsert.status.unwrap_or(ConversationStatus::Active).as_str())
        .bind(now)
        .bind(now)
        .bind(upsert.total_tokens)
        .bind(upsert.status.map(|s| s.as_str()))
        .execute(self.store.pool())
        .await?;

        self.get_conversation(id)
            .await?
            .ok_or_else(|| CoreError::not_found("会话", id))
    }

    pub async fn get_conversation(&self, id: &str) -> CoreResult<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, task_id, title, total_tokens, last_model, model_response_ids, status, created_at, updated_at \
             FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.store.pool())
        .await?;
        row.map(|r| Conversation::from_row(&r)).transpose()
    }

    /// 追加会话消息，同时隐式 upsert 父会话（updated_at = 消息时间）
    pub async fn append_message(
        &self,
        input: ConversationMessageInput,
        now: DateTime<Utc>,
    ) -> CoreResult<i64> {
        if input.content.is_empty() {
            return Err(CoreError::validation("消息内容不能为空"));
        }
        if input.conversation_id.trim().is_empty() {
            return Err(CoreError::validation("会话ID不能为空"));
        }
        let metadata = input.metadata.as_ref().map(|v| v.to_string());

        let mut tx = self.store.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO conversations (id, status, created_at, updated_at)
            VALUES (?, 'active', ?, ?)
            ON CONFLICT (id) DO UPDATE SET updated_at = excluded.updated_at
            "#,
        )
        .bind(&input.conversation_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "INSERT INTO conversation_messages \
             (conversation_id, role, content, message_type, model_id, token_count, metadata, plan_step_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&input.conversation_id)
        .bind(input.role.as_str())
        .bind(&input.content)
        .bind(&input.message_type)
        .bind(&input.model_id)
        .bind(input.token_count)
        .bind(&metadata)
        .bind(input.plan_step_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    /// 会话消息，按时间排列
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        limit: Option<i64>,
    ) -> CoreResult<Vec<ConversationMessage>> {
        let mut sql = String::from(
            "SELECT id, conversation_id, role, content, message_type, model_id, token_count, metadata, plan_step_id, created_at \
             FROM conversation_messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
        );
        if limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql).bind(conversation_id);
        if let Some(limit) = limit {
            query = query.bind(limit.max(0));
        }

        let rows = query.fetch_all(self.store.pool()).await?;
        rows.iter().map(ConversationMessage::from_row).collect()
    }

    /// 最近 N 条消息（时间升序返回）
    pub async fn list_recent_messages(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> CoreResult<Vec<ConversationMessage>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, message_type, model_id, token_count, metadata, plan_step_id, created_at \
             FROM conversation_messages WHERE conversation_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit.max(0))
        .fetch_all(self.store.pool())
        .await?;

        let mut messages: Vec<ConversationMessage> = rows
            .iter()
            .map(ConversationMessage::from_row)
            .collect::<CoreResult<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }
}
