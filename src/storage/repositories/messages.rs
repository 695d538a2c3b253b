/*!
 * 任务消息与任务上下文Repository
 *
 * task_messages 记录执行过程中的各角色消息；task_contexts 是按任务
 * 追加写的侧记录（终态摘要、事后分析等）。
 */

use super::RowMapper;
use crate::error::{CoreError, CoreResult};
use crate::storage::database::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::sync::Arc;

/// 消息角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            _ => Err(CoreError::validation(format!("无效的消息角色: {}", s))),
        }
    }
}

/// 任务消息实体
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub id: i64,
    pub task_id: String,
    pub plan_step_id: Option<i64>,
    pub role: MessageRole,
    pub content: String,
    pub message_type: String,
    pub model_used: Option<String>,
    pub token_count: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl RowMapper<TaskMessage> for TaskMessage {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Self> {
        let role_str: String = row.try_get("role")?;
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            plan_step_id: row.try_get("plan_step_id")?,
            role: MessageRole::parse(&role_str)?,
            content: row.try_get("content")?,
            message_type: row.try_get("message_type")?,
            model_used: row.try_get("model_used")?,
            token_count: row.try_get("token_count")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// 任务消息输入
#[derive(Debug, Clone)]
pub struct TaskMessageInput {
    pub task_id: String,
    pub plan_step_id: Option<i64>,
    pub role: MessageRole,
    pub content: String,
    pub message_type: String,
    pub model_used: Option<String>,
    pub token_count: Option<i64>,
}

impl TaskMessageInput {
    pub fn new(task_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            plan_step_id: None,
            role,
            content: content.into(),
            message_type: "text".to_string(),
            model_used: None,
            token_count: None,
        }
    }

    pub fn with_step(mut self, plan_step_id: i64) -> Self {
        self.plan_step_id = Some(plan_step_id);
        self
    }

    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = message_type.into();
        self
    }
}

/// 任务上下文条目（追加写）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub id: i64,
    pub task_id: String,
    pub context_type: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl RowMapper<TaskContext> for TaskContext {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            context_type: row.try_get("context_type")?,
            content: row.try_get("content")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// 消息Repository
pub struct MessageRepository {
    store: Arc<StateStore>,
}

impl MessageRepository {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// 追加任务消息
    pub async fn append_task_message(
        &self,
        input: TaskMessageInput,
        now: DateTime<Utc>,
    ) -> CoreResult<i64> {
        if input.content.is_empty() {
            return Err(CoreError::validation("消息内容不能为空"));
        }

        let result = sqlx::query(
            "INSERT INTO task_messages \
             (task_id, plan_step_id, role, content, message_type, model_used, token_count, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&input.task_id)
        .bind(input.plan_step_id)
        .bind(input.role.as_str())
        .bind(&input.content)
        .bind(&input.message_type)
        .bind(&input.model_used)
        .bind(input.token_count)
        .bind(now)
        .execute(self.store.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// 任务消息列表，按时间排列
    pub async fn list_task_messages(
        &self,
        task_id: &str,
        limit: Option<i64>,
    ) -> CoreResult<Vec<TaskMessage>> {
        let mut sql = String::from(
            "SELECT id, task_id, plan_step_id, role, content, message_type, model_used, token_count, created_at \
             FROM task_messages WHERE task_id = ? ORDER BY created_at ASC, id ASC",
        );
        if limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql).bind(task_id);
        if let Some(limit) = limit {
            query = query.bind(limit.max(0));
        }

        let rows = query.fetch_all(self.store.pool()).await?;
        rows.iter().map(TaskMessage::from_row).collect()
    }

    /// 追加任务上下文条目
    pub async fn append_task_context(
        &self,
        task_id: &str,
        context_type: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<i64> {
        if content.is_empty() {
            return Err(CoreError::validation("上下文内容不能为空"));
        }

        let result = sqlx::query(
            "INSERT INTO task_contexts (task_id, context_type, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(context_type)
        .bind(content)
        .bind(now)
        .execute(self.store.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// 任务上下文条目，按时间排列
    pub async fn list_task_contexts(&self, task_id: &str) -> CoreResult<Vec<TaskContext>> {
        let rows = sqlx::query(
            "SELECT id, task_id, context_type, content, created_at \
             FROM task_contexts WHERE task_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(task_id)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(TaskContext::from_row).collect()
    }
}
