/*!
 * 计划步骤Repository
 *
 * 计划整体替换：删除旧计划、置空消息引用、插入新步骤在同一事务内完成。
 */

use super::RowMapper;
use crate::error::{CoreError, CoreResult};
use crate::storage::database::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::sync::Arc;

/// 步骤状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(CoreError::validation(format!("无效的步骤状态: {}", s))),
        }
    }
}

/// 计划步骤实体
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: i64,
    pub task_id: String,
    pub step_number: i64,
    pub title: String,
    pub description: Option<String>,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RowMapper<PlanStep> for PlanStep {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Self> {
        let status_str: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            step_number: row.try_get("step_number")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            status: StepStatus::parse(&status_str)?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

/// 规划器产出的步骤输入
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStepInput {
    pub title: String,
    pub description: Option<String>,
}

/// 计划步骤Repository
pub struct PlanStepRepository {
    store: Arc<StateStore>,
}

impl PlanStepRepository {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// 整体替换任务的计划
    ///
    /// 单事务：置空 task_messages 的 plan_step_id、删除旧步骤、
    /// 按 1..N 插入新步骤。
    pub async fn set_plan(&self, task_id: &str, steps: &[PlanStepInput]) -> CoreResult<Vec<PlanStep>> {
        if steps.is_empty() {
            return Err(CoreError::validation("计划不能为空"));
        }
        for step in steps {
            if step.title.trim().is_empty() {
                return Err(CoreError::validation("步骤标题不能为空"));
            }
        }

        let mut tx = self.store.pool().begin().await?;

        sqlx::query(
            "UPDATE task_messages SET plan_step_id = NULL WHERE task_id = ? AND plan_step_id IS NOT NULL",
        )
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM plan_steps WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        for (i, step) in steps.iter().enumerate() {
            sqlx::query(
                "INSERT INTO plan_steps (task_id, step_number, title, description, status) \
                 VALUES (?, ?, ?, ?, 'pending')",
            )
            .bind(task_id)
            .bind(i as i64 + 1)
            .bind(step.title.trim())
            .bind(step.description.as_deref().map(str::trim))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.list_steps(task_id).await
    }

    /// 任务的步骤，按序号排列
    pub async fn list_steps(&self, task_id: &str) -> CoreResult<Vec<PlanStep>> {
        let rows = sqlx::query(
            "SELECT id, task_id, step_number, title, description, status, started_at, completed_at \
             FROM plan_steps WHERE task_id = ? ORDER BY step_number ASC",
        )
        .bind(task_id)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(PlanStep::from_row).collect()
    }

    /// 更新步骤状态，进入 running 补 started_at，进入终态补 completed_at
    pub async fn update_step_status(
        &self,
        step_id: i64,
        status: StepStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let (started, completed) = match status {
            StepStatus::Running => (Some(now), None),
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => (None, Some(now)),
            StepStatus::Pending => (None, None),
        };

        let result = sqlx::query(
            "UPDATE plan_steps SET status = ?, \
             started_at = COALESCE(started_at, ?), \
             completed_at = COALESCE(completed_at, ?) \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(started)
        .bind(completed)
        .bind(step_id)
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("计划步骤", step_id.to_string()));
        }
        Ok(())
    }
}
