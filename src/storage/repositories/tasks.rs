/*!
 * 任务Repository
 *
 * 任务表的类型化访问：创建、合并更新、单工作者声明（claim）、
 * 队列提升、待执行队列的移动与部分重排。
 */

use super::RowMapper;
use crate::error::{CoreError, CoreResult};
use crate::storage::database::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::sync::Arc;
use tracing::debug;

/// 标题派生上限（字符）
const TITLE_MAX_CHARS: usize = 32;
/// claim/提升竞争时的有界重试次数
const CLAIM_RETRIES: usize = 3;
/// 默认重试预算
const DEFAULT_MAX_RETRIES: i64 = 3;

/// 任务状态机
///
/// queued → pending → (planning → running) → {completed, failed, cancelled}；
/// failed 且预算未耗尽 → pending；paused 仅由外部变更进入。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Pending,
    Planning,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(CoreError::validation(format!("无效的任务状态: {}", s))),
        }
    }

    /// 终态：completed / failed / cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// 执行中：planning / running
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Planning | Self::Running)
    }
}

/// 任务实体
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub prompt: String,
    pub model: Option<String>,
    pub model_params: Option<serde_json::Value>,
    pub status: TaskStatus,
    pub priority: i64,
    pub queue_order: i64,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub prompt_injected_at: Option<DateTime<Utc>>,
    pub inherit_context: bool,
    pub parent_task_id: Option<String>,
    pub thread_id: String,
    pub result: Option<String>,
    pub last_error: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

impl RowMapper<Task> for Task {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Self> {
        let status_str: String = row.try_get("status")?;
        let model_params: Option<String> = row.try_get("model_params")?;
        Ok(Self {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            prompt: row.try_get("prompt")?,
            model: row.try_get("model")?,
            model_params: model_params.and_then(|raw| serde_json::from_str(&raw).ok()),
            status: TaskStatus::parse(&status_str)?,
            priority: row.try_get("priority")?,
            queue_order: row.try_get("queue_order")?,
            queued_at: row.try_get("queued_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            archived_at: row.try_get("archived_at")?,
            prompt_injected_at: row.try_get("prompt_injected_at")?,
            inherit_context: row.try_get("inherit_context")?,
            parent_task_id: row.try_get("parent_task_id")?,
            thread_id: row.try_get("thread_id")?,
            result: row.try_get("result")?,
            last_error: row.try_get("last_error")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            created_at: row.try_get("created_at")?,
            created_by: row.try_get("created_by")?,
        })
    }
}

/// 创建任务的输入
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskInput {
    pub id: Option<String>,
    pub title: Option<String>,
    pub prompt: String,
    pub model: Option<String>,
    pub model_params: Option<serde_json::Value>,
    pub priority: Option<i64>,
    #[serde(default)]
    pub inherit_context: bool,
    pub parent_task_id: Option<String>,
    pub thread_id: Option<String>,
    pub max_retries: Option<i64>,
    pub created_by: Option<String>,
}

/// 创建任务的选项
#[derive(Debug, Clone, Default)]
pub struct CreateTaskOptions {
    /// 初始状态覆盖（默认 pending；queued 时自动补 queued_at）
    pub status: Option<TaskStatus>,
    pub queued_at: Option<DateTime<Utc>>,
}

/// 合并更新补丁
///
/// 外层 None 表示不变；双层 Option 的字段内层 None 表示清空。
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub model_params: Option<serde_json::Value>,
    pub status: Option<TaskStatus>,
    pub priority: Option<i64>,
    pub result: Option<Option<String>>,
    pub last_error: Option<Option<String>>,
    pub retry_count: Option<i64>,
    pub max_retries: Option<i64>,
    pub queued_at: Option<Option<DateTime<Utc>>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub thread_id: Option<String>,
    /// 写一次语义：已设置过则忽略
    pub prompt_injected_at: Option<DateTime<Utc>>,
}

/// 列表过滤
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub limit: Option<i64>,
}

/// 待执行队列中的移动方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Up,
    Down,
}

impl MoveDirection {
    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            _ => Err(CoreError::validation(format!("无效的移动方向: {}", s))),
        }
    }
}

const TASK_COLUMNS: &str = "id, title, prompt, model, model_params, status, priority, queue_order, \
     queued_at, started_at, completed_at, archived_at, prompt_injected_at, inherit_context, \
     parent_task_id, thread_id, result, last_error, retry_count, max_retries, created_at, created_by";

/// 从提示词首个非空行派生标题，超长截断加省略号
pub(crate) fn derive_title(prompt: &str) -> String {
    let line = prompt
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("未命名任务");
    let chars: Vec<char> = line.chars().collect();
    if chars.len() <= TITLE_MAX_CHARS {
        line.to_string()
    } else {
        let mut title: String = chars[..TITLE_MAX_CHARS - 1].iter().collect();
        title.push('…');
        title
    }
}

/// 任务Repository
pub struct TaskRepository {
    store: Arc<StateStore>,
}

impl TaskRepository {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// 创建任务
    ///
    /// 派生 id / title / thread_id，queue_order 取当前最大值加一，
    /// 全部在同一事务内完成。
    pub async fn create_task(
        &self,
        input: CreateTaskInput,
        now: DateTime<Utc>,
        options: CreateTaskOptions,
    ) -> CoreResult<Task> {
        if input.prompt.trim().is_empty() {
            return Err(CoreError::validation("任务提示词不能为空"));
        }
        if let Some(status) = options.status {
            if !matches!(status, TaskStatus::Pending | TaskStatus::Queued) {
                return Err(CoreError::validation(format!(
                    "创建任务不允许初始状态: {}",
                    status.as_str()
                )));
            }
        }

        let id = input
            .id
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let title = input
            .title
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| derive_title(&input.prompt));
        let status = options.status.unwrap_or(TaskStatus::Pending);
        let queued_at = if status == TaskStatus::Queued {
            Some(options.queued_at.unwrap_or(now))
        } else {
            options.queued_at
        };
        let max_retries = input.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(0);

        let mut tx = self.store.pool().begin().await?;

        let queue_order: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(queue_order), 0) + 1 FROM tasks")
                .fetch_one(&mut *tx)
                .await?;

        let thread_id = match input.thread_id.filter(|v| !v.trim().is_empty()) {
            Some(explicit) => explicit,
            None if input.inherit_context => {
                let prior: Option<String> = sqlx::query_scalar(
                    "SELECT thread_id FROM tasks ORDER BY created_at DESC, id DESC LIMIT 1",
                )
                .fetch_optional(&mut *tx)
                .await?;
                prior.unwrap_or_else(|| format!("conv-{}", id))
            }
            None => format!("conv-{}", id),
        };

        let model_params = input
            .model_params
            .as_ref()
            .map(|v| v.to_string());

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, title, prompt, model, model_params, status, priority, queue_order,
                queued_at, inherit_context, parent_task_id, thread_id,
                retry_count, max_retries, created_at, created_by
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&title)
        .bind(&input.prompt)
        .bind(&input.model)
        .bind(&model_params)
        .bind(status.as_str())
        .bind(input.priority.unwrap_or(0))
        .bind(queue_order)
        .bind(queued_at)
        .bind(input.inherit_context)
        .bind(&input.parent_task_id)
        .bind(&thread_id)
        .bind(max_retries)
        .bind(now)
        .bind(&input.created_by)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(task_id = %id, queue_order, "创建任务");
        self.get_task(&id)
            .await?
            .ok_or_else(|| CoreError::not_found("任务", id))
    }

    pub async fn get_task(&self, id: &str) -> CoreResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?;
        row.map(|r| Task::from_row(&r)).transpose()
    }

    /// 列出任务（可按状态过滤，按队列顺序排列）
    pub async fn list_tasks(&self, filter: TaskFilter) -> CoreResult<Vec<Task>> {
        let mut sql = format!("SELECT {} FROM tasks", TASK_COLUMNS);
        if filter.status.is_some() {
            sql.push_str(" WHERE status = ?");
        }
        sql.push_str(" ORDER BY queue_order ASC, created_at ASC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit.max(0));
        }

        let rows = query.fetch_all(self.store.pool()).await?;
        rows.iter().map(Task::from_row).collect()
    }

    /// 合并更新
    ///
    /// prompt_injected_at 写一次；进入 running 补 started_at；进入终态补
    /// completed_at；进入/离开 completed 维护 archived_at。
    pub async fn update_task(
        &self,
        id: &str,
        patch: TaskPatch,
        now: DateTime<Utc>,
    ) -> CoreResult<Task> {
        let mut task = self
            .get_task(id)
            .await?
            .ok_or_else(|| CoreError::not_found("任务", id))?;
        let old_status = task.status;

        if let Some(title) = patch.title {
            if title.trim().is_empty() {
                return Err(CoreError::validation("任务标题不能为空"));
            }
            task.title = title;
        }
        if let Some(prompt) = patch.prompt {
            if prompt.trim().is_empty() {
                return Err(CoreError::validation("任务提示词不能为空"));
            }
            task.prompt = prompt;
        }
        if let Some(model) = patch.model {
            task.model = Some(model);
        }
        if let Some(params) = patch.model_params {
            task.model_params = Some(params);
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(result) = patch.result {
            task.result = result;
        }
        if let Some(last_error) = patch.last_error {
            task.last_error = last_error;
        }
        if let Some(retry_count) = patch.retry_count {
            task.retry_count = retry_count.max(0);
        }
        if let Some(max_retries) = patch.max_retries {
            task.max_retries = max_retries.max(0);
        }
        if let Some(queued_at) = patch.queued_at {
            task.queued_at = queued_at;
        }
        if let Some(started_at) = patch.started_at {
            task.started_at = started_at;
        }
        if let Some(completed_at) = patch.completed_at {
            task.completed_at = completed_at;
        }
        if let Some(thread_id) = patch.thread_id {
            if thread_id.trim().is_empty() {
                return Err(CoreError::validation("thread_id 不能为空"));
            }
            task.thread_id = thread_id;
        }
        if task.prompt_injected_at.is_none() {
            if let Some(ts) = patch.prompt_injected_at {
                task.prompt_injected_at = Some(ts);
            }
        }

        if let Some(status) = patch.status {
            task.status = status;
            if status == TaskStatus::Running && task.started_at.is_none() {
                task.started_at = Some(now);
            }
            if status.is_terminal() && task.completed_at.is_none() {
                task.completed_at = Some(now);
            }
            if !status.is_terminal() {
                task.completed_at = None;
            }
            if status == TaskStatus::Completed {
                if task.archived_at.is_none() {
                    task.archived_at = Some(now);
                }
            } else if old_status == TaskStatus::Completed {
                task.archived_at = None;
            }
        }

        self.persist(&task).await?;
        Ok(task)
    }

    async fn persist(&self, task: &Task) -> CoreResult<()> {
        let model_params = task.model_params.as_ref().map(|v| v.to_string());
        sqlx::query(
            r#"
            UPDATE tasks SET
                title = ?, prompt = ?, model = ?, model_params = ?, status = ?, priority = ?,
                queued_at = ?, started_at = ?, completed_at = ?, archived_at = ?,
                prompt_injected_at = ?, result = ?, last_error = ?,
                retry_count = ?, max_retries = ?, thread_id = ?
            WHERE id = ?
            "#,
        )
        .bind(&task.title)
        .bind(&task.prompt)
        .bind(&task.model)
        .bind(&model_params)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.queued_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.archived_at)
        .bind(task.prompt_injected_at)
        .bind(&task.result)
        .bind(&task.last_error)
        .bind(task.retry_count)
        .bind(task.max_retries)
        .bind(&task.thread_id)
        .bind(&task.id)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// CAS 写入 prompt_injected_at，返回是否生效
    pub async fn mark_prompt_injected(&self, id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET prompt_injected_at = ? WHERE id = ? AND prompt_injected_at IS NULL",
        )
        .bind(now)
        .bind(id)
        .execute(self.store.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// 声明下一个 pending 任务（pending → running）
    ///
    /// 守卫式 UPDATE，竞争导致零行生效时有界重试；没有可声明行返回 None。
    pub async fn claim_next_pending_task(&self, now: DateTime<Utc>) -> CoreResult<Option<Task>> {
        for _ in 0..CLAIM_RETRIES {
            let mut tx = self.store.pool().begin().await?;

            let candidate: Option<String> = sqlx::query_scalar(
                "SELECT id FROM tasks WHERE status = 'pending' \
                 ORDER BY queue_order ASC, created_at ASC LIMIT 1",
            )
            .fetch_optional(&mut *tx)
            .await?;

            let Some(id) = candidate else {
                return Ok(None);
            };

            let updated = sqlx::query(
                "UPDATE tasks SET status = 'running', started_at = COALESCE(started_at, ?) \
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(now)
            .bind(&id)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                tx.rollback().await?;
                continue;
            }

            tx.commit().await?;
            return self.get_task(&id).await;
        }
        Ok(None)
    }

    /// 提升下一个 queued 任务到 pending
    pub async fn dequeue_next_queued_task(&self, _now: DateTime<Utc>) -> CoreResult<Option<Task>> {
        for _ in 0..CLAIM_RETRIES {
            let mut tx = self.store.pool().begin().await?;

            let candidate: Option<String> = sqlx::query_scalar(
                "SELECT id FROM tasks WHERE status = 'queued' \
                 ORDER BY queued_at ASC, queue_order ASC, created_at ASC, id ASC LIMIT 1",
            )
            .fetch_optional(&mut *tx)
            .await?;

            let Some(id) = candidate else {
                return Ok(None);
            };

            let updated =
                sqlx::query("UPDATE tasks SET status = 'pending' WHERE id = ? AND status = 'queued'")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;

            if updated.rows_affected() == 0 {
                tx.rollback().await?;
                continue;
            }

            tx.commit().await?;
            return self.get_task(&id).await;
        }
        Ok(None)
    }

    /// 删除任务，级联消息/上下文/计划步骤/附件链接（blob 保留）
    pub async fn delete_task(&self, id: &str) -> CoreResult<()> {
        let mut tx = self.store.pool().begin().await?;
        sqlx::query("DELETE FROM task_messages WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM task_contexts WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM task_attachments WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM plan_steps WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("任务", id));
        }
        Ok(())
    }

    /// 与相邻 pending 任务交换队列位置；并列时对被移动者 ±1
    pub async fn move_pending_task(&self, id: &str, direction: MoveDirection) -> CoreResult<()> {
        let mut tx = self.store.pool().begin().await?;

        let row = sqlx::query("SELECT queue_order, status FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::not_found("任务", id))?;
        let status: String = row.try_get("status")?;
        if status != "pending" {
            return Err(CoreError::validation(format!(
                "只能移动 pending 任务，当前状态: {}",
                status
            )));
        }
        let order: i64 = row.try_get("queue_order")?;

        let neighbor_sql = match direction {
            MoveDirection::Up => {
                "SELECT id, queue_order FROM tasks WHERE status = 'pending' AND queue_order < ? \
                 ORDER BY queue_order DESC LIMIT 1"
            }
            MoveDirection::Down => {
                "SELECT id, queue_order FROM tasks WHERE status = 'pending' AND queue_order > ? \
                 ORDER BY queue_order ASC LIMIT 1"
            }
        };
        let neighbor = sqlx::query(neighbor_sql)
            .bind(order)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(neighbor) = neighbor else {
            // 已经在边界上，无事可做
            tx.commit().await?;
            return Ok(());
        };
        let neighbor_id: String = neighbor.try_get("id")?;
        let neighbor_order: i64 = neighbor.try_get("queue_order")?;

        let new_order = if neighbor_order == order {
            match direction {
                MoveDirection::Up => order - 1,
                MoveDirection::Down => order + 1,
            }
        } else {
            neighbor_order
        };

        sqlx::query("UPDATE tasks SET queue_order = ? WHERE id = ?")
            .bind(order)
            .bind(&neighbor_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE tasks SET queue_order = ? WHERE id = ?")
            .bind(new_order)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// 部分重排 pending 队列
    ///
    /// 被选中的任务按给定顺序落到原先由未选中任务占据的位置（从前往后），
    /// 未选中任务保持相对顺序补入剩余位置；给定全量时等价于直接按给定
    /// 顺序重排。受影响行从现有最小 queue_order 起连续重新编号。
    pub async fn reorder_pending_tasks(&self, task_ids: &[String]) -> CoreResult<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        {
            let mut seen = std::collections::HashSet::new();
            for id in task_ids {
                if !seen.insert(id.as_str()) {
                    return Err(CoreError::validation(format!("重复的任务ID: {}", id)));
                }
            }
        }

        let mut tx = self.store.pool().begin().await?;

        let rows = sqlx::query(
            "SELECT id, queue_order FROM tasks WHERE status = 'pending' ORDER BY queue_order ASC, created_at ASC",
        )
        .fetch_all(&mut *tx)
        .await?;

        let current: Vec<(String, i64)> = rows
            .iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("id")?,
                    row.try_get::<i64, _>("queue_order")?,
                ))
            })
            .collect::<CoreResult<Vec<_>>>()?;

        let current_ids: Vec<&str> = current.iter().map(|(id, _)| id.as_str()).collect();
        for id in task_ids {
            if !current_ids.contains(&id.as_str()) {
                return Err(CoreError::validation(format!(
                    "任务不在 pending 队列中: {}",
                    id
                )));
            }
        }

        let new_sequence = overlay_reorder(&current_ids, task_ids);

        let base = current.iter().map(|(_, o)| *o).min().unwrap_or(1);
        for (i, id) in new_sequence.iter().enumerate() {
            sqlx::query("UPDATE tasks SET queue_order = ? WHERE id = ?")
                .bind(base + i as i64)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// 计算部分重排后的新序列
///
/// selected 中的 id 依次落到 current 中未选中成员原先占据的位置；
/// 位置不足时，余下的 selected 与未选中成员按序补入空位。
fn overlay_reorder(current: &[&str], selected: &[String]) -> Vec<String> {
    let selected_set: std::collections::HashSet<&str> =
        selected.iter().map(|s| s.as_str()).collect();
    let untouched: Vec<&str> = current
        .iter()
        .copied()
        .filter(|id| !selected_set.contains(id))
        .collect();
    let untouched_positions: Vec<usize> = current
        .iter()
        .enumerate()
        .filter(|(_, id)| !selected_set.contains(*id))
        .map(|(i, _)| i)
        .collect();

    let mut slots: Vec<Option<String>> = vec![None; current.len()];
    let placed = selected.len().min(untouched_positions.len());
    for i in 0..placed {
        slots[untouched_positions[i]] = Some(selected[i].clone());
    }

    let mut rest: Vec<String> = selected[placed..].iter().cloned().collect();
    rest.extend(untouched.iter().map(|s| s.to_string()));

    let mut rest_iter = rest.into_iter();
    slots
        .into_iter()
        .map(|slot| match slot {
            Some(id) => id,
            None => rest_iter.next().unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_title_short() {
        assert_eq!(derive_title("write hello world"), "write hello world");
    }

    #[test]
    fn test_derive_title_first_nonempty_line() {
        assert_eq!(derive_title("\n\n  修复构建\n其余内容"), "修复构建");
    }

    #[test]
    fn test_derive_title_ellipsized() {
        let long = "a".repeat(80);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), 32);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn test_derive_title_empty_prompt_lines() {
        assert_eq!(derive_title("   \n  "), "未命名任务");
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Pending,
            TaskStatus::Planning,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TaskStatus::parse("done").is_err());
    }

    fn ids(v: Vec<&str>) -> Vec<String> {
        v.into_iter().map(String::from).collect()
    }

    #[test]
    fn test_overlay_reorder_partial_subset() {
        // [A,B,C,D] 选中 [D,B] → [D,A,B,C]
        let out = overlay_reorder(&["A", "B", "C", "D"], &ids(vec!["D", "B"]));
        assert_eq!(out, ids(vec!["D", "A", "B", "C"]));
    }

    #[test]
    fn test_overlay_reorder_identity_is_noop() {
        let out = overlay_reorder(&["A", "B", "C"], &ids(vec!["A", "B", "C"]));
        assert_eq!(out, ids(vec!["A", "B", "C"]));
    }

    #[test]
    fn test_overlay_reorder_full_permutation() {
        let out = overlay_reorder(&["A", "B", "C"], &ids(vec!["C", "A", "B"]));
        assert_eq!(out, ids(vec!["C", "A", "B"]));
    }

    #[test]
    fn test_overlay_reorder_single() {
        // [A,B,C] 选中 [C] → C 落到 A 的位置，其余保持相对顺序
        let out = overlay_reorder(&["A", "B", "C"], &ids(vec!["C"]));
        assert_eq!(out, ids(vec!["C", "A", "B"]));
    }
}
