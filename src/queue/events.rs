/*!
 * 任务生命周期事件
 *
 * 队列发布到 EventBus 的事件集合。每个事件携带任务快照，
 * 信封上是工作区内单调递增的序号，订阅方可用它做重连回放。
 */

use crate::storage::repositories::{PlanStep, Task};
use serde::{Deserialize, Serialize};

/// 生命周期事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueueEvent {
    #[serde(rename = "task:updated")]
    TaskUpdated { task: Task },
    #[serde(rename = "task:started")]
    TaskStarted { task: Task },
    #[serde(rename = "task:planned")]
    TaskPlanned { task: Task, steps: Vec<PlanStep> },
    #[serde(rename = "task:running")]
    TaskRunning { task: Task },
    #[serde(rename = "task:completed")]
    TaskCompleted { task: Task },
    #[serde(rename = "task:failed")]
    TaskFailed { task: Task, error: String },
    #[serde(rename = "task:cancelled")]
    TaskCancelled { task: Task },
    #[serde(rename = "step:started")]
    StepStarted { task: Task, step: PlanStep },
    #[serde(rename = "step:completed")]
    StepCompleted { task: Task, step: PlanStep },
    #[serde(rename = "message")]
    Message {
        task: Task,
        role: String,
        content: String,
    },
    #[serde(rename = "message:delta")]
    MessageDelta {
        task: Task,
        step_number: i64,
        delta: String,
    },
    #[serde(rename = "command")]
    Command { task: Task, command: String },
    #[serde(rename = "queue:paused")]
    QueuePaused { reason: Option<String> },
    #[serde(rename = "queue:resumed")]
    QueueResumed,
}

impl QueueEvent {
    /// 事件归属的任务 id（队列级事件为 None）
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskUpdated { task }
            | Self::TaskStarted { task }
            | Self::TaskPlanned { task, .. }
            | Self::TaskRunning { task }
            | Self::TaskCompleted { task }
            | Self::TaskFailed { task, .. }
            | Self::TaskCancelled { task }
            | Self::StepStarted { task, .. }
            | Self::StepCompleted { task, .. }
            | Self::Message { task, .. }
            | Self::MessageDelta { task, .. }
            | Self::Command { task, .. } => Some(&task.id),
            Self::QueuePaused { .. } | Self::QueueResumed => None,
        }
    }

    /// 事件名（与 serde 标签一致）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskUpdated { .. } => "task:updated",
            Self::TaskStarted { .. } => "task:started",
            Self::TaskPlanned { .. } => "task:planned",
            Self::TaskRunning { .. } => "task:running",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskFailed { .. } => "task:failed",
            Self::TaskCancelled { .. } => "task:cancelled",
            Self::StepStarted { .. } => "step:started",
            Self::StepCompleted { .. } => "step:completed",
            Self::Message { .. } => "message",
            Self::MessageDelta { .. } => "message:delta",
            Self::Command { .. } => "command",
            Self::QueuePaused { .. } => "queue:paused",
            Self::QueueResumed => "queue:resumed",
        }
    }
}

/// 带序号的事件信封
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEventEnvelope {
    pub seq: u64,
    #[serde(flatten)]
    pub event: QueueEvent,
}
