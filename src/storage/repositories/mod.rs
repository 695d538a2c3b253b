/*!
 * Repository模式实现
 *
 * 提供数据访问层的抽象，每个表族一个结构体，TaskStore 统一持有。
 * 所有输入在触达存储前完成校验；多行变更在单个事务内执行。
 */

pub mod attachments;
pub mod conversations;
pub mod messages;
pub mod models;
pub mod plan_steps;
pub mod preferences;
pub mod tasks;

pub use attachments::{Attachment, AttachmentRepository, NewAttachment};
pub use conversations::{
    Conversation, ConversationMessage, ConversationMessageInput, ConversationRepository,
    ConversationStatus, ConversationUpsert,
};
pub use messages::{MessageRepository, MessageRole, TaskContext, TaskMessage, TaskMessageInput};
pub use models::{ModelConfig, ModelConfigRepository};
pub use plan_steps::{PlanStep, PlanStepInput, PlanStepRepository, StepStatus};
pub use preferences::PreferenceRepository;
pub use tasks::{
    CreateTaskInput, CreateTaskOptions, MoveDirection, Task, TaskFilter, TaskPatch,
    TaskRepository, TaskStatus,
};

use crate::error::CoreResult;
use crate::storage::database::StateStore;
use std::sync::Arc;

/// 通用的行转换工具
pub trait RowMapper<T> {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> CoreResult<T>;
}

/// 任务存储门面
///
/// 对外暴露类型化 CRUD；transports 只能通过它（经由 WorkspaceContext）
/// 访问状态库。
pub struct TaskStore {
    store: Arc<StateStore>,
    tasks: TaskRepository,
    plan_steps: PlanStepRepository,
    messages: MessageRepository,
    conversations: ConversationRepository,
    models: ModelConfigRepository,
    attachments: AttachmentRepository,
    preferences: PreferenceRepository,
}

impl TaskStore {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            tasks: TaskRepository::new(Arc::clone(&store)),
            plan_steps: PlanStepRepository::new(Arc::clone(&store)),
            messages: MessageRepository::new(Arc::clone(&store)),
            conversations: ConversationRepository::new(Arc::clone(&store)),
            models: ModelConfigRepository::new(Arc::clone(&store)),
            attachments: AttachmentRepository::new(Arc::clone(&store)),
            preferences: PreferenceRepository::new(Arc::clone(&store)),
            store,
        }
    }

    pub fn tasks(&self) -> &TaskRepository {
        &self.tasks
    }

    pub fn plan_steps(&self) -> &PlanStepRepository {
        &self.plan_steps
    }

    pub fn messages(&self) -> &MessageRepository {
        &self.messages
    }

    pub fn conversations(&self) -> &ConversationRepository {
        &self.conversations
    }

    pub fn models(&self) -> &ModelConfigRepository {
        &self.models
    }

    pub fn attachments(&self) -> &AttachmentRepository {
        &self.attachments
    }

    pub fn preferences(&self) -> &PreferenceRepository {
        &self.preferences
    }

    pub fn state_store(&self) -> &StateStore {
        &self.store
    }
}
