/*!
 * 工作区层
 *
 * WorkspaceContext 把一个工作区的全部构件捆在一起：状态库、任务
 * 存储、队列、运行控制器、互斥锁、指标与事件总线。上层 transports
 * 只通过它暴露的窄接口访问核心。
 *
 * 上下文按工作区根目录惰性构造并缓存在并发注册表里，没有模块级
 * 可变状态。
 */

pub mod event_bus;
pub mod run_controller;

pub use event_bus::{EventBus, EventSink, Subscription};
pub use run_controller::{RunController, RunMode, RunState};

use crate::agent::adapter::{AgentAdapter, CliAdapterConfig, CliAgentAdapter};
use crate::agent::AgentVendor;
use crate::config::CoreSettings;
use crate::error::{CoreError, CoreResult};
use crate::queue::events::{QueueEvent, QueueEventEnvelope};
use crate::queue::executor::TaskExecutor;
use crate::queue::planner::TaskPlanner;
use crate::queue::task_queue::{TaskQueue, TaskQueueConfig};
use crate::storage::database::{StateStore, StateStoreOptions};
use crate::storage::paths::WorkspacePaths;
use crate::storage::repositories::{
    Attachment, CreateTaskInput, CreateTaskOptions, ModelConfig, MoveDirection, NewAttachment,
    Task, TaskFilter, TaskPatch, TaskStatus,
};
use crate::storage::TaskStore;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// 工作区指标计数器
#[derive(Default)]
pub struct WorkspaceMetrics {
    pub tasks_created: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    pub events_published: AtomicU64,
}

/// 指标快照
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub tasks_created: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub events_published: u64,
}

impl WorkspaceMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_created: self.tasks_created.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
        }
    }
}

/// 工作区构造选项
#[derive(Debug, Clone)]
pub struct WorkspaceOptions {
    pub settings: CoreSettings,
    /// 执行用 vendor
    pub executor_vendor: AgentVendor,
    /// 规划/评审用 vendor（只读沙箱）
    pub supervisor_vendor: AgentVendor,
    pub run_mode: RunMode,
    pub queue: TaskQueueConfig,
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        Self {
            settings: CoreSettings::default(),
            executor_vendor: AgentVendor::Droid,
            supervisor_vendor: AgentVendor::Droid,
            run_mode: RunMode::All,
            queue: TaskQueueConfig::default(),
        }
    }
}

impl WorkspaceOptions {
    pub fn from_env() -> Self {
        Self {
            settings: CoreSettings::from_env(),
            ..Default::default()
        }
    }
}

/// 每工作区单例上下文
pub struct WorkspaceContext {
    paths: WorkspacePaths,
    state_store: Arc<StateStore>,
    task_store: Arc<TaskStore>,
    queue: Arc<TaskQueue>,
    run_controller: Arc<RunController>,
    async_lock: Arc<tokio::sync::Mutex<()>>,
    metrics: Arc<WorkspaceMetrics>,
    event_bus: Arc<EventBus>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WorkspaceContext {
    /// 用默认 CLI 适配器打开工作区
    pub async fn open(root: &Path, options: WorkspaceOptions) -> CoreResult<Arc<Self>> {
        let executor_adapter: Arc<dyn AgentAdapter> = Arc::new(CliAgentAdapter::new(
            CliAdapterConfig::for_vendor(options.executor_vendor, &options.settings),
        ));
        let supervisor_adapter: Arc<dyn AgentAdapter> = Arc::new(CliAgentAdapter::new(
            CliAdapterConfig::for_vendor(options.supervisor_vendor, &options.settings).read_only(),
        ));
        Self::open_with_adapters(root, options, executor_adapter, supervisor_adapter).await
    }

    /// 注入适配器打开工作区（测试与自定义 vendor 用）
    pub async fn open_with_adapters(
        root: &Path,
        options: WorkspaceOptions,
        executor_adapter: Arc<dyn AgentAdapter>,
        supervisor_adapter: Arc<dyn AgentAdapter>,
    ) -> CoreResult<Arc<Self>> {
        let paths = WorkspacePaths::new(root);
        paths.validate()?;

        let state_store = Arc::new(
            StateStore::open(
                paths.clone(),
                StateStoreOptions::from_settings(&options.settings),
            )
            .await?,
        );
        let task_store = Arc::new(TaskStore::new(Arc::clone(&state_store)));
        let run_controller = Arc::new(RunController::new(options.run_mode));
        let event_bus = Arc::new(EventBus::new());
        let metrics = Arc::new(WorkspaceMetrics::default());
        let async_lock = Arc::new(tokio::sync::Mutex::new(()));

        // 队列事件 → 指标 + 总线
        let bus_for_publisher = Arc::clone(&event_bus);
        let metrics_for_publisher = Arc::clone(&metrics);
        let publisher: Arc<dyn Fn(QueueEventEnvelope) + Send + Sync> =
            Arc::new(move |envelope| {
                metrics_for_publisher
                    .events_published
                    .fetch_add(1, Ordering::Relaxed);
                match &envelope.event {
                    QueueEvent::TaskCompleted { .. } => {
                        metrics_for_publisher
                            .tasks_completed
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    QueueEvent::TaskFailed { task, .. } if task.status == TaskStatus::Failed => {
                        metrics_for_publisher
                            .tasks_failed
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    QueueEvent::TaskCancelled { .. } => {
                        metrics_for_publisher
                            .tasks_cancelled
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                bus_for_publisher.publish(&envelope);
            });

        let planner = Arc::new(TaskPlanner::new(supervisor_adapter));
        let executor = Arc::new(
            TaskExecutor::new(Arc::clone(&task_store), executor_adapter)
                .with_async_lock(Arc::clone(&async_lock))
                .with_step_timeout(options.settings.step_timeout),
        );

        let queue = Arc::new(TaskQueue::new(
            Arc::clone(&task_store),
            planner,
            executor,
            Arc::clone(&run_controller),
            options.queue.clone(),
            publisher,
        ));
        let worker = queue.spawn();

        info!(root = %paths.root.display(), "工作区上下文已构建");
        Ok(Arc::new(Self {
            paths,
            state_store,
            task_store,
            queue,
            run_controller,
            async_lock,
            metrics,
            event_bus,
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    pub fn run_controller(&self) -> &Arc<RunController> {
        &self.run_controller
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn task_store(&self) -> &Arc<TaskStore> {
        &self.task_store
    }

    // ==================== 任务操作 ====================

    pub async fn create_task(
        &self,
        input: CreateTaskInput,
        options: CreateTaskOptions,
    ) -> CoreResult<Task> {
        let task = self
            .task_store
            .tasks()
            .create_task(input, Utc::now(), options)
            .await?;
        self.metrics.tasks_created.fetch_add(1, Ordering::Relaxed);
        self.queue.emit(QueueEvent::TaskUpdated { task: task.clone() });
        self.queue.notify_new_task();
        Ok(task)
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> CoreResult<Vec<Task>> {
        self.task_store.tasks().list_tasks(filter).await
    }

    pub async fn get_task(&self, id: &str) -> CoreResult<Option<Task>> {
        self.task_store.tasks().get_task(id).await
    }

    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> CoreResult<Task> {
        let task = self
            .task_store
            .tasks()
            .update_task(id, patch, Utc::now())
            .await?;
        self.queue.emit(QueueEvent::TaskUpdated { task: task.clone() });
        Ok(task)
    }

    /// 删除任务与其级联数据；与队列进度互斥
    pub async fn delete_task(&self, id: &str) -> CoreResult<()> {
        let _guard = self.async_lock.lock().await;
        self.task_store.tasks().delete_task(id).await
    }

    pub async fn cancel_task(&self, id: &str) -> CoreResult<()> {
        self.queue.cancel(id).await
    }

    pub async fn retry_task(&self, id: &str) -> CoreResult<()> {
        self.queue.retry(id).await
    }

    pub fn pause_queue(&self, reason: Option<String>) {
        self.run_controller.set_paused(true);
        self.queue.pause(reason);
    }

    pub fn resume_queue(&self) {
        self.run_controller.set_paused(false);
        self.queue.resume();
    }

    pub async fn move_pending_task(&self, id: &str, direction: MoveDirection) -> CoreResult<()> {
        let _guard = self.async_lock.lock().await;
        self.queue.move_pending_task(id, direction).await
    }

    /// 部分重排；与队列进度互斥
    pub async fn reorder_pending_tasks(&self, task_ids: &[String]) -> CoreResult<()> {
        let _guard = self.async_lock.lock().await;
        self.task_store.tasks().reorder_pending_tasks(task_ids).await
    }

    pub async fn mark_prompt_injected(&self, id: &str) -> CoreResult<bool> {
        self.task_store
            .tasks()
            .mark_prompt_injected(id, Utc::now())
            .await
    }

    // ==================== 事件订阅 ====================

    pub fn subscribe(&self, session_id: impl Into<String>, sink: EventSink) -> Subscription {
        self.event_bus.subscribe(session_id, sink)
    }

    pub fn replay_events(&self, session_id: &str, after_seq: u64) -> Vec<QueueEventEnvelope> {
        self.event_bus.replay_since(session_id, after_seq)
    }

    // ==================== 附件 ====================

    pub async fn create_image_attachment(&self, input: NewAttachment) -> CoreResult<Attachment> {
        self.task_store
            .attachments()
            .create_image_attachment(input, Utc::now())
            .await
    }

    pub async fn link_attachments_to_task(
        &self,
        task_id: &str,
        attachment_ids: &[String],
    ) -> CoreResult<()> {
        self.task_store
            .attachments()
            .link_to_task(task_id, attachment_ids, Utc::now())
            .await
    }

    pub async fn list_attachments_for_task(&self, task_id: &str) -> CoreResult<Vec<Attachment>> {
        self.task_store.attachments().list_for_task(task_id).await
    }

    // ==================== 模型配置 ====================

    pub async fn upsert_model_config(&self, config: &ModelConfig) -> CoreResult<()> {
        self.task_store.models().upsert(config, Utc::now()).await
    }

    pub async fn list_model_configs(&self) -> CoreResult<Vec<ModelConfig>> {
        self.task_store.models().list().await
    }

    pub async fn get_model_config(&self, id: &str) -> CoreResult<Option<ModelConfig>> {
        self.task_store.models().get(id).await
    }

    pub async fn delete_model_config(&self, id: &str) -> CoreResult<()> {
        self.task_store.models().delete(id).await
    }

    // ==================== 偏好 ====================

    pub async fn set_preference(&self, key: &str, value: &str) -> CoreResult<()> {
        self.task_store.preferences().set(key, value, Utc::now()).await
    }

    pub async fn get_preference(&self, key: &str) -> CoreResult<Option<String>> {
        self.task_store.preferences().get(key).await
    }

    // ==================== 生命周期 ====================

    /// 停止队列、等待工作者退出、关闭状态库
    pub async fn shutdown(&self) {
        self.queue.stop();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("等待队列工作者退出失败: {}", e);
            }
        }
        self.state_store.close().await;
        info!(root = %self.paths.root.display(), "工作区上下文已关闭");
    }
}

/// 工作区注册表：按根目录缓存上下文
pub struct WorkspaceRegistry {
    contexts: DashMap<PathBuf, Arc<WorkspaceContext>>,
    options: WorkspaceOptions,
}

impl WorkspaceRegistry {
    pub fn new(options: WorkspaceOptions) -> Self {
        Self {
            contexts: DashMap::new(),
            options,
        }
    }

    /// 取出或惰性构建工作区上下文
    pub async fn get_or_open(&self, root: &Path) -> CoreResult<Arc<WorkspaceContext>> {
        let key = root.canonicalize().map_err(|e| {
            CoreError::io(format!("工作区路径无效: {}", e), Some(root.to_path_buf()))
        })?;

        if let Some(existing) = self.contexts.get(&key) {
            return Ok(Arc::clone(&existing));
        }

        let context = WorkspaceContext::open(&key, self.options.clone()).await?;
        match self.contexts.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                // 并发构建输掉的一方收掉自己的
                context.shutdown().await;
                Ok(Arc::clone(entry.get()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&context));
                Ok(context)
            }
        }
    }

    pub fn get(&self, root: &Path) -> Option<Arc<WorkspaceContext>> {
        let key = root.canonicalize().ok()?;
        self.contexts.get(&key).map(|c| Arc::clone(&c))
    }

    /// 关闭并移除工作区
    pub async fn close(&self, root: &Path) -> CoreResult<()> {
        let key = root.canonicalize().map_err(|e| {
            CoreError::io(format!("工作区路径无效: {}", e), Some(root.to_path_buf()))
        })?;
        if let Some((_, context)) = self.contexts.remove(&key) {
            context.shutdown().await;
        }
        Ok(())
    }

    /// 关闭全部工作区
    pub async fn close_all(&self) {
        let keys: Vec<PathBuf> = self.contexts.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, context)) = self.contexts.remove(&key) {
                context.shutdown().await;
            }
        }
    }
}
