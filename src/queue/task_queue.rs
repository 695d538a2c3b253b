/*!
 * 任务队列
 *
 * 每个工作区一个单工作者循环：声明 pending 任务、规划、执行、
 * 按取消/重试/失败分类收尾，并把生命周期事件发布出去。
 * 队列是失败边界：规划器与执行器的所有错误都在这里分类。
 */

use crate::config::DEFAULT_RETRY_BACKOFF;
use crate::error::{CoreError, CoreResult};
use crate::queue::events::{QueueEvent, QueueEventEnvelope};
use crate::queue::executor::{ExecutorHooks, TaskExecutor};
use crate::queue::planner::TaskPlanner;
use crate::storage::repositories::{
    ConversationMessageInput, MessageRole, MoveDirection, StepStatus, Task, TaskPatch, TaskStatus,
};
use crate::storage::TaskStore;
use crate::workspace::run_controller::{RunController, RunMode};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 工作循环空转时的等待上限
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// 事件发布回调（WorkspaceContext 接到 EventBus 上）
pub type EventPublisher = Arc<dyn Fn(QueueEventEnvelope) + Send + Sync>;

/// 队列配置
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// 可重试失败后的退避
    pub retry_backoff: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// 当前正在执行的任务
struct RunningTask {
    id: String,
    cancel: CancellationToken,
}

/// 任务队列
pub struct TaskQueue {
    store: Arc<TaskStore>,
    planner: Arc<TaskPlanner>,
    executor: Arc<TaskExecutor>,
    run_controller: Arc<RunController>,
    config: TaskQueueConfig,
    publisher: EventPublisher,
    wake: Notify,
    paused: AtomicBool,
    stopped: AtomicBool,
    seq: AtomicU64,
    running: Mutex<Option<RunningTask>>,
}

impl TaskQueue {
    pub fn new(
        store: Arc<TaskStore>,
        planner: Arc<TaskPlanner>,
        executor: Arc<TaskExecutor>,
        run_controller: Arc<RunController>,
        config: TaskQueueConfig,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            store,
            planner,
            executor,
            run_controller,
            config,
            publisher,
            wake: Notify::new(),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            running: Mutex::new(None),
        }
    }

    /// 发布带单调序号的事件
    pub(crate) fn emit(&self, event: QueueEvent) {
        let envelope = QueueEventEnvelope {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            event,
        };
        (self.publisher)(envelope);
    }

    /// 启动单工作者循环（每个队列只调用一次）
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            Self::worker_loop(queue).await;
        })
    }

    async fn worker_loop(queue: Arc<Self>) {
        info!("任务队列工作者启动");
        while !queue.stopped.load(Ordering::SeqCst) {
            if queue.paused.load(Ordering::SeqCst) {
                queue.wait_for_wake().await;
                continue;
            }

            // all 模式下自动把排队任务提升为待执行
            if queue.run_controller.mode() == RunMode::All {
                loop {
                    match queue.store.tasks().dequeue_next_queued_task(Utc::now()).await {
                        Ok(Some(task)) => queue.emit(QueueEvent::TaskUpdated { task }),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("提升排队任务失败: {}", e);
                            break;
                        }
                    }
                }
            }

            let claimed = match queue.store.tasks().claim_next_pending_task(Utc::now()).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!("声明任务失败: {}", e);
                    None
                }
            };

            let Some(task) = claimed else {
                queue.wait_for_wake().await;
                continue;
            };

            Self::run_task(&queue, task).await;
        }
        info!("任务队列工作者退出");
    }

    async fn wait_for_wake(&self) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(IDLE_WAIT) => {}
        }
    }

    /// 执行一个已声明的任务：规划 → 落计划 → 执行 → 分类收尾
    async fn run_task(queue: &Arc<Self>, task: Task) {
        let cancel = CancellationToken::new();
        *queue.running.lock() = Some(RunningTask {
            id: task.id.clone(),
            cancel: cancel.clone(),
        });

        queue.emit(QueueEvent::TaskStarted { task: task.clone() });

        let outcome = Self::drive_task(queue, &task, &cancel).await;

        match outcome {
            Ok(summary) => queue.finish_completed(&task, summary).await,
            Err(e) if e.is_cancelled() => queue.finish_cancelled(&task).await,
            Err(e) => queue.handle_error(&task, e).await,
        }

        *queue.running.lock() = None;
    }

    async fn drive_task(
        queue: &Arc<Self>,
        task: &Task,
        cancel: &CancellationToken,
    ) -> CoreResult<Option<String>> {
        // 规划阶段
        let task = queue
            .store
            .tasks()
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Planning),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await?;

        let plan = queue.planner.generate_plan(&task, cancel).await?;
        queue.ensure_not_cancelled(&task.id, cancel).await?;

        let steps = queue.store.plan_steps().set_plan(&task.id, &plan).await?;
        queue.emit(QueueEvent::TaskPlanned {
            task: task.clone(),
            steps: steps.clone(),
        });

        // 执行阶段
        let task = queue
            .store
            .tasks()
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Running),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await?;
        queue.emit(QueueEvent::TaskRunning { task: task.clone() });

        let hooks = Self::build_hooks(queue, task.clone());
        let result = queue.executor.execute(&task, &steps, cancel, &hooks).await?;
        queue.ensure_not_cancelled(&task.id, cancel).await?;

        Ok(result.result_summary)
    }

    /// 执行钩子：把执行进度翻译成生命周期事件
    fn build_hooks(queue: &Arc<Self>, task: Task) -> ExecutorHooks {
        let q_started = Arc::clone(queue);
        let q_completed = Arc::clone(queue);
        let q_delta = Arc::clone(queue);
        let q_command = Arc::clone(queue);
        let task_started = task.clone();
        let task_completed = task.clone();
        let task_delta = task.clone();
        let task_command = task;

        ExecutorHooks {
            on_step_started: Some(Arc::new(move |step| {
                q_started.emit(QueueEvent::StepStarted {
                    task: task_started.clone(),
                    step: step.clone(),
                });
            })),
            on_step_complete: Some(Arc::new(move |step, result| {
                q_completed.emit(QueueEvent::StepCompleted {
                    task: task_completed.clone(),
                    step: step.clone(),
                });
                if !result.is_empty() {
                    q_completed.emit(QueueEvent::Message {
                        task: task_completed.clone(),
                        role: "assistant".to_string(),
                        content: result.to_string(),
                    });
                }
            })),
            on_message_delta: Some(Arc::new(move |step, delta| {
                q_delta.emit(QueueEvent::MessageDelta {
                    task: task_delta.clone(),
                    step_number: step.step_number,
                    delta: delta.to_string(),
                });
            })),
            on_command: Some(Arc::new(move |_step, command| {
                q_command.emit(QueueEvent::Command {
                    task: task_command.clone(),
                    command: command.to_string(),
                });
            })),
        }
    }

    /// 取消信号或外部把状态改成 cancelled 都按取消处理
    async fn ensure_not_cancelled(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if let Some(task) = self.store.tasks().get_task(task_id).await? {
            if task.status == TaskStatus::Cancelled {
                return Err(CoreError::Cancelled);
            }
        }
        Ok(())
    }

    async fn finish_completed(&self, task: &Task, summary: Option<String>) {
        let updated = self
            .store
            .tasks()
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Completed),
                    result: Some(summary.clone()),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await;

        let updated = match updated {
            Ok(updated) => updated,
            Err(e) => {
                warn!(task_id = %task.id, "写入完成状态失败: {}", e);
                return;
            }
        };

        if let Some(summary) = &summary {
            if let Err(e) = self
                .store
                .messages()
                .append_task_context(&task.id, "summary", summary, Utc::now())
                .await
            {
                warn!(task_id = %task.id, "写入任务摘要失败: {}", e);
            }
            if !updated.thread_id.is_empty() {
                let message = ConversationMessageInput::new(
                    &updated.thread_id,
                    MessageRole::System,
                    format!("[任务完成摘要]\n{}", summary),
                )
                .with_metadata(serde_json::json!({"kind": "task_summary"}));
                if let Err(e) = self
                    .store
                    .conversations()
                    .append_message(message, Utc::now())
                    .await
                {
                    warn!(task_id = %task.id, "写入会话摘要失败: {}", e);
                }
            }
        }

        self.emit(QueueEvent::TaskCompleted { task: updated });
    }

    async fn finish_cancelled(&self, task: &Task) {
        let updated = self
            .store
            .tasks()
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Cancelled),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await;

        // 运行中的步骤标记为失败
        if let Ok(steps) = self.store.plan_steps().list_steps(&task.id).await {
            for step in steps {
                if step.status == StepStatus::Running {
                    if let Err(e) = self
                        .store
                        .plan_steps()
                        .update_step_status(step.id, StepStatus::Failed, Utc::now())
                        .await
                    {
                        warn!(task_id = %task.id, "标记取消步骤失败: {}", e);
                    }
                }
            }
        }

        if let Err(e) = self
            .store
            .messages()
            .append_task_context(&task.id, "transcript", "[已取消]", Utc::now())
            .await
        {
            warn!(task_id = %task.id, "写入取消标记失败: {}", e);
        }

        match updated {
            Ok(updated) => self.emit(QueueEvent::TaskCancelled { task: updated }),
            Err(e) => warn!(task_id = %task.id, "写入取消状态失败: {}", e),
        }
    }

    /// 重试或终局失败
    async fn handle_error(&self, task: &Task, error: CoreError) {
        let message = error.to_string();
        warn!(task_id = %task.id, "任务执行失败: {}", message);

        let fresh = match self.store.tasks().get_task(&task.id).await {
            Ok(Some(fresh)) => fresh,
            _ => task.clone(),
        };

        if fresh.retry_count + 1 <= fresh.max_retries {
            // 还有预算：回到 pending 并唤醒循环
            let patch = TaskPatch {
                status: Some(TaskStatus::Pending),
                retry_count: Some(fresh.retry_count + 1),
                result: Some(None),
                started_at: Some(None),
                completed_at: Some(None),
                last_error: Some(Some(message.clone())),
                ..Default::default()
            };
            match self.store.tasks().update_task(&task.id, patch, Utc::now()).await {
                Ok(updated) => {
                    self.emit(QueueEvent::TaskFailed {
                        task: updated,
                        error: message,
                    });
                    tokio::time::sleep(self.config.retry_backoff).await;
                    self.wake.notify_one();
                }
                Err(e) => warn!(task_id = %task.id, "写入重试状态失败: {}", e),
            }
        } else {
            let patch = TaskPatch {
                status: Some(TaskStatus::Failed),
                last_error: Some(Some(message.clone())),
                ..Default::default()
            };
            match self.store.tasks().update_task(&task.id, patch, Utc::now()).await {
                Ok(updated) => {
                    if let Err(e) = self
                        .store
                        .messages()
                        .append_task_context(
                            &task.id,
                            "transcript",
                            &format!("[失败]\n{}", message),
                            Utc::now(),
                        )
                        .await
                    {
                        warn!(task_id = %task.id, "写入失败标记失败: {}", e);
                    }
                    self.emit(QueueEvent::TaskFailed {
                        task: updated,
                        error: message,
                    });
                }
                Err(e) => warn!(task_id = %task.id, "写入失败状态失败: {}", e),
            }
        }
    }

    // ==================== 外部控制 ====================

    /// 暂停工作循环
    pub fn pause(&self, reason: Option<String>) {
        self.paused.store(true, Ordering::SeqCst);
        self.emit(QueueEvent::QueuePaused { reason });
    }

    /// 恢复工作循环
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.emit(QueueEvent::QueueResumed);
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// 取消任务：运行中的任务触发取消控制器，其余直接翻状态
    pub async fn cancel(&self, task_id: &str) -> CoreResult<()> {
        let running = {
            let guard = self.running.lock();
            guard
                .as_ref()
                .filter(|r| r.id == task_id)
                .map(|r| r.cancel.clone())
        };

        let updated = self
            .store
            .tasks()
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Cancelled),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await?;

        match running {
            Some(cancel) => {
                // 工作者会在收尾时发出 task:cancelled
                cancel.cancel();
            }
            None => {
                self.emit(QueueEvent::TaskCancelled { task: updated });
                self.wake.notify_one();
            }
        }
        Ok(())
    }

    /// 重试：重置重试计数与结果，回到 pending
    pub async fn retry(&self, task_id: &str) -> CoreResult<()> {
        let updated = self
            .store
            .tasks()
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Pending),
                    retry_count: Some(0),
                    result: Some(None),
                    last_error: Some(None),
                    started_at: Some(None),
                    completed_at: Some(None),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await?;
        self.emit(QueueEvent::TaskUpdated { task: updated });
        self.wake.notify_one();
        Ok(())
    }

    /// 新任务信号
    pub fn notify_new_task(&self) {
        self.wake.notify_one();
    }

    /// 队列级移动/重排直接转发给存储层
    pub async fn move_pending_task(
        &self,
        task_id: &str,
        direction: MoveDirection,
    ) -> CoreResult<()> {
        self.store.tasks().move_pending_task(task_id, direction).await
    }

    /// 停止工作者；运行中的任务收到取消信号
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(running) = self.running.lock().as_ref() {
            running.cancel.cancel();
        }
        self.wake.notify_one();
    }

    /// 当前正在执行的任务 id
    pub fn running_task_id(&self) -> Option<String> {
        self.running.lock().as_ref().map(|r| r.id.clone())
    }
}
