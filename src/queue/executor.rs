/*!
 * 任务执行器
 *
 * 顺序执行计划中的每一步：落库步骤消息、拼装带会话历史的提示词、
 * 流式调用适配器并把累积文本差分成增量转发给钩子、步骤完成后
 * 落库助手消息。最后一步的回复截断后作为任务结果摘要。
 */

use crate::agent::adapter::{AgentAdapter, AgentInput, SendOptions};
use crate::agent::events::AgentEvent;
use crate::error::{CoreError, CoreResult};
use crate::storage::repositories::{
    ConversationMessageInput, MessageRole, PlanStep, StepStatus, Task, TaskMessageInput,
};
use crate::storage::TaskStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 结果摘要截断长度（字符）
const RESULT_SUMMARY_MAX_CHARS: usize = 1600;
/// 会话历史条数上限
const HISTORY_MESSAGE_LIMIT: i64 = 16;
/// 历史单行截断长度（字符）
const HISTORY_LINE_MAX_CHARS: usize = 800;

const STEP_PREAMBLE: &str = "你在执行一个排队任务中的单个步骤。任务已被拆成有序步骤，\
逐步推进；只完成当前步骤，不要提前做后续步骤的工作。";

const STEP_REQUIREMENTS: &str = "## 要求\n\
- 完成本步骤后给出简洁的结果说明\n\
- 不要重复会话历史里已有的内容\n\
- 执行过命令时附上关键输出";

pub type StepHook = Arc<dyn Fn(&PlanStep) + Send + Sync>;
pub type StepResultHook = Arc<dyn Fn(&PlanStep, &str) + Send + Sync>;
pub type DeltaHook = Arc<dyn Fn(&PlanStep, &str) + Send + Sync>;
pub type CommandHook = Arc<dyn Fn(&PlanStep, &str) + Send + Sync>;

/// 执行钩子，队列用它把进度转成生命周期事件
#[derive(Default, Clone)]
pub struct ExecutorHooks {
    pub on_step_started: Option<StepHook>,
    pub on_step_complete: Option<StepResultHook>,
    pub on_message_delta: Option<DeltaHook>,
    pub on_command: Option<CommandHook>,
}

/// 执行结果
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    /// 最后一步回复的截断摘要
    pub result_summary: Option<String>,
}

/// 任务执行器
pub struct TaskExecutor {
    store: Arc<TaskStore>,
    adapter: Arc<dyn AgentAdapter>,
    /// 工作区互斥锁：提供时整个执行过程持锁
    async_lock: Option<Arc<tokio::sync::Mutex<()>>>,
    step_timeout: Option<Duration>,
}

impl TaskExecutor {
    pub fn new(store: Arc<TaskStore>, adapter: Arc<dyn AgentAdapter>) -> Self {
        Self {
            store,
            adapter,
            async_lock: None,
            step_timeout: None,
        }
    }

    pub fn with_async_lock(mut self, lock: Arc<tokio::sync::Mutex<()>>) -> Self {
        self.async_lock = Some(lock);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// 顺序执行全部步骤
    pub async fn execute(
        &self,
        task: &Task,
        steps: &[PlanStep],
        cancel: &CancellationToken,
        hooks: &ExecutorHooks,
    ) -> CoreResult<ExecutionOutcome> {
        match &self.async_lock {
            Some(lock) => {
                let _guard = lock.lock().await;
                self.execute_inner(task, steps, cancel, hooks).await
            }
            None => self.execute_inner(task, steps, cancel, hooks).await,
        }
    }

    async fn execute_inner(
        &self,
        task: &Task,
        steps: &[PlanStep],
        cancel: &CancellationToken,
        hooks: &ExecutorHooks,
    ) -> CoreResult<ExecutionOutcome> {
        let mut last_result = String::new();

        for step in steps {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            last_result = self.run_step(task, step, steps.len(), cancel, hooks).await?;
        }

        let summary = if last_result.is_empty() {
            None
        } else {
            Some(truncate_chars(&last_result, RESULT_SUMMARY_MAX_CHARS))
        };
        Ok(ExecutionOutcome {
            result_summary: summary,
        })
    }

    async fn run_step(
        &self,
        task: &Task,
        step: &PlanStep,
        total_steps: usize,
        cancel: &CancellationToken,
        hooks: &ExecutorHooks,
    ) -> CoreResult<String> {
        let header = step_header(step, total_steps);
        debug!(task_id = %task.id, step = step.step_number, "开始执行步骤");

        // 前置写入：步骤置为运行中，记录系统消息并镜像到会话
        self.store
            .plan_steps()
            .update_step_status(step.id, StepStatus::Running, Utc::now())
            .await?;
        let step_note = format!("开始执行：{}", header);
        self.store
            .messages()
            .append_task_message(
                TaskMessageInput::new(&task.id, MessageRole::System, &step_note)
                    .with_type("step")
                    .with_step(step.id),
                Utc::now(),
            )
            .await?;
        self.store
            .conversations()
            .append_message(
                ConversationMessageInput::new(&task.thread_id, MessageRole::System, &step_note)
                    .with_type("step")
                    .with_step(step.id),
                Utc::now(),
            )
            .await?;
        if let Some(hook) = &hooks.on_step_started {
            hook(step);
        }

        let history = self.history_snippet(&task.thread_id).await?;
        let prompt = compose_step_prompt(task, step, &header, &history);

        // 会话日志存精简版，完整提示词只交给适配器
        let compact_prompt = match &step.description {
            Some(desc) => format!("{}\n{}", header, desc),
            None => header.clone(),
        };
        self.store
            .conversations()
            .append_message(
                ConversationMessageInput::new(&task.thread_id, MessageRole::User, &compact_prompt)
                    .with_type("prompt")
                    .with_step(step.id),
                Utc::now(),
            )
            .await?;

        let result_text = self
            .stream_step(task, step, prompt, cancel, hooks)
            .await?;

        // 后置写入：助手消息落库并镜像，步骤置为完成
        if !result_text.is_empty() {
            self.store
                .messages()
                .append_task_message(
                    TaskMessageInput::new(&task.id, MessageRole::Assistant, &result_text)
                        .with_type("text")
                        .with_step(step.id),
                    Utc::now(),
                )
                .await?;
            self.store
                .conversations()
                .append_message(
                    ConversationMessageInput::new(
                        &task.thread_id,
                        MessageRole::Assistant,
                        &result_text,
                    )
                    .with_step(step.id),
                    Utc::now(),
                )
                .await?;
        }
        self.store
            .plan_steps()
            .update_step_status(step.id, StepStatus::Completed, Utc::now())
            .await?;
        if let Some(hook) = &hooks.on_step_complete {
            hook(step, &result_text);
        }

        Ok(result_text)
    }

    /// 流式调用适配器，同时消费事件流
    async fn stream_step(
        &self,
        task: &Task,
        step: &PlanStep,
        prompt: String,
        cancel: &CancellationToken,
        hooks: &ExecutorHooks,
    ) -> CoreResult<String> {
        let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();
        let guard = self.adapter.on_event(Arc::new(move |sequenced| {
            let _ = tx.send(sequenced.event.clone());
        }));

        let options = SendOptions {
            model: task.model.clone(),
            cancel: Some(cancel.clone()),
            timeout: self.step_timeout,
        };
        let send_fut = self.adapter.send(AgentInput::Text(prompt), options);
        tokio::pin!(send_fut);

        let mut cumulative = String::new();
        let send_result = loop {
            tokio::select! {
                biased;
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            self.handle_stream_event(task, step, event, &mut cumulative, hooks)
                                .await;
                        }
                        // 通道关闭后只等 send 结束
                        None => break send_fut.await,
                    }
                }
                result = &mut send_fut => break result,
            }
        };
        drop(guard);

        // 把剩余缓冲的事件排空
        while let Ok(event) = rx.try_recv() {
            self.handle_stream_event(task, step, event, &mut cumulative, hooks)
                .await;
        }

        let result = send_result?;
        Ok(if result.response.is_empty() {
            cumulative
        } else {
            result.response
        })
    }

    async fn handle_stream_event(
        &self,
        task: &Task,
        step: &PlanStep,
        event: AgentEvent,
        cumulative: &mut String,
        hooks: &ExecutorHooks,
    ) {
        match event {
            AgentEvent::Responding { delta } => {
                let incremental = diff_cumulative(cumulative, &delta);
                if !incremental.is_empty() {
                    if let Some(hook) = &hooks.on_message_delta {
                        hook(step, &incremental);
                    }
                }
            }
            AgentEvent::Command { title, detail } if title == "执行命令" => {
                let command = detail
                    .split(" | ")
                    .next()
                    .unwrap_or(detail.as_str())
                    .trim()
                    .to_string();
                if command.is_empty() {
                    return;
                }
                // 事件处理中的落库失败不致命，记录后继续
                if let Err(e) = self
                    .store
                    .messages()
                    .append_task_message(
                        TaskMessageInput::new(
                            &task.id,
                            MessageRole::System,
                            format!("$ {}", command),
                        )
                        .with_type("command")
                        .with_step(step.id),
                        Utc::now(),
                    )
                    .await
                {
                    warn!(task_id = %task.id, "记录命令消息失败: {}", e);
                }
                if let Some(hook) = &hooks.on_command {
                    hook(step, &command);
                }
            }
            _ => {}
        }
    }

    /// 会话历史片段：最近若干条 user/assistant 消息
    async fn history_snippet(&self, thread_id: &str) -> CoreResult<String> {
        let messages = self
            .store
            .conversations()
            .list_recent_messages(thread_id, HISTORY_MESSAGE_LIMIT)
            .await?;
        let lines: Vec<String> = messages
            .iter()
            .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
            .map(|m| {
                format!(
                    "- {}: {}",
                    m.role.as_str(),
                    truncate_chars(&m.content, HISTORY_LINE_MAX_CHARS)
                )
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

/// 步骤标题行
fn step_header(step: &PlanStep, total: usize) -> String {
    format!("步骤 {}/{}：{}", step.step_number, total, step.title)
}

/// 拼装单步提示词，固定顺序
fn compose_step_prompt(task: &Task, step: &PlanStep, header: &str, history: &str) -> String {
    let mut parts = vec![STEP_PREAMBLE.to_string()];
    if !history.is_empty() {
        parts.push(format!("## 会话历史\n{}", history));
    }
    parts.push(format!("## 任务\n{}", task.title));
    parts.push(task.prompt.trim().to_string());
    parts.push(format!("## 当前步骤\n{}", header));
    if let Some(desc) = &step.description {
        parts.push(desc.clone());
    }
    parts.push(STEP_REQUIREMENTS.to_string());
    parts.join("\n\n")
}

/// 累积文本差分
///
/// 新文本严格变短视为重置（整段转发）；否则转发公共前缀之后的部分。
fn diff_cumulative(last: &mut String, new: &str) -> String {
    if new.chars().count() < last.chars().count() {
        *last = new.to_string();
        return new.to_string();
    }
    let common = last
        .char_indices()
        .zip(new.char_indices())
        .take_while(|((_, a), (_, b))| a == b)
        .count();
    let byte_offset = last
        .char_indices()
        .nth(common)
        .map(|(i, _)| i)
        .unwrap_or(last.len());
    let suffix = new[byte_offset..].to_string();
    *last = new.to_string();
    suffix
}

/// 按字符截断
fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::repositories::TaskStatus;
    use chrono::Utc;

    fn sample_task() -> Task {
        Task {
            id: "t1".into(),
            title: "示例任务".into(),
            prompt: "write hello world in python".into(),
            model: None,
            model_params: None,
            status: TaskStatus::Running,
            priority: 0,
            queue_order: 1,
            queued_at: None,
            started_at: None,
            completed_at: None,
            archived_at: None,
            prompt_injected_at: None,
            inherit_context: false,
            parent_task_id: None,
            thread_id: "conv-t1".into(),
            result: None,
            last_error: None,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
            created_by: None,
        }
    }

    fn sample_step(n: i64, title: &str) -> PlanStep {
        PlanStep {
            id: n,
            task_id: "t1".into(),
            step_number: n,
            title: title.into(),
            description: None,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_diff_cumulative_forwards_suffix() {
        let mut last = String::new();
        assert_eq!(diff_cumulative(&mut last, "hel"), "hel");
        assert_eq!(diff_cumulative(&mut last, "hello"), "lo");
        assert_eq!(diff_cumulative(&mut last, "hello"), "");
    }

    #[test]
    fn test_diff_cumulative_reset_on_shorter() {
        let mut last = "hello world".to_string();
        assert_eq!(diff_cumulative(&mut last, "new"), "new");
        assert_eq!(last, "new");
    }

    #[test]
    fn test_diff_cumulative_divergent_same_length() {
        let mut last = "abcdef".to_string();
        assert_eq!(diff_cumulative(&mut last, "abcxyz"), "xyz");
    }

    #[test]
    fn test_diff_cumulative_multibyte() {
        let mut last = String::new();
        assert_eq!(diff_cumulative(&mut last, "你好"), "你好");
        assert_eq!(diff_cumulative(&mut last, "你好，世界"), "，世界");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abc", 5), "abc");
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("你好世界", 2), "你好");
    }

    #[test]
    fn test_prompt_composition_order() {
        let task = sample_task();
        let step = sample_step(1, "写脚本");
        let header = step_header(&step, 2);
        let prompt = compose_step_prompt(&task, &step, &header, "- user: 之前说过的话");

        let preamble_pos = prompt.find(STEP_PREAMBLE).unwrap();
        let history_pos = prompt.find("## 会话历史").unwrap();
        let task_pos = prompt.find("## 任务").unwrap();
        let step_pos = prompt.find("## 当前步骤").unwrap();
        let req_pos = prompt.find("## 要求").unwrap();
        assert!(preamble_pos < history_pos);
        assert!(history_pos < task_pos);
        assert!(task_pos < step_pos);
        assert!(step_pos < req_pos);
        assert!(prompt.contains("步骤 1/2：写脚本"));
    }

    #[test]
    fn test_prompt_without_history_has_no_history_section() {
        let task = sample_task();
        let step = sample_step(1, "写脚本");
        let header = step_header(&step, 1);
        let prompt = compose_step_prompt(&task, &step, &header, "");
        assert!(!prompt.contains("## 会话历史"));
    }
}
