/*!
 * Agent CLI 适配器
 *
 * 以非 shell 方式 spawn vendor CLI，把提示词写入 stdin 后关闭，
 * 按行消费 stdout 的 JSON 事件流，经 vendor 解析器转成规范化事件
 * 分发给订阅者。持有可恢复的 thread id；模型变更导致 vendor 拒绝
 * resume 时，去掉 resume 子句透明重试一次。
 */

use crate::agent::allowlist::check_command_allowed;
use crate::agent::events::{AgentEvent, SequencedEvent, TokenUsage};
use crate::agent::AgentVendor;
use crate::config::{CoreSettings, DEFAULT_TURN_TIMEOUT};
use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 单次流式输出的字节上限，超出部分丢弃但进程继续运行
const MAX_STREAM_BYTES: usize = 10 * 1024 * 1024;
/// stderr 采集上限
const MAX_STDERR_BYTES: usize = 64 * 1024;
/// SIGTERM 后的宽限期
const TERM_GRACE: Duration = Duration::from_secs(2);

/// 流式配置
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub enabled: bool,
    pub throttle_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            throttle_ms: 50,
        }
    }
}

/// 适配器状态
#[derive(Debug, Clone)]
pub struct AdapterStatus {
    pub ready: bool,
    pub streaming: bool,
}

/// send 的输入：纯文本或按行拼接的片段
#[derive(Debug, Clone)]
pub enum AgentInput {
    Text(String),
    Parts(Vec<String>),
}

impl AgentInput {
    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts.join("\n"),
        }
    }
}

impl From<String> for AgentInput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for AgentInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// send 选项
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// 模型覆盖
    pub model: Option<String>,
    /// 协作式取消
    pub cancel: Option<CancellationToken>,
    /// 本次调用的超时覆盖
    pub timeout: Option<Duration>,
}

/// send 结果
#[derive(Debug, Clone)]
pub struct SendResult {
    pub response: String,
    pub usage: Option<TokenUsage>,
    /// 本次使用的线程 id
    pub agent_id: Option<String>,
}

/// 事件订阅者
pub type EventSubscriber = Arc<dyn Fn(&SequencedEvent) + Send + Sync>;

/// 订阅句柄，drop 或显式调用即退订
pub struct SubscriptionGuard {
    id: u64,
    subscribers: Arc<Mutex<HashMap<u64, EventSubscriber>>>,
}

impl SubscriptionGuard {
    /// 自定义适配器实现共用的句柄构造
    pub fn for_map(id: u64, subscribers: Arc<Mutex<HashMap<u64, EventSubscriber>>>) -> Self {
        Self { id, subscribers }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.subscribers.lock().remove(&self.id);
    }
}

/// 适配器统一接口（planner / executor / queue 依赖的接缝）
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    async fn send(&self, input: AgentInput, options: SendOptions) -> CoreResult<SendResult>;

    fn on_event(&self, subscriber: EventSubscriber) -> SubscriptionGuard;

    fn status(&self) -> AdapterStatus;

    /// 清除可恢复的会话线程 id
    fn reset(&self);

    fn streaming_config(&self) -> StreamingConfig;
}

/// CLI 适配器配置
#[derive(Debug, Clone)]
pub struct CliAdapterConfig {
    pub vendor: AgentVendor,
    /// vendor 二进制（名字或路径）
    pub binary: String,
    /// 默认模型
    pub model: Option<String>,
    /// 评审/规划用途：以只读沙箱运行
    pub sandbox_read_only: bool,
    /// 子进程白名单
    pub allowlist: Option<Vec<String>>,
    pub streaming: StreamingConfig,
    /// 连接+排空超时
    pub turn_timeout: Duration,
}

impl CliAdapterConfig {
    pub fn for_vendor(vendor: AgentVendor, settings: &CoreSettings) -> Self {
        Self {
            vendor,
            binary: vendor.binary(settings),
            model: None,
            sandbox_read_only: false,
            allowlist: settings.exec_allowlist.clone(),
            streaming: StreamingConfig::default(),
            turn_timeout: DEFAULT_TURN_TIMEOUT,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.sandbox_read_only = true;
        self
    }
}

/// vendor CLI 子进程适配器
pub struct CliAgentAdapter {
    config: CliAdapterConfig,
    thread_id: Mutex<Option<String>>,
    subscribers: Arc<Mutex<HashMap<u64, EventSubscriber>>>,
    next_subscriber_id: AtomicU64,
    in_flight: AtomicUsize,
}

/// 单次 send 的本地累积
#[derive(Default)]
struct RunState {
    response_text: String,
    usage: Option<TokenUsage>,
    thread_id: Option<String>,
    stream_error: Option<String>,
    turn_failed: bool,
}

impl CliAgentAdapter {
    pub fn new(config: CliAdapterConfig) -> Self {
        Self {
            config,
            thread_id: Mutex::new(None),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn vendor(&self) -> AgentVendor {
        self.config.vendor
    }

    /// 当前可恢复线程 id
    pub fn thread_id(&self) -> Option<String> {
        self.thread_id.lock().clone()
    }

    fn notify(&self, event: &SequencedEvent) {
        let subscribers: Vec<EventSubscriber> = self.subscribers.lock().values().cloned().collect();
        for subscriber in subscribers {
            subscriber(event);
        }
    }

    fn build_args(&self, model: Option<&str>, resume_thread: Option<&str>) -> Vec<String> {
        let mut args = vec!["--json".to_string(), "--skip-git-repo-check".to_string()];
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if self.config.sandbox_read_only {
            args.push("--sandbox".to_string());
            args.push("read-only".to_string());
        }
        if let Some(thread) = resume_thread {
            args.push("resume".to_string());
            args.push(thread.to_string());
        }
        args
    }

    /// 跑一次子进程，返回 (RunState, 退出码, stderr)
    async fn run_once(
        &self,
        prompt: &str,
        args: &[String],
        cancel: &CancellationToken,
        timeout: Duration,
        seq: &AtomicU64,
    ) -> CoreResult<(RunState, Option<i32>, String)> {
        let mut command = Command::new(&self.config.binary);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| CoreError::adapter(format!("启动 {} 失败: {}", self.config.binary, e)))?;

        // 写入提示词后立刻关闭 stdin
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| CoreError::adapter(format!("写入提示词失败: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| CoreError::adapter(format!("关闭 stdin 失败: {}", e)))?;
        }

        let stderr_handle = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::with_capacity(1024);
                let mut chunk = [0u8; 4096];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if buf.len() < MAX_STDERR_BYTES {
                                let take = n.min(MAX_STDERR_BYTES - buf.len());
                                buf.extend_from_slice(&chunk[..take]);
                            }
                        }
                    }
                }
                String::from_utf8_lossy(&buf).trim().to_string()
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::adapter("无法获取子进程 stdout"))?;

        let mut run = RunState::default();
        let mut parser = self.config.vendor.new_parser();
        let mut reader = BufReader::new(stdout).lines();
        let mut consumed_bytes = 0usize;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut cancelled = false;
        let mut timed_out = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
                line = reader.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if consumed_bytes >= MAX_STREAM_BYTES {
                                continue;
                            }
                            consumed_bytes += line.len();
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            // 解析失败的行忽略
                            let Ok(payload) = serde_json::from_str::<serde_json::Value>(trimmed) else {
                                continue;
                            };
                            for event in parser.parse_line(&payload) {
                                self.apply_event(&event, &mut run);
                                let sequenced = SequencedEvent {
                                    seq: seq.fetch_add(1, Ordering::Relaxed),
                                    event,
                                };
                                self.notify(&sequenced);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!("读取 agent 输出中断: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        if cancelled || timed_out {
            terminate_child(&mut child).await;
        }

        // 等待退出本身可被取消
        let status = tokio::select! {
            _ = cancel.cancelled(), if !cancelled => {
                terminate_child(&mut child).await;
                cancelled = true;
                None
            }
            status = child.wait() => status.ok(),
        };

        // stderr 管道可能被遗留的孙进程占住，排空只等有限时间
        let stderr_text = match stderr_handle {
            Some(handle) => tokio::time::timeout(TERM_GRACE, handle)
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or_default(),
            None => String::new(),
        };

        if cancelled {
            return Err(CoreError::Cancelled);
        }
        if timed_out {
            return Err(CoreError::adapter(format!(
                "agent 超时（{} 秒）",
                timeout.as_secs()
            )));
        }

        if run.response_text.is_empty() {
            if let Some(text) = parser.final_message() {
                run.response_text = text;
            }
        }
        if run.stream_error.is_none() {
            run.stream_error = parser.last_error().map(str::to_string);
        }

        let exit_code = status.and_then(|s| s.code());
        Ok((run, exit_code, stderr_text))
    }

    fn apply_event(&self, event: &AgentEvent, run: &mut RunState) {
        match event {
            AgentEvent::ThreadStarted { thread_id } => {
                run.thread_id = Some(thread_id.clone());
            }
            AgentEvent::Responding { delta } => {
                run.response_text = delta.clone();
            }
            AgentEvent::Completed { text } => {
                if !text.is_empty() {
                    run.response_text = text.clone();
                }
            }
            AgentEvent::TurnCompleted { usage } => {
                if usage.is_some() {
                    run.usage = usage.clone();
                }
            }
            AgentEvent::TurnFailed { message } => {
                run.turn_failed = true;
                run.stream_error = Some(message.clone());
            }
            AgentEvent::Error { message } => {
                if run.stream_error.is_none() {
                    run.stream_error = Some(message.clone());
                }
            }
            _ => {}
        }
    }
}

/// vendor 拒绝跨模型 resume 的报错判定
fn is_resume_mismatch(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("resume") && lower.contains("model")
}

/// SIGTERM → 宽限期 → SIGKILL
async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
            if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
                return;
            }
            warn!("agent 进程未在宽限期内退出，SIGKILL");
        }
    }
    let _ = child.kill().await;
}

#[async_trait]
impl AgentAdapter for CliAgentAdapter {
    async fn send(&self, input: AgentInput, options: SendOptions) -> CoreResult<SendResult> {
        check_command_allowed(&self.config.binary, self.config.allowlist.as_deref())?;

        let prompt = input.render();
        if prompt.trim().is_empty() {
            return Err(CoreError::validation("提示词不能为空"));
        }

        let model = options.model.clone().or_else(|| self.config.model.clone());
        let cancel = options.cancel.clone().unwrap_or_default();
        let timeout = options.timeout.unwrap_or(self.config.turn_timeout);
        let seq = AtomicU64::new(0);

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = async {
            // 第一轮带 resume；vendor 因模型变更拒绝时清掉线程重试一次
            for attempt in 0..2 {
                let resume_thread = if attempt == 0 { self.thread_id() } else { None };
                let args = self.build_args(model.as_deref(), resume_thread.as_deref());
                debug!(vendor = self.config.vendor.as_str(), attempt, "spawn agent");

                let (run, exit_code, stderr_text) = self
                    .run_once(&prompt, &args, &cancel, timeout, &seq)
                    .await?;

                let failed = exit_code != Some(0) || run.turn_failed;
                if failed {
                    let mismatch = run
                        .stream_error
                        .as_deref()
                        .map(is_resume_mismatch)
                        .unwrap_or(false);
                    if attempt == 0 && resume_thread.is_some() && mismatch {
                        debug!("模型变更导致 resume 被拒，清除线程后重试");
                        *self.thread_id.lock() = None;
                        continue;
                    }
                    let message = run
                        .stream_error
                        .clone()
                        .filter(|m| !m.is_empty())
                        .or_else(|| Some(stderr_text.clone()).filter(|m| !m.is_empty()))
                        .unwrap_or_else(|| {
                            format!("agent 进程退出码 {}", exit_code.unwrap_or(-1))
                        });
                    return Err(CoreError::adapter(message));
                }

                if let Some(thread) = &run.thread_id {
                    *self.thread_id.lock() = Some(thread.clone());
                }
                return Ok(SendResult {
                    response: run.response_text,
                    usage: run.usage,
                    agent_id: run.thread_id.or(resume_thread),
                });
            }
            Err(CoreError::adapter("resume 重试后仍失败"))
        }
        .await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn on_event(&self, subscriber: EventSubscriber) -> SubscriptionGuard {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, subscriber);
        SubscriptionGuard {
            id,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    fn status(&self) -> AdapterStatus {
        AdapterStatus {
            ready: !self.config.binary.is_empty(),
            streaming: self.in_flight.load(Ordering::SeqCst) > 0,
        }
    }

    fn reset(&self) {
        *self.thread_id.lock() = None;
    }

    fn streaming_config(&self) -> StreamingConfig {
        self.config.streaming.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_render() {
        assert_eq!(AgentInput::Text("a".into()).render(), "a");
        assert_eq!(
            AgentInput::Parts(vec!["a".into(), "b".into()]).render(),
            "a\nb"
        );
    }

    #[test]
    fn test_build_args_plain() {
        let adapter = CliAgentAdapter::new(CliAdapterConfig {
            vendor: AgentVendor::Droid,
            binary: "droid".into(),
            model: None,
            sandbox_read_only: false,
            allowlist: None,
            streaming: StreamingConfig::default(),
            turn_timeout: DEFAULT_TURN_TIMEOUT,
        });
        assert_eq!(
            adapter.build_args(None, None),
            vec!["--json".to_string(), "--skip-git-repo-check".to_string()]
        );
    }

    #[test]
    fn test_build_args_full() {
        let adapter = CliAgentAdapter::new(
            CliAdapterConfig {
                vendor: AgentVendor::Amp,
                binary: "amp".into(),
                model: None,
                sandbox_read_only: false,
                allowlist: None,
                streaming: StreamingConfig::default(),
                turn_timeout: DEFAULT_TURN_TIMEOUT,
            }
            .read_only(),
        );
        assert_eq!(
            adapter.build_args(Some("m-1"), Some("T-7")),
            vec![
                "--json".to_string(),
                "--skip-git-repo-check".to_string(),
                "--model".to_string(),
                "m-1".to_string(),
                "--sandbox".to_string(),
                "read-only".to_string(),
                "resume".to_string(),
                "T-7".to_string(),
            ]
        );
    }

    #[test]
    fn test_resume_mismatch_detection() {
        assert!(is_resume_mismatch(
            "Cannot resume thread with a different model"
        ));
        assert!(is_resume_mismatch("RESUME rejected: model changed"));
        assert!(!is_resume_mismatch("network unreachable"));
    }

    #[test]
    fn test_subscription_guard_unsubscribes_on_drop() {
        let adapter = CliAgentAdapter::new(CliAdapterConfig {
            vendor: AgentVendor::Droid,
            binary: "droid".into(),
            model: None,
            sandbox_read_only: false,
            allowlist: None,
            streaming: StreamingConfig::default(),
            turn_timeout: DEFAULT_TURN_TIMEOUT,
        });
        let guard = adapter.on_event(Arc::new(|_| {}));
        assert_eq!(adapter.subscribers.lock().len(), 1);
        drop(guard);
        assert!(adapter.subscribers.lock().is_empty());
    }
}
