/*!
 * 队列集成测试
 *
 * 用脚本化的 mock 适配器驱动完整工作区：规划 → 执行 → 事件流，
 * 覆盖正常路径、规划失败重试、执行中取消与暂停/恢复。
 */

use ads_core::agent::adapter::{
    AdapterStatus, AgentAdapter, AgentInput, SendOptions, SendResult, StreamingConfig,
};
use ads_core::agent::events::{AgentEvent, SequencedEvent};
use ads_core::error::{CoreError, CoreResult};
use ads_core::queue::events::QueueEvent;
use ads_core::storage::repositories::{
    CreateTaskInput, CreateTaskOptions, StepStatus, TaskStatus,
};
use ads_core::workspace::{WorkspaceContext, WorkspaceOptions};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// 单步脚本
enum Scripted {
    /// 成功：先发事件再返回文本
    Ok {
        events: Vec<AgentEvent>,
        response: String,
    },
    /// 失败
    Fail(String),
    /// 挂起直到被取消
    Hang,
}

/// 脚本化适配器：按顺序消费脚本，向订阅者转发事件
struct ScriptedAdapter {
    script: Mutex<VecDeque<Scripted>>,
    subscribers: Arc<Mutex<HashMap<u64, Arc<dyn Fn(&SequencedEvent) + Send + Sync>>>>,
    next_id: AtomicU64,
    seq: AtomicU64,
}

impl ScriptedAdapter {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            seq: AtomicU64::new(0),
        })
    }

    fn emit(&self, event: AgentEvent) {
        let sequenced = SequencedEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            event,
        };
        let subscribers: Vec<_> = self.subscribers.lock().values().cloned().collect();
        for subscriber in subscribers {
            subscriber(&sequenced);
        }
    }
}

#[async_trait]
impl AgentAdapter for ScriptedAdapter {
    async fn send(&self, _input: AgentInput, options: SendOptions) -> CoreResult<SendResult> {
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(Scripted::Fail("脚本耗尽".into()));

        match step {
            Scripted::Ok { events, response } => {
                for event in events {
                    self.emit(event);
                    tokio::task::yield_now().await;
                }
                Ok(SendResult {
                    response,
                    usage: None,
                    agent_id: Some("mock-thread".into()),
                })
            }
            Scripted::Fail(message) => Err(CoreError::AdapterFailure(message)),
            Scripted::Hang => {
                let cancel = options.cancel.unwrap_or_default();
                cancel.cancelled().await;
                Err(CoreError::Cancelled)
            }
        }
    }

    fn on_event(
        &self,
        subscriber: Arc<dyn Fn(&SequencedEvent) + Send + Sync>,
    ) -> ads_core::agent::adapter::SubscriptionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, subscriber);
        ads_core::agent::adapter::SubscriptionGuard::for_map(id, Arc::clone(&self.subscribers))
    }

    fn status(&self) -> AdapterStatus {
        AdapterStatus {
            ready: true,
            streaming: false,
        }
    }

    fn reset(&self) {}

    fn streaming_config(&self) -> StreamingConfig {
        StreamingConfig::default()
    }
}

fn plan_reply(titles: &[&str]) -> String {
    let steps: Vec<serde_json::Value> = titles
        .iter()
        .map(|t| serde_json::json!({"title": t}))
        .collect();
    serde_json::to_string(&steps).unwrap()
}

fn planner_ok(titles: &[&str]) -> Scripted {
    Scripted::Ok {
        events: vec![],
        response: plan_reply(titles),
    }
}

fn exec_ok(text: &str) -> Scripted {
    Scripted::Ok {
        events: vec![
            AgentEvent::Responding {
                delta: text.to_string(),
            },
            AgentEvent::Completed {
                text: text.to_string(),
            },
        ],
        response: text.to_string(),
    }
}

struct TestHarness {
    context: Arc<WorkspaceContext>,
    events: Arc<Mutex<Vec<QueueEvent>>>,
    _subscription: ads_core::workspace::Subscription,
    _temp: TempDir,
}

async fn harness(planner: Vec<Scripted>, executor: Vec<Scripted>) -> TestHarness {
    let _ = tracing_subscriber::fmt::try_init();
    let temp = TempDir::new().unwrap();
    let context = WorkspaceContext::open_with_adapters(
        temp.path(),
        WorkspaceOptions::default(),
        ScriptedAdapter::new(executor),
        ScriptedAdapter::new(planner),
    )
    .await
    .unwrap();

    let events: Arc<Mutex<Vec<QueueEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let subscription = context.subscribe(
        "session-1",
        Arc::new(move |envelope| {
            sink_events.lock().push(envelope.event.clone());
        }),
    );

    TestHarness {
        context,
        events,
        _subscription: subscription,
        _temp: temp,
    }
}

async fn wait_for_status(
    context: &WorkspaceContext,
    task_id: &str,
    status: TaskStatus,
) -> ads_core::storage::repositories::Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(task) = context.get_task(task_id).await.unwrap() {
            if task.status == status {
                return task;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "等待任务状态 {:?} 超时",
            status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// 等订阅者看到指定事件（状态落库先于事件发布，直接读状态会竞争）
async fn wait_for_event(events: &Mutex<Vec<QueueEvent>>, task_id: &str, kind: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if events
            .lock()
            .iter()
            .any(|e| e.kind() == kind && e.task_id() == Some(task_id))
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "等待事件 {} 超时",
            kind
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn lifecycle_kinds(events: &[QueueEvent], task_id: &str) -> Vec<&'static str> {
    events
        .iter()
        .filter(|e| e.task_id() == Some(task_id))
        .map(|e| e.kind())
        .filter(|k| !matches!(*k, "task:updated" | "message" | "message:delta"))
        .collect()
}

#[tokio::test]
async fn test_happy_path_end_to_end() {
    let h = harness(
        vec![planner_ok(&["Draft script", "Explain"])],
        vec![exec_ok("print('hello')"), exec_ok("Explanation text")],
    )
    .await;

    let task = h
        .context
        .create_task(
            CreateTaskInput {
                prompt: "write hello world in python".into(),
                ..Default::default()
            },
            CreateTaskOptions::default(),
        )
        .await
        .unwrap();

    let done = wait_for_status(&h.context, &task.id, TaskStatus::Completed).await;
    wait_for_event(&h.events, &task.id, "task:completed").await;
    assert_eq!(done.result.as_deref(), Some("Explanation text"));
    assert!(done.completed_at.is_some());
    assert!(done.archived_at.is_some());
    assert_eq!(done.retry_count, 0);

    // 两个步骤都完成
    let steps = h
        .context
        .task_store()
        .plan_steps()
        .list_steps(&task.id)
        .await
        .unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));

    // 摘要上下文
    let contexts = h
        .context
        .task_store()
        .messages()
        .list_task_contexts(&task.id)
        .await
        .unwrap();
    let summary: Vec<_> = contexts.iter().filter(|c| c.context_type == "summary").collect();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].content, "Explanation text");

    // 会话里有任务完成摘要
    let conv_messages = h
        .context
        .task_store()
        .conversations()
        .list_messages(&task.thread_id, None)
        .await
        .unwrap();
    assert!(conv_messages
        .iter()
        .any(|m| m.content.starts_with("[任务完成摘要]")));

    // 事件顺序
    let events = h.events.lock();
    assert_eq!(
        lifecycle_kinds(&events, &task.id),
        vec![
            "task:started",
            "task:planned",
            "task:running",
            "step:started",
            "step:completed",
            "step:started",
            "step:completed",
            "task:completed",
        ]
    );
}

#[tokio::test]
async fn test_planner_failure_retries_then_succeeds() {
    let h = harness(
        vec![
            Scripted::Fail("exit 2".into()),
            Scripted::Fail("exit 2".into()),
            planner_ok(&["Only step"]),
        ],
        vec![exec_ok("done")],
    )
    .await;

    let task = h
        .context
        .create_task(
            CreateTaskInput {
                prompt: "retry me".into(),
                max_retries: Some(1),
                ..Default::default()
            },
            CreateTaskOptions::default(),
        )
        .await
        .unwrap();

    let done = wait_for_status(&h.context, &task.id, TaskStatus::Completed).await;
    wait_for_event(&h.events, &task.id, "task:completed").await;
    // 第二次尝试成功：retry_count = 1
    assert_eq!(done.retry_count, 1);

    let events = h.events.lock();
    let kinds = lifecycle_kinds(&events, &task.id);
    assert_eq!(
        kinds,
        vec![
            "task:started",
            "task:failed",
            "task:started",
            "task:planned",
            "task:running",
            "step:started",
            "step:completed",
            "task:completed",
        ]
    );

    // 第一次 task:failed 的快照状态是 pending（还有预算）
    let failed_event = events
        .iter()
        .find(|e| e.kind() == "task:failed")
        .cloned()
        .unwrap();
    match failed_event {
        QueueEvent::TaskFailed { task, .. } => assert_eq!(task.status, TaskStatus::Pending),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_retry_exhaustion_ends_failed() {
    // 规划连续失败：尝试 1 + 重试 1，之后预算耗尽
    let h = harness(
        vec![
            Scripted::Fail("boom".into()),
            Scripted::Fail("boom".into()),
            Scripted::Fail("boom".into()),
            Scripted::Fail("boom".into()),
        ],
        vec![],
    )
    .await;

    let task = h
        .context
        .create_task(
            CreateTaskInput {
                prompt: "always fails".into(),
                max_retries: Some(1),
                ..Default::default()
            },
            CreateTaskOptions::default(),
        )
        .await
        .unwrap();

    let failed = wait_for_status(&h.context, &task.id, TaskStatus::Failed).await;
    // 预算耗尽：retry_count == max_retries
    assert_eq!(failed.retry_count, 1);
    assert!(failed.last_error.is_some());
    assert!(failed.completed_at.is_some());

    let contexts = h
        .context
        .task_store()
        .messages()
        .list_task_contexts(&task.id)
        .await
        .unwrap();
    assert!(contexts.iter().any(|c| c.content.starts_with("[失败]")));
}

#[tokio::test]
async fn test_cancel_mid_step() {
    let h = harness(
        vec![planner_ok(&["长步骤"])],
        vec![Scripted::Hang],
    )
    .await;

    let task = h
        .context
        .create_task(
            CreateTaskInput {
                prompt: "cancel me".into(),
                ..Default::default()
            },
            CreateTaskOptions::default(),
        )
        .await
        .unwrap();

    // 等第一步启动
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if h.events
            .lock()
            .iter()
            .any(|e| e.kind() == "step:started" && e.task_id() == Some(task.id.as_str()))
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "等待 step:started 超时");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    h.context.cancel_task(&task.id).await.unwrap();
    wait_for_event(&h.events, &task.id, "task:cancelled").await;
    let cancelled = wait_for_status(&h.context, &task.id, TaskStatus::Cancelled).await;
    assert!(cancelled.completed_at.is_some());
    assert!(cancelled.result.is_none());

    // 步骤不是 completed
    let steps = h
        .context
        .task_store()
        .plan_steps()
        .list_steps(&task.id)
        .await
        .unwrap();
    assert!(steps
        .iter()
        .all(|s| matches!(s.status, StepStatus::Failed | StepStatus::Running)));

    // 取消标记
    let contexts = h
        .context
        .task_store()
        .messages()
        .list_task_contexts(&task.id)
        .await
        .unwrap();
    assert!(contexts.iter().any(|c| c.content == "[已取消]"));

    // 订阅者看到 task:cancelled 且没有 task:completed
    let events = h.events.lock();
    assert!(events
        .iter()
        .any(|e| e.kind() == "task:cancelled" && e.task_id() == Some(task.id.as_str())));
    assert!(!events
        .iter()
        .any(|e| e.kind() == "task:completed" && e.task_id() == Some(task.id.as_str())));
}

#[tokio::test]
async fn test_message_delta_events_in_step_order() {
    let h = harness(
        vec![planner_ok(&["流式步骤"])],
        vec![Scripted::Ok {
            events: vec![
                AgentEvent::Responding {
                    delta: "he".into(),
                },
                AgentEvent::Responding {
                    delta: "hello".into(),
                },
                AgentEvent::Completed {
                    text: "hello".into(),
                },
            ],
            response: "hello".into(),
        }],
    )
    .await;

    let task = h
        .context
        .create_task(
            CreateTaskInput {
                prompt: "stream".into(),
                ..Default::default()
            },
            CreateTaskOptions::default(),
        )
        .await
        .unwrap();

    wait_for_status(&h.context, &task.id, TaskStatus::Completed).await;

    let events = h.events.lock();
    let deltas: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            QueueEvent::MessageDelta { task: t, delta, .. } if t.id == task.id => {
                Some(delta.clone())
            }
            _ => None,
        })
        .collect();
    // 累积文本被差分成增量
    assert_eq!(deltas.concat(), "hello");
    assert!(deltas.len() >= 2);
}

#[tokio::test]
async fn test_pause_holds_pending_tasks() {
    let h = harness(vec![planner_ok(&["步骤"])], vec![exec_ok("ok")]).await;

    h.context.pause_queue(Some("maintenance".into()));
    let task = h
        .context
        .create_task(
            CreateTaskInput {
                prompt: "held".into(),
                ..Default::default()
            },
            CreateTaskOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let held = h.context.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(held.status, TaskStatus::Pending);

    h.context.resume_queue();
    wait_for_status(&h.context, &task.id, TaskStatus::Completed).await;

    let events = h.events.lock();
    assert!(events.iter().any(|e| e.kind() == "queue:paused"));
    assert!(events.iter().any(|e| e.kind() == "queue:resumed"));
}

#[tokio::test]
async fn test_queued_task_promoted_in_all_mode() {
    let h = harness(vec![planner_ok(&["步骤"])], vec![exec_ok("ok")]).await;

    let task = h
        .context
        .create_task(
            CreateTaskInput {
                prompt: "queued first".into(),
                ..Default::default()
            },
            CreateTaskOptions {
                status: Some(TaskStatus::Queued),
                queued_at: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Queued);

    wait_for_status(&h.context, &task.id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn test_event_replay_after_reconnect() {
    let h = harness(vec![planner_ok(&["步骤"])], vec![exec_ok("ok")]).await;

    let task = h
        .context
        .create_task(
            CreateTaskInput {
                prompt: "replay".into(),
                ..Default::default()
            },
            CreateTaskOptions::default(),
        )
        .await
        .unwrap();
    wait_for_status(&h.context, &task.id, TaskStatus::Completed).await;

    // 重连回放：序号严格递增
    let replayed = h.context.replay_events("session-1", 0);
    assert!(!replayed.is_empty());
    let seqs: Vec<u64> = replayed.iter().map(|e| e.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(seqs, sorted);
}
