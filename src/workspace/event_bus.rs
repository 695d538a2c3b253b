/*!
 * 事件总线
 *
 * 按会话 id 扇出生命周期事件。每个会话维护一个有界的最近事件环，
 * 重连时可按序号回放（至少一次投递；去重靠信封上的单调序号）。
 * 对单个 sink 的投递顺序与发布顺序一致。
 */

use crate::queue::events::QueueEventEnvelope;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// 每会话保留的最近事件数
pub const REPLAY_BUFFER_SIZE: usize = 256;

/// 事件接收器
pub type EventSink = Arc<dyn Fn(&QueueEventEnvelope) + Send + Sync>;

struct SessionState {
    /// (订阅令牌, sink)；重订阅替换令牌，旧句柄的 drop 不再生效
    sink: Option<(u64, EventSink)>,
    recent: VecDeque<QueueEventEnvelope>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            sink: None,
            recent: VecDeque::with_capacity(REPLAY_BUFFER_SIZE),
        }
    }

    fn push(&mut self, envelope: &QueueEventEnvelope) {
        if self.recent.len() >= REPLAY_BUFFER_SIZE {
            self.recent.pop_front();
        }
        self.recent.push_back(envelope.clone());
    }
}

/// 会话级事件总线
pub struct EventBus {
    sessions: DashMap<String, SessionState>,
    next_token: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// 订阅：为会话挂上 sink，返回退订句柄
    ///
    /// 同一会话重复订阅会替换旧 sink；最近事件环保留，供重连回放。
    pub fn subscribe(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        sink: EventSink,
    ) -> Subscription {
        let session_id = session_id.into();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(SessionState::new)
            .sink = Some((token, sink));
        debug!(session = %session_id, "事件订阅建立");
        Subscription {
            bus: Arc::clone(self),
            session_id,
            token,
        }
    }

    /// 发布事件给所有会话，按发布顺序投递
    pub fn publish(&self, envelope: &QueueEventEnvelope) {
        for mut entry in self.sessions.iter_mut() {
            entry.push(envelope);
            if let Some((_, sink)) = entry.sink.clone() {
                sink(envelope);
            }
        }
    }

    /// 回放会话中序号大于 after_seq 的事件
    pub fn replay_since(&self, session_id: &str, after_seq: u64) -> Vec<QueueEventEnvelope> {
        self.sessions
            .get(session_id)
            .map(|state| {
                state
                    .recent
                    .iter()
                    .filter(|e| e.seq > after_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 移除会话（断开且不再回放时）
    pub fn drop_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    fn detach_sink(&self, session_id: &str, token: u64) {
        if let Some(mut state) = self.sessions.get_mut(session_id) {
            if matches!(state.sink, Some((t, _)) if t == token) {
                state.sink = None;
            }
        }
    }

    /// 当前挂着 sink 的会话数
    pub fn subscriber_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.sink.is_some())
            .count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// 订阅句柄：drop 时摘掉自己的 sink（事件环保留）
pub struct Subscription {
    bus: Arc<EventBus>,
    session_id: String,
    token: u64,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.detach_sink(&self.session_id, self.token);
    }
}
