/*!
 * 规范化 Agent 事件词汇表
 *
 * vendor 流解析后统一落到这组带标签的变体上；只存在于内存，
 * 从不落库。responding 的载荷是到当前为止的全量文本（累积增量）。
 */

use serde::{Deserialize, Serialize};

/// token 用量
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

impl TokenUsage {
    /// 从 vendor 的 usage 对象尽力提取
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        let get = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| obj.get(*k).and_then(|v| v.as_i64()))
        };
        let usage = Self {
            input_tokens: get(&["input_tokens", "inputTokens", "prompt_tokens"]),
            output_tokens: get(&["output_tokens", "outputTokens", "completion_tokens"]),
            total_tokens: get(&["total_tokens", "totalTokens"]),
        };
        if usage.input_tokens.is_none()
            && usage.output_tokens.is_none()
            && usage.total_tokens.is_none()
        {
            None
        } else {
            Some(usage)
        }
    }
}

/// Agent 事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 进程/会话启动
    Boot,
    /// 思考过程增量
    Analysis { delta: String },
    /// 助手文本（累积增量：delta 是到当前为止的全量文本）
    Responding { delta: String },
    /// 命令类动作；detail 形如 "<命令> | <说明>"
    Command { title: String, detail: String },
    /// 文件编辑类动作
    Editing { title: String, item: String },
    /// 最终回复
    Completed { text: String },
    /// 流内错误
    Error { message: String },
    /// 会话线程建立
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "turn.completed")]
    TurnCompleted { usage: Option<TokenUsage> },
    #[serde(rename = "turn.failed")]
    TurnFailed { message: String },
}

impl AgentEvent {
    /// 该事件是否意味着本轮终止
    pub fn is_turn_terminal(&self) -> bool {
        matches!(self, Self::TurnCompleted { .. } | Self::TurnFailed { .. })
    }
}

/// 运行内带单调序号的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: AgentEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tags() {
        let event = AgentEvent::ThreadStarted {
            thread_id: "T-1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "thread.started");
        assert_eq!(json["thread_id"], "T-1");

        let event = AgentEvent::Responding {
            delta: "hello".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "responding");
    }

    #[test]
    fn test_usage_extraction() {
        let value = serde_json::json!({"input_tokens": 10, "output_tokens": 20});
        let usage = TokenUsage::from_value(&value).unwrap();
        assert_eq!(usage.input_tokens, Some(10));
        assert_eq!(usage.output_tokens, Some(20));
        assert_eq!(usage.total_tokens, None);

        assert!(TokenUsage::from_value(&serde_json::json!({})).is_none());
        assert!(TokenUsage::from_value(&serde_json::json!("usage")).is_none());
    }

    #[test]
    fn test_turn_terminal() {
        assert!(AgentEvent::TurnCompleted { usage: None }.is_turn_terminal());
        assert!(AgentEvent::TurnFailed {
            message: "x".into()
        }
        .is_turn_terminal());
        assert!(!AgentEvent::Boot.is_turn_terminal());
    }
}
