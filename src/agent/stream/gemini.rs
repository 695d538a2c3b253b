/*!
 * gemini 流解析器
 *
 * gemini 的行式 JSON 事件更扁平：
 *   {"type":"init","session_id":"..."}
 *   {"type":"message","role":"assistant","id":"m1","content":"..."}
 *   {"type":"thought","text":"..."}
 *   {"type":"tool_call","tool_call":{"id":"c1","name":"run_shell_command","args":{...}}}
 *   {"type":"tool_result","id":"c1","status":"success","output":"..."}
 *   {"type":"result","text":"...","stats":{"tokens":{...}}}
 */

use super::{
    classify_tool, command_started_event, extract_field, AgentStreamParser, StreamState,
    ToolCallInfo, ToolKind, COMMAND_FIELDS, PATH_FIELDS, QUERY_FIELDS,
};
use crate::agent::events::{AgentEvent, TokenUsage};
use serde_json::Value;

pub struct GeminiStreamParser {
    state: StreamState,
}

impl GeminiStreamParser {
    pub fn new() -> Self {
        Self {
            state: StreamState::new(),
        }
    }

    /// gemini 专有的工具名补充
    fn classify(name: &str, call_id: &str) -> ToolKind {
        match name {
            "run_shell_command" => ToolKind::Command,
            "google_web_search" => ToolKind::WebSearch,
            _ => classify_tool(name, call_id),
        }
    }

    fn handle_tool_result(&mut self, payload: &Value, out: &mut Vec<AgentEvent>) {
        let call_id = payload.get("id").and_then(|v| v.as_str()).unwrap_or_default();
        let failed = payload.get("status").and_then(|v| v.as_str()) == Some("error");
        if failed {
            let message = payload
                .get("output")
                .and_then(|v| v.as_str())
                .unwrap_or("tool failed");
            self.state.set_error(message);
        }

        let Some(info) = self.state.tool_call(call_id) else {
            return;
        };
        let event = match info.kind {
            ToolKind::Command => AgentEvent::Command {
                title: "命令完成".to_string(),
                detail: format!(
                    "{} | {}",
                    extract_field(&info.parameters, COMMAND_FIELDS)
                        .unwrap_or_else(|| info.tool_name.clone()),
                    if failed { "失败" } else { "完成" }
                ),
            },
            ToolKind::FileChange => AgentEvent::Editing {
                title: "编辑完成".to_string(),
                item: extract_field(&info.parameters, PATH_FIELDS)
                    .unwrap_or_else(|| info.tool_name.clone()),
            },
            ToolKind::WebSearch => AgentEvent::Command {
                title: "网络搜索".to_string(),
                detail: format!(
                    "{} | 完成",
                    extract_field(&info.parameters, QUERY_FIELDS).unwrap_or_default()
                ),
            },
            ToolKind::ToolCall => AgentEvent::Command {
                title: "调用工具".to_string(),
                detail: format!("{} | 完成", info.tool_name),
            },
        };
        out.push(event);
    }
}

impl Default for GeminiStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentStreamParser for GeminiStreamParser {
    fn parse_line(&mut self, payload: &Value) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        match payload.get("type").and_then(|v| v.as_str()) {
            Some("init") => {
                let session = payload
                    .get("session_id")
                    .or_else(|| payload.get("sessionId"))
                    .and_then(|v| v.as_str());
                if let Some(session) = session {
                    self.state.set_session_once(session);
                    out.push(AgentEvent::ThreadStarted {
                        thread_id: session.to_string(),
                    });
                }
                out.push(AgentEvent::TurnStarted);
            }
            Some("message") => {
                if payload.get("role").and_then(|v| v.as_str()) == Some("assistant") {
                    let message_id = payload
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("assistant");
                    if let Some(content) = payload.get("content").and_then(|v| v.as_str()) {
                        if !content.is_empty() {
                            let full = self.state.update_assistant_text(message_id, content);
                            out.push(AgentEvent::Responding { delta: full });
                        }
                    }
                }
            }
            Some("thought") => {
                if let Some(text) = payload.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        out.push(AgentEvent::Analysis {
                            delta: text.to_string(),
                        });
                    }
                }
            }
            Some("tool_call") => {
                if let Some(call) = payload.get("tool_call") {
                    let call_id = call.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                    let name = call.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                    let parameters = call.get("args").cloned().unwrap_or(Value::Null);
                    self.state.record_tool_call(
                        call_id,
                        ToolCallInfo {
                            tool_name: name.to_string(),
                            kind: Self::classify(name, call_id),
                            parameters,
                        },
                    );
                    if let Some(event) = command_started_event(&self.state, call_id) {
                        out.push(event);
                    }
                }
            }
            Some("tool_result") => {
                self.handle_tool_result(payload, &mut out);
            }
            Some("result") => {
                let failed = payload.get("status").and_then(|v| v.as_str()) == Some("error");
                if failed {
                    let message = payload
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("gemini 执行失败")
                        .to_string();
                    self.state.set_error(&message);
                    out.push(AgentEvent::TurnFailed { message });
                } else {
                    if let Some(text) = payload.get("text").and_then(|v| v.as_str()) {
                        self.state.set_final_message(text);
                    }
                    let text = self.state.final_or_accumulated().unwrap_or_default();
                    out.push(AgentEvent::Completed { text });
                    let usage = payload
                        .get("stats")
                        .and_then(|s| s.get("tokens"))
                        .and_then(TokenUsage::from_value);
                    out.push(AgentEvent::TurnCompleted { usage });
                }
            }
            Some("error") => {
                let message = payload
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error");
                self.state.set_error(message);
                out.push(AgentEvent::Error {
                    message: message.to_string(),
                });
            }
            _ => {}
        }
        out
    }

    fn session_id(&self) -> Option<&str> {
        self.state.session_id()
    }

    fn final_message(&self) -> Option<String> {
        self.state.final_or_accumulated()
    }

    fn last_error(&self) -> Option<&str> {
        self.state.last_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_shell_command_is_command() {
        let mut parser = GeminiStreamParser::new();
        let events = parser.parse_line(&json!({
            "type": "tool_call",
            "tool_call": {"id": "c1", "name": "run_shell_command", "args": {"command": "ls"}}
        }));
        assert_eq!(
            events,
            vec![AgentEvent::Command {
                title: "执行命令".to_string(),
                detail: "ls | 执行中".to_string()
            }]
        );
    }

    #[test]
    fn test_google_web_search_is_web_search() {
        let mut parser = GeminiStreamParser::new();
        let events = parser.parse_line(&json!({
            "type": "tool_call",
            "tool_call": {"id": "c1", "name": "google_web_search", "args": {"query": "rust sqlx"}}
        }));
        assert_eq!(
            events,
            vec![AgentEvent::Command {
                title: "网络搜索".to_string(),
                detail: "rust sqlx | 搜索中".to_string()
            }]
        );
    }

    #[test]
    fn test_cumulative_message_updates() {
        let mut parser = GeminiStreamParser::new();
        parser.parse_line(&json!({"type": "message", "role": "assistant", "id": "m1", "content": "he"}));
        let events = parser
            .parse_line(&json!({"type": "message", "role": "assistant", "id": "m1", "content": "hello"}));
        assert_eq!(
            events,
            vec![AgentEvent::Responding {
                delta: "hello".to_string()
            }]
        );
    }

    #[test]
    fn test_result_with_stats() {
        let mut parser = GeminiStreamParser::new();
        let events = parser.parse_line(&json!({
            "type": "result", "text": "答案",
            "stats": {"tokens": {"prompt_tokens": 3, "completion_tokens": 4}}
        }));
        assert_eq!(events.len(), 2);
        match &events[1] {
            AgentEvent::TurnCompleted { usage: Some(usage) } => {
                assert_eq!(usage.input_tokens, Some(3));
                assert_eq!(usage.output_tokens, Some(4));
            }
            other => panic!("期望 turn.completed，得到 {:?}", other),
        }
    }

    #[test]
    fn test_error_result_turn_failed() {
        let mut parser = GeminiStreamParser::new();
        let events = parser.parse_line(&json!({
            "type": "result", "status": "error", "message": "quota exceeded"
        }));
        assert_eq!(
            events,
            vec![AgentEvent::TurnFailed {
                message: "quota exceeded".to_string()
            }]
        );
        assert_eq!(parser.last_error(), Some("quota exceeded"));
    }

    #[test]
    fn test_ignores_non_assistant_messages() {
        let mut parser = GeminiStreamParser::new();
        let events =
            parser.parse_line(&json!({"type": "message", "role": "user", "content": "hi"}));
        assert!(events.is_empty());
    }
}
