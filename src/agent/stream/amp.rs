/*!
 * amp 流解析器
 *
 * amp 以线程为中心：
 *   {"type":"initialized","threadId":"T-123"}
 *   {"type":"assistant","id":"m1","text":"..."}
 *   {"type":"tool-start","tool":{"id":"c1","name":"Bash","input":{...}}}
 *   {"type":"tool-finish","id":"c1","error":"..."}
 *   {"type":"done","text":"...","usage":{...}}
 *   {"type":"done","error":"..."}
 */

use super::{
    classify_tool, command_started_event, extract_field, AgentStreamParser, StreamState,
    ToolCallInfo, ToolKind, COMMAND_FIELDS, PATH_FIELDS, QUERY_FIELDS,
};
use crate::agent::events::{AgentEvent, TokenUsage};
use serde_json::Value;

pub struct AmpStreamParser {
    state: StreamState,
}

impl AmpStreamParser {
    pub fn new() -> Self {
        Self {
            state: StreamState::new(),
        }
    }

    /// amp 专有的工具名补充：search_web 归入网络搜索
    fn classify(name: &str, call_id: &str) -> ToolKind {
        if name.eq_ignore_ascii_case("search_web") {
            return ToolKind::WebSearch;
        }
        classify_tool(name, call_id)
    }
}

impl Default for AmpStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentStreamParser for AmpStreamParser {
    fn parse_line(&mut self, payload: &Value) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        match payload.get("type").and_then(|v| v.as_str()) {
            Some("initialized") => {
                if let Some(thread) = payload.get("threadId").and_then(|v| v.as_str()) {
                    self.state.set_session_once(thread);
                    out.push(AgentEvent::ThreadStarted {
                        thread_id: thread.to_string(),
                    });
                }
                out.push(AgentEvent::TurnStarted);
            }
            Some("assistant") => {
                let message_id = payload
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("assistant");
                if let Some(text) = payload.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        let full = self.state.update_assistant_text(message_id, text);
                        out.push(AgentEvent::Responding { delta: full });
                    }
                }
            }
            Some("thinking") => {
                if let Some(text) = payload.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        out.push(AgentEvent::Analysis {
                            delta: text.to_string(),
                        });
                    }
                }
            }
            Some("tool-start") => {
                if let Some(tool) = payload.get("tool") {
                    let call_id = tool.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                    let name = tool.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                    let parameters = tool.get("input").cloned().unwrap_or(Value::Null);
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
            Some("tool-finish") => {
                let call_id = payload.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                let error = payload.get("error").and_then(|v| v.as_str());
                if let Some(message) = error {
                    self.state.set_error(message);
                }
                if let Some(info) = self.state.tool_call(call_id) {
                    let event = match info.kind {
                        ToolKind::Command => AgentEvent::Command {
                            title: "命令完成".to_string(),
                            detail: format!(
                                "{} | {}",
                                extract_field(&info.parameters, COMMAND_FIELDS)
                                    .unwrap_or_else(|| info.tool_name.clone()),
                                if error.is_some() { "失败" } else { "完成" }
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
            Some("done") => {
                if let Some(message) = payload.get("error").and_then(|v| v.as_str()) {
                    self.state.set_error(message);
                    out.push(AgentEvent::TurnFailed {
                        message: message.to_string(),
                    });
                } else {
                    if let Some(text) = payload.get("text").and_then(|v| v.as_str()) {
                        self.state.set_final_message(text);
                    }
                    let text = self.state.final_or_accumulated().unwrap_or_default();
                    out.push(AgentEvent::Completed { text });
                    out.push(AgentEvent::TurnCompleted {
                        usage: payload.get("usage").and_then(TokenUsage::from_value),
                    });
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
