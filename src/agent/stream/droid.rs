/*!
 * droid 流解析器
 *
 * droid 以行式 JSON 输出会话事件，形如：
 *   {"type":"system","subtype":"init","session_id":"..."}
 *   {"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"..."},
 *       {"type":"tool_use","id":"t1","name":"Bash","input":{...}}]}}
 *   {"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1",
 *       "content":"...","is_error":false}]}}
 *   {"type":"result","subtype":"success","result":"...","usage":{...}}
 */

use super::{
    classify_tool, command_started_event, extract_field, AgentStreamParser, StreamState,
    ToolCallInfo, ToolKind, COMMAND_FIELDS, PATH_FIELDS, QUERY_FIELDS,
};
use crate::agent::events::{AgentEvent, TokenUsage};
use serde_json::Value;

pub struct DroidStreamParser {
    state: StreamState,
}

impl DroidStreamParser {
    pub fn new() -> Self {
        Self {
            state: StreamState::new(),
        }
    }

    /// droid 专有的工具名补充：write_file 归入文件变更
    fn classify(name: &str, call_id: &str) -> ToolKind {
        if name.eq_ignore_ascii_case("write_file") {
            return ToolKind::FileChange;
        }
        classify_tool(name, call_id)
    }

    fn handle_assistant(&mut self, message: &Value, out: &mut Vec<AgentEvent>) {
        let message_id = message
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("assistant");
        let Some(blocks) = message.get("content").and_then(|v| v.as_array()) else {
            return;
        };

        let mut text_parts: Vec<&str> = Vec::new();
        for block in blocks {
            match block.get("type").and_then(|v| v.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                        text_parts.push(text);
                    }
                }
                Some("thinking") => {
                    if let Some(text) = block.get("thinking").and_then(|v| v.as_str()) {
                        if !text.is_empty() {
                            out.push(AgentEvent::Analysis {
                                delta: text.to_string(),
                            });
                        }
                    }
                }
                Some("tool_use") => {
                    let call_id = block.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                    let name = block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    let parameters = block.get("input").cloned().unwrap_or(Value::Null);
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
                _ => {}
            }
        }

        let joined = text_parts.join("");
        if !joined.is_empty() {
            let full = self.state.update_assistant_text(message_id, &joined);
            out.push(AgentEvent::Responding { delta: full });
        }
    }

    fn handle_tool_result(&mut self, block: &Value, out: &mut Vec<AgentEvent>) {
        let call_id = block
            .get("tool_use_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let is_error = block
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if is_error {
            let message = block
                .get("content")
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
                    if is_error { "失败" } else { "完成" }
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

impl Default for DroidStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentStreamParser for DroidStreamParser {
    fn parse_line(&mut self, payload: &Value) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        match payload.get("type").and_then(|v| v.as_str()) {
            Some("system") => {
                if payload.get("subtype").and_then(|v| v.as_str()) == Some("init") {
                    if let Some(session) = payload.get("session_id").and_then(|v| v.as_str()) {
                        self.state.set_session_once(session);
                        out.push(AgentEvent::ThreadStarted {
                            thread_id: session.to_string(),
                        });
                    }
                    out.push(AgentEvent::TurnStarted);
                } else {
                    // 其他 system 行（进程自检等）归为 boot
                    out.push(AgentEvent::Boot);
                }
            }
            Some("assistant") => {
                if let Some(message) = payload.get("message") {
                    self.handle_assistant(message, &mut out);
                }
            }
            Some("user") => {
                if let Some(blocks) = payload
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|v| v.as_array())
                {
                    for block in blocks {
                        if block.get("type").and_then(|v| v.as_str()) == Some("tool_result") {
                            self.handle_tool_result(block, &mut out);
                        }
                    }
                }
            }
            Some("result") => {
                let subtype = payload
                    .get("subtype")
                    .and_then(|v| v.as_str())
                    .unwrap_or("success");
                if subtype == "success" {
                    if let Some(result) = payload.get("result").and_then(|v| v.as_str()) {
                        self.state.set_final_message(result);
                    }
                    let text = self.state.final_or_accumulated().unwrap_or_default();
                    out.push(AgentEvent::Completed { text });
                    out.push(AgentEvent::TurnCompleted {
                        usage: payload.get("usage").and_then(TokenUsage::from_value),
                    });
                } else {
                    let message = payload
                        .get("error")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("droid 执行失败: {}", subtype));
                    self.state.set_error(&message);
                    out.push(AgentEvent::TurnFailed { message });
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
