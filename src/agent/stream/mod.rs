/*!
 * vendor 事件流解析
 *
 * 每个 vendor 一个解析器，共用工具分类规则、字段候选表与累积状态。
 * 解析器是从任意 JSON 到事件列表的全函数：字段类型不对就退化为
 * 空输出或尽力而为的通用 tool_call，绝不报错。
 */

pub mod amp;
pub mod droid;
pub mod gemini;

use crate::agent::events::AgentEvent;
use serde_json::Value;
use std::collections::HashMap;

/// 工具调用分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Command,
    FileChange,
    WebSearch,
    ToolCall,
}

/// 命令文本候选字段，按优先级排列
pub const COMMAND_FIELDS: &[&str] = &["command", "cmd", "shell_command", "bash", "args"];
/// 文件路径候选字段
pub const PATH_FIELDS: &[&str] = &[
    "path",
    "file_path",
    "filename",
    "file",
    "filePath",
    "target_file",
    "targetPath",
];
/// 搜索词候选字段
pub const QUERY_FIELDS: &[&str] = &["query", "q", "text", "prompt"];

/// vendor 流解析器统一接口
pub trait AgentStreamParser: Send {
    /// 处理一行已解析的 JSON，返回零个或多个规范化事件（按投递顺序）
    fn parse_line(&mut self, payload: &Value) -> Vec<AgentEvent>;

    /// 流内会话/线程 id（首个 init 事件时设置）
    fn session_id(&self) -> Option<&str>;

    /// 最终回复文本（完成事件给出的，或累积的助手文本）
    fn final_message(&self) -> Option<String>;

    /// 最近一次流内错误
    fn last_error(&self) -> Option<&str>;
}

/// 按名称分类工具，名称认不出时回退到 call id
pub fn classify_tool(name: &str, call_id: &str) -> ToolKind {
    classify_name(name).unwrap_or_else(|| classify_name(call_id).unwrap_or(ToolKind::ToolCall))
}

fn classify_name(name: &str) -> Option<ToolKind> {
    let lower = name.to_lowercase();
    if lower == "execute" || lower == "bash" || lower == "shell" {
        return Some(ToolKind::Command);
    }
    if lower.contains("applypatch")
        || lower.contains("apply_patch")
        || lower.contains("edit")
        || lower.contains("create")
    {
        return Some(ToolKind::FileChange);
    }
    if lower.contains("websearch") || lower.contains("web_search") {
        return Some(ToolKind::WebSearch);
    }
    None
}

/// 从参数对象按候选表取第一个非空字符串；字符串数组按空格拼接
pub fn extract_field(params: &Value, candidates: &[&str]) -> Option<String> {
    let obj = params.as_object()?;
    for key in candidates {
        match obj.get(*key) {
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
            Some(Value::Array(items)) => {
                let parts: Vec<&str> = items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect();
                if !parts.is_empty() {
                    return Some(parts.join(" "));
                }
            }
            _ => {}
        }
    }
    None
}

/// 记录中的工具调用
#[derive(Debug, Clone)]
pub struct ToolCallInfo {
    pub tool_name: String,
    pub kind: ToolKind,
    pub parameters: Value,
}

/// 各 vendor 解析器共用的累积状态
#[derive(Default)]
pub struct StreamState {
    session_id: Option<String>,
    /// 助手文本按消息 id 累积，保持插入顺序
    assistant_order: Vec<String>,
    assistant_texts: HashMap<String, String>,
    tool_calls: HashMap<String, ToolCallInfo>,
    last_error: Option<String>,
    final_message: Option<String>,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 首个 init 事件设置会话 id，之后不再变
    pub fn set_session_once(&mut self, id: impl Into<String>) {
        if self.session_id.is_none() {
            self.session_id = Some(id.into());
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// 覆盖指定消息的累积文本，返回渲染后的全量文本
    pub fn update_assistant_text(&mut self, message_id: &str, text: &str) -> String {
        if !self.assistant_texts.contains_key(message_id) {
            self.assistant_order.push(message_id.to_string());
        }
        self.assistant_texts
            .insert(message_id.to_string(), text.to_string());
        self.rendered_text()
    }

    /// 按插入顺序以空行连接所有助手文本
    pub fn rendered_text(&self) -> String {
        self.assistant_order
            .iter()
            .filter_map(|id| self.assistant_texts.get(id))
            .filter(|t| !t.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn record_tool_call(&mut self, call_id: impl Into<String>, info: ToolCallInfo) {
        self.tool_calls.insert(call_id.into(), info);
    }

    pub fn tool_call(&self, call_id: &str) -> Option<&ToolCallInfo> {
        self.tool_calls.get(call_id)
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn set_final_message(&mut self, text: impl Into<String>) {
        self.final_message = Some(text.into());
    }

    /// 完成事件给出的最终文本，否则回退到累积文本
    pub fn final_or_accumulated(&self) -> Option<String> {
        if let Some(text) = &self.final_message {
            if !text.is_empty() {
                return Some(text.clone());
            }
        }
        let rendered = self.rendered_text();
        if rendered.is_empty() {
            None
        } else {
            Some(rendered)
        }
    }
}

/// 命令类工具调用的展示事件
pub(crate) fn command_started_event(state: &StreamState, call_id: &str) -> Option<AgentEvent> {
    let info = state.tool_call(call_id)?;
    match info.kind {
        ToolKind::Command => {
            let cmd = extract_field(&info.parameters, COMMAND_FIELDS)
                .unwrap_or_else(|| info.tool_name.clone());
            Some(AgentEvent::Command {
                title: "执行命令".to_string(),
                detail: format!("{} | 执行中", cmd),
            })
        }
        ToolKind::FileChange => {
            let path = extract_field(&info.parameters, PATH_FIELDS)
                .unwrap_or_else(|| info.tool_name.clone());
            Some(AgentEvent::Editing {
                title: "编辑文件".to_string(),
                item: path,
            })
        }
        ToolKind::WebSearch => {
            let query = extract_field(&info.parameters, QUERY_FIELDS).unwrap_or_default();
            Some(AgentEvent::Command {
                title: "网络搜索".to_string(),
                detail: format!("{} | 搜索中", query),
            })
        }
        ToolKind::ToolCall => Some(AgentEvent::Command {
            title: "调用工具".to_string(),
            detail: format!("{} | 执行中", info.tool_name),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_canonical_names() {
        assert_eq!(classify_tool("Bash", "x"), ToolKind::Command);
        assert_eq!(classify_tool("execute", "x"), ToolKind::Command);
        assert_eq!(classify_tool("shell", "x"), ToolKind::Command);
        assert_eq!(classify_tool("apply_patch", "x"), ToolKind::FileChange);
        assert_eq!(classify_tool("edit_file", "x"), ToolKind::FileChange);
        assert_eq!(classify_tool("create_file", "x"), ToolKind::FileChange);
        assert_eq!(classify_tool("WebSearch", "x"), ToolKind::WebSearch);
        assert_eq!(classify_tool("web_search", "x"), ToolKind::WebSearch);
        assert_eq!(classify_tool("read_file", "x"), ToolKind::ToolCall);
    }

    #[test]
    fn test_classify_falls_back_to_id() {
        assert_eq!(classify_tool("", "bash"), ToolKind::Command);
        assert_eq!(classify_tool("unknown", "call-99"), ToolKind::ToolCall);
    }

    #[test]
    fn test_extract_field_priority() {
        let params = json!({"cmd": "echo hi", "command": "ls -la"});
        assert_eq!(
            extract_field(&params, COMMAND_FIELDS),
            Some("ls -la".to_string())
        );
    }

    #[test]
    fn test_extract_field_skips_empty() {
        let params = json!({"command": "   ", "cmd": "pwd"});
        assert_eq!(extract_field(&params, COMMAND_FIELDS), Some("pwd".to_string()));
    }

    #[test]
    fn test_extract_field_joins_array() {
        let params = json!({"args": ["git", "status", "-s"]});
        assert_eq!(
            extract_field(&params, COMMAND_FIELDS),
            Some("git status -s".to_string())
        );
    }

    #[test]
    fn test_extract_field_non_object() {
        assert_eq!(extract_field(&json!("ls"), COMMAND_FIELDS), None);
        assert_eq!(extract_field(&json!(null), COMMAND_FIELDS), None);
    }

    #[test]
    fn test_state_accumulates_in_insertion_order() {
        let mut state = StreamState::new();
        state.update_assistant_text("m1", "first");
        state.update_assistant_text("m2", "second");
        let full = state.update_assistant_text("m1", "first edited");
        assert_eq!(full, "first edited\n\nsecond");
    }

    #[test]
    fn test_final_or_accumulated() {
        let mut state = StreamState::new();
        assert_eq!(state.final_or_accumulated(), None);
        state.update_assistant_text("m1", "partial");
        assert_eq!(state.final_or_accumulated(), Some("partial".to_string()));
        state.set_final_message("final");
        assert_eq!(state.final_or_accumulated(), Some("final".to_string()));
    }

    #[test]
    fn test_session_set_once() {
        let mut state = StreamState::new();
        state.set_session_once("a");
        state.set_session_once("b");
        assert_eq!(state.session_id(), Some("a"));
    }
}
