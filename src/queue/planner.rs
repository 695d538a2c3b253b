/*!
 * 任务规划器
 *
 * 以规划模式调用 agent（非流式），把任务提示词变成有序步骤列表。
 * 回复中的 JSON 提取对围栏代码块和前后废话保持宽容；schema 校验
 * 失败后用纠正提示词重试一次，第二次失败对任务是致命的。
 */

use crate::agent::adapter::{AgentAdapter, AgentInput, SendOptions};
use crate::config::DEFAULT_PLANNER_TIMEOUT;
use crate::error::{CoreError, CoreResult};
use crate::storage::repositories::{PlanStepInput, Task};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 单个任务允许的最大步骤数
const MAX_PLAN_STEPS: usize = 32;

/// 任务规划器
pub struct TaskPlanner {
    adapter: Arc<dyn AgentAdapter>,
    timeout: Duration,
}

impl TaskPlanner {
    pub fn new(adapter: Arc<dyn AgentAdapter>) -> Self {
        Self {
            adapter,
            timeout: DEFAULT_PLANNER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 生成 1..N 编号的计划
    pub async fn generate_plan(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<PlanStepInput>> {
        let prompt = build_planner_prompt(task);
        let options = SendOptions {
            model: task.model.clone(),
            cancel: Some(cancel.clone()),
            timeout: Some(self.timeout),
        };

        let reply = self
            .adapter
            .send(AgentInput::Text(prompt.clone()), options.clone())
            .await?;

        match parse_plan_reply(&reply.response) {
            Ok(steps) => Ok(steps),
            Err(first_err) => {
                warn!(task_id = %task.id, "规划输出无效，纠正后重试: {}", first_err);
                let corrective = format!(
                    "{}\n\n上一次输出无法解析为计划。只返回 JSON 数组本身，\
                     不要代码围栏，不要任何解释文字。",
                    prompt
                );
                let retry = self
                    .adapter
                    .send(AgentInput::Text(corrective), options)
                    .await?;
                parse_plan_reply(&retry.response).map_err(|e| {
                    CoreError::adapter(format!("规划两次均无法解析: {}", e))
                })
            }
        }
    }
}

/// 规划提示词：任务内容 + 期望回复的结构描述
fn build_planner_prompt(task: &Task) -> String {
    format!(
        "你是任务规划器。把下面的任务拆解成按顺序执行的步骤，\
         每一步要小到一次 agent 调用能完成。\n\n\
         ## 任务\n{}\n\n{}\n\n\
         ## 输出格式\n\
         返回一个 JSON 数组，每个元素是 {{\"title\": \"步骤标题\", \"description\": \"可选的补充说明\"}}。\n\
         数组不能为空，至多 {} 步。除 JSON 外不要输出任何内容。",
        task.title,
        task.prompt.trim(),
        MAX_PLAN_STEPS
    )
}

/// 从回复中提取并校验计划
fn parse_plan_reply(reply: &str) -> CoreResult<Vec<PlanStepInput>> {
    let payload = extract_json_payload(reply)
        .ok_or_else(|| CoreError::validation("回复中没有 JSON 数组"))?;

    let raw: Vec<serde_json::Value> = serde_json::from_str(&payload)
        .map_err(|e| CoreError::validation(format!("计划 JSON 解析失败: {}", e)))?;

    if raw.is_empty() {
        return Err(CoreError::validation("计划不能为空"));
    }
    if raw.len() > MAX_PLAN_STEPS {
        return Err(CoreError::validation(format!(
            "计划步骤过多: {} > {}",
            raw.len(),
            MAX_PLAN_STEPS
        )));
    }

    let mut steps = Vec::with_capacity(raw.len());
    for (i, item) in raw.iter().enumerate() {
        let title = item
            .get("title")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                CoreError::validation(format!("第 {} 步缺少 title 字段", i + 1))
            })?;
        let description = item
            .get("description")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        steps.push(PlanStepInput {
            title: title.to_string(),
            description,
        });
    }

    debug!("规划完成，共 {} 步", steps.len());
    Ok(steps)
}

/// 提取 JSON 数组：优先围栏代码块，其次首个 '[' 到最后一个 ']' 的区间
fn extract_json_payload(reply: &str) -> Option<String> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(fence_start) = trimmed.find("```") {
        let after = &trimmed[fence_start + 3..];
        // 跳过语言标记行（如 json）
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(fence_end) = body.find("```") {
            let inner = body[..fence_end].trim();
            if inner.starts_with('[') {
                return Some(inner.to_string());
            }
        }
    }

    let start = trimmed.find('[')?;
    let end = trimmed.rfind(']')?;
    if end <= start {
        return None;
    }
    Some(trimmed[start..=end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bare_json() {
        let payload = extract_json_payload(r#"[{"title":"a"}]"#).unwrap();
        assert!(payload.starts_with('['));
    }

    #[test]
    fn test_extract_fenced_json() {
        let reply = "好的，计划如下：\n```json\n[{\"title\": \"第一步\"}]\n```\n以上。";
        let payload = extract_json_payload(reply).unwrap();
        assert_eq!(payload, "[{\"title\": \"第一步\"}]");
    }

    #[test]
    fn test_extract_with_surrounding_prose() {
        let reply = "计划是 [{\"title\":\"x\"}] 这样";
        assert_eq!(
            extract_json_payload(reply).unwrap(),
            "[{\"title\":\"x\"}]"
        );
    }

    #[test]
    fn test_extract_none_when_no_array() {
        assert!(extract_json_payload("没有计划").is_none());
        assert!(extract_json_payload("").is_none());
    }

    #[test]
    fn test_parse_valid_plan() {
        let steps = parse_plan_reply(
            r#"[{"title":"写脚本","description":"python"},{"title":"解释"}]"#,
        )
        .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].title, "写脚本");
        assert_eq!(steps[0].description.as_deref(), Some("python"));
        assert_eq!(steps[1].description, None);
    }

    #[test]
    fn test_parse_rejects_empty_plan() {
        assert!(parse_plan_reply("[]").is_err());
    }

    #[test]
    fn test_parse_rejects_missing_title() {
        assert!(parse_plan_reply(r#"[{"description":"x"}]"#).is_err());
        assert!(parse_plan_reply(r#"[{"title":"   "}]"#).is_err());
    }

    #[test]
    fn test_parse_rejects_non_array() {
        assert!(parse_plan_reply(r#"{"title":"x"}"#).is_err());
    }
}
