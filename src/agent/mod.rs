/*!
 * Agent 层
 *
 * 职责：
 * - events: 规范化的内部事件词汇表
 * - stream: 各 vendor 行式 JSON 事件流解析器
 * - adapter: vendor CLI 子进程适配器
 * - allowlist: 子进程白名单门禁
 */

pub mod adapter;
pub mod allowlist;
pub mod events;
pub mod stream;

pub use adapter::{
    AdapterStatus, AgentAdapter, AgentInput, CliAdapterConfig, CliAgentAdapter, SendOptions,
    SendResult, StreamingConfig,
};
pub use events::{AgentEvent, SequencedEvent, TokenUsage};
pub use stream::{AgentStreamParser, ToolKind};

use crate::config::CoreSettings;
use crate::error::{CoreError, CoreResult};

/// 支持的 vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentVendor {
    Droid,
    Gemini,
    Amp,
}

impl AgentVendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Droid => "droid",
            Self::Gemini => "gemini",
            Self::Amp => "amp",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "droid" => Ok(Self::Droid),
            "gemini" => Ok(Self::Gemini),
            "amp" => Ok(Self::Amp),
            _ => Err(CoreError::validation(format!("未知的 agent vendor: {}", s))),
        }
    }

    /// vendor 二进制：环境变量覆盖优先，否则用 PATH 上的默认名
    pub fn binary(&self, settings: &CoreSettings) -> String {
        let override_bin = match self {
            Self::Droid => settings.droid_bin.clone(),
            Self::Gemini => settings.gemini_bin.clone(),
            Self::Amp => settings.amp_bin.clone(),
        };
        override_bin.unwrap_or_else(|| self.as_str().to_string())
    }

    /// 新建该 vendor 的流解析器
    pub fn new_parser(&self) -> Box<dyn AgentStreamParser> {
        match self {
            Self::Droid => Box::new(stream::droid::DroidStreamParser::new()),
            Self::Gemini => Box::new(stream::gemini::GeminiStreamParser::new()),
            Self::Amp => Box::new(stream::amp::AmpStreamParser::new()),
        }
    }
}
