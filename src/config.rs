/*!
 * 核心配置
 *
 * 从环境变量读取一次性配置（ADS_* / AGENT_*），未知变量忽略。
 * 配置在 WorkspaceContext 构造时读取并向下传递，不做全局可变状态。
 */

use std::path::PathBuf;
use std::time::Duration;

/// 环境变量名
pub const ENV_STATE_DB_PATH: &str = "ADS_STATE_DB_PATH";
pub const ENV_SQLITE_BUSY_TIMEOUT_MS: &str = "ADS_SQLITE_BUSY_TIMEOUT_MS";
pub const ENV_DROID_BIN: &str = "ADS_DROID_BIN";
/// 历史名称，droid 适配器沿用 codex 风格的事件流
pub const ENV_CODEX_BIN: &str = "ADS_CODEX_BIN";
pub const ENV_GEMINI_BIN: &str = "ADS_GEMINI_BIN";
pub const ENV_AMP_BIN: &str = "ADS_AMP_BIN";
pub const ENV_EXEC_ALLOWLIST: &str = "AGENT_EXEC_ALLOWLIST";
pub const ENV_STEP_TIMEOUT_MS: &str = "AGENT_STEP_TIMEOUT_MS";

/// 默认 busy-timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
/// Planner 超时
pub const DEFAULT_PLANNER_TIMEOUT: Duration = Duration::from_secs(60);
/// Agent 连接+排空超时
pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// 失败重试退避
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// 核心配置快照
#[derive(Debug, Clone)]
pub struct CoreSettings {
    /// 状态库文件位置覆盖（主要用于测试）
    pub state_db_path: Option<PathBuf>,
    /// SQLite busy-timeout
    pub busy_timeout: Duration,
    /// 各 vendor 二进制路径覆盖
    pub droid_bin: Option<String>,
    pub gemini_bin: Option<String>,
    pub amp_bin: Option<String>,
    /// 子进程 basename 白名单，逗号分隔；None 表示不启用
    pub exec_allowlist: Option<Vec<String>>,
    /// 单步超时；None 表示不限
    pub step_timeout: Option<Duration>,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            state_db_path: None,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            droid_bin: None,
            gemini_bin: None,
            amp_bin: None,
            exec_allowlist: None,
            step_timeout: None,
        }
    }
}

impl CoreSettings {
    /// 从环境变量读取配置
    pub fn from_env() -> Self {
        let busy_timeout_ms = std::env::var(ENV_SQLITE_BUSY_TIMEOUT_MS)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS);

        let exec_allowlist = std::env::var(ENV_EXEC_ALLOWLIST).ok().map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        });

        let step_timeout = std::env::var(ENV_STEP_TIMEOUT_MS)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        Self {
            state_db_path: std::env::var(ENV_STATE_DB_PATH).ok().map(PathBuf::from),
            busy_timeout: Duration::from_millis(busy_timeout_ms),
            droid_bin: std::env::var(ENV_DROID_BIN)
                .or_else(|_| std::env::var(ENV_CODEX_BIN))
                .ok(),
            gemini_bin: std::env::var(ENV_GEMINI_BIN).ok(),
            amp_bin: std::env::var(ENV_AMP_BIN).ok(),
            exec_allowlist,
            step_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = CoreSettings::default();
        assert_eq!(
            settings.busy_timeout,
            Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS)
        );
        assert!(settings.exec_allowlist.is_none());
        assert!(settings.step_timeout.is_none());
    }
}
