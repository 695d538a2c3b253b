/*!
 * 核心错误类型
 *
 * 按语义分类的错误枚举：校验、存储冲突、取消、适配器失败、
 * 模式版本不匹配等。队列层根据分类决定重试或终止。
 */

use std::path::PathBuf;
use thiserror::Error;

/// 核心统一结果类型
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// 调用方输入被拒绝，不重试
    #[error("参数校验失败: {0}")]
    Validation(String),

    /// 声明/提升时的行级竞争，方法内部有界重试后仍未成功
    #[error("存储冲突: {0}")]
    StoreConflict(String),

    /// 协作式取消，既不是失败也不消耗重试预算
    #[error("任务已取消")]
    Cancelled,

    /// 外部 agent 子进程非零退出、turn.failed 或超时
    #[error("Agent 执行失败: {0}")]
    AdapterFailure(String),

    /// 状态库 schema 版本不被识别，工作区拒绝打开
    #[error("状态库版本不匹配: 发现 {found}, 期望 {expected}")]
    SchemaMismatch { found: i64, expected: i64 },

    /// 实体不存在
    #[error("{kind}不存在: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    /// 磁盘/文件系统错误，直接上抛
    #[error("文件系统错误: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn adapter(message: impl Into<String>) -> Self {
        Self::AdapterFailure(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn io(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self::Io {
            message: message.into(),
            path,
        }
    }

    /// 队列层用于区分取消路径
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            path: None,
        }
    }
}
