/*!
 * 存储系统模块
 *
 * 职责：
 * - database: 每工作区 SQLite 状态库管理
 * - schema: 内嵌建表语句与版本门禁
 * - repositories: 数据访问层（每个表族一个结构体）
 * - paths: 工作区状态目录布局
 */

pub mod database;
pub mod paths;
pub mod repositories;
pub mod schema;

pub use database::{StateStore, StateStoreOptions};
pub use paths::WorkspacePaths;
pub use repositories::TaskStore;

/// 状态目录名称（工作区根目录下）
pub const STATE_DIR_NAME: &str = ".ads";
/// 状态库文件名
pub const DATABASE_FILE_NAME: &str = "state.db";
/// 附件目录名
pub const ATTACHMENTS_DIR_NAME: &str = "attachments";
/// 工作区元数据文件名
pub const WORKSPACE_META_FILE_NAME: &str = "workspace.json";
