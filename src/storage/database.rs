/*!
 * 状态库管理
 *
 * 每个工作区一个 SQLite 文件。打开时启用 WAL、外键约束与 busy-timeout，
 * 校验 schema 版本后执行内嵌建表语句。多行变更一律走事务。
 */

use crate::config::CoreSettings;
use crate::error::{CoreError, CoreResult};
use crate::storage::paths::WorkspacePaths;
use crate::storage::schema;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{ConnectOptions, Row};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// 状态库选项
#[derive(Debug, Clone)]
pub struct StateStoreOptions {
    /// busy-timeout
    pub busy_timeout: Duration,
    /// 连接池大小
    pub pool_size: u32,
    /// 状态库文件位置覆盖（测试用）
    pub db_path_override: Option<PathBuf>,
}

impl Default for StateStoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(crate::config::DEFAULT_BUSY_TIMEOUT_MS),
            pool_size: 5,
            db_path_override: None,
        }
    }
}

impl StateStoreOptions {
    pub fn from_settings(settings: &CoreSettings) -> Self {
        Self {
            busy_timeout: settings.busy_timeout,
            pool_size: 5,
            db_path_override: settings.state_db_path.clone(),
        }
    }
}

/// 每工作区的状态库
#[derive(Debug)]
pub struct StateStore {
    pool: SqlitePool,
    paths: WorkspacePaths,
}

impl StateStore {
    /// 打开（必要时创建）工作区状态库
    ///
    /// 打开失败（IO、版本不匹配、损坏）直接返回错误，由持有方决定如何失败。
    pub async fn open(paths: WorkspacePaths, options: StateStoreOptions) -> CoreResult<Self> {
        paths.ensure_directories(Utc::now()).await?;

        let db_path = options
            .db_path_override
            .clone()
            .unwrap_or_else(|| paths.database_file());
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CoreError::io(format!("创建数据目录失败: {}", e), Some(parent.to_path_buf()))
            })?;
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(options.busy_timeout)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(options.pool_size)
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                CoreError::io(
                    format!("状态库连接失败: {}", e),
                    Some(db_path.clone()),
                )
            })?;

        let store = Self { pool, paths };
        store.check_schema_version().await?;
        store.apply_schema().await?;
        info!("状态库已打开: {}", db_path.display());
        Ok(store)
    }

    /// 获取连接池
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 工作区路径
    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// 版本门禁：meta 表已存在且版本不认识时拒绝打开，不做静默迁移
    async fn check_schema_version(&self) -> CoreResult<()> {
        let meta_exists: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
        )
        .fetch_optional(&self.pool)
        .await?;

        if meta_exists.is_none() {
            return Ok(());
        }

        let row = sqlx::query("SELECT value FROM meta WHERE key = 'schema_version'")
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            let raw: String = row.try_get("value")?;
            let found = raw
                .trim()
                .parse::<i64>()
                .map_err(|_| CoreError::SchemaMismatch {
                    found: -1,
                    expected: schema::SCHEMA_VERSION,
                })?;
            if found != schema::SCHEMA_VERSION {
                return Err(CoreError::SchemaMismatch {
                    found,
                    expected: schema::SCHEMA_VERSION,
                });
            }
        }

        Ok(())
    }

    /// 执行内嵌建表语句并写入版本行
    async fn apply_schema(&self) -> CoreResult<()> {
        debug!("开始执行建表语句");
        for stmt in schema::statements() {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        sqlx::query("INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?)")
            .bind(schema::SCHEMA_VERSION.to_string())
            .execute(&self.pool)
            .await?;
        debug!("建表语句执行完成");
        Ok(())
    }
}
