/*!
 * 状态库 schema
 *
 * 内嵌建表语句，打开时按顺序执行（全部 IF NOT EXISTS，可重复执行）。
 * meta 表中的 schema_version 行是版本门禁：不认识的版本拒绝打开。
 */

/// 当前 schema 版本
pub const SCHEMA_VERSION: i64 = 1;

/// 建表与索引语句，按依赖顺序排列
pub fn statements() -> &'static [&'static str] {
    &[
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            prompt TEXT NOT NULL,
            model TEXT,
            model_params TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            priority INTEGER NOT NULL DEFAULT 0,
            queue_order INTEGER NOT NULL,
            queued_at TEXT,
            started_at TEXT,
            completed_at TEXT,
            archived_at TEXT,
            prompt_injected_at TEXT,
            inherit_context INTEGER NOT NULL DEFAULT 0,
            parent_task_id TEXT,
            thread_id TEXT NOT NULL,
            result TEXT,
            last_error TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            created_at TEXT NOT NULL,
            created_by TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS plan_steps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            step_number INTEGER NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            started_at TEXT,
            completed_at TEXT,
            UNIQUE (task_id, step_number)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS task_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            plan_step_id INTEGER REFERENCES plan_steps(id) ON DELETE SET NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            message_type TEXT NOT NULL DEFAULT 'text',
            model_used TEXT,
            token_count INTEGER,
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS task_contexts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            context_type TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            task_id TEXT,
            title TEXT,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            last_model TEXT,
            model_response_ids TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS conversation_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            message_type TEXT NOT NULL DEFAULT 'text',
            model_id TEXT,
            token_count INTEGER,
            metadata TEXT,
            plan_step_id INTEGER,
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS model_configs (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            provider TEXT NOT NULL,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            is_default INTEGER NOT NULL DEFAULT 0,
            config_json TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS attachments (
            id TEXT PRIMARY KEY,
            sha256 TEXT NOT NULL UNIQUE,
            content_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            width INTEGER,
            height INTEGER,
            filename TEXT,
            storage_key TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'image',
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS task_attachments (
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            attachment_id TEXT NOT NULL REFERENCES attachments(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL,
            PRIMARY KEY (task_id, attachment_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS preferences (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_tasks_status_queue_order ON tasks (status, queue_order)",
        "CREATE INDEX IF NOT EXISTS idx_plan_steps_task ON plan_steps (task_id, step_number)",
        "CREATE INDEX IF NOT EXISTS idx_task_messages_task ON task_messages (task_id, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_conversation_messages_conv_created ON conversation_messages (conversation_id, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_attachments_sha256 ON attachments (sha256)",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_are_idempotent_creates() {
        for stmt in statements() {
            let normalized = stmt.trim_start().to_uppercase();
            assert!(
                normalized.starts_with("CREATE TABLE IF NOT EXISTS")
                    || normalized.starts_with("CREATE INDEX IF NOT EXISTS"),
                "非幂等语句: {}",
                stmt
            );
        }
    }
}
