/*!
 * 工作区路径管理
 *
 * 每个工作区根目录下有一个状态目录：
 *   .ads/state.db                       状态库
 *   .ads/attachments/<sha[0:2]>/<sha>.<ext>  内容寻址附件
 *   .ads/workspace.json                 工作区元数据
 */

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// 工作区路径管理器
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    /// 工作区根目录
    pub root: PathBuf,
    /// 状态目录
    pub state_dir: PathBuf,
    /// 附件目录
    pub attachments_dir: PathBuf,
}

/// workspace.json 的内容
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMeta {
    pub name: String,
    pub created: DateTime<Utc>,
}

impl WorkspacePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(super::STATE_DIR_NAME);
        let attachments_dir = state_dir.join(super::ATTACHMENTS_DIR_NAME);
        Self {
            root,
            state_dir,
            attachments_dir,
        }
    }

    /// 状态库文件路径
    pub fn database_file(&self) -> PathBuf {
        self.state_dir.join(super::DATABASE_FILE_NAME)
    }

    /// 工作区元数据文件路径
    pub fn workspace_meta_file(&self) -> PathBuf {
        self.state_dir.join(super::WORKSPACE_META_FILE_NAME)
    }

    /// 附件 blob 路径：attachments/<sha[0:2]>/<sha>.<ext>
    pub fn attachment_blob(&self, sha256: &str, ext: &str) -> PathBuf {
        self.attachments_dir
            .join(&sha256[..2])
            .join(format!("{}.{}", sha256, ext))
    }

    /// blob 相对状态目录的存储键
    pub fn attachment_storage_key(sha256: &str, ext: &str) -> String {
        format!(
            "{}/{}/{}.{}",
            super::ATTACHMENTS_DIR_NAME,
            &sha256[..2],
            sha256,
            ext
        )
    }

    /// 确保状态目录存在，并写入初始 workspace.json
    pub async fn ensure_directories(&self, now: DateTime<Utc>) -> CoreResult<()> {
        for dir in [&self.state_dir, &self.attachments_dir] {
            if !dir.exists() {
                tokio::fs::create_dir_all(dir).await.map_err(|e| {
                    CoreError::io(format!("创建目录失败: {}", e), Some(dir.clone()))
                })?;
                info!("创建目录: {}", dir.display());
            }
        }

        let meta_file = self.workspace_meta_file();
        if !meta_file.exists() {
            let name = self
                .root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "workspace".to_string());
            let meta = WorkspaceMeta { name, created: now };
            let body = serde_json::to_string_pretty(&meta)
                .map_err(|e| CoreError::io(format!("序列化工作区元数据失败: {}", e), None))?;
            tokio::fs::write(&meta_file, body).await.map_err(|e| {
                CoreError::io(format!("写入工作区元数据失败: {}", e), Some(meta_file.clone()))
            })?;
        }

        Ok(())
    }

    /// 校验根目录可访问
    pub fn validate(&self) -> CoreResult<()> {
        if !self.root.exists() {
            return Err(CoreError::io(
                "工作区根目录不存在",
                Some(self.root.clone()),
            ));
        }
        if let Err(e) = std::fs::metadata(&self.root) {
            return Err(CoreError::io(
                format!("无法访问工作区根目录: {}", e),
                Some(self.root.clone()),
            ));
        }
        Ok(())
    }
}

/// 扩展名从 content-type 推导
pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    match content_type {
        "image/png" => Some("png"),
        "image/jpeg" => Some("jpg"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = WorkspacePaths::new("/tmp/ws");
        assert_eq!(paths.database_file(), PathBuf::from("/tmp/ws/.ads/state.db"));
        assert_eq!(
            paths.attachment_blob("abcdef", "png"),
            PathBuf::from("/tmp/ws/.ads/attachments/ab/abcdef.png")
        );
        assert_eq!(
            WorkspacePaths::attachment_storage_key("abcdef", "png"),
            "attachments/ab/abcdef.png"
        );
    }

    #[test]
    fn test_extension_mapping() {
        assert_eq!(extension_for_content_type("image/png"), Some("png"));
        assert_eq!(extension_for_content_type("image/jpeg"), Some("jpg"));
        assert_eq!(extension_for_content_type("image/webp"), Some("webp"));
        assert_eq!(extension_for_content_type("application/pdf"), None);
    }
}
