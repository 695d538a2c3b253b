/*!
 * 附件Repository
 *
 * 仅图片。内容寻址：相同 sha256 共享一行与一个磁盘 blob。
 * 解除链接不删除 blob，显式 collect_garbage 才回收。
 */

use super::RowMapper;
use crate::error::{CoreError, CoreResult};
use crate::storage::database::StateStore;
use crate::storage::paths::{extension_for_content_type, WorkspacePaths};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, warn};

/// 附件实体
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub sha256: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub filename: Option<String>,
    pub storage_key: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

impl RowMapper<Attachment> for Attachment {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            sha256: row.try_get("sha256")?,
            content_type: row.try_get("content_type")?,
            size_bytes: row.try_get("size_bytes")?,
            width: row.try_get("width")?,
            height: row.try_get("height")?,
            filename: row.try_get("filename")?,
            storage_key: row.try_get("storage_key")?,
            kind: row.try_get("kind")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// 新附件输入
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub bytes: Vec<u8>,
    pub filename: Option<String>,
    pub content_type: String,
}

const ATTACHMENT_COLUMNS: &str =
    "id, sha256, content_type, size_bytes, width, height, filename, storage_key, kind, created_at";

/// 附件Repository
pub struct AttachmentRepository {
    store: Arc<StateStore>,
}

impl AttachmentRepository {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    fn paths(&self) -> &WorkspacePaths {
        self.store.paths()
    }

    /// 创建图片附件（内容寻址幂等：相同字节返回已有行）
    pub async fn create_image_attachment(
        &self,
        input: NewAttachment,
        now: DateTime<Utc>,
    ) -> CoreResult<Attachment> {
        if input.bytes.is_empty() {
            return Err(CoreError::validation("附件内容不能为空"));
        }
        let ext = extension_for_content_type(&input.content_type).ok_or_else(|| {
            CoreError::validation(format!("不支持的附件类型: {}", input.content_type))
        })?;

        let sha256 = hex::encode(Sha256::digest(&input.bytes));

        if let Some(existing) = self.find_by_sha256(&sha256).await? {
            debug!(sha256 = %sha256, "附件已存在，复用");
            return Ok(existing);
        }

        let blob_path = self.paths().attachment_blob(&sha256, ext);
        if let Some(parent) = blob_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CoreError::io(format!("创建附件目录失败: {}", e), Some(parent.to_path_buf()))
            })?;
        }
        // create-if-not-exists：并发写同一内容时后到者直接复用
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&blob_path)
            .await
        {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(&input.bytes).await.map_err(|e| {
                    CoreError::io(format!("写入附件失败: {}", e), Some(blob_path.clone()))
                })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(CoreError::io(
                    format!("写入附件失败: {}", e),
                    Some(blob_path.clone()),
                ));
            }
        }

        let (width, height) = probe_image_dimensions(&input.bytes, &input.content_type)
            .map(|(w, h)| (Some(w as i64), Some(h as i64)))
            .unwrap_or((None, None));

        let id = uuid::Uuid::new_v4().to_string();
        let storage_key = WorkspacePaths::attachment_storage_key(&sha256, ext);

        sqlx::query(
            "INSERT INTO attachments (id, sha256, content_type, size_bytes, width, height, filename, storage_key, kind, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'image', ?) \
             ON CONFLICT (sha256) DO NOTHING",
        )
        .bind(&id)
        .bind(&sha256)
        .bind(&input.content_type)
        .bind(input.bytes.len() as i64)
        .bind(width)
        .bind(height)
        .bind(&input.filename)
        .bind(&storage_key)
        .bind(now)
        .execute(self.store.pool())
        .await?;

        // ON CONFLICT 落空时返回竞争者的行
        self.find_by_sha256(&sha256)
            .await?
            .ok_or_else(|| CoreError::not_found("附件", sha256))
    }

    pub async fn find_by_sha256(&self, sha256: &str) -> CoreResult<Option<Attachment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM attachments WHERE sha256 = ?",
            ATTACHMENT_COLUMNS
        ))
        .bind(sha256)
        .fetch_optional(self.store.pool())
        .await?;
        row.map(|r| Attachment::from_row(&r)).transpose()
    }

    pub async fn get(&self, id: &str) -> CoreResult<Option<Attachment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM attachments WHERE id = ?",
            ATTACHMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.store.pool())
        .await?;
        row.map(|r| Attachment::from_row(&r)).transpose()
    }

    /// 关联附件到任务
    pub async fn link_to_task(
        &self,
        task_id: &str,
        attachment_ids: &[String],
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut tx = self.store.pool().begin().await?;
        for attachment_id in attachment_ids {
            sqlx::query(
                "INSERT INTO task_attachments (task_id, attachment_id, created_at) VALUES (?, ?, ?) \
                 ON CONFLICT (task_id, attachment_id) DO NOTHING",
            )
            .bind(task_id)
            .bind(attachment_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// 解除关联（blob 保留）
    pub async fn unlink_from_task(&self, task_id: &str, attachment_id: &str) -> CoreResult<()> {
        sqlx::query("DELETE FROM task_attachments WHERE task_id = ? AND attachment_id = ?")
            .bind(task_id)
            .bind(attachment_id)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    /// 任务的附件列表
    pub async fn list_for_task(&self, task_id: &str) -> CoreResult<Vec<Attachment>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM attachments a \
             JOIN task_attachments ta ON ta.attachment_id = a.id \
             WHERE ta.task_id = ? ORDER BY ta.created_at ASC",
            "a.id, a.sha256, a.content_type, a.size_bytes, a.width, a.height, a.filename, a.storage_key, a.kind, a.created_at"
        ))
        .bind(task_id)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(Attachment::from_row).collect()
    }

    /// 回收零引用附件：删除行并尽力删除 blob
    pub async fn collect_garbage(&self) -> CoreResult<u64> {
        let rows = sqlx::query(
            "SELECT id, storage_key FROM attachments \
             WHERE id NOT IN (SELECT attachment_id FROM task_attachments)",
        )
        .fetch_all(self.store.pool())
        .await?;

        let mut removed = 0u64;
        for row in rows {
            let id: String = row.try_get("id")?;
            let storage_key: String = row.try_get("storage_key")?;

            sqlx::query("DELETE FROM attachments WHERE id = ?")
                .bind(&id)
                .execute(self.store.pool())
                .await?;

            let blob_path = self.paths().state_dir.join(&storage_key);
            if let Err(e) = tokio::fs::remove_file(&blob_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %blob_path.display(), "删除附件 blob 失败: {}", e);
                }
            }
            removed += 1;
        }
        Ok(removed)
    }
}

/// 从图片头部尽力解析尺寸，解析不出返回 None
fn probe_image_dimensions(bytes: &[u8], content_type: &str) -> Option<(u32, u32)> {
    match content_type {
        "image/png" => probe_png(bytes),
        "image/jpeg" => probe_jpeg(bytes),
        "image/webp" => probe_webp(bytes),
        _ => None,
    }
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// PNG：IHDR 固定位于第 16 字节处
fn probe_png(bytes: &[u8]) -> Option<(u32, u32)> {
    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    if bytes.len() < 24 || &bytes[..8] != PNG_MAGIC {
        return None;
    }
    Some((be32(&bytes[16..20]), be32(&bytes[20..24])))
}

/// JPEG：扫描 SOF 段
fn probe_jpeg(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return None;
    }
    let mut i = 2;
    while i + 9 < bytes.len() {
        if bytes[i] != 0xFF {
            i += 1;
            continue;
        }
        let marker = bytes[i + 1];
        // SOF0-SOF15，排除 DHT/JPG/DAC
        if (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC) {
            let height = u16::from_be_bytes([bytes[i + 5], bytes[i + 6]]) as u32;
            let width = u16::from_be_bytes([bytes[i + 7], bytes[i + 8]]) as u32;
            return Some((width, height));
        }
        let len = u16::from_be_bytes([bytes[i + 2], bytes[i + 3]]) as usize;
        i += 2 + len;
    }
    None
}

/// WebP：VP8 / VP8L / VP8X 三种封装
fn probe_webp(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 30 || &bytes[..4] != b"RIFF" || &bytes[8..12] != b"WEBP" {
        return None;
    }
    match &bytes[12..16] {
        b"VP8X" => {
            let w = 1 + (bytes[24] as u32 | (bytes[25] as u32) << 8 | (bytes[26] as u32) << 16);
            let h = 1 + (bytes[27] as u32 | (bytes[28] as u32) << 8 | (bytes[29] as u32) << 16);
            Some((w, h))
        }
        b"VP8L" => {
            let b = &bytes[21..25];
            let w = 1 + ((b[0] as u32) | ((b[1] as u32 & 0x3F) << 8));
            let h = 1 + (((b[1] as u32 & 0xC0) >> 6) | ((b[2] as u32) << 2) | ((b[3] as u32 & 0x0F) << 10));
            Some((w, h))
        }
        b"VP8 " => {
            let w = u16::from_le_bytes([bytes[26], bytes[27]]) as u32 & 0x3FFF;
            let h = u16::from_le_bytes([bytes[28], bytes[29]]) as u32 & 0x3FFF;
            Some((w, h))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        bytes
    }

    #[test]
    fn test_probe_png() {
        assert_eq!(probe_png(&png_bytes(640, 480)), Some((640, 480)));
        assert_eq!(probe_png(b"not a png at all........"), None);
    }

    #[test]
    fn test_probe_jpeg_sof0() {
        // SOI + APP0(最小) + SOF0(2x3)
        let mut bytes = vec![0xFF, 0xD8];
        bytes.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00]);
        bytes.extend_from_slice(&[
            0xFF, 0xC0, 0x00, 0x0B, 0x08, 0x00, 0x03, 0x00, 0x02, 0x01, 0x01, 0x11, 0x00,
        ]);
        assert_eq!(probe_jpeg(&bytes), Some((2, 3)));
    }

    #[test]
    fn test_probe_webp_vp8x() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(b"WEBP");
        bytes.extend_from_slice(b"VP8X");
        bytes.extend_from_slice(&[10, 0, 0, 0]);
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        // 宽 99（存 98），高 49（存 48）
        bytes.extend_from_slice(&[98, 0, 0]);
        bytes.extend_from_slice(&[48, 0, 0]);
        assert_eq!(probe_webp(&bytes), Some((99, 49)));
    }

    #[test]
    fn test_probe_wrong_type() {
        assert_eq!(probe_image_dimensions(&png_bytes(1, 1), "image/jpeg"), None);
    }
}
