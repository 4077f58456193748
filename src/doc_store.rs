//! 文档库模块
//!
//! 当主向量库不保留原始文本时，节点的剥离副本（无嵌入向量）在此落盘，
//! 并维护逻辑文档 ID 到节点 ID 的反向索引，供删除与内容回溯使用。
//!
//! ## 设计要点
//!
//! - **无向量列**: `doc_nodes` 表没有 embedding 列，镜像副本结构上不可能
//!   携带向量
//! - **允许更新**: `add_documents(allow_update=true)` 静默覆盖同 ID 旧行
//! - **幂等删除**: 按逻辑文档删除时缺失条目不算错误（raise_error 可选）

use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::database::Database;
use crate::models::AppError;
use crate::types::{ImageNode, Node, NodeImage, RefDocInfo, TextNode};

type Result<T> = std::result::Result<T, AppError>;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 内容哈希（文本 + 图片引用），用于变更检测
fn compute_content_hash(text: Option<&str>, image_ref: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    if let Some(t) = text {
        hasher.update(t.as_bytes());
    }
    hasher.update(b"|");
    if let Some(r) = image_ref {
        hasher.update(r.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

type NodeRowParts = (String, String, Option<String>, Option<String>, Option<String>, i64);

fn row_to_parts(row: &Row) -> rusqlite::Result<NodeRowParts> {
    Ok((
        row.get("kind")?,
        row.get("source_id")?,
        row.get("text_content")?,
        row.get("image_json")?,
        row.get("metadata_json")?,
        row.get("created_at")?,
    ))
}

/// 文档库
///
/// 持久化节点的剥离副本，并提供 source_id 反向索引。
pub struct DocumentStore {
    database: Arc<Database>,
}

impl DocumentStore {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// 写入一批节点副本
    ///
    /// ## 参数
    /// - `nodes`: 节点列表（写入前强制剥离嵌入向量）
    /// - `allow_update`: true 时同 ID 静默覆盖；false 时同 ID 报校验错误
    pub fn add_documents(&self, nodes: &[Node], allow_update: bool) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }

        let mut conn = self.database.get_conn()?;
        let tx = conn.transaction()?;
        let now = now_ms();

        for node in nodes {
            // 镜像副本不携带向量
            let node = node.without_embedding();

            if !allow_update {
                let exists: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM doc_nodes WHERE node_id = ?1",
                        params![node.id()],
                        |r| r.get(0),
                    )
                    .optional()?;
                if exists.is_some() {
                    return Err(AppError::validation(format!(
                        "节点已存在: {}",
                        node.id()
                    )));
                }
            }

            let image_json = node
                .image()
                .map(serde_json::to_string)
                .transpose()?;
            let metadata_json = node
                .metadata()
                .map(serde_json::to_string)
                .transpose()?;
            let content_hash =
                compute_content_hash(node.text(), image_json.as_deref());

            tx.execute(
                "INSERT OR REPLACE INTO doc_nodes
                 (node_id, source_id, kind, text_content, image_json,
                  metadata_json, content_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    node.id(),
                    node.source_id(),
                    node.kind(),
                    node.text(),
                    image_json,
                    metadata_json,
                    content_hash,
                    now,
                    now,
                ],
            )?;
        }

        tx.commit()?;
        log::debug!("📚 文档库写入 {} 个节点副本", nodes.len());
        Ok(())
    }

    /// 读取单个节点副本
    pub fn get_node(&self, node_id: &str) -> Result<Option<Node>> {
        let conn = self.database.get_conn()?;
        let row = conn
            .query_row(
                "SELECT kind, source_id, text_content, image_json, metadata_json, created_at
                 FROM doc_nodes WHERE node_id = ?1",
                params![node_id],
                row_to_parts,
            )
            .optional()?;

        let Some((kind, source_id, text, image_json, metadata_json, created_at)) = row else {
            return Ok(None);
        };

        let metadata: Option<serde_json::Value> = metadata_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let created_at = chrono::DateTime::from_timestamp_millis(created_at)
            .unwrap_or_else(chrono::Utc::now);

        let node = match kind.as_str() {
            "text" => Node::Text(TextNode {
                id: node_id.to_string(),
                source_id,
                text: text.unwrap_or_default(),
                metadata,
                embedding: None,
                created_at,
            }),
            "image" => {
                let image_json = image_json.ok_or_else(|| {
                    AppError::internal(format!("图像节点 {} 缺少图片内容", node_id))
                })?;
                let image: NodeImage = serde_json::from_str(&image_json)?;
                Node::Image(ImageNode {
                    id: node_id.to_string(),
                    source_id,
                    image,
                    text,
                    metadata,
                    embedding: None,
                    created_at,
                })
            }
            other => {
                return Err(AppError::internal(format!(
                    "未知的节点类型: {}",
                    other
                )))
            }
        };
        Ok(Some(node))
    }

    /// 逻辑文档反向索引
    ///
    /// 返回 source_id 对应的全部节点 ID（插入顺序）；无任何节点时返回 None。
    pub fn get_ref_doc_info(&self, source_id: &str) -> Result<Option<RefDocInfo>> {
        let conn = self.database.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_id FROM doc_nodes WHERE source_id = ?1 ORDER BY rowid",
        )?;
        let node_ids: Vec<String> = stmt
            .query_map(params![source_id], |r| r.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        if node_ids.is_empty() {
            return Ok(None);
        }
        Ok(Some(RefDocInfo {
            source_id: source_id.to_string(),
            node_ids,
        }))
    }

    /// 删除单个节点副本
    pub fn delete_document(&self, node_id: &str) -> Result<()> {
        let conn = self.database.get_conn()?;
        conn.execute(
            "DELETE FROM doc_nodes WHERE node_id = ?1",
            params![node_id],
        )?;
        Ok(())
    }

    /// 删除逻辑文档的全部节点副本
    ///
    /// ## 参数
    /// - `raise_error`: true 时缺失条目报 NotFound；false 时视为空操作
    pub fn delete_ref_doc(&self, source_id: &str, raise_error: bool) -> Result<usize> {
        let conn = self.database.get_conn()?;
        let removed = conn.execute(
            "DELETE FROM doc_nodes WHERE source_id = ?1",
            params![source_id],
        )?;

        if removed == 0 && raise_error {
            return Err(AppError::not_found(format!(
                "逻辑文档不存在: {}",
                source_id
            )));
        }
        if removed > 0 {
            log::debug!("🗑️ 文档库删除逻辑文档 {} 的 {} 个节点", source_id, removed);
        }
        Ok(removed)
    }

    /// 节点总数（统计/测试用）
    pub fn count(&self) -> Result<usize> {
        let conn = self.database.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM doc_nodes", [], |r| r.get(0))?;
        Ok(count as usize)
    }
}
