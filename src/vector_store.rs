//! 向量存储模块
//!
//! 定义向量存储契约，并提供两种内置后端：
//!
//! - `InMemoryVectorStore`: 进程内存储（dashmap），不保留原始文本，
//!   写入层因此默认启用文档库镜像
//! - `SqliteVectorStore`: SQLite 持久化存储，向量以 bincode BLOB 落盘，
//!   保留原始文本
//!
//! ## 设计要点
//!
//! - **删除粒度**: `delete(id)` 同时按逻辑文档 ID 和节点 ID 匹配，
//!   兼容按文档删除与按节点清理两种调用方
//! - **维度校验**: 支持 64-8192 维，覆盖常见嵌入模型输出
//! - **检索**: 余弦相似度，降序返回 top_k

use async_trait::async_trait;
use dashmap::DashMap;
use rusqlite::params;
use std::sync::Arc;

use crate::database::Database;
use crate::models::AppError;
use crate::types::Node;

type Result<T> = std::result::Result<T, AppError>;

/// 向量维度下限
const MIN_DIMENSION: usize = 64;
/// 向量维度上限
const MAX_DIMENSION: usize = 8192;

/// 检查维度是否在合理范围内
pub fn is_dimension_valid(dim: usize) -> bool {
    (MIN_DIMENSION..=MAX_DIMENSION).contains(&dim)
}

/// 余弦相似度
///
/// 任一向量为零向量或长度不一致时返回 0。
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// 检索命中记录
#[derive(Debug, Clone)]
pub struct QueryMatch {
    pub node_id: String,
    pub source_id: String,
    /// 原始文本（仅保留文本的后端返回）
    pub text: Option<String>,
    pub score: f32,
}

/// 向量存储契约
///
/// 写入层按命名空间持有多个实现（默认通道 + 图像通道）。
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 批量写入携带嵌入向量的节点
    ///
    /// 按输入顺序返回每个节点的存储端 ID。缺少嵌入向量的节点视为内部错误。
    async fn add(&self, nodes: &[Node]) -> Result<Vec<String>>;

    /// 删除匹配 ID 的全部记录
    ///
    /// 按逻辑文档 ID 或节点 ID 匹配均命中；无匹配不算错误。
    async fn delete(&self, id: &str) -> Result<()>;

    /// 余弦相似度检索，降序返回至多 top_k 条
    async fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<QueryMatch>>;

    /// 是否保留原始文本
    ///
    /// 返回 false 时写入层为该存储启用文档库镜像。
    fn stores_text(&self) -> bool;
}

/// 校验节点嵌入并返回向量引用
fn require_embedding(node: &Node) -> Result<&[f32]> {
    let embedding = node
        .embedding()
        .ok_or_else(|| AppError::internal(format!("节点 {} 缺少嵌入向量", node.id())))?;
    if !is_dimension_valid(embedding.len()) {
        return Err(AppError::configuration(format!(
            "向量维度超出合理范围: {}，有效范围: {}-{}",
            embedding.len(),
            MIN_DIMENSION,
            MAX_DIMENSION
        )));
    }
    Ok(embedding)
}

// ============================================================================
// 内存向量存储
// ============================================================================

#[derive(Debug, Clone)]
struct InMemoryRecord {
    source_id: String,
    embedding: Vec<f32>,
}

/// 内存向量存储
///
/// 默认后端：仅保存节点 ID、逻辑文档 ID 与向量，不保留原始文本。
#[derive(Default)]
pub struct InMemoryVectorStore {
    records: DashMap<String, InMemoryRecord>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前记录数
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 是否包含指定节点
    pub fn contains(&self, node_id: &str) -> bool {
        self.records.contains_key(node_id)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, nodes: &[Node]) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            let embedding = require_embedding(node)?.to_vec();
            self.records.insert(
                node.id().to_string(),
                InMemoryRecord {
                    source_id: node.source_id().to_string(),
                    embedding,
                },
            );
            ids.push(node.id().to_string());
        }
        Ok(ids)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records
            .retain(|node_id, record| node_id != id && record.source_id != id);
        Ok(())
    }

    async fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<QueryMatch>> {
        let mut matches: Vec<QueryMatch> = self
            .records
            .iter()
            .map(|entry| QueryMatch {
                node_id: entry.key().clone(),
                source_id: entry.value().source_id.clone(),
                text: None,
                score: cosine_similarity(embedding, &entry.value().embedding),
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    fn stores_text(&self) -> bool {
        false
    }
}

// ============================================================================
// SQLite 向量存储
// ============================================================================

/// SQLite 向量存储
///
/// 每个命名空间一张表（`vec_{namespace}`），保留原始文本，
/// 向量以 bincode 序列化后存入 BLOB 列。
pub struct SqliteVectorStore {
    database: Arc<Database>,
    table: String,
}

impl std::fmt::Debug for SqliteVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteVectorStore")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl SqliteVectorStore {
    /// 创建（或打开）指定命名空间的向量表
    pub fn new(database: Arc<Database>, namespace: &str) -> Result<Self> {
        if namespace.is_empty()
            || !namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(AppError::configuration(format!(
                "无效的向量表命名空间: {:?}",
                namespace
            )));
        }

        let table = format!("vec_{}", namespace);
        let conn = database.get_conn()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                node_id       TEXT PRIMARY KEY,
                source_id     TEXT NOT NULL,
                text_content  TEXT,
                embedding     BLOB NOT NULL,
                dim           INTEGER NOT NULL,
                metadata_json TEXT,
                created_at    INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_source ON {table} (source_id);"
        ))?;
        drop(conn);

        Ok(Self { database, table })
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn add(&self, nodes: &[Node]) -> Result<Vec<String>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.database.get_conn()?;
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(nodes.len());

        for node in nodes {
            let embedding = require_embedding(node)?;
            let blob = bincode::serialize(&embedding.to_vec())?;
            let metadata_json = node
                .metadata()
                .map(serde_json::to_string)
                .transpose()?;

            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {}
                     (node_id, source_id, text_content, embedding, dim, metadata_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    self.table
                ),
                params![
                    node.id(),
                    node.source_id(),
                    node.text(),
                    blob,
                    embedding.len() as i64,
                    metadata_json,
                    Self::now_ms(),
                ],
            )?;
            ids.push(node.id().to_string());
        }

        tx.commit()?;
        log::debug!("📊 [{}] 写入 {} 条向量记录", self.table, ids.len());
        Ok(ids)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.database.get_conn()?;
        let removed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE node_id = ?1 OR source_id = ?1",
                self.table
            ),
            params![id],
        )?;
        if removed > 0 {
            log::debug!("🗑️ [{}] 删除 {} 条向量记录 (id={})", self.table, removed, id);
        }
        Ok(())
    }

    async fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<QueryMatch>> {
        let conn = self.database.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT node_id, source_id, text_content, embedding
             FROM {} WHERE dim = ?1",
            self.table
        ))?;

        let rows = stmt.query_map(params![embedding.len() as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;

        let mut matches = Vec::new();
        for row in rows {
            let (node_id, source_id, text, blob) = row?;
            let stored: Vec<f32> = bincode::deserialize(&blob)?;
            matches.push(QueryMatch {
                node_id,
                source_id,
                text,
                score: cosine_similarity(embedding, &stored),
            });
        }

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    fn stores_text(&self) -> bool {
        true
    }
}
