//! 索引结构模块
//!
//! 内存中的节点注册表：节点 ID → 存储端 ID。
//! 仅在文档库镜像启用时被写入，用于删除时的逐节点清理与内容回溯。
//! 通过 `IndexStructRepo` 以 JSON 形式持久化到 SQLite。

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::database::Database;
use crate::models::AppError;

type Result<T> = std::result::Result<T, AppError>;

/// 生成索引 ID（idx_ 前缀 + 10位 nanoid）
pub fn generate_index_id() -> String {
    format!("idx_{}", nanoid::nanoid!(10))
}

/// 多模态索引结构
///
/// `nodes_dict` 记录每个节点在向量库中的存储端 ID。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultimodalIndexStruct {
    /// 索引唯一标识
    pub index_id: String,
    /// 节点 ID → 存储端 ID
    pub nodes_dict: HashMap<String, String>,
}

impl MultimodalIndexStruct {
    /// 创建空索引结构
    pub fn new(index_id: impl Into<String>) -> Self {
        Self {
            index_id: index_id.into(),
            nodes_dict: HashMap::new(),
        }
    }

    /// 注册节点与其存储端 ID
    pub fn add_node(&mut self, node_id: impl Into<String>, store_id: impl Into<String>) {
        self.nodes_dict.insert(node_id.into(), store_id.into());
    }

    /// 移除节点注册
    pub fn delete(&mut self, node_id: &str) {
        self.nodes_dict.remove(node_id);
    }

    /// 是否包含节点
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes_dict.contains_key(node_id)
    }

    /// 已注册节点数量
    pub fn len(&self) -> usize {
        self.nodes_dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes_dict.is_empty()
    }
}

impl Default for MultimodalIndexStruct {
    fn default() -> Self {
        Self::new(generate_index_id())
    }
}

/// 索引结构持久化仓库
///
/// `index_structs` 表按索引 ID 存储 JSON 序列化后的结构。
pub struct IndexStructRepo {
    database: Arc<Database>,
}

impl IndexStructRepo {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// 持久化索引结构（同 ID 覆盖）
    pub fn persist(&self, index_struct: &MultimodalIndexStruct) -> Result<()> {
        let data_json = serde_json::to_string(index_struct)?;
        let conn = self.database.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO index_structs (index_id, data_json, updated_at)
             VALUES (?1, ?2, ?3)",
            params![
                index_struct.index_id,
                data_json,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        log::debug!(
            "💾 索引结构已持久化: {} ({} 个节点)",
            index_struct.index_id,
            index_struct.len()
        );
        Ok(())
    }

    /// 加载索引结构
    pub fn load(&self, index_id: &str) -> Result<Option<MultimodalIndexStruct>> {
        let conn = self.database.get_conn()?;
        let data_json: Option<String> = conn
            .query_row(
                "SELECT data_json FROM index_structs WHERE index_id = ?1",
                params![index_id],
                |r| r.get(0),
            )
            .optional()?;

        match data_json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
