//! 多模态检索器
//!
//! 索引写入层产出的轻量查询句柄：将查询内容交给对应通道的嵌入契约，
//! 在相应命名空间的向量库中做 top_k 检索，并通过存储行或文档库镜像
//! 解析出文本内容。检索执行本身完全委托给向量库。

use std::sync::Arc;

use crate::doc_store::DocumentStore;
use crate::embedding_service::{MultimodalEmbedding, TextEmbedding};
use crate::models::AppError;
use crate::types::{NodeImage, ScoredNode};
use crate::vector_store::{QueryMatch, VectorStore};

type Result<T> = std::result::Result<T, AppError>;

/// 默认返回条数
const DEFAULT_TOP_K: usize = 5;

/// 检索配置
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    /// 文本通道返回条数
    pub similarity_top_k: usize,
    /// 图像通道返回条数
    pub image_similarity_top_k: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            similarity_top_k: DEFAULT_TOP_K,
            image_similarity_top_k: DEFAULT_TOP_K,
        }
    }
}

/// 多模态检索器
pub struct MultimodalRetriever {
    text_embedder: Arc<dyn TextEmbedding>,
    image_embedder: Arc<dyn MultimodalEmbedding>,
    primary_store: Arc<dyn VectorStore>,
    image_store: Arc<dyn VectorStore>,
    doc_store: Arc<DocumentStore>,
    mirror_nodes: bool,
    config: RetrieverConfig,
}

impl MultimodalRetriever {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        text_embedder: Arc<dyn TextEmbedding>,
        image_embedder: Arc<dyn MultimodalEmbedding>,
        primary_store: Arc<dyn VectorStore>,
        image_store: Arc<dyn VectorStore>,
        doc_store: Arc<DocumentStore>,
        mirror_nodes: bool,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            text_embedder,
            image_embedder,
            primary_store,
            image_store,
            doc_store,
            mirror_nodes,
            config,
        }
    }

    /// 文本查询：检索默认命名空间
    pub async fn retrieve(&self, query: &str) -> Result<Vec<ScoredNode>> {
        let vectors = self
            .text_embedder
            .embed_texts(&[query.to_string()])
            .await?;
        let query_embedding = vectors
            .into_iter()
            .next()
            .ok_or_else(|| AppError::embedding("嵌入服务返回空结果"))?;

        let matches = self
            .primary_store
            .query(&query_embedding, self.config.similarity_top_k)
            .await?;
        log::debug!("🔍 文本检索命中 {} 条", matches.len());
        self.resolve(matches)
    }

    /// 图像查询：检索图像命名空间
    pub async fn retrieve_images(&self, image: &NodeImage) -> Result<Vec<ScoredNode>> {
        let vectors = self.image_embedder.embed_images(&[image.clone()]).await?;
        let query_embedding = vectors
            .into_iter()
            .next()
            .ok_or_else(|| AppError::embedding("嵌入服务返回空结果"))?;

        let matches = self
            .image_store
            .query(&query_embedding, self.config.image_similarity_top_k)
            .await?;
        log::debug!("🔍 图像检索命中 {} 条", matches.len());
        self.resolve(matches)
    }

    /// 解析命中记录的文本内容
    ///
    /// 向量库保留文本时直接使用存储行；否则在镜像启用时回溯文档库副本。
    fn resolve(&self, matches: Vec<QueryMatch>) -> Result<Vec<ScoredNode>> {
        let mut results = Vec::with_capacity(matches.len());
        for m in matches {
            let text = match m.text {
                Some(text) => Some(text),
                None if self.mirror_nodes => self
                    .doc_store
                    .get_node(&m.node_id)?
                    .and_then(|node| node.text().map(|t| t.to_string())),
                None => None,
            };

            results.push(ScoredNode {
                node_id: m.node_id,
                source_id: Some(m.source_id),
                text,
                score: m.score,
            });
        }
        Ok(results)
    }
}
