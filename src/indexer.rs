//! 多模态索引写入层
//!
//! 将混合内容节点写入双通道向量索引并保持镜像一致。
//!
//! ## 核心流程
//!
//! 1. **分流**: 按节点类型穷尽匹配，拆分为图像分区与文本分区
//!    （带说明文本的图像节点同时进入两个分区）
//! 2. **批量嵌入**: 每个分区调用各自的嵌入契约，构建节点 ID → 向量映射
//! 3. **持久化**: 文本分区写入默认命名空间向量库，图像分区写入图像命名空间
//! 4. **镜像**: 主向量库不保留文本（或调用方强制）时，将剥离向量的节点副本
//!    写入文档库，并在索引结构中登记存储端 ID
//!
//! ## 已知限制
//!
//! 文本分区先于图像分区处理。图像分区嵌入失败时文本分区已经落库，
//! 此时索引处于部分写入状态，不做补偿回滚。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::embedding_service::{MultimodalEmbedding, TextEmbedding};
use crate::index_struct::MultimodalIndexStruct;
use crate::models::AppError;
use crate::retriever::{MultimodalRetriever, RetrieverConfig};
use crate::storage::{StorageContext, DEFAULT_NAMESPACE, IMAGE_NAMESPACE};
use crate::types::Node;
use crate::vector_store::{InMemoryVectorStore, VectorStore};

type Result<T> = std::result::Result<T, AppError>;

/// 索引写入层配置
#[derive(Debug, Clone, Default)]
pub struct IndexerConfig {
    /// 索引 ID（指定时从索引仓库重载既有结构；缺省自动生成）
    pub index_id: Option<String>,
    /// 强制镜像：即使主向量库保留文本也写入文档库镜像
    pub force_mirror: bool,
}

/// 多模态索引写入层
///
/// 持有存储上下文与两个嵌入契约，负责节点的双通道写入与删除。
/// 假定单调用方、调用间不重叠；同一逻辑文档的并发写删不做同步。
pub struct MultimodalIndexer {
    storage: StorageContext,
    text_embedder: Arc<dyn TextEmbedding>,
    image_embedder: Arc<dyn MultimodalEmbedding>,
    index_struct: RwLock<MultimodalIndexStruct>,
    /// 镜像开关（构造时解析一次，调用期间不再重估）
    mirror_nodes: bool,
}

impl std::fmt::Debug for MultimodalIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultimodalIndexer")
            .field("mirror_nodes", &self.mirror_nodes)
            .finish_non_exhaustive()
    }
}

impl MultimodalIndexer {
    /// 创建索引写入层
    ///
    /// ## 校验
    /// - 图像嵌入器必须声明多模态能力，否则立即返回配置错误
    /// - 默认命名空间必须已注册向量库
    ///
    /// 图像命名空间未注册时自动挂载内存向量库。
    pub fn new(
        mut storage: StorageContext,
        text_embedder: Arc<dyn TextEmbedding>,
        image_embedder: Arc<dyn MultimodalEmbedding>,
        config: IndexerConfig,
    ) -> Result<Self> {
        if !image_embedder.supports_images() {
            return Err(AppError::configuration(
                "图像嵌入器未声明多模态能力，无法用于图像通道",
            ));
        }

        let primary = storage.vector_stores().get(DEFAULT_NAMESPACE).ok_or_else(|| {
            AppError::configuration("存储上下文缺少默认命名空间向量库")
        })?;
        let mirror_nodes = !primary.stores_text() || config.force_mirror;

        if !storage.vector_stores().contains(IMAGE_NAMESPACE) {
            storage
                .vector_stores_mut()
                .register(IMAGE_NAMESPACE, Arc::new(InMemoryVectorStore::new()));
        }

        // 指定索引 ID 时重载既有结构，保证进程重启后删除仍能找到节点映射
        let index_struct = match &config.index_id {
            Some(id) => storage
                .index_store()
                .load(id)?
                .unwrap_or_else(|| MultimodalIndexStruct::new(id.clone())),
            None => MultimodalIndexStruct::default(),
        };

        log::info!(
            "🧩 多模态索引写入层就绪: {} (镜像: {}, 已注册命名空间: {})",
            index_struct.index_id,
            mirror_nodes,
            storage.vector_stores().len()
        );

        Ok(Self {
            storage,
            text_embedder,
            image_embedder,
            index_struct: RwLock::new(index_struct),
            mirror_nodes,
        })
    }

    /// 基于既有主向量库构建
    ///
    /// 主向量库必须保留原始文本，否则无法在没有镜像历史的情况下回溯内容。
    pub fn from_vector_store(
        vector_store: Arc<dyn VectorStore>,
        database: Arc<crate::database::Database>,
        text_embedder: Arc<dyn TextEmbedding>,
        image_embedder: Arc<dyn MultimodalEmbedding>,
        config: IndexerConfig,
    ) -> Result<Self> {
        if !vector_store.stores_text() {
            return Err(AppError::configuration(
                "无法基于不保留文本的向量库初始化索引",
            ));
        }

        let storage = StorageContext::with_database(database)
            .with_vector_store(DEFAULT_NAMESPACE, vector_store);
        Self::new(storage, text_embedder, image_embedder, config)
    }

    /// 镜像是否启用
    pub fn mirror_nodes(&self) -> bool {
        self.mirror_nodes
    }

    /// 存储上下文
    pub fn storage(&self) -> &StorageContext {
        &self.storage
    }

    /// 当前索引结构快照
    pub fn index_struct_snapshot(&self) -> Result<MultimodalIndexStruct> {
        Ok(self.read_index_struct()?.clone())
    }

    fn primary_store(&self) -> Result<Arc<dyn VectorStore>> {
        self.storage
            .vector_stores()
            .get(DEFAULT_NAMESPACE)
            .cloned()
            .ok_or_else(|| AppError::internal("默认命名空间向量库缺失"))
    }

    fn image_store(&self) -> Result<Arc<dyn VectorStore>> {
        self.storage
            .vector_stores()
            .get(IMAGE_NAMESPACE)
            .cloned()
            .ok_or_else(|| AppError::internal("图像命名空间向量库缺失"))
    }

    fn read_index_struct(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, MultimodalIndexStruct>> {
        self.index_struct
            .read()
            .map_err(|_| AppError::internal("索引结构锁中毒"))
    }

    fn write_index_struct(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, MultimodalIndexStruct>> {
        self.index_struct
            .write()
            .map_err(|_| AppError::internal("索引结构锁中毒"))
    }

    // ========================================================================
    // 写入
    // ========================================================================

    /// 写入一批节点
    ///
    /// 空批次立即返回，不触碰任何存储。
    pub async fn insert(&self, nodes: Vec<Node>) -> Result<()> {
        if nodes.is_empty() {
            log::debug!("写入批次为空，跳过");
            return Ok(());
        }

        // 分流：图像节点进图像分区；携带非空文本的节点（含带说明的图像节点）进文本分区
        let mut image_nodes: Vec<Node> = Vec::new();
        let mut text_nodes: Vec<Node> = Vec::new();
        for node in &nodes {
            match node {
                Node::Image(_) => image_nodes.push(node.clone()),
                Node::Text(_) => {}
            }
            if node.has_text() {
                text_nodes.push(node.clone());
            }
        }

        log::info!(
            "📄 开始写入 {} 个节点 (文本通道 {}, 图像通道 {})",
            nodes.len(),
            text_nodes.len(),
            image_nodes.len()
        );

        // 文本通道：批量嵌入后写入默认命名空间（空分区不触碰存储）
        let embedded_text = self.embed_text_nodes(&text_nodes).await?;
        let text_ids = if embedded_text.is_empty() {
            Vec::new()
        } else {
            self.primary_store()?.add(&embedded_text).await?
        };

        // 图像通道：对原始图像节点批量嵌入后写入图像命名空间
        let embedded_images = self.embed_image_nodes(&image_nodes).await?;
        let image_ids = if embedded_images.is_empty() {
            Vec::new()
        } else {
            self.image_store()?.add(&embedded_images).await?
        };

        // 镜像：剥离向量的副本写入文档库，索引结构登记存储端 ID
        if self.mirror_nodes {
            let mut index_struct = self.write_index_struct()?;
            for (node, store_id) in embedded_text
                .iter()
                .zip(text_ids.iter())
                .chain(embedded_images.iter().zip(image_ids.iter()))
            {
                let stripped = node.without_embedding();
                index_struct.add_node(stripped.id(), store_id.clone());
                self.storage.doc_store().add_documents(&[stripped], true)?;
            }
            self.storage.index_store().persist(&index_struct)?;
        }

        log::info!(
            "✅ 写入完成: 文本通道 {} 条, 图像通道 {} 条",
            text_ids.len(),
            image_ids.len()
        );
        Ok(())
    }

    /// 写入一批节点（阻塞入口）
    ///
    /// 不能在异步运行时内调用。
    pub fn insert_blocking(&self, nodes: Vec<Node>) -> Result<()> {
        Self::block_on(self.insert(nodes))
    }

    /// 文本分区嵌入：构建节点 ID → 向量映射后立即消费
    async fn embed_text_nodes(&self, nodes: &[Node]) -> Result<Vec<Node>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = nodes
            .iter()
            .map(|n| n.text().unwrap_or_default().to_string())
            .collect();
        let vectors = self.text_embedder.embed_texts(&texts).await?;
        self.attach_embeddings(nodes, vectors)
    }

    /// 图像分区嵌入
    async fn embed_image_nodes(&self, nodes: &[Node]) -> Result<Vec<Node>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let images: Vec<_> = nodes
            .iter()
            .filter_map(|n| n.image().cloned())
            .collect();
        if images.len() != nodes.len() {
            return Err(AppError::internal("图像分区包含非图像节点"));
        }
        let vectors = self.image_embedder.embed_images(&images).await?;
        self.attach_embeddings(nodes, vectors)
    }

    /// 将向量按节点 ID 映射到新的节点副本上
    fn attach_embeddings(&self, nodes: &[Node], vectors: Vec<Vec<f32>>) -> Result<Vec<Node>> {
        if vectors.len() != nodes.len() {
            return Err(AppError::internal(format!(
                "嵌入结果数量不匹配: 期望 {}, 实际 {}",
                nodes.len(),
                vectors.len()
            )));
        }

        let mut id_to_embedding: HashMap<String, Vec<f32>> = nodes
            .iter()
            .map(|n| n.id().to_string())
            .zip(vectors)
            .collect();

        nodes
            .iter()
            .map(|node| {
                let embedding = id_to_embedding.remove(node.id()).ok_or_else(|| {
                    AppError::internal(format!("节点 {} 缺少嵌入结果", node.id()))
                })?;
                Ok(node.with_embedding(embedding))
            })
            .collect()
    }

    // ========================================================================
    // 删除
    // ========================================================================

    /// 删除逻辑文档
    ///
    /// 按注册顺序对所有命名空间向量库执行删除；镜像启用时根据文档库反向索引
    /// 逐节点清理索引结构与主向量库（兼容按节点粒度删除的后端）。
    /// 反向索引缺失视为无需进一步清理。结束时无条件持久化索引结构。
    ///
    /// ## 参数
    /// - `delete_from_docstore`: 是否同时移除文档库中的节点副本（幂等）
    pub async fn delete(&self, source_id: &str, delete_from_docstore: bool) -> Result<()> {
        log::info!("🗑️ 删除逻辑文档: {}", source_id);

        for (namespace, store) in self.storage.vector_stores().iter() {
            store.delete(source_id).await?;
            log::debug!("  [{}] 已执行删除", namespace);
        }

        if self.mirror_nodes {
            if let Some(ref_doc_info) = self.storage.doc_store().get_ref_doc_info(source_id)? {
                {
                    let mut index_struct = self.write_index_struct()?;
                    for node_id in &ref_doc_info.node_ids {
                        index_struct.delete(node_id);
                    }
                }
                let primary = self.primary_store()?;
                for node_id in &ref_doc_info.node_ids {
                    primary.delete(node_id).await?;
                }
                log::debug!(
                    "  清理 {} 个节点的索引结构与主向量库记录",
                    ref_doc_info.node_ids.len()
                );
            }
        }

        if delete_from_docstore {
            self.storage.doc_store().delete_ref_doc(source_id, false)?;
        }

        let index_struct = self.read_index_struct()?;
        self.storage.index_store().persist(&index_struct)?;

        log::info!("✅ 逻辑文档删除完成: {}", source_id);
        Ok(())
    }

    /// 删除逻辑文档（阻塞入口）
    ///
    /// 不能在异步运行时内调用。
    pub fn delete_blocking(&self, source_id: &str, delete_from_docstore: bool) -> Result<()> {
        Self::block_on(self.delete(source_id, delete_from_docstore))
    }

    // ========================================================================
    // 检索句柄
    // ========================================================================

    /// 创建检索句柄
    ///
    /// 检索执行委托给独立的查询组件，此处仅组装其依赖。
    pub fn as_retriever(&self, config: RetrieverConfig) -> Result<MultimodalRetriever> {
        Ok(MultimodalRetriever::new(
            self.text_embedder.clone(),
            self.image_embedder.clone(),
            self.primary_store()?,
            self.image_store()?,
            self.storage.doc_store().clone(),
            self.mirror_nodes,
            config,
        ))
    }

    /// 在独立的单线程运行时上执行异步入口
    fn block_on<F, T>(future: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(AppError::configuration(
                "阻塞入口不能在异步运行时内调用，请使用异步方法",
            ));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| AppError::internal(format!("创建运行时失败: {}", e)))?;
        runtime.block_on(future)
    }
}
