//! 多模态索引端到端测试
//!
//! 使用确定性嵌入器覆盖双通道写入、镜像一致性与删除清理的完整链路。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mm_index::{
    AppError, AppErrorType, Database, ImageNode, IndexerConfig, InMemoryVectorStore,
    MultimodalEmbedding, MultimodalIndexer, Node, NodeImage, RetrieverConfig, SqliteVectorStore,
    StorageContext, TextEmbedding, TextNode, DEFAULT_NAMESPACE, IMAGE_NAMESPACE,
};

const DIM: usize = 64;

/// 确定性嵌入器：向量由输入内容长度派生
struct StubEmbedder {
    text_calls: AtomicUsize,
    image_calls: AtomicUsize,
}

impl StubEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            text_calls: AtomicUsize::new(0),
            image_calls: AtomicUsize::new(0),
        })
    }

    fn vector(seed: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; DIM];
        v[0] = (seed % 97) as f32 + 1.0;
        v[1] = 1.0;
        v
    }
}

#[async_trait]
impl TextEmbedding for StubEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| Self::vector(t.bytes().map(usize::from).sum()))
            .collect())
    }
}

#[async_trait]
impl MultimodalEmbedding for StubEmbedder {
    fn supports_images(&self) -> bool {
        true
    }

    async fn embed_images(&self, images: &[NodeImage]) -> Result<Vec<Vec<f32>>, AppError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        Ok(images
            .iter()
            .map(|i| Self::vector(i.to_api_ref().len()))
            .collect())
    }
}

/// 无图像能力的嵌入器（配置校验用）
struct TextOnlyEmbedder;

#[async_trait]
impl TextEmbedding for TextOnlyEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        Ok(texts.iter().map(|t| StubEmbedder::vector(t.len())).collect())
    }
}

#[async_trait]
impl MultimodalEmbedding for TextOnlyEmbedder {
    fn supports_images(&self) -> bool {
        false
    }

    async fn embed_images(&self, _images: &[NodeImage]) -> Result<Vec<Vec<f32>>, AppError> {
        Err(AppError::configuration("无图像嵌入能力"))
    }
}

struct Fixture {
    indexer: MultimodalIndexer,
    primary: Arc<InMemoryVectorStore>,
    image: Arc<InMemoryVectorStore>,
    embedder: Arc<StubEmbedder>,
}

/// 默认环境：主/图像向量库均为内存实现（不保留文本 → 镜像启用）
fn fixture() -> Fixture {
    let embedder = StubEmbedder::new();
    let primary = Arc::new(InMemoryVectorStore::new());
    let image = Arc::new(InMemoryVectorStore::new());

    let database = Arc::new(Database::open_in_memory().unwrap());
    let storage = StorageContext::with_database(database)
        .with_vector_store(DEFAULT_NAMESPACE, primary.clone())
        .with_vector_store(IMAGE_NAMESPACE, image.clone());

    let indexer = MultimodalIndexer::new(
        storage,
        embedder.clone(),
        embedder.clone(),
        IndexerConfig::default(),
    )
    .unwrap();

    Fixture {
        indexer,
        primary,
        image,
        embedder,
    }
}

fn png_node(id: &str, source: &str) -> ImageNode {
    ImageNode::new(
        source,
        NodeImage::Base64 {
            data: "aGVsbG8gd29ybGQsIHRoaXMgaXMgYSBjYXQ=".into(),
            media_type: "image/png".into(),
        },
    )
    .with_id(id)
}

#[tokio::test]
async fn text_only_batch_never_touches_image_store() {
    let f = fixture();

    f.indexer
        .insert(vec![
            Node::Text(TextNode::new("doc_1", "hello").with_id("a")),
            Node::Text(TextNode::new("doc_1", "world").with_id("b")),
        ])
        .await
        .unwrap();

    assert_eq!(f.primary.len(), 2);
    assert!(f.image.is_empty());
    assert_eq!(f.embedder.image_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn image_only_batch_never_touches_primary_store() {
    let f = fixture();

    // 无说明文本的图像节点只走图像通道
    f.indexer
        .insert(vec![Node::Image(png_node("img_1", "doc_1"))])
        .await
        .unwrap();

    assert!(f.primary.is_empty());
    assert_eq!(f.image.len(), 1);
    assert!(f.image.contains("img_1"));
    // 文本分区为空时不触发文本嵌入调用
    assert_eq!(f.embedder.text_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn captioned_image_lands_in_both_stores() {
    let f = fixture();

    f.indexer
        .insert(vec![Node::Image(png_node("b", "doc_1").with_text("a cat"))])
        .await
        .unwrap();

    // 同一节点 ID 在两个通道各有一份副本，各自使用对应模型嵌入
    assert!(f.primary.contains("b"));
    assert!(f.image.contains("b"));
    assert_eq!(f.embedder.text_calls.load(Ordering::SeqCst), 1);
    assert_eq!(f.embedder.image_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mirror_holds_stripped_copy_and_store_id() {
    let f = fixture();

    f.indexer
        .insert(vec![Node::Text(TextNode::new("doc_1", "hello").with_id("a"))])
        .await
        .unwrap();

    // 文档库镜像：text="hello"、无嵌入向量
    let mirrored = f
        .indexer
        .storage()
        .doc_store()
        .get_node("a")
        .unwrap()
        .unwrap();
    assert_eq!(mirrored.text(), Some("hello"));
    assert!(mirrored.embedding().is_none());

    // 索引结构把节点映射到主向量库返回的存储端 ID
    let snapshot = f.indexer.index_struct_snapshot().unwrap();
    assert_eq!(snapshot.nodes_dict.get("a"), Some(&"a".to_string()));
}

#[tokio::test]
async fn mirrored_copies_never_carry_embedding() {
    let f = fixture();

    f.indexer
        .insert(vec![
            Node::Text(TextNode::new("doc_1", "hello").with_id("a")),
            Node::Image(png_node("b", "doc_1").with_text("a cat")),
        ])
        .await
        .unwrap();

    for node_id in ["a", "b"] {
        let mirrored = f
            .indexer
            .storage()
            .doc_store()
            .get_node(node_id)
            .unwrap()
            .unwrap();
        assert!(mirrored.embedding().is_none(), "节点 {} 镜像携带了向量", node_id);
    }
}

#[tokio::test]
async fn insert_then_delete_leaves_no_orphans() {
    let f = fixture();

    f.indexer
        .insert(vec![
            Node::Text(TextNode::new("doc_1", "hello").with_id("a")),
            Node::Image(png_node("b", "doc_1").with_text("a cat")),
            Node::Text(TextNode::new("doc_2", "keep me").with_id("c")),
        ])
        .await
        .unwrap();

    f.indexer.delete("doc_1", true).await.unwrap();

    // 两个向量库、文档库、索引结构中均无 doc_1 的残留
    assert!(!f.primary.contains("a"));
    assert!(!f.primary.contains("b"));
    assert!(!f.image.contains("b"));
    assert!(f
        .indexer
        .storage()
        .doc_store()
        .get_ref_doc_info("doc_1")
        .unwrap()
        .is_none());
    let snapshot = f.indexer.index_struct_snapshot().unwrap();
    assert!(!snapshot.contains("a"));
    assert!(!snapshot.contains("b"));

    // 其他逻辑文档不受影响
    assert!(f.primary.contains("c"));
    assert!(snapshot.contains("c"));
}

#[tokio::test]
async fn deleting_missing_source_is_noop() {
    let f = fixture();
    f.indexer.delete("missing_doc", true).await.unwrap();
    f.indexer.delete("missing_doc", false).await.unwrap();
}

#[tokio::test]
async fn text_retaining_primary_disables_mirror() {
    let embedder = StubEmbedder::new();
    let database = Arc::new(Database::open_in_memory().unwrap());
    let primary = Arc::new(SqliteVectorStore::new(database.clone(), DEFAULT_NAMESPACE).unwrap());
    let storage =
        StorageContext::with_database(database).with_vector_store(DEFAULT_NAMESPACE, primary);

    let indexer = MultimodalIndexer::new(
        storage,
        embedder.clone(),
        embedder,
        IndexerConfig::default(),
    )
    .unwrap();
    assert!(!indexer.mirror_nodes());

    indexer
        .insert(vec![Node::Text(TextNode::new("doc_1", "hello").with_id("a"))])
        .await
        .unwrap();

    // 主向量库保留文本，文档库与索引结构保持空白
    assert_eq!(indexer.storage().doc_store().count().unwrap(), 0);
    assert!(indexer.index_struct_snapshot().unwrap().is_empty());
}

#[tokio::test]
async fn force_mirror_overrides_text_retention() {
    let embedder = StubEmbedder::new();
    let database = Arc::new(Database::open_in_memory().unwrap());
    let primary = Arc::new(SqliteVectorStore::new(database.clone(), DEFAULT_NAMESPACE).unwrap());
    let storage =
        StorageContext::with_database(database).with_vector_store(DEFAULT_NAMESPACE, primary);

    let indexer = MultimodalIndexer::new(
        storage,
        embedder.clone(),
        embedder,
        IndexerConfig {
            index_id: None,
            force_mirror: true,
        },
    )
    .unwrap();
    assert!(indexer.mirror_nodes());

    indexer
        .insert(vec![Node::Text(TextNode::new("doc_1", "hello").with_id("a"))])
        .await
        .unwrap();
    assert_eq!(indexer.storage().doc_store().count().unwrap(), 1);
}

#[tokio::test]
async fn non_multimodal_embedder_rejected_before_any_store_write() {
    let text_embedder = StubEmbedder::new();
    let primary = Arc::new(InMemoryVectorStore::new());

    let database = Arc::new(Database::open_in_memory().unwrap());
    let storage = StorageContext::with_database(database)
        .with_vector_store(DEFAULT_NAMESPACE, primary.clone());

    let err = MultimodalIndexer::new(
        storage,
        text_embedder,
        Arc::new(TextOnlyEmbedder),
        IndexerConfig::default(),
    )
    .unwrap_err();

    assert!(matches!(err.error_type, AppErrorType::Configuration));
    assert!(primary.is_empty());
}

#[tokio::test]
async fn retriever_resolves_text_through_mirror() {
    let f = fixture();

    f.indexer
        .insert(vec![
            Node::Text(TextNode::new("doc_1", "hello").with_id("a")),
            Node::Image(png_node("b", "doc_1").with_text("a cat")),
        ])
        .await
        .unwrap();

    let retriever = f.indexer.as_retriever(RetrieverConfig::default()).unwrap();

    // 内存向量库不保留文本，内容经文档库镜像解析
    let results = retriever.retrieve("hello").await.unwrap();
    assert!(!results.is_empty());
    let top = &results[0];
    assert_eq!(top.node_id, "a");
    assert_eq!(top.text.as_deref(), Some("hello"));
    assert_eq!(top.source_id.as_deref(), Some("doc_1"));

    // 图像查询只命中图像命名空间
    let image_results = retriever
        .retrieve_images(&NodeImage::Base64 {
            data: "aGVsbG8gd29ybGQsIHRoaXMgaXMgYSBjYXQ=".into(),
            media_type: "image/png".into(),
        })
        .await
        .unwrap();
    assert_eq!(image_results.len(), 1);
    assert_eq!(image_results[0].node_id, "b");
}

#[tokio::test]
async fn store_ids_follow_input_order() {
    let f = fixture();

    let nodes: Vec<Node> = (0..10)
        .map(|i| Node::Text(TextNode::new("doc_1", format!("chunk {}", i)).with_id(format!("n{}", i))))
        .collect();
    f.indexer.insert(nodes).await.unwrap();

    let snapshot = f.indexer.index_struct_snapshot().unwrap();
    assert_eq!(snapshot.len(), 10);
    for i in 0..10 {
        let id = format!("n{}", i);
        assert_eq!(snapshot.nodes_dict.get(&id), Some(&id));
    }
}
