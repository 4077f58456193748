// mm-index library entry
// 多模态向量索引：文本/图像双通道嵌入与存储编排。
// 节点按类型分流到各自的嵌入模型与向量库命名空间；
// 主向量库不保留文本时，文档库与索引结构维护剥离向量的镜像。

// 声明所有子模块，以便在 crate 内可见
pub mod database;
pub mod doc_store;
pub mod embedding_service;
pub mod index_struct;
pub mod indexer;
pub mod models;
pub mod retriever;
pub mod storage;
pub mod types;
pub mod vector_store;

// 重新导出常用类型
pub use database::Database;
pub use doc_store::DocumentStore;
pub use embedding_service::{
    ApiEmbeddingService, EmbeddingServiceConfig, MultimodalEmbedding, TextEmbedding,
};
pub use index_struct::{IndexStructRepo, MultimodalIndexStruct};
pub use indexer::{IndexerConfig, MultimodalIndexer};
pub use models::{AppError, AppErrorType};
pub use retriever::{MultimodalRetriever, RetrieverConfig};
pub use storage::{StorageContext, VectorStoreRegistry, DEFAULT_NAMESPACE, IMAGE_NAMESPACE};
pub use types::{ImageNode, Node, NodeImage, RefDocInfo, ScoredNode, TextNode};
pub use vector_store::{InMemoryVectorStore, QueryMatch, SqliteVectorStore, VectorStore};
