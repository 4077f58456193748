//! 存储上下文模块
//!
//! 将文档库、索引结构仓库与命名空间向量库注册表捆绑为一个显式配置对象。
//! 注册表由索引写入层在构造时接管并持有其生命周期，不存在进程级全局状态。

use std::sync::Arc;

use crate::database::Database;
use crate::doc_store::DocumentStore;
use crate::index_struct::IndexStructRepo;
use crate::models::AppError;
use crate::vector_store::{InMemoryVectorStore, SqliteVectorStore, VectorStore};

type Result<T> = std::result::Result<T, AppError>;

/// 默认（文本）向量库命名空间
pub const DEFAULT_NAMESPACE: &str = "default";

/// 图像向量库命名空间
pub const IMAGE_NAMESPACE: &str = "image";

/// 命名空间 → 向量库注册表
///
/// 保持注册顺序，删除操作按此顺序扇出到所有命名空间。
#[derive(Default)]
pub struct VectorStoreRegistry {
    stores: Vec<(String, Arc<dyn VectorStore>)>,
}

impl VectorStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册向量库（同名覆盖）
    pub fn register(&mut self, namespace: impl Into<String>, store: Arc<dyn VectorStore>) {
        let namespace = namespace.into();
        if let Some(entry) = self.stores.iter_mut().find(|(ns, _)| *ns == namespace) {
            entry.1 = store;
        } else {
            self.stores.push((namespace, store));
        }
    }

    /// 按命名空间查找
    pub fn get(&self, namespace: &str) -> Option<&Arc<dyn VectorStore>> {
        self.stores
            .iter()
            .find(|(ns, _)| ns == namespace)
            .map(|(_, store)| store)
    }

    /// 是否已注册命名空间
    pub fn contains(&self, namespace: &str) -> bool {
        self.get(namespace).is_some()
    }

    /// 按注册顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn VectorStore>)> {
        self.stores.iter().map(|(ns, store)| (ns.as_str(), store))
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

/// 存储上下文
///
/// 索引写入层的全部存储依赖：共享数据库、文档库、索引结构仓库与向量库注册表。
pub struct StorageContext {
    database: Arc<Database>,
    doc_store: Arc<DocumentStore>,
    index_store: Arc<IndexStructRepo>,
    vector_stores: VectorStoreRegistry,
}

impl StorageContext {
    /// 默认配置：内存数据库 + 默认命名空间下的内存向量库
    ///
    /// 内存向量库不保留文本，写入层因此默认启用文档库镜像。
    pub fn from_defaults() -> Result<Self> {
        let database = Arc::new(Database::open_in_memory()?);
        let mut context = Self::with_database(database);
        context
            .vector_stores
            .register(DEFAULT_NAMESPACE, Arc::new(InMemoryVectorStore::new()));
        Ok(context)
    }

    /// 持久化配置：文件数据库 + 默认命名空间下的 SQLite 向量库
    pub fn persistent(db_path: &std::path::Path) -> Result<Self> {
        let database = Arc::new(Database::open(db_path)?);
        let default_store = Arc::new(SqliteVectorStore::new(database.clone(), DEFAULT_NAMESPACE)?);
        let mut context = Self::with_database(database);
        context.vector_stores.register(DEFAULT_NAMESPACE, default_store);
        Ok(context)
    }

    /// 基于已有数据库句柄组装（不注册任何向量库）
    pub fn with_database(database: Arc<Database>) -> Self {
        let doc_store = Arc::new(DocumentStore::new(database.clone()));
        let index_store = Arc::new(IndexStructRepo::new(database.clone()));
        Self {
            database,
            doc_store,
            index_store,
            vector_stores: VectorStoreRegistry::new(),
        }
    }

    /// 注册向量库（构造器风格）
    pub fn with_vector_store(
        mut self,
        namespace: impl Into<String>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        self.vector_stores.register(namespace, store);
        self
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn doc_store(&self) -> &Arc<DocumentStore> {
        &self.doc_store
    }

    pub fn index_store(&self) -> &Arc<IndexStructRepo> {
        &self.index_store
    }

    pub fn vector_stores(&self) -> &VectorStoreRegistry {
        &self.vector_stores
    }

    pub(crate) fn vector_stores_mut(&mut self) -> &mut VectorStoreRegistry {
        &mut self.vector_stores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_and_replace() {
        let mut registry = VectorStoreRegistry::new();
        registry.register(DEFAULT_NAMESPACE, Arc::new(InMemoryVectorStore::new()));
        registry.register(IMAGE_NAMESPACE, Arc::new(InMemoryVectorStore::new()));
        assert_eq!(registry.len(), 2);

        // 同名覆盖不追加
        registry.register(IMAGE_NAMESPACE, Arc::new(InMemoryVectorStore::new()));
        assert_eq!(registry.len(), 2);

        let namespaces: Vec<&str> = registry.iter().map(|(ns, _)| ns).collect();
        assert_eq!(namespaces, vec![DEFAULT_NAMESPACE, IMAGE_NAMESPACE]);
    }

    #[test]
    fn test_from_defaults_registers_default_store() {
        let context = StorageContext::from_defaults().unwrap();
        assert!(context.vector_stores().contains(DEFAULT_NAMESPACE));
        assert!(!context.vector_stores().contains(IMAGE_NAMESPACE));

        let store = context.vector_stores().get(DEFAULT_NAMESPACE).unwrap();
        assert!(!store.stores_text());
    }

    #[test]
    fn test_persistent_default_store_keeps_text() {
        let dir = tempfile::tempdir().unwrap();
        let context = StorageContext::persistent(&dir.path().join("index.db")).unwrap();
        let store = context.vector_stores().get(DEFAULT_NAMESPACE).unwrap();
        assert!(store.stores_text());
    }
}
