//! 数据库管理模块
//!
//! 提供索引元数据（文档库、索引结构、SQLite 向量表）的 SQLite 初始化和管理。
//! 使用 r2d2 连接池，支持并发访问。
//!
//! ## 设计原则
//! - **单一数据库**：文档库、索引结构与可选的 SQLite 向量表共用一个数据库文件
//! - **连接池管理**：使用 r2d2 管理连接池
//! - **内存模式**：测试/临时索引使用共享缓存内存库，所有池化连接可见同一数据

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::models::AppError;

type Result<T> = std::result::Result<T, AppError>;

/// SQLite 连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// SQLite 池化连接类型
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// 数据库管理器
///
/// 管理索引元数据的 SQLite 数据库（文件或共享缓存内存库）。
/// 支持：
/// - r2d2 连接池管理
/// - WAL 模式提升并发性能（仅文件模式）
/// - 建表语句幂等初始化
pub struct Database {
    /// 数据库连接池
    pool: DbPool,
    /// 数据库路径（内存模式下为 URI）
    db_path: PathBuf,
    /// 内存模式常驻连接
    ///
    /// 共享缓存内存库在最后一个连接关闭时销毁，因此必须保留一个
    /// 不经过连接池回收的常驻连接。
    _mem_keepalive: Option<Mutex<Connection>>,
}

impl Database {
    /// 打开（或创建）文件数据库
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("[Database] Opening index database: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::database(format!("创建数据库目录失败: {}", e)))?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            // 启用外键约束（必须！）
            conn.pragma_update(None, "foreign_keys", "ON")?;
            // 使用 WAL 模式提升并发性能
            conn.pragma_update(None, "journal_mode", "WAL")?;
            // 同步模式设为 NORMAL（平衡安全与性能）
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            // 设置 busy_timeout 避免无界等待
            conn.pragma_update(None, "busy_timeout", 5000i64)?;
            Ok(())
        });

        let pool = Self::build_pool(manager)?;

        let db = Self {
            pool,
            db_path: db_path.to_path_buf(),
            _mem_keepalive: None,
        };
        db.init_schema()?;

        info!(
            "[Database] Index database initialized successfully: {}",
            db.db_path.display()
        );
        Ok(db)
    }

    /// 打开共享缓存内存数据库
    ///
    /// 每次调用产生一个独立的内存库（URI 名称随机），
    /// 同一 Database 实例的所有池化连接共享数据。
    pub fn open_in_memory() -> Result<Self> {
        let uri = format!(
            "file:mm_index_{}?mode=memory&cache=shared",
            nanoid::nanoid!(8)
        );
        debug!("[Database] Opening in-memory database: {}", uri);

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        // 常驻连接先于连接池建立，保证内存库存活
        let keepalive = Connection::open_with_flags(&uri, flags)
            .map_err(|e| AppError::database(format!("打开内存数据库失败: {}", e)))?;

        let manager = SqliteConnectionManager::file(&uri)
            .with_flags(flags)
            .with_init(|conn| {
                conn.pragma_update(None, "foreign_keys", "ON")?;
                conn.pragma_update(None, "busy_timeout", 5000i64)?;
                Ok(())
            });

        let pool = Self::build_pool(manager)?;

        let db = Self {
            pool,
            db_path: PathBuf::from(uri),
            _mem_keepalive: Some(Mutex::new(keepalive)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// 构建连接池
    fn build_pool(manager: SqliteConnectionManager) -> Result<DbPool> {
        let pool = Pool::builder()
            .max_size(15) // SQLite 单写者模型下无需太多连接
            .min_idle(Some(2))
            .connection_timeout(Duration::from_secs(5))
            .max_lifetime(Some(Duration::from_secs(1800)))
            .idle_timeout(Some(Duration::from_secs(600)))
            .build(manager)
            .map_err(|e| AppError::database(format!("创建连接池失败: {}", e)))?;
        Ok(pool)
    }

    /// 幂等初始化表结构
    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS doc_nodes (
                node_id        TEXT PRIMARY KEY,
                source_id      TEXT NOT NULL,
                kind           TEXT NOT NULL,
                text_content   TEXT,
                image_json     TEXT,
                metadata_json  TEXT,
                content_hash   TEXT,
                created_at     INTEGER NOT NULL,
                updated_at     INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_doc_nodes_source
                ON doc_nodes (source_id);

            CREATE TABLE IF NOT EXISTS index_structs (
                index_id   TEXT PRIMARY KEY,
                data_json  TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;

        debug!("[Database] Schema initialized");
        Ok(())
    }

    /// 获取数据库连接
    pub fn get_conn(&self) -> Result<PooledConnection> {
        self.pool
            .get()
            .map_err(|e| AppError::database(format!("获取数据库连接失败: {}", e)))
    }

    /// 数据库路径（内存模式下为 URI）
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_schema_shared_across_connections() {
        let db = Database::open_in_memory().unwrap();

        // 两个池化连接必须看到同一份数据
        let conn1 = db.get_conn().unwrap();
        conn1
            .execute(
                "INSERT INTO index_structs (index_id, data_json, updated_at)
                 VALUES ('idx', '{}', 0)",
                [],
            )
            .unwrap();
        drop(conn1);

        let conn2 = db.get_conn().unwrap();
        let count: i64 = conn2
            .query_row("SELECT COUNT(*) FROM index_structs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("databases").join("index.db");
        let db = Database::open(&path).unwrap();
        assert!(db.db_path().exists());

        let conn = db.get_conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM doc_nodes", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
