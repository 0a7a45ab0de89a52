//! SQLite 持久化层（sqlx，异步）
//!
//! 一个连接池承载全部表：会话、会话消息、任务、AgentRun、频道消息、摘要与摘要分节。
//! 表结构在连接时以 `CREATE TABLE IF NOT EXISTS` 建立。

pub mod digests;
pub mod messages;
pub mod runs;
mod schema;

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;

pub use digests::{Digest, DigestSection, DigestSelection, DigestSummary, DigestType, NewDigest};
pub use messages::{ChannelMessage, MessageFilter, NewChannelMessage};

/// 存储层错误
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("corrupted record: {0}")]
    Corrupted(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// 数据库句柄（可廉价 clone，内部是连接池）
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// 打开（必要时创建）数据库文件并建表
    pub async fn connect(db_path: impl AsRef<Path>, max_connections: u32) -> StorageResult<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&db_url)
            .await?;

        let db = Self { pool };
        schema::init(&db.pool).await?;
        tracing::info!(path = %db_path.as_ref().display(), "Database ready");
        Ok(db)
    }

    /// 内存数据库（单连接，测试与一次性 CLI 使用）
    pub async fn in_memory() -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        schema::init(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 关闭连接池（优雅关闭时调用）
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// 当前时间（毫秒时间戳），全库统一的时间表示
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_creates_file_and_schema() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let db = Database::connect(&path, 2).await.unwrap();
        assert!(path.exists());

        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
             ('sessions', 'session_messages', 'tasks', 'agent_runs', 'messages', 'digests', 'digest_sections')",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(row.0, 7);
    }

    #[tokio::test]
    async fn test_schema_init_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("twice.db");
        let first = Database::connect(&path, 1).await.unwrap();
        first.close().await;
        assert!(Database::connect(&path, 1).await.is_ok());
    }
}
