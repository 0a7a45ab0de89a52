//! 会话存储抽象层
//!
//! 统一的会话管理接口，内存与 SQLite 两种实现

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;

use super::session::{Session, SessionId, SessionMessage};
use crate::gateway::task_queue::TaskId;
use crate::memory::{Message, Role};
use crate::storage::{now_millis, Database, StorageError};

/// 会话层错误
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for SessionError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(StorageError::Database(e))
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 获取或创建会话；已归档的会话被重新激活
    async fn get_or_create(&self, user_id: &str, chat_id: Option<i64>, display_name: &str) -> SessionResult<Session>;

    async fn get(&self, session_id: &str) -> SessionResult<Option<Session>>;

    /// 追加一条历史消息并刷新 updated_at
    async fn append_message(&self, session_id: &str, message: Message) -> SessionResult<()>;

    /// 最近 limit 条消息（旧 -> 新）
    async fn history(&self, session_id: &str, limit: usize) -> SessionResult<Vec<Message>>;

    async fn set_active_task(&self, session_id: &str, task_id: Option<TaskId>) -> SessionResult<()>;

    /// 仅当当前活动任务等于 expected 时替换为 task_id，返回是否替换
    async fn swap_active_task(
        &self,
        session_id: &str,
        expected: Option<&str>,
        task_id: Option<TaskId>,
    ) -> SessionResult<bool>;

    async fn archive(&self, session_id: &str) -> SessionResult<()>;

    /// 归档空闲超过 max_idle_secs 且无活动任务的会话
    async fn archive_idle(&self, max_idle_secs: u64) -> SessionResult<usize>;

    /// 未归档会话数
    async fn active_count(&self) -> SessionResult<usize>;
}

/// 内存会话存储（测试与一次性运行）
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
    max_history: usize,
}

impl MemorySessionStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_history: max_history.max(1),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_or_create(&self, user_id: &str, chat_id: Option<i64>, display_name: &str) -> SessionResult<Session> {
        let mut sessions = self.sessions.write().await;
        let fresh = Session::new(user_id, chat_id, display_name);
        let session = sessions.entry(fresh.id.clone()).or_insert(fresh);
        if session.archived {
            tracing::debug!(session_id = %session.id, "Reviving archived session");
            session.archived = false;
        }
        if !display_name.is_empty() {
            session.display_name = display_name.to_string();
        }
        session.touch();
        Ok(session.clone())
    }

    async fn get(&self, session_id: &str) -> SessionResult<Option<Session>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn append_message(&self, session_id: &str, message: Message) -> SessionResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.push(message);
        let overflow = session.history.len().saturating_sub(self.max_history);
        if overflow > 0 {
            session.history.drain(..overflow);
        }
        Ok(())
    }

    async fn history(&self, session_id: &str, limit: usize) -> SessionResult<Vec<Message>> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        Ok(session.recent(limit))
    }

    async fn set_active_task(&self, session_id: &str, task_id: Option<TaskId>) -> SessionResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.active_task = task_id;
        session.touch();
        Ok(())
    }

    async fn swap_active_task(
        &self,
        session_id: &str,
        expected: Option<&str>,
        task_id: Option<TaskId>,
    ) -> SessionResult<bool> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if session.active_task.as_deref() != expected {
            return Ok(false);
        }
        session.active_task = task_id;
        session.touch();
        Ok(true)
    }

    async fn archive(&self, session_id: &str) -> SessionResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.archived = true;
        Ok(())
    }

    async fn archive_idle(&self, max_idle_secs: u64) -> SessionResult<usize> {
        let now = now_millis();
        let max_idle = max_idle_secs as i64 * 1000;
        let mut sessions = self.sessions.write().await;
        let mut count = 0;
        for session in sessions.values_mut() {
            if !session.archived && !session.is_busy() && session.idle_millis(now) > max_idle {
                session.archived = true;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn active_count(&self) -> SessionResult<usize> {
        Ok(self.sessions.read().await.values().filter(|s| !s.archived).count())
    }
}

/// SQLite 会话存储
pub struct SqliteSessionStore {
    db: Database,
    max_history: usize,
}

impl SqliteSessionStore {
    pub fn new(db: Database, max_history: usize) -> Self {
        Self {
            db,
            max_history: max_history.max(1),
        }
    }

    fn row_to_session(row: &SqliteRow) -> Session {
        Session {
            id: row.get("id"),
            user_id: row.get("user_id"),
            chat_id: row.get("chat_id"),
            display_name: row.get("display_name"),
            history: Vec::new(),
            active_task: row.get("active_task"),
            archived: row.get::<i64, _>("archived") != 0,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    async fn load_history(&self, session_id: &str, limit: usize) -> SessionResult<Vec<SessionMessage>> {
        let rows = sqlx::query(
            "SELECT role, content, created_at FROM session_messages
             WHERE session_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;

        let mut history = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            let raw: String = row.get("role");
            let role = Role::parse(&raw)
                .ok_or_else(|| StorageError::Corrupted(format!("session_messages.role = {raw}")))?;
            history.push(SessionMessage {
                message: Message {
                    role,
                    content: row.get("content"),
                },
                at: row.get("created_at"),
            });
        }
        Ok(history)
    }

    async fn ensure_exists(&self, session_id: &str) -> SessionResult<()> {
        let found: Option<(String,)> = sqlx::query_as("SELECT id FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(self.db.pool())
            .await?;
        match found {
            Some(_) => Ok(()),
            None => Err(SessionError::NotFound(session_id.to_string())),
        }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get_or_create(&self, user_id: &str, chat_id: Option<i64>, display_name: &str) -> SessionResult<Session> {
        let fresh = Session::new(user_id, chat_id, display_name);
        let now = now_millis();

        sqlx::query(
            "INSERT INTO sessions (id, user_id, chat_id, display_name, active_task, archived, created_at, updated_at)
             VALUES (?, ?, ?, ?, NULL, 0, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                archived = 0,
                display_name = CASE WHEN excluded.display_name = '' THEN sessions.display_name ELSE excluded.display_name END,
                updated_at = excluded.updated_at",
        )
        .bind(&fresh.id)
        .bind(user_id)
        .bind(chat_id)
        .bind(display_name)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        self.get(&fresh.id)
            .await?
            .ok_or_else(|| SessionError::NotFound(fresh.id.clone()))
    }

    async fn get(&self, session_id: &str) -> SessionResult<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, user_id, chat_id, display_name, active_task, archived, created_at, updated_at
             FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            Some(row) => {
                let mut session = Self::row_to_session(&row);
                session.history = self.load_history(session_id, self.max_history).await?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn append_message(&self, session_id: &str, message: Message) -> SessionResult<()> {
        let now = now_millis();
        let mut tx = self.db.pool().begin().await?;

        let updated = sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        sqlx::query("INSERT INTO session_messages (session_id, role, content, created_at) VALUES (?, ?, ?, ?)")
            .bind(session_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn history(&self, session_id: &str, limit: usize) -> SessionResult<Vec<Message>> {
        self.ensure_exists(session_id).await?;
        Ok(self
            .load_history(session_id, limit)
            .await?
            .into_iter()
            .map(|m| m.message)
            .collect())
    }

    async fn set_active_task(&self, session_id: &str, task_id: Option<TaskId>) -> SessionResult<()> {
        let result = sqlx::query("UPDATE sessions SET active_task = ?, updated_at = ? WHERE id = ?")
            .bind(&task_id)
            .bind(now_millis())
            .bind(session_id)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn swap_active_task(
        &self,
        session_id: &str,
        expected: Option<&str>,
        task_id: Option<TaskId>,
    ) -> SessionResult<bool> {
        let result = sqlx::query("UPDATE sessions SET active_task = ?, updated_at = ? WHERE id = ? AND active_task IS ?")
            .bind(&task_id)
            .bind(now_millis())
            .bind(session_id)
            .bind(expected)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            self.ensure_exists(session_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn archive(&self, session_id: &str) -> SessionResult<()> {
        let result = sqlx::query("UPDATE sessions SET archived = 1 WHERE id = ?")
            .bind(session_id)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn archive_idle(&self, max_idle_secs: u64) -> SessionResult<usize> {
        let cutoff = now_millis() - max_idle_secs as i64 * 1000;
        let result = sqlx::query(
            "UPDATE sessions SET archived = 1
             WHERE archived = 0 AND active_task IS NULL AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn active_count(&self) -> SessionResult<usize> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE archived = 0")
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.0 as usize)
    }
}

/// 创建会话存储：有数据库时用 SQLite，否则用内存
pub fn create_session_store(db: Option<Database>, max_history: usize) -> Arc<dyn SessionStore> {
    match db {
        Some(db) => {
            tracing::info!("Using SQLite session store");
            Arc::new(SqliteSessionStore::new(db, max_history))
        }
        None => {
            tracing::info!("Using in-memory session store");
            Arc::new(MemorySessionStore::new(max_history))
        }
    }
}
