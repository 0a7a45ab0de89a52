//! 任务队列
//!
//! 入口事件与定时任务都以 [`Task`] 的形式提交，由 [`TaskExecutor`] 按优先级取出交给编排器执行。
//!
//! 核心功能：
//! - 严格的状态机：Pending -> Running -> Succeeded / Failed
//! - 每个会话同一时刻至多一个未结束任务
//! - 任务依赖、优先级打分、超时与重试
//! - SQLite 持久化，重启后恢复
//! - 完成通知

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::QueueSection;
use crate::core::recovery::backoff_delay;
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::storage::{now_millis, Database, DigestSelection, StorageError};

/// 任务 ID
pub type TaskId = String;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CLEANUP_HOURS: u64 = 24;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// 等待执行
    Pending,
    /// 正在执行（含重试）
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Self::Pending),
            "Running" => Some(Self::Running),
            "Succeeded" => Some(Self::Succeeded),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// 仅允许 Pending -> Running、Running -> Succeeded、Running -> Failed
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running) | (Self::Running, Self::Succeeded) | (Self::Running, Self::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TaskPriority {
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Low,
            3 => Self::High,
            4 => Self::Critical,
            _ => Self::Normal,
        }
    }
}

/// 任务内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// 用户提问（推理循环）
    Question { text: String },
    /// 运行场景
    Scenario {
        scenario: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    /// `/period` 摘要
    PeriodDigest {
        start: NaiveDate,
        end: NaiveDate,
        digest_type: DigestSelection,
    },
    Collect { days_back: u32 },
    Analyze { limit: u32, batch_size: usize },
    Review { threshold: u8, limit: u32 },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Question { .. } => "question",
            Self::Scenario { .. } => "scenario",
            Self::PeriodDigest { .. } => "period_digest",
            Self::Collect { .. } => "collect",
            Self::Analyze { .. } => "analyze",
            Self::Review { .. } => "review",
        }
    }

    /// /status 中显示的描述
    pub fn describe(&self) -> String {
        match self {
            Self::Question { text } => format!("ответ на вопрос «{}»", crate::utils::preview(text, 40)),
            Self::Scenario { scenario, .. } => format!("сценарий {scenario}"),
            Self::PeriodDigest { start, end, .. } => format!("дайджест за {start} - {end}"),
            Self::Collect { days_back } => format!("сбор сообщений за {days_back} дн."),
            Self::Analyze { limit, .. } => format!("анализ до {limit} сообщений"),
            Self::Review { threshold, .. } => format!("проверка категорий (порог {threshold})"),
        }
    }
}

/// 任务结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// 面向用户的文本
    pub text: String,
    /// 结构化附加数据（报告等）
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl TaskOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// 队列中的任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub session_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// 已开始的尝试次数
    pub attempts: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub depends_on: Vec<TaskId>,
    pub result: Option<TaskOutput>,
    pub error: Option<String>,
    /// 需要通知的聊天
    pub reply_to: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Task {
    pub fn new(session_id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            kind,
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            depends_on: Vec::new(),
            result: None,
            error: None,
            reply_to: None,
            created_at: now_millis(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_reply_to(mut self, chat_id: Option<i64>) -> Self {
        self.reply_to = chat_id;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// 采用配置中的超时与重试次数
    pub fn with_limits(self, cfg: &QueueSection) -> Self {
        self.with_timeout(cfg.task_timeout_secs).with_max_retries(cfg.max_retries)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// priority * 1000 + min(age_minutes, 100) - attempts * 50
    pub fn score(&self, now: i64) -> i64 {
        let age_minutes = ((now - self.created_at).max(0) / 60_000).min(100);
        self.priority as i64 * 1000 + age_minutes - self.attempts as i64 * 50
    }
}

/// 队列错误
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("session {session_id} already has an active task {active}")]
    SessionBusy { session_id: String, active: TaskId },

    #[error("unknown dependency: {0}")]
    UnknownDependency(TaskId),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition { id: TaskId, from: TaskStatus, to: TaskStatus },

    #[error("queue storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(StorageError::Database(e))
    }
}

/// 任务结束通知
#[derive(Debug, Clone)]
pub struct TaskNotification {
    pub task_id: TaskId,
    pub session_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub reply_to: Option<i64>,
    pub result: Option<TaskOutput>,
    pub error: Option<String>,
}

/// 队列统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    /// 依赖未满足的 pending
    pub blocked: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

fn transition(task: &mut Task, to: TaskStatus) -> Result<(), QueueError> {
    if !task.status.can_transition_to(to) {
        return Err(QueueError::InvalidTransition {
            id: task.id.clone(),
            from: task.status,
            to,
        });
    }
    task.status = to;
    match to {
        TaskStatus::Running => task.started_at = Some(now_millis()),
        TaskStatus::Succeeded | TaskStatus::Failed => task.completed_at = Some(now_millis()),
        TaskStatus::Pending => {}
    }
    Ok(())
}

/// 任务队列（内存索引 + 可选 SQLite 持久化）
pub struct TaskQueue {
    tasks: RwLock<HashMap<TaskId, Task>>,
    /// Running 任务的取消令牌
    cancel_tokens: Mutex<HashMap<TaskId, CancellationToken>>,
    /// 唤醒执行器
    wakeup: Notify,
    notification_tx: mpsc::UnboundedSender<TaskNotification>,
    db: Option<Database>,
}

impl TaskQueue {
    /// 创建内存版任务队列
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskNotification>) {
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        (
            Self {
                tasks: RwLock::new(HashMap::new()),
                cancel_tokens: Mutex::new(HashMap::new()),
                wakeup: Notify::new(),
                notification_tx,
                db: None,
            },
            notification_rx,
        )
    }

    /// 创建持久化版任务队列并恢复未完成任务
    pub async fn with_persistence(
        db: Database,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TaskNotification>), QueueError> {
        let (mut queue, notification_rx) = Self::new();
        queue.db = Some(db);
        queue.restore().await?;
        Ok((queue, notification_rx))
    }

    /// 从数据库恢复：Pending 继续排队，遗留的 Running 记为失败
    async fn restore(&self) -> Result<(), QueueError> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        let rows = sqlx::query(
            "SELECT id, session_id, kind, status, priority, attempts, max_retries, timeout_secs, depends_on,
                    reply_to, result, error, created_at, started_at, completed_at
             FROM tasks ORDER BY created_at ASC",
        )
        .fetch_all(db.pool())
        .await?;

        let mut restored = Vec::with_capacity(rows.len());
        for row in &rows {
            match row_to_task(row) {
                Ok(task) => restored.push(task),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable task row"),
            }
        }

        let mut pending = 0;
        let mut interrupted = Vec::new();
        let mut tasks = self.tasks.write().await;
        for mut task in restored {
            match task.status {
                TaskStatus::Pending => pending += 1,
                TaskStatus::Running => {
                    transition(&mut task, TaskStatus::Failed)?;
                    task.error = Some("interrupted by restart".to_string());
                    interrupted.push(task.clone());
                }
                TaskStatus::Succeeded | TaskStatus::Failed => {}
            }
            tasks.insert(task.id.clone(), task);
        }
        drop(tasks);

        for task in &interrupted {
            self.persist_or_log(task).await;
            self.notify_finished(task);
        }

        if pending > 0 || !interrupted.is_empty() {
            tracing::info!(pending, interrupted = interrupted.len(), "Restored tasks from database");
            self.wakeup.notify_one();
        }
        Ok(())
    }

    /// 状态已在内存中生效后的持久化：失败只记日志，不打断认领与通知
    async fn persist_or_log(&self, task: &Task) {
        if let Err(e) = self.persist(task).await {
            tracing::error!(task_id = %task.id, status = %task.status, error = %e, "Failed to persist task");
        }
    }

    async fn persist(&self, task: &Task) -> Result<(), QueueError> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        let kind = serde_json::to_string(&task.kind).map_err(StorageError::from)?;
        let depends_on = serde_json::to_string(&task.depends_on).map_err(StorageError::from)?;
        let result = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(StorageError::from)?;

        sqlx::query(
            "INSERT OR REPLACE INTO tasks
             (id, session_id, kind, status, priority, attempts, max_retries, timeout_secs, depends_on,
              reply_to, result, error, created_at, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.session_id)
        .bind(&kind)
        .bind(task.status.as_str())
        .bind(task.priority as i64)
        .bind(task.attempts as i64)
        .bind(task.max_retries as i64)
        .bind(task.timeout_secs as i64)
        .bind(&depends_on)
        .bind(task.reply_to)
        .bind(&result)
        .bind(&task.error)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(db.pool())
        .await?;
        Ok(())
    }

    fn notify_finished(&self, task: &Task) {
        let notification = TaskNotification {
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            kind: task.kind.clone(),
            status: task.status,
            reply_to: task.reply_to,
            result: task.result.clone(),
            error: task.error.clone(),
        };
        let _ = self.notification_tx.send(notification);
    }

    /// 提交新任务
    pub async fn submit(&self, mut task: Task) -> Result<TaskId, QueueError> {
        let mut tasks = self.tasks.write().await;

        if let Some(active) = tasks
            .values()
            .find(|t| t.session_id == task.session_id && !t.is_terminal())
        {
            return Err(QueueError::SessionBusy {
                session_id: task.session_id.clone(),
                active: active.id.clone(),
            });
        }
        if let Some(missing) = task.depends_on.iter().find(|d| !tasks.contains_key(*d)) {
            return Err(QueueError::UnknownDependency(missing.clone()));
        }

        task.status = TaskStatus::Pending;
        self.persist(&task).await?;

        let task_id = task.id.clone();
        tracing::info!(
            task_id = %task_id,
            session_id = %task.session_id,
            kind = task.kind.name(),
            priority = ?task.priority,
            "Task submitted"
        );
        tasks.insert(task_id.clone(), task);
        drop(tasks);

        self.wakeup.notify_one();
        Ok(task_id)
    }

    /// 取出得分最高的可执行任务并置为 Running
    ///
    /// 依赖失败的 Pending 任务在此被判定失败。
    pub async fn claim_next(&self) -> Result<Option<Task>, QueueError> {
        let now = now_millis();
        let mut tasks = self.tasks.write().await;

        // 依赖失败 -> 连带失败
        let doomed: Vec<(TaskId, TaskId)> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter_map(|t| {
                t.depends_on
                    .iter()
                    .find(|d| tasks.get(*d).is_some_and(|dep| dep.status == TaskStatus::Failed))
                    .map(|d| (t.id.clone(), d.clone()))
            })
            .collect();
        let mut failed = Vec::new();
        for (id, dep) in doomed {
            if let Some(task) = tasks.get_mut(&id) {
                transition(task, TaskStatus::Running)?;
                transition(task, TaskStatus::Failed)?;
                task.error = Some(format!("dependency {dep} failed"));
                failed.push(task.clone());
            }
        }

        let running_sessions: HashSet<&str> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.session_id.as_str())
            .collect();

        let best = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| !running_sessions.contains(t.session_id.as_str()))
            .filter(|t| dependencies_met(t, &tasks))
            .max_by(|a, b| {
                a.score(now)
                    .cmp(&b.score(now))
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|t| t.id.clone());

        let claimed = match best {
            Some(id) => match tasks.get_mut(&id) {
                Some(task) => {
                    transition(task, TaskStatus::Running)?;
                    self.cancel_tokens
                        .lock()
                        .await
                        .insert(task.id.clone(), CancellationToken::new());
                    Some(task.clone())
                }
                None => None,
            },
            None => None,
        };
        drop(tasks);

        for task in &failed {
            tracing::warn!(task_id = %task.id, error = ?task.error, "Task failed on dependency");
            self.persist_or_log(task).await;
            self.notify_finished(task);
        }

        if let Some(task) = &claimed {
            self.persist_or_log(task).await;
            tracing::debug!(task_id = %task.id, kind = task.kind.name(), "Task claimed");
        }
        Ok(claimed)
    }

    /// 运行中任务开始新一次尝试，返回尝试序号（从 1 开始）
    pub async fn record_attempt(&self, task_id: &str) -> Result<u32, QueueError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Running {
            return Err(QueueError::InvalidTransition {
                id: task.id.clone(),
                from: task.status,
                to: TaskStatus::Running,
            });
        }
        task.attempts += 1;
        let attempts = task.attempts;
        let snapshot = task.clone();
        drop(tasks);
        self.persist_or_log(&snapshot).await;
        Ok(attempts)
    }

    async fn finish(&self, task_id: &str, to: TaskStatus, apply: impl FnOnce(&mut Task)) -> Result<(), QueueError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        transition(task, to)?;
        apply(task);
        let snapshot = task.clone();
        drop(tasks);

        self.cancel_tokens.lock().await.remove(task_id);
        self.persist_or_log(&snapshot).await;
        self.notify_finished(&snapshot);
        // 下游依赖可能已就绪
        self.wakeup.notify_one();
        Ok(())
    }

    /// Running -> Succeeded
    pub async fn complete(&self, task_id: &str, output: TaskOutput) -> Result<(), QueueError> {
        self.finish(task_id, TaskStatus::Succeeded, |t| t.result = Some(output))
            .await?;
        tracing::info!(task_id, "Task succeeded");
        Ok(())
    }

    /// Running -> Failed
    pub async fn fail(&self, task_id: &str, error: impl Into<String>) -> Result<(), QueueError> {
        let error = error.into();
        tracing::warn!(task_id, error = %error, "Task failed");
        self.finish(task_id, TaskStatus::Failed, |t| t.error = Some(error)).await
    }

    /// 取消任务：Pending 直接失败，Running 触发取消令牌；已结束返回 false
    pub async fn cancel(&self, task_id: &str) -> Result<bool, QueueError> {
        let status = match self.tasks.read().await.get(task_id) {
            Some(task) => task.status,
            None => return Ok(false),
        };

        match status {
            TaskStatus::Pending => {
                {
                    let mut tasks = self.tasks.write().await;
                    match tasks.get_mut(task_id) {
                        Some(task) if task.status == TaskStatus::Pending => transition(task, TaskStatus::Running)?,
                        _ => return Ok(false),
                    }
                }
                self.fail(task_id, "cancelled").await?;
                Ok(true)
            }
            TaskStatus::Running => {
                match self.cancel_tokens.lock().await.get(task_id) {
                    Some(token) => {
                        token.cancel();
                        tracing::info!(task_id, "Cancellation requested");
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            TaskStatus::Succeeded | TaskStatus::Failed => Ok(false),
        }
    }

    /// 运行中任务的取消令牌
    pub async fn cancel_token(&self, task_id: &str) -> Option<CancellationToken> {
        self.cancel_tokens.lock().await.get(task_id).cloned()
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// 会话的全部任务（按创建时间）
    pub async fn session_tasks(&self, session_id: &str) -> Vec<Task> {
        let mut list: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        list.sort_by_key(|t| t.created_at);
        list
    }

    /// 会话当前未结束的任务
    pub async fn active_for_session(&self, session_id: &str) -> Option<Task> {
        self.tasks
            .read()
            .await
            .values()
            .find(|t| t.session_id == session_id && !t.is_terminal())
            .cloned()
    }

    pub async fn stats(&self) -> QueueStats {
        let tasks = self.tasks.read().await;
        let mut stats = QueueStats::default();
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => {
                    stats.pending += 1;
                    if !dependencies_met(task, &tasks) {
                        stats.blocked += 1;
                    }
                }
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Succeeded => stats.succeeded += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// 清理结束超过 max_age_hours 的任务
    pub async fn cleanup(&self, max_age_hours: u64) -> Result<usize, QueueError> {
        let cutoff = now_millis() - max_age_hours as i64 * 3600 * 1000;

        let mut tasks = self.tasks.write().await;
        let old_ids: Vec<TaskId> = tasks
            .values()
            .filter(|t| t.is_terminal() && t.completed_at.is_some_and(|c| c < cutoff))
            .map(|t| t.id.clone())
            .collect();
        for id in &old_ids {
            tasks.remove(id);
        }
        drop(tasks);

        if let Some(db) = &self.db {
            sqlx::query("DELETE FROM tasks WHERE status IN ('Succeeded', 'Failed') AND completed_at < ?")
                .bind(cutoff)
                .execute(db.pool())
                .await?;
        }

        if !old_ids.is_empty() {
            tracing::info!(removed = old_ids.len(), "Cleaned up finished tasks");
        }
        Ok(old_ids.len())
    }

    /// 等待新任务或状态变化
    pub async fn wait_for_work(&self) {
        self.wakeup.notified().await;
    }
}

/// 依赖全部成功（已被清理的依赖视为满足）
fn dependencies_met(task: &Task, tasks: &HashMap<TaskId, Task>) -> bool {
    task.depends_on
        .iter()
        .all(|d| tasks.get(d).map_or(true, |dep| dep.status == TaskStatus::Succeeded))
}

fn row_to_task(row: &SqliteRow) -> Result<Task, StorageError> {
    let status_raw: String = row.get("status");
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| StorageError::Corrupted(format!("tasks.status = {status_raw}")))?;
    let kind: TaskKind = serde_json::from_str(&row.get::<String, _>("kind"))?;
    let depends_on: Vec<TaskId> = serde_json::from_str(&row.get::<String, _>("depends_on"))?;
    let result = row
        .get::<Option<String>, _>("result")
        .map(|s| serde_json::from_str::<TaskOutput>(&s))
        .transpose()?;

    Ok(Task {
        id: row.get("id"),
        session_id: row.get("session_id"),
        kind,
        status,
        priority: TaskPriority::from_i64(row.get("priority")),
        attempts: row.get::<i64, _>("attempts") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        timeout_secs: row.get::<i64, _>("timeout_secs") as u64,
        depends_on,
        result,
        error: row.get("error"),
        reply_to: row.get("reply_to"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

/// 任务处理器（由编排器实现）
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// `task.attempts` 为当前尝试序号
    async fn handle(&self, task: &Task, cancel: CancellationToken) -> Result<TaskOutput, AgentError>;

    /// 执行器因超时、取消或关闭丢弃了本次尝试
    async fn abandoned(&self, _task: &Task, _error: &AgentError) {}
}

/// 任务执行器：信号量限流，单次尝试带超时，失败按退避重试
pub struct TaskExecutor {
    queue: Arc<TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    max_concurrent: usize,
    recovery: Arc<RecoveryEngine>,
}

impl TaskExecutor {
    pub fn new(queue: Arc<TaskQueue>, handler: Arc<dyn TaskHandler>, max_concurrent: usize) -> Self {
        Self {
            queue,
            handler,
            max_concurrent: max_concurrent.max(1),
            recovery: Arc::new(RecoveryEngine::new()),
        }
    }

    /// 启动执行器，直到 shutdown 被触发
    pub async fn run(self, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        tracing::info!(max_concurrent = self.max_concurrent, "Task executor started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let task = loop {
                match self.queue.claim_next().await {
                    Ok(Some(task)) => break Some(task),
                    Ok(None) => {}
                    Err(e) => tracing::error!(error = %e, "Failed to claim task"),
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break None,
                    _ = self.queue.wait_for_work() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            };
            let Some(task) = task else { break };

            let queue = Arc::clone(&self.queue);
            let handler = Arc::clone(&self.handler);
            let recovery = Arc::clone(&self.recovery);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _permit = permit;
                run_task(queue, handler, recovery, task, shutdown).await;
            });
        }

        tracing::info!("Task executor stopped");
    }
}

async fn run_task(
    queue: Arc<TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    recovery: Arc<RecoveryEngine>,
    task: Task,
    shutdown: CancellationToken,
) {
    let mut task = task;
    let task_id = task.id.clone();
    let cancel = queue.cancel_token(&task_id).await.unwrap_or_default();
    let limit = Duration::from_secs(task.timeout_secs.max(1));

    let outcome: Result<TaskOutput, String> = loop {
        let attempt = match queue.record_attempt(&task_id).await {
            Ok(n) => n,
            Err(e) => break Err(e.to_string()),
        };
        task.attempts = attempt;
        tracing::info!(task_id = %task_id, kind = task.kind.name(), attempt, "Task attempt started");

        let abandoned = tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            _ = shutdown.cancelled() => Err(AgentError::Cancelled),
            r = tokio::time::timeout(limit, handler.handle(&task, cancel.clone())) => match r {
                Ok(r) => Ok(r),
                Err(_) => Err(AgentError::Timeout(task.timeout_secs)),
            },
        };
        let result = match abandoned {
            Ok(r) => r,
            Err(e) => {
                handler.abandoned(&task, &e).await;
                Err(e)
            }
        };

        let err = match result {
            Ok(output) => break Ok(output),
            Err(AgentError::Cancelled) => break Err("cancelled".to_string()),
            Err(e) => e,
        };

        if attempt > task.max_retries {
            break Err(err.to_string());
        }
        let delay = match recovery.handle(&err, attempt) {
            RecoveryAction::Abort => break Err(err.to_string()),
            RecoveryAction::RetryAfter(d) => d,
            RecoveryAction::RetryWithPrompt(_) => backoff_delay(attempt),
        };
        tracing::warn!(task_id = %task_id, attempt, error = %err, delay_secs = delay.as_secs(), "Task attempt failed, retrying");

        tokio::select! {
            _ = cancel.cancelled() => break Err("cancelled".to_string()),
            _ = shutdown.cancelled() => break Err("cancelled".to_string()),
            _ = tokio::time::sleep(delay) => {}
        }
    };

    let finished = match outcome {
        Ok(output) => queue.complete(&task_id, output).await,
        Err(error) => queue.fail(&task_id, error).await,
    };
    if let Err(e) = finished {
        tracing::error!(task_id = %task_id, error = %e, "Failed to record task outcome");
    }
}
