//! 网关：入站请求、会话与任务队列
//!
//! ```text
//! Telegram ──► InboundRequest ──► Hub ──► SessionStore
//!                                  │
//!                                  ▼
//!                             TaskQueue ──► TaskExecutor ──► TaskHandler（编排器）
//!                                  │
//!                                  ▼
//!                          TaskNotification ──► Egress
//! ```

pub mod hub;
pub mod message;
pub mod session;
pub mod session_store;
pub mod task_queue;

pub use hub::{category_keyboard, Button, Hub, HubError, Reply, BUSY_REPLY};
pub use message::{parse_start_payload, BotCommand, CallbackAction, InboundKind, InboundRequest};
pub use session::{scheduler_session, session_key, Session, SessionId, SessionMessage, CLI_SESSION};
pub use session_store::{
    create_session_store, MemorySessionStore, SessionError, SessionResult, SessionStore, SqliteSessionStore,
};
pub use task_queue::{
    QueueError, QueueStats, Task, TaskExecutor, TaskHandler, TaskId, TaskKind, TaskNotification, TaskOutput,
    TaskPriority, TaskQueue, TaskStatus,
};
