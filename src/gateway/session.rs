//! 会话
//!
//! 一个 Telegram 聊天、一个定时任务或命令行各对应一个会话；会话只归档、不删除。

use serde::{Deserialize, Serialize};

use crate::gateway::task_queue::TaskId;
use crate::memory::Message;
use crate::storage::now_millis;

/// 会话 ID：`tg:<chat_id>`、`scheduler:<job>` 或 `cli`
pub type SessionId = String;

/// 命令行会话
pub const CLI_SESSION: &str = "cli";

/// 由用户与聊天推导会话 ID（有 chat_id 时以聊天为准）
pub fn session_key(user_id: &str, chat_id: Option<i64>) -> SessionId {
    match chat_id {
        Some(chat_id) => format!("tg:{chat_id}"),
        None => user_id.to_string(),
    }
}

/// 定时任务专用会话
pub fn scheduler_session(job: &str) -> SessionId {
    format!("scheduler:{job}")
}

/// 带时间戳的历史消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub message: Message,
    pub at: i64,
}

impl SessionMessage {
    pub fn now(message: Message) -> Self {
        Self {
            message,
            at: now_millis(),
        }
    }
}

/// 单个会话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: String,
    pub chat_id: Option<i64>,
    pub display_name: String,
    /// 有序历史（旧 -> 新）
    pub history: Vec<SessionMessage>,
    /// 当前未结束的任务
    pub active_task: Option<TaskId>,
    pub archived: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    pub fn new(user_id: &str, chat_id: Option<i64>, display_name: &str) -> Self {
        let now = now_millis();
        Self {
            id: session_key(user_id, chat_id),
            user_id: user_id.to_string(),
            chat_id,
            display_name: display_name.to_string(),
            history: Vec::new(),
            active_task: None,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.history.push(SessionMessage::now(message));
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    /// 最近 limit 条消息（旧 -> 新）
    pub fn recent(&self, limit: usize) -> Vec<Message> {
        let start = self.history.len().saturating_sub(limit);
        self.history[start..].iter().map(|m| m.message.clone()).collect()
    }

    pub fn is_busy(&self) -> bool {
        self.active_task.is_some()
    }

    pub fn idle_millis(&self, now: i64) -> i64 {
        now - self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_keys() {
        assert_eq!(session_key("42", Some(-100123)), "tg:-100123");
        assert_eq!(session_key(CLI_SESSION, None), "cli");
        assert_eq!(scheduler_session("collect"), "scheduler:collect");
    }

    #[test]
    fn test_recent_is_oldest_first() {
        let mut session = Session::new("u1", Some(1), "Anna");
        session.push(Message::user("a"));
        session.push(Message::assistant("b"));
        session.push(Message::user("c"));
        let recent = session.recent(2);
        assert_eq!(recent, vec![Message::assistant("b"), Message::user("c")]);
        assert_eq!(session.recent(10).len(), 3);
    }
}
