//! Hub：入站请求的路由中枢
//!
//! 把 [`InboundRequest`] 变成回复或入队任务。与 Telegram API 无关：
//! teloxide 端点只负责规整更新与发送 [`Reply`]，便于在测试中直接驱动。

use std::sync::Arc;

use chrono::FixedOffset;
use teloxide::utils::command::BotCommands;
use thiserror::Error;

use super::message::{parse_start_payload, BotCommand, CallbackAction, InboundKind, InboundRequest};
use super::session_store::{SessionError, SessionStore};
use super::task_queue::{QueueError, Task, TaskKind, TaskPriority, TaskQueue};
use crate::agents::categories;
use crate::config::QueueSection;
use crate::memory::Message;
use crate::storage::{Database, DigestType, NewChannelMessage, StorageError};
use crate::utils::dates::{format_ru_date, local_today, parse_period};

/// /list 展示的摘要数
const LIST_LIMIT: i64 = 10;

pub const BUSY_REPLY: &str =
    "⏳ Предыдущий запрос ещё обрабатывается. Дождитесь ответа или отмените его командой /cancel.";

#[derive(Error, Debug)]
pub enum HubError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// 内联按钮
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, action: &CallbackAction) -> Self {
        Self {
            label: label.into(),
            data: action.encode(),
        }
    }
}

/// 回复：Markdown 文本 + 可选内联键盘
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub keyboard: Vec<Vec<Button>>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            keyboard: Vec::new(),
        }
    }

    pub fn with_keyboard(mut self, keyboard: Vec<Vec<Button>>) -> Self {
        self.keyboard = keyboard;
        self
    }
}

pub struct Hub {
    db: Database,
    queue: Arc<TaskQueue>,
    sessions: Arc<dyn SessionStore>,
    limits: QueueSection,
    offset: FixedOffset,
}

impl Hub {
    pub fn new(
        db: Database,
        queue: Arc<TaskQueue>,
        sessions: Arc<dyn SessionStore>,
        limits: QueueSection,
        offset: FixedOffset,
    ) -> Self {
        Self {
            db,
            queue,
            sessions,
            limits,
            offset,
        }
    }

    /// 处理一个入站请求；内部错误记录日志并回复通用提示
    pub async fn handle(&self, req: InboundRequest) -> Option<Reply> {
        match self.route(&req).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(session = %req.session_key, error = %e, "Request failed");
                Some(Reply::text("⚠️ Произошла внутренняя ошибка. Попробуйте позже."))
            }
        }
    }

    async fn route(&self, req: &InboundRequest) -> Result<Option<Reply>, HubError> {
        if let InboundKind::ChannelPost {
            channel,
            message_id,
            text,
            date,
        } = &req.kind
        {
            let saved = self
                .db
                .save_message(&NewChannelMessage {
                    channel: channel.clone(),
                    message_id: *message_id,
                    text: text.clone(),
                    date: *date,
                })
                .await?;
            if saved.is_some() {
                tracing::info!(channel = %channel, message_id, "Channel post saved");
            }
            return Ok(None);
        }

        let session = self
            .sessions
            .get_or_create(&req.user_id, req.chat_id, &req.display_name)
            .await?;

        let reply = match &req.kind {
            InboundKind::Command(cmd) => self.command(cmd, &session.id, req.chat_id).await?,
            InboundKind::Text(text) => self.question(text, &session.id, req.chat_id).await?,
            InboundKind::Callback(action) => self.callback(action).await?,
            InboundKind::ChannelPost { .. } => return Ok(None),
        };
        Ok(Some(reply))
    }

    async fn command(&self, cmd: &BotCommand, session_id: &str, chat_id: Option<i64>) -> Result<Reply, HubError> {
        match cmd {
            BotCommand::Start(payload) => match parse_start_payload(payload) {
                Some(id) => self.show_message(id).await,
                None => Ok(Reply::text(format!("{GREETING}\n\n{}", BotCommand::descriptions()))),
            },
            BotCommand::Help => Ok(Reply::text(format!("{HELP}\n\n{}", BotCommand::descriptions()))),
            BotCommand::Digest => self.latest(DigestType::Brief).await,
            BotCommand::DigestDetailed => self.latest(DigestType::Detailed).await,
            BotCommand::Period(arg) => {
                let request = match parse_period(arg, local_today(self.offset)) {
                    Ok(r) => r,
                    Err(msg) => return Ok(Reply::text(format!("⚠️ {msg}"))),
                };
                let kind = TaskKind::PeriodDigest {
                    start: request.period.start,
                    end: request.period.end,
                    digest_type: request.selection,
                };
                let accepted = self.enqueue(session_id, chat_id, kind, TaskPriority::High).await?;
                Ok(if accepted {
                    Reply::text(format!(
                        "⏳ Формирую дайджест ({}) за {}. Это может занять несколько минут.",
                        request.selection.label(),
                        request.period.describe()
                    ))
                } else {
                    Reply::text(BUSY_REPLY)
                })
            }
            BotCommand::Cat => Ok(Reply::text("Выберите категорию:").with_keyboard(category_keyboard())),
            BotCommand::List => self.list().await,
            BotCommand::Status => Ok(self.status(session_id).await),
            BotCommand::Cancel => self.cancel(session_id).await,
        }
    }

    /// 自由文本 -> Question 任务；会话忙时不入队
    ///
    /// 问题先写入历史再入队，保证它排在回答之前。
    async fn question(&self, text: &str, session_id: &str, chat_id: Option<i64>) -> Result<Reply, HubError> {
        let task = self.new_task(session_id, chat_id, TaskKind::Question { text: text.to_string() }, TaskPriority::Normal);
        if !self.claim_session(session_id, &task.id).await? {
            return Ok(Reply::text(BUSY_REPLY));
        }
        self.sessions.append_message(session_id, Message::user(text)).await?;
        if !self.submit_claimed(session_id, task).await? {
            return Ok(Reply::text(BUSY_REPLY));
        }
        Ok(Reply::text("🔎 Ищу ответ в правовых новостях..."))
    }

    /// 返回是否入队；会话忙时返回 false
    async fn enqueue(
        &self,
        session_id: &str,
        chat_id: Option<i64>,
        kind: TaskKind,
        priority: TaskPriority,
    ) -> Result<bool, HubError> {
        let task = self.new_task(session_id, chat_id, kind, priority);
        if !self.claim_session(session_id, &task.id).await? {
            return Ok(false);
        }
        self.submit_claimed(session_id, task).await
    }

    fn new_task(&self, session_id: &str, chat_id: Option<i64>, kind: TaskKind, priority: TaskPriority) -> Task {
        Task::new(session_id, kind)
            .with_priority(priority)
            .with_reply_to(chat_id)
            .with_limits(&self.limits)
    }

    /// 在入队之前把会话的活动任务占为 task_id，通知先于占位到达时不会留下残留
    ///
    /// 占位指向已结束（或队列已不认识）的任务时直接接管。
    async fn claim_session(&self, session_id: &str, task_id: &str) -> Result<bool, HubError> {
        if self
            .sessions
            .swap_active_task(session_id, None, Some(task_id.to_string()))
            .await?
        {
            return Ok(true);
        }
        let Some(stale) = self.sessions.get(session_id).await?.and_then(|s| s.active_task) else {
            return Ok(self
                .sessions
                .swap_active_task(session_id, None, Some(task_id.to_string()))
                .await?);
        };
        if self.queue.get(&stale).await.is_some_and(|t| !t.is_terminal()) {
            tracing::info!(session = session_id, active = %stale, "Session busy");
            return Ok(false);
        }
        tracing::debug!(session = session_id, stale = %stale, "Replacing finished active task");
        Ok(self
            .sessions
            .swap_active_task(session_id, Some(stale.as_str()), Some(task_id.to_string()))
            .await?)
    }

    /// 入队失败时释放占位
    async fn submit_claimed(&self, session_id: &str, task: Task) -> Result<bool, HubError> {
        let task_id = task.id.clone();
        let submitted = self.queue.submit(task).await;
        if submitted.is_err() {
            self.sessions.swap_active_task(session_id, Some(task_id.as_str()), None).await?;
        }
        match submitted {
            Ok(_) => Ok(true),
            Err(QueueError::SessionBusy { active, .. }) => {
                tracing::info!(session = session_id, active = %active, "Session busy");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn show_message(&self, id: i64) -> Result<Reply, HubError> {
        Ok(match self.db.get_message(id).await? {
            Some(msg) => Reply::text(format!(
                "📢 Канал: @{}\n📅 Дата: {}\n\n{}",
                msg.channel,
                format_ru_date(msg.date.with_timezone(&self.offset).date_naive()),
                msg.text
            )),
            None => Reply::text("Сообщение не найдено."),
        })
    }

    async fn latest(&self, digest_type: DigestType) -> Result<Reply, HubError> {
        Ok(match self.db.latest_digest(digest_type).await? {
            Some(digest) => Reply::text(digest.text),
            None => Reply::text(format!(
                "{} дайджест пока не сформирован. Запросите его командой /period today.",
                capitalize(digest_type.label())
            )),
        })
    }

    async fn list(&self) -> Result<Reply, HubError> {
        let digests = self.db.list_digests(LIST_LIMIT).await?;
        if digests.is_empty() {
            return Ok(Reply::text("Дайджестов пока нет."));
        }
        let rows = digests
            .iter()
            .map(|d| {
                let mut label = format!("{} ({})", format_ru_date(d.date), d.digest_type.label());
                if let Some(focus) = &d.focus_category {
                    label.push_str(&format!(" - {}", categories::short_name(focus)));
                }
                vec![Button::new(label, &CallbackAction::ShowDigest(d.id))]
            })
            .collect();
        Ok(Reply::text("Последние дайджесты:").with_keyboard(rows))
    }

    async fn status(&self, session_id: &str) -> Reply {
        let stats = self.queue.stats().await;
        let mut text = format!(
            "📊 Очередь задач\nОжидают: {} (заблокировано: {})\nВыполняются: {}\nГотово: {}\nОшибки: {}",
            stats.pending, stats.blocked, stats.running, stats.succeeded, stats.failed
        );
        match self.queue.active_for_session(session_id).await {
            Some(task) => text.push_str(&format!(
                "\n\nВаша задача: {} ({}, попытка {})",
                task.kind.name(),
                task.status,
                task.attempts
            )),
            None => text.push_str("\n\nУ вас нет активных задач."),
        }
        Reply::text(text)
    }

    async fn cancel(&self, session_id: &str) -> Result<Reply, HubError> {
        let Some(task) = self.queue.active_for_session(session_id).await else {
            return Ok(Reply::text("Нет активной задачи."));
        };
        Ok(if self.queue.cancel(&task.id).await? {
            Reply::text("🛑 Задача отменяется.")
        } else {
            Reply::text("Задача уже завершена.")
        })
    }

    async fn callback(&self, action: &CallbackAction) -> Result<Reply, HubError> {
        match action {
            CallbackAction::Category { digest_type, category } => {
                let Some(digest) = self.db.latest_digest(*digest_type).await? else {
                    return Ok(Reply::text("Дайджест пока не сформирован."));
                };
                Ok(match digest.section(category) {
                    Some(section) => Reply::text(format!(
                        "## {}\n*{} дайджест за {}*\n\n{}",
                        categories::heading(category),
                        capitalize(digest_type.label()),
                        format_ru_date(digest.date),
                        section.text
                    )),
                    None => Reply::text(format!(
                        "В последнем дайджесте нет новостей в категории «{category}»."
                    )),
                })
            }
            CallbackAction::ShowDigest(id) => Ok(match self.db.get_digest(*id).await? {
                Some(digest) => Reply::text(digest.text),
                None => Reply::text("Дайджест не найден."),
            }),
        }
    }
}

const GREETING: &str = "👋 Здравствуйте! Я собираю правовые новости из официальных Telegram-каналов, \
                        классифицирую их и готовлю дайджесты. Можно просто задать вопрос текстом.";

const HELP: &str = "Задайте вопрос текстом, например «Какие законы приняли на этой неделе?», \
                    или воспользуйтесь командами:";

/// 每个分类一行：简要 / 详细
pub fn category_keyboard() -> Vec<Vec<Button>> {
    categories::all()
        .map(|c| {
            let short = categories::short_name(c);
            vec![
                Button::new(
                    format!("{short} (кратко)"),
                    &CallbackAction::Category {
                        digest_type: DigestType::Brief,
                        category: c.to_string(),
                    },
                ),
                Button::new(
                    format!("{short} (подр.)"),
                    &CallbackAction::Category {
                        digest_type: DigestType::Detailed,
                        category: c.to_string(),
                    },
                ),
            ]
        })
        .collect()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};

    use super::*;
    use crate::gateway::{MemorySessionStore, TaskOutput, TaskStatus};
    use crate::storage::{DigestSection, NewDigest};

    struct Fixture {
        hub: Hub,
        db: Database,
        queue: Arc<TaskQueue>,
        sessions: Arc<dyn SessionStore>,
    }

    async fn fixture() -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let (queue, _rx) = TaskQueue::new();
        let queue = Arc::new(queue);
        let sessions: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new(20));
        let hub = Hub::new(
            db.clone(),
            queue.clone(),
            sessions.clone(),
            QueueSection::default(),
            FixedOffset::east_opt(3 * 3600).unwrap(),
        );
        Fixture { hub, db, queue, sessions }
    }

    fn request(kind: InboundKind) -> InboundRequest {
        InboundRequest::new("7", Some(100), "Anna", kind)
    }

    #[tokio::test]
    async fn test_question_enqueues_and_busy_rejects() {
        let f = fixture().await;
        let first = f.hub.handle(request(InboundKind::Text("Что нового?".into()))).await.unwrap();
        assert!(first.text.starts_with("🔎"));

        let task = f.queue.active_for_session("tg:100").await.unwrap();
        assert_eq!(task.reply_to, Some(100));
        let session = f.sessions.get("tg:100").await.unwrap().unwrap();
        assert_eq!(session.active_task.as_deref(), Some(task.id.as_str()));
        assert_eq!(f.sessions.history("tg:100", 10).await.unwrap(), vec![Message::user("Что нового?")]);

        let second = f.hub.handle(request(InboundKind::Text("Ещё вопрос".into()))).await.unwrap();
        assert_eq!(second.text, BUSY_REPLY);
        assert_eq!(f.sessions.history("tg:100", 10).await.unwrap().len(), 1);

        let claimed = f.queue.claim_next().await.unwrap().unwrap();
        f.queue.complete(&claimed.id, TaskOutput::text("ok")).await.unwrap();
        let third = f.hub.handle(request(InboundKind::Text("Ещё вопрос".into()))).await.unwrap();
        assert!(third.text.starts_with("🔎"));
    }

    #[tokio::test]
    async fn test_period_command() {
        let f = fixture().await;
        let bad = f
            .hub
            .handle(request(InboundKind::Command(BotCommand::Period("завтра".into()))))
            .await
            .unwrap();
        assert!(bad.text.starts_with("⚠️"));
        assert!(f.queue.active_for_session("tg:100").await.is_none());

        let ok = f
            .hub
            .handle(request(InboundKind::Command(BotCommand::Period("2024-01-10 2024-01-12 both".into()))))
            .await
            .unwrap();
        assert!(ok.text.contains("10.01.2024 - 12.01.2024"), "{}", ok.text);
        let task = f.queue.active_for_session("tg:100").await.unwrap();
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(
            task.kind,
            TaskKind::PeriodDigest {
                start: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 1, 12).unwrap(),
                digest_type: crate::storage::DigestSelection::Both,
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let f = fixture().await;
        let none = f.hub.handle(request(InboundKind::Command(BotCommand::Cancel))).await.unwrap();
        assert_eq!(none.text, "Нет активной задачи.");

        f.hub.handle(request(InboundKind::Text("вопрос".into()))).await;
        let task = f.queue.active_for_session("tg:100").await.unwrap();
        let reply = f.hub.handle(request(InboundKind::Command(BotCommand::Cancel))).await.unwrap();
        assert!(reply.text.starts_with("🛑"));
        assert_eq!(f.queue.get(&task.id).await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_digest_commands_and_callbacks() {
        let f = fixture().await;
        let empty = f.hub.handle(request(InboundKind::Command(BotCommand::Digest))).await.unwrap();
        assert!(empty.text.starts_with("Краткий дайджест пока не сформирован"));

        let day = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        let id = f
            .db
            .save_digest(&NewDigest {
                date: day,
                digest_type: DigestType::Detailed,
                text: "Полный текст".into(),
                range_start: day,
                range_end: day,
                focus_category: None,
                sections: vec![DigestSection {
                    category: "новые законы".into(),
                    text: "Подписан закон".into(),
                }],
            })
            .await
            .unwrap();

        let latest = f.hub.handle(request(InboundKind::Command(BotCommand::DigestDetailed))).await.unwrap();
        assert_eq!(latest.text, "Полный текст");

        let section = f
            .hub
            .handle(request(InboundKind::Callback(CallbackAction::Category {
                digest_type: DigestType::Detailed,
                category: "новые законы".into(),
            })))
            .await
            .unwrap();
        assert!(section.text.starts_with("## НОВЫЕ ЗАКОНЫ"));
        assert!(section.text.ends_with("Подписан закон"));

        let list = f.hub.handle(request(InboundKind::Command(BotCommand::List))).await.unwrap();
        assert_eq!(list.keyboard.len(), 1);
        assert_eq!(list.keyboard[0][0].data, format!("show_digest_{id}"));
        assert_eq!(list.keyboard[0][0].label, "02.05.2024 (подробный)");

        let shown = f
            .hub
            .handle(request(InboundKind::Callback(CallbackAction::ShowDigest(id))))
            .await
            .unwrap();
        assert_eq!(shown.text, "Полный текст");
    }

    #[tokio::test]
    async fn test_channel_post_and_deep_link() {
        let f = fixture().await;
        let post = InboundRequest::new(
            "channel",
            Some(-100),
            "dumainfo",
            InboundKind::ChannelPost {
                channel: "dumainfo".into(),
                message_id: 5,
                text: "Госдума приняла закон".into(),
                date: Utc::now(),
            },
        );
        assert!(f.hub.handle(post).await.is_none());
        assert_eq!(f.db.count_unanalyzed().await.unwrap(), 1);
        let stored = f.db.unanalyzed_messages(1).await.unwrap().remove(0);

        let reply = f
            .hub
            .handle(request(InboundKind::Command(BotCommand::Start(format!("msg_{}", stored.id)))))
            .await
            .unwrap();
        assert!(reply.text.starts_with("📢 Канал: @dumainfo"));
        assert!(reply.text.ends_with("Госдума приняла закон"));
    }

    #[test]
    fn test_category_keyboard() {
        let keyboard = category_keyboard();
        assert_eq!(keyboard.len(), categories::all().count());
        assert!(keyboard.iter().all(|row| row.len() == 2));
        assert_eq!(keyboard[0][0].data, "cat_brief_законодательные инициативы");
        assert!(keyboard[0][1].label.ends_with("(подр.)"));
    }
}
