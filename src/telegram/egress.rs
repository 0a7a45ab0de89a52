//! 出口：把任务结果送回 Telegram
//!
//! Markdown 转 HTML，按 4000 字符分段；瞬时错误指数退避重试，
//! Telegram 拒绝 HTML（实体解析失败）时退回纯文本。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, ParseMode};
use teloxide::{ApiError, RequestError};
use tokio::sync::mpsc;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::gateway::{Button, Reply, SessionStore, TaskKind, TaskNotification, TaskStatus};
use crate::memory::Message;
use crate::utils::text::{markdown_to_html, split_text, TELEGRAM_MESSAGE_LIMIT};

const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 4000;
const MAX_RETRIES: usize = 3;

#[async_trait]
pub trait Egress: Send + Sync {
    async fn deliver(&self, chat_id: i64, reply: &Reply) -> anyhow::Result<()>;
}

pub struct TelegramEgress {
    bot: Bot,
}

impl TelegramEgress {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    async fn send_part(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<&InlineKeyboardMarkup>,
    ) -> anyhow::Result<()> {
        let html = markdown_to_html(text);
        let sent = retry_telegram(|| async {
            let mut req = self.bot.send_message(chat_id, html.clone()).parse_mode(ParseMode::Html);
            if let Some(kb) = keyboard {
                req = req.reply_markup(kb.clone());
            }
            req.await
        })
        .await;

        match sent {
            Ok(_) => Ok(()),
            Err(e) if is_markup_rejection(&e) => {
                tracing::warn!(error = %e, "Telegram rejected HTML, resending as plain text");
                retry_telegram(|| async {
                    let mut req = self.bot.send_message(chat_id, text.to_string());
                    if let Some(kb) = keyboard {
                        req = req.reply_markup(kb.clone());
                    }
                    req.await
                })
                .await
                .map(|_| ())
                .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
            }
            Err(e) => Err(anyhow::anyhow!("Telegram send error: {e}")),
        }
    }
}

#[async_trait]
impl Egress for TelegramEgress {
    async fn deliver(&self, chat_id: i64, reply: &Reply) -> anyhow::Result<()> {
        let parts = split_text(&reply.text, TELEGRAM_MESSAGE_LIMIT);
        let keyboard = (!reply.keyboard.is_empty()).then(|| inline_keyboard(&reply.keyboard));
        let last = parts.len().saturating_sub(1);

        if parts.is_empty() {
            if let Some(kb) = &keyboard {
                return self.send_part(ChatId(chat_id), "…", Some(kb)).await;
            }
            return Ok(());
        }
        for (i, part) in parts.iter().enumerate() {
            // 键盘挂在最后一段
            let kb = if i == last { keyboard.as_ref() } else { None };
            self.send_part(ChatId(chat_id), part, kb).await?;
        }
        Ok(())
    }
}

/// 只有实体解析失败才值得以纯文本重发；被拉黑、聊天不存在等直接报错
fn is_markup_rejection(e: &RequestError) -> bool {
    match e {
        RequestError::Api(ApiError::CantParseEntities(_)) => true,
        RequestError::Api(ApiError::Unknown(msg)) => msg.contains("can't parse entities"),
        _ => false,
    }
}

pub fn inline_keyboard(rows: &[Vec<Button>]) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(rows.iter().map(|row| {
        row.iter()
            .map(|b| InlineKeyboardButton::callback(b.label.clone(), b.data.clone()))
            .collect::<Vec<_>>()
    }))
}

/// 只重试网络类错误；Api 错误（含 HTML 解析失败）直接返回
async fn retry_telegram<F, Fut, T>(operation: F) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RequestError>>,
{
    let strategy = ExponentialBackoff::from_millis(INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(MAX_BACKOFF_MS))
        .map(jitter)
        .take(MAX_RETRIES);

    RetryIf::spawn(strategy, operation, |e: &RequestError| {
        let transient = !matches!(e, RequestError::Api(_));
        if transient {
            tracing::warn!(error = %e, "Telegram request failed, retrying");
        }
        transient
    })
    .await
}

/// 任务结束后的回复文本
pub fn notification_text(note: &TaskNotification) -> String {
    match note.status {
        TaskStatus::Succeeded => note
            .result
            .as_ref()
            .map(|r| r.text.clone())
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "✅ Готово.".to_string()),
        _ => {
            let error = note.error.as_deref().unwrap_or("неизвестная ошибка");
            if error == "cancelled" {
                "🛑 Задача отменена.".to_string()
            } else {
                let what = match note.kind {
                    TaskKind::Question { .. } => "ответить на вопрос",
                    TaskKind::PeriodDigest { .. } => "сформировать дайджест",
                    _ => "выполнить задачу",
                };
                format!("⚠️ Не удалось {what}: {error}")
            }
        }
    }
}

/// 消费任务通知：释放会话活动任务、写入助手回复、发送给 reply_to
pub async fn run_notifications(
    mut rx: mpsc::UnboundedReceiver<TaskNotification>,
    sessions: Arc<dyn SessionStore>,
    egress: Arc<dyn Egress>,
) {
    while let Some(note) = rx.recv().await {
        // 会话已被新任务占用时保持不变
        if let Err(e) = sessions.swap_active_task(&note.session_id, Some(note.task_id.as_str()), None).await {
            tracing::debug!(session = %note.session_id, error = %e, "No session to clear");
        }

        let text = notification_text(&note);
        if note.status == TaskStatus::Succeeded && matches!(note.kind, TaskKind::Question { .. }) {
            if let Err(e) = sessions.append_message(&note.session_id, Message::assistant(text.clone())).await {
                tracing::warn!(session = %note.session_id, error = %e, "Failed to store reply");
            }
        }

        let Some(chat_id) = note.reply_to else {
            tracing::info!(task_id = %note.task_id, status = %note.status, "Task finished");
            continue;
        };
        if let Err(e) = egress.deliver(chat_id, &Reply::text(text)).await {
            tracing::error!(task_id = %note.task_id, chat_id, error = %e, "Delivery failed");
        }
    }
    tracing::info!("Notification channel closed");
}
