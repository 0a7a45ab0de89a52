//! teloxide 端点：把更新规整为 InboundRequest 交给 Hub，并发送回复

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, Me};
use teloxide::utils::command::BotCommands;

use super::egress::Egress;
use crate::gateway::{BotCommand, CallbackAction, Hub, InboundKind, InboundRequest, Reply};

/// 允许使用机器人的用户；为空表示不限制
#[derive(Debug, Clone, Default)]
pub struct AccessList(pub Vec<i64>);

impl AccessList {
    pub fn allows(&self, user_id: i64) -> bool {
        self.0.is_empty() || self.0.contains(&user_id)
    }
}

/// 文本 -> 命令或问题；无法解析的 `/xxx` 视为 /help
pub fn classify_text(text: &str, bot_username: &str) -> InboundKind {
    let text = text.trim();
    if text.starts_with('/') {
        return match BotCommand::parse(text, bot_username) {
            Ok(cmd) => InboundKind::Command(cmd),
            Err(_) => InboundKind::Command(BotCommand::Help),
        };
    }
    InboundKind::Text(text.to_string())
}

fn user_id_of(msg: &Message) -> i64 {
    msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(msg.chat.id.0)
}

fn display_name_of(msg: &Message) -> String {
    msg.from
        .as_ref()
        .map(|u| u.full_name())
        .unwrap_or_else(|| "Unknown".to_string())
}

async fn send(egress: &Arc<dyn Egress>, chat_id: i64, reply: Option<Reply>) {
    if let Some(reply) = reply {
        if let Err(e) = egress.deliver(chat_id, &reply).await {
            tracing::error!(chat_id, error = %e, "Failed to send reply");
        }
    }
}

pub async fn on_message(
    msg: Message,
    me: Me,
    hub: Arc<Hub>,
    egress: Arc<dyn Egress>,
    access: Arc<AccessList>,
) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let user_id = user_id_of(&msg);
    let chat_id = msg.chat.id.0;
    if !access.allows(user_id) {
        tracing::info!(user_id, "Unauthorized access");
        send(&egress, chat_id, Some(Reply::text("⛔️ Доступ запрещён."))).await;
        return Ok(());
    }

    let kind = classify_text(text, me.username());
    let req = InboundRequest::new(user_id.to_string(), Some(chat_id), display_name_of(&msg), kind);
    let reply = hub.handle(req).await;
    send(&egress, chat_id, reply).await;
    Ok(())
}

pub async fn on_callback(
    bot: Bot,
    q: CallbackQuery,
    hub: Arc<Hub>,
    egress: Arc<dyn Egress>,
    access: Arc<AccessList>,
) -> ResponseResult<()> {
    if let Err(e) = bot.answer_callback_query(q.id.clone()).await {
        tracing::debug!(error = %e, "answer_callback_query failed");
    }
    let user_id = q.from.id.0 as i64;
    let chat_id = q.message.as_ref().map(|m| m.chat().id.0).unwrap_or(user_id);
    if !access.allows(user_id) {
        return Ok(());
    }
    let Some(action) = q.data.as_deref().and_then(CallbackAction::parse) else {
        tracing::warn!(data = ?q.data, "Unknown callback data");
        return Ok(());
    };

    let req = InboundRequest::new(user_id.to_string(), Some(chat_id), q.from.full_name(), InboundKind::Callback(action));
    let reply = hub.handle(req).await;
    send(&egress, chat_id, reply).await;
    Ok(())
}

/// 机器人被加入频道后收到的帖子直接入库
pub async fn on_channel_post(msg: Message, hub: Arc<Hub>) -> ResponseResult<()> {
    let Some(text) = msg.text().or(msg.caption()) else {
        return Ok(());
    };
    let channel = msg
        .chat
        .username()
        .map(str::to_string)
        .unwrap_or_else(|| msg.chat.id.0.to_string());
    let req = InboundRequest::new(
        channel.clone(),
        Some(msg.chat.id.0),
        channel.clone(),
        InboundKind::ChannelPost {
            channel,
            message_id: i64::from(msg.id.0),
            text: text.to_string(),
            date: msg.date,
        },
    );
    hub.handle(req).await;
    Ok(())
}

/// 注册命令菜单
pub async fn register_commands(bot: &Bot) {
    if let Err(e) = bot.set_my_commands(BotCommand::bot_commands()).await {
        tracing::warn!(error = %e, "Failed to register bot commands");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_text() {
        assert_eq!(
            classify_text("/period today brief", "lawbot"),
            InboundKind::Command(BotCommand::Period("today brief".into()))
        );
        assert_eq!(classify_text("/unknown", "lawbot"), InboundKind::Command(BotCommand::Help));
        assert_eq!(
            classify_text("  Какие законы приняты?  ", "lawbot"),
            InboundKind::Text("Какие законы приняты?".into())
        );
    }

    #[test]
    fn test_access_list() {
        assert!(AccessList::default().allows(1));
        let list = AccessList(vec![5]);
        assert!(list.allows(5));
        assert!(!list.allows(6));
    }
}
