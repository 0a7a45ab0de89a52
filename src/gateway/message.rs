//! 入站请求
//!
//! Telegram 更新（命令、文本、回调、频道帖子）统一规整为 [`InboundRequest`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use teloxide::utils::command::BotCommands;

use super::session::{session_key, SessionId};
use crate::agents::categories;
use crate::storage::DigestType;

/// 机器人命令
#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "Доступные команды:")]
pub enum BotCommand {
    #[command(description = "начать работу")]
    Start(String),
    #[command(description = "справка")]
    Help,
    #[command(description = "последний краткий дайджест")]
    Digest,
    #[command(rename = "digest_detailed", description = "последний подробный дайджест")]
    DigestDetailed,
    #[command(description = "дайджест за период: today | yesterday | YYYY-MM-DD [YYYY-MM-DD] [brief|detailed|both]")]
    Period(String),
    #[command(description = "новости по категории")]
    Cat,
    #[command(description = "список дайджестов")]
    List,
    #[command(description = "состояние очереди задач")]
    Status,
    #[command(description = "отменить текущую задачу")]
    Cancel,
}

/// 内联键盘回调
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackAction {
    /// 某分类的最新摘要分节
    Category {
        digest_type: DigestType,
        category: String,
    },
    /// 查看指定摘要
    ShowDigest(i64),
}

impl CallbackAction {
    pub fn parse(data: &str) -> Option<Self> {
        if let Some(rest) = data.strip_prefix("cat_brief_") {
            return categories::normalize(rest).map(|c| Self::Category {
                digest_type: DigestType::Brief,
                category: c.to_string(),
            });
        }
        if let Some(rest) = data.strip_prefix("cat_detailed_") {
            return categories::normalize(rest).map(|c| Self::Category {
                digest_type: DigestType::Detailed,
                category: c.to_string(),
            });
        }
        if let Some(rest) = data.strip_prefix("show_digest_") {
            return rest.parse().ok().map(Self::ShowDigest);
        }
        None
    }

    /// 编码回 callback data
    pub fn encode(&self) -> String {
        match self {
            Self::Category { digest_type, category } => format!("cat_{}_{}", digest_type.as_str(), category),
            Self::ShowDigest(id) => format!("show_digest_{id}"),
        }
    }
}

/// 入站请求种类
#[derive(Debug, Clone, PartialEq)]
pub enum InboundKind {
    Command(BotCommand),
    Text(String),
    Callback(CallbackAction),
    ChannelPost {
        channel: String,
        message_id: i64,
        text: String,
        date: DateTime<Utc>,
    },
}

/// 规整后的入站请求
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub session_key: SessionId,
    pub user_id: String,
    pub chat_id: Option<i64>,
    pub display_name: String,
    pub kind: InboundKind,
}

impl InboundRequest {
    pub fn new(user_id: impl Into<String>, chat_id: Option<i64>, display_name: impl Into<String>, kind: InboundKind) -> Self {
        let user_id = user_id.into();
        Self {
            session_key: session_key(&user_id, chat_id),
            user_id,
            chat_id,
            display_name: display_name.into(),
            kind,
        }
    }
}

/// `/start msg_<id>` 深链接参数
pub fn parse_start_payload(payload: &str) -> Option<i64> {
    payload.trim().strip_prefix("msg_")?.parse().ok()
}
