//! 新闻检索工具：最新摘要、消息检索、单条消息、分类列表

use async_trait::async_trait;
use chrono::{Duration, FixedOffset, Utc};
use serde_json::Value;

use super::registry::Tool;
use crate::agents::categories;
use crate::storage::{ChannelMessage, Database, DigestType, MessageFilter};
use crate::utils::dates::format_ru_date;
use crate::utils::preview;

/// 单次检索返回的最大条数
const MAX_SEARCH_RESULTS: i64 = 20;

fn format_message(msg: &ChannelMessage, offset: FixedOffset, max_chars: usize) -> String {
    let date = format_ru_date(msg.date.with_timezone(&offset).date_naive());
    let category = msg.category.as_deref().unwrap_or("не классифицировано");
    format!(
        "[id {}] @{} {} ({}): {}",
        msg.id,
        msg.channel,
        date,
        category,
        preview(&msg.text, max_chars)
    )
}

/// 最新摘要
pub struct LatestDigestTool {
    db: Database,
}

impl LatestDigestTool {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Tool for LatestDigestTool {
    fn name(&self) -> &str {
        "latest_digest"
    }

    fn description(&self) -> &str {
        "Возвращает текст последнего дайджеста правовых новостей. digest_type: brief (краткий) или detailed (подробный)."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "digest_type": { "type": "string", "enum": ["brief", "detailed"] }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let digest_type = args
            .get("digest_type")
            .and_then(|v| v.as_str())
            .and_then(DigestType::parse)
            .unwrap_or(DigestType::Brief);

        let digest = self
            .db
            .latest_digest(digest_type)
            .await
            .map_err(|e| e.to_string())?;
        Ok(match digest {
            Some(d) => format!("Дайджест за {} ({}):\n{}", format_ru_date(d.date), d.digest_type.label(), d.text),
            None => "Дайджесты ещё не сформированы.".to_string(),
        })
    }
}

/// 按分类 / 时间 / 关键词检索消息
pub struct SearchMessagesTool {
    db: Database,
    offset: FixedOffset,
}

impl SearchMessagesTool {
    pub fn new(db: Database, offset: FixedOffset) -> Self {
        Self { db, offset }
    }
}

#[async_trait]
impl Tool for SearchMessagesTool {
    fn name(&self) -> &str {
        "search_messages"
    }

    fn description(&self) -> &str {
        "Ищет сообщения официальных каналов. Параметры (все необязательные): category, days_back, query (подстрока текста), limit."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "category": { "type": "string" },
                "days_back": { "type": "integer", "minimum": 1 },
                "query": { "type": "string" },
                "limit": { "type": "integer", "minimum": 1, "maximum": MAX_SEARCH_RESULTS }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let category = match args.get("category").and_then(|v| v.as_str()) {
            Some(raw) => Some(
                categories::normalize(raw)
                    .ok_or_else(|| format!("Неизвестная категория: {raw}"))?
                    .to_string(),
            ),
            None => None,
        };
        let days_back = args.get("days_back").and_then(|v| v.as_i64()).unwrap_or(7).max(1);
        let limit = args
            .get("limit")
            .and_then(|v| v.as_i64())
            .unwrap_or(10)
            .clamp(1, MAX_SEARCH_RESULTS);
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .filter(|q| !q.trim().is_empty());

        let filter = MessageFilter {
            start: Some(Utc::now() - Duration::days(days_back)),
            category,
            query,
            newest_first: true,
            limit: Some(limit),
            ..Default::default()
        };
        let found = self.db.find_messages(&filter).await.map_err(|e| e.to_string())?;
        if found.is_empty() {
            return Ok("Сообщений не найдено.".to_string());
        }
        Ok(found
            .iter()
            .map(|m| format_message(m, self.offset, 300))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// 按 ID 取完整消息
pub struct GetMessageTool {
    db: Database,
    offset: FixedOffset,
}

impl GetMessageTool {
    pub fn new(db: Database, offset: FixedOffset) -> Self {
        Self { db, offset }
    }
}

#[async_trait]
impl Tool for GetMessageTool {
    fn name(&self) -> &str {
        "get_message"
    }

    fn description(&self) -> &str {
        "Возвращает полный текст сообщения по его id."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "id": { "type": "integer" } },
            "required": ["id"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let id = args
            .get("id")
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| "Missing 'id'".to_string())?;
        match self.db.get_message(id).await.map_err(|e| e.to_string())? {
            Some(msg) => Ok(format_message(&msg, self.offset, usize::MAX)),
            None => Err(format!("Сообщение {id} не найдено")),
        }
    }
}

/// 分类列表
pub struct ListCategoriesTool;

#[async_trait]
impl Tool for ListCategoriesTool {
    fn name(&self) -> &str {
        "list_categories"
    }

    fn description(&self) -> &str {
        "Возвращает список категорий правовых новостей."
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        Ok(categories::all().collect::<Vec<_>>().join("\n"))
    }
}
