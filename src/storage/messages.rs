//! 频道消息：采集入库（按 channel + message_id 去重）、分类结果回写、按日期 / 类别检索

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

use super::{now_millis, Database, StorageResult};

/// 已入库的频道消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub id: i64,
    pub channel: String,
    pub message_id: i64,
    pub text: String,
    pub date: DateTime<Utc>,
    pub category: Option<String>,
    /// 分类置信度 1..=5
    pub confidence: Option<u8>,
    pub created_at: i64,
}

/// 待入库的频道消息
#[derive(Debug, Clone)]
pub struct NewChannelMessage {
    pub channel: String,
    pub message_id: i64,
    pub text: String,
    pub date: DateTime<Utc>,
}

/// 检索条件；start / end 为闭区间
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub channels: Vec<String>,
    /// 正文子串（大小写敏感，由 SQLite LIKE 处理 ASCII 大小写）
    pub query: Option<String>,
    pub only_unanalyzed: bool,
    /// 按时间倒序（先取最新）
    pub newest_first: bool,
    pub limit: Option<i64>,
}

const COLUMNS: &str = "id, channel, message_id, text, date, category, confidence, created_at";

fn row_to_message(row: &SqliteRow) -> ChannelMessage {
    let date_ms: i64 = row.get("date");
    ChannelMessage {
        id: row.get("id"),
        channel: row.get("channel"),
        message_id: row.get("message_id"),
        text: row.get("text"),
        date: Utc.timestamp_millis_opt(date_ms).single().unwrap_or_default(),
        category: row.get("category"),
        confidence: row
            .get::<Option<i64>, _>("confidence")
            .map(|c| c.clamp(1, 5) as u8),
        created_at: row.get("created_at"),
    }
}

impl Database {
    /// 保存消息；(channel, message_id) 已存在时返回 None
    pub async fn save_message(&self, msg: &NewChannelMessage) -> StorageResult<Option<i64>> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO messages (channel, message_id, text, date, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&msg.channel)
        .bind(msg.message_id)
        .bind(&msg.text)
        .bind(msg.date.timestamp_millis())
        .bind(now_millis())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            Ok(None)
        } else {
            Ok(Some(result.last_insert_rowid()))
        }
    }

    pub async fn get_message(&self, id: i64) -> StorageResult<Option<ChannelMessage>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM messages WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(row_to_message))
    }

    /// 尚未分类的消息，按时间正序
    pub async fn unanalyzed_messages(&self, limit: i64) -> StorageResult<Vec<ChannelMessage>> {
        self.find_messages(&MessageFilter {
            only_unanalyzed: true,
            limit: Some(limit),
            ..Default::default()
        })
        .await
    }

    pub async fn count_unanalyzed(&self) -> StorageResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE category IS NULL")
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }

    /// 回写分类结果；消息不存在时返回 false
    pub async fn update_category(&self, id: i64, category: &str, confidence: u8) -> StorageResult<bool> {
        let result = sqlx::query("UPDATE messages SET category = ?, confidence = ? WHERE id = ?")
            .bind(category)
            .bind(i64::from(confidence.clamp(1, 5)))
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// 置信度不高于阈值的已分类消息，最新的在前
    pub async fn low_confidence_messages(&self, threshold: u8, limit: i64) -> StorageResult<Vec<ChannelMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM messages
             WHERE category IS NOT NULL AND confidence <= ?
             ORDER BY date DESC LIMIT ?"
        ))
        .bind(i64::from(threshold))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    pub async fn count_low_confidence(&self, threshold: u8) -> StorageResult<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages WHERE category IS NOT NULL AND confidence <= ?",
        )
        .bind(i64::from(threshold))
        .fetch_one(self.pool())
        .await?;
        Ok(row.0)
    }

    /// 按条件检索，按消息时间正序
    pub async fn find_messages(&self, filter: &MessageFilter) -> StorageResult<Vec<ChannelMessage>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM messages WHERE 1 = 1"));

        if let Some(start) = filter.start {
            qb.push(" AND date >= ").push_bind(start.timestamp_millis());
        }
        if let Some(end) = filter.end {
            qb.push(" AND date <= ").push_bind(end.timestamp_millis());
        }
        if let Some(category) = &filter.category {
            qb.push(" AND category = ").push_bind(category.clone());
        }
        if filter.only_unanalyzed {
            qb.push(" AND category IS NULL");
        }
        if !filter.channels.is_empty() {
            qb.push(" AND channel IN (");
            let mut sep = qb.separated(", ");
            for ch in &filter.channels {
                sep.push_bind(ch.clone());
            }
            sep.push_unseparated(")");
        }
        if let Some(q) = filter.query.as_ref().filter(|q| !q.is_empty()) {
            qb.push(" AND text LIKE ").push_bind(format!("%{}%", q));
        }
        if filter.newest_first {
            qb.push(" ORDER BY date DESC, id DESC");
        } else {
            qb.push(" ORDER BY date ASC, id ASC");
        }
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows = qb.build().fetch_all(self.pool()).await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    /// 最近一次入库时间（毫秒），用于判断是否需要重新采集
    pub async fn last_collected_at(&self) -> StorageResult<Option<i64>> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(created_at) FROM messages")
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }
}
