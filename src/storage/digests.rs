//! 摘要与摘要分节

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{now_millis, Database, StorageError, StorageResult};

/// 摘要类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestType {
    Brief,
    Detailed,
}

impl DigestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brief => "brief",
            Self::Detailed => "detailed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "brief" | "кратко" | "краткий" => Some(Self::Brief),
            "detailed" | "подробно" | "подробный" => Some(Self::Detailed),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Brief => "краткий",
            Self::Detailed => "подробный",
        }
    }
}

/// 请求生成哪些类型的摘要
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestSelection {
    Brief,
    Detailed,
    Both,
}

impl DigestSelection {
    pub fn types(&self) -> Vec<DigestType> {
        match self {
            Self::Brief => vec![DigestType::Brief],
            Self::Detailed => vec![DigestType::Detailed],
            Self::Both => vec![DigestType::Brief, DigestType::Detailed],
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "both" | "оба" | "все" => Some(Self::Both),
            other => DigestType::parse(other).map(|t| match t {
                DigestType::Brief => Self::Brief,
                DigestType::Detailed => Self::Detailed,
            }),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Brief => "краткий",
            Self::Detailed => "подробный",
            Self::Both => "краткий и подробный",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestSection {
    pub category: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub id: i64,
    pub date: NaiveDate,
    pub digest_type: DigestType,
    pub text: String,
    pub range_start: NaiveDate,
    pub range_end: NaiveDate,
    pub focus_category: Option<String>,
    pub sections: Vec<DigestSection>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Digest {
    pub fn section(&self, category: &str) -> Option<&DigestSection> {
        self.sections.iter().find(|s| s.category == category)
    }
}

/// /list 用的轻量摘要信息（不含分节）
#[derive(Debug, Clone)]
pub struct DigestSummary {
    pub id: i64,
    pub date: NaiveDate,
    pub digest_type: DigestType,
    pub focus_category: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewDigest {
    pub date: NaiveDate,
    pub digest_type: DigestType,
    pub text: String,
    pub range_start: NaiveDate,
    pub range_end: NaiveDate,
    pub focus_category: Option<String>,
    pub sections: Vec<DigestSection>,
}

const COLUMNS: &str =
    "id, date, digest_type, text, range_start, range_end, focus_category, created_at, updated_at";

fn parse_date(row: &SqliteRow, column: &str) -> StorageResult<NaiveDate> {
    let raw: String = row.get(column);
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|e| StorageError::Corrupted(format!("digests.{column} = {raw}: {e}")))
}

fn parse_type(row: &SqliteRow) -> StorageResult<DigestType> {
    let raw: String = row.get("digest_type");
    DigestType::parse(&raw).ok_or_else(|| StorageError::Corrupted(format!("digest_type = {raw}")))
}

fn row_to_digest(row: &SqliteRow) -> StorageResult<Digest> {
    Ok(Digest {
        id: row.get("id"),
        date: parse_date(row, "date")?,
        digest_type: parse_type(row)?,
        text: row.get("text"),
        range_start: parse_date(row, "range_start")?,
        range_end: parse_date(row, "range_end")?,
        focus_category: row.get("focus_category"),
        sections: Vec::new(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

impl Database {
    /// 保存摘要及其分节（单事务）
    pub async fn save_digest(&self, digest: &NewDigest) -> StorageResult<i64> {
        let now = now_millis();
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            "INSERT INTO digests (date, digest_type, text, range_start, range_end, focus_category, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(fmt_date(digest.date))
        .bind(digest.digest_type.as_str())
        .bind(&digest.text)
        .bind(fmt_date(digest.range_start))
        .bind(fmt_date(digest.range_end))
        .bind(&digest.focus_category)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        for section in &digest.sections {
            sqlx::query("INSERT INTO digest_sections (digest_id, category, text) VALUES (?, ?, ?)")
                .bind(id)
                .bind(&section.category)
                .bind(&section.text)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    /// 覆盖已有摘要的正文与分节（单事务）
    pub async fn update_digest(&self, id: i64, digest: &NewDigest) -> StorageResult<()> {
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            "UPDATE digests SET text = ?, range_start = ?, range_end = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&digest.text)
        .bind(fmt_date(digest.range_start))
        .bind(fmt_date(digest.range_end))
        .bind(now_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("digest {id}")));
        }

        sqlx::query("DELETE FROM digest_sections WHERE digest_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for section in &digest.sections {
            sqlx::query("INSERT INTO digest_sections (digest_id, category, text) VALUES (?, ?, ?)")
                .bind(id)
                .bind(&section.category)
                .bind(&section.text)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_sections(&self, digest: &mut Digest) -> StorageResult<()> {
        let rows = sqlx::query("SELECT category, text FROM digest_sections WHERE digest_id = ? ORDER BY id")
            .bind(digest.id)
            .fetch_all(self.pool())
            .await?;
        digest.sections = rows
            .iter()
            .map(|r| DigestSection {
                category: r.get("category"),
                text: r.get("text"),
            })
            .collect();
        Ok(())
    }

    pub async fn get_digest(&self, id: i64) -> StorageResult<Option<Digest>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM digests WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        match row {
            Some(row) => {
                let mut digest = row_to_digest(&row)?;
                self.load_sections(&mut digest).await?;
                Ok(Some(digest))
            }
            None => Ok(None),
        }
    }

    /// 指定类型的最新摘要（含分节）
    pub async fn latest_digest(&self, digest_type: DigestType) -> StorageResult<Option<Digest>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM digests WHERE digest_type = ? ORDER BY date DESC, updated_at DESC LIMIT 1"
        ))
        .bind(digest_type.as_str())
        .fetch_optional(self.pool())
        .await?;
        match row {
            Some(row) => {
                let mut digest = row_to_digest(&row)?;
                self.load_sections(&mut digest).await?;
                Ok(Some(digest))
            }
            None => Ok(None),
        }
    }

    /// 某日期、某类型、同一关注类别的摘要
    pub async fn digest_for_date(
        &self,
        date: NaiveDate,
        digest_type: DigestType,
        focus_category: Option<&str>,
    ) -> StorageResult<Option<Digest>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM digests
             WHERE date = ? AND digest_type = ? AND focus_category IS ?
             ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(fmt_date(date))
        .bind(digest_type.as_str())
        .bind(focus_category)
        .fetch_optional(self.pool())
        .await?;
        match row {
            Some(row) => {
                let mut digest = row_to_digest(&row)?;
                self.load_sections(&mut digest).await?;
                Ok(Some(digest))
            }
            None => Ok(None),
        }
    }

    /// 某日期的摘要数量（任何类型）
    pub async fn count_digests_for_date(&self, date: NaiveDate) -> StorageResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM digests WHERE date = ?")
            .bind(fmt_date(date))
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }

    pub async fn list_digests(&self, limit: i64) -> StorageResult<Vec<DigestSummary>> {
        let rows = sqlx::query(
            "SELECT id, date, digest_type, focus_category, created_at FROM digests
             ORDER BY date DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(DigestSummary {
                    id: row.get("id"),
                    date: parse_date(row, "date")?,
                    digest_type: parse_type(row)?,
                    focus_category: row.get("focus_category"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}
