//! 摘要生成：按类别汇总日期区间内的已分类消息，写入 digests / digest_sections
//!
//! 分节顺序与类别列表一致，`другое` 放在最后、标题为 `ДРУГИЕ НОВОСТИ`。同日期、同类型、
//! 同关注类别的摘要已存在时原地更新。

use std::sync::Arc;

use chrono::FixedOffset;
use futures_util::future::join_all;

use crate::agents::categories;
use crate::core::AgentError;
use crate::llm::{CompletionOptions, LlmClient};
use crate::memory::Message;
use crate::storage::{ChannelMessage, Database, DigestSection, DigestSelection, DigestType, MessageFilter, NewDigest};
use crate::utils::dates::Period;
use crate::utils::{preview, truncate_chars};
use crate::workflow::DigestMode;

/// 每条消息送入模型的最大字符数
const MAX_SOURCE_CHARS: usize = 1200;
/// 单个分节最多引用的消息数
const MAX_SECTION_MESSAGES: usize = 30;
const BRIEF_SECTION_TOKENS: u32 = 400;
const INTRO_TOKENS: u32 = 300;

/// 一次摘要请求
#[derive(Debug, Clone, PartialEq)]
pub struct DigestRequest {
    pub period: Period,
    pub digest_type: DigestType,
    pub focus: Option<String>,
    pub mode: DigestMode,
}

/// 生成结果
#[derive(Debug, Clone, PartialEq)]
pub struct DigestResult {
    pub digest_id: i64,
    pub digest_type: DigestType,
    pub period: Period,
    pub text: String,
    pub message_count: usize,
    /// 是否覆盖了已有摘要
    pub updated: bool,
}

pub struct Digester {
    db: Database,
    llm: Arc<dyn LlmClient>,
    offset: FixedOffset,
    bot_username: Option<String>,
    max_tokens: u32,
}

impl Digester {
    pub fn new(db: Database, llm: Arc<dyn LlmClient>, offset: FixedOffset) -> Self {
        Self {
            db,
            llm,
            offset,
            bot_username: None,
            max_tokens: 1500,
        }
    }

    /// 详细摘要中的 `msg_<id>` 深链接指向此 bot
    pub fn with_bot_username(mut self, username: Option<String>) -> Self {
        self.bot_username = username.map(|u| u.trim_start_matches('@').to_string()).filter(|u| !u.is_empty());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn message_link(&self, id: i64) -> String {
        match &self.bot_username {
            Some(bot) => format!("https://t.me/{bot}?start=msg_{id}"),
            None => format!("/start msg_{id}"),
        }
    }

    /// 区间内已分类的消息（可限定关注类别）
    pub async fn categorized_messages(
        &self,
        period: Period,
        focus: Option<&str>,
    ) -> Result<Vec<ChannelMessage>, AgentError> {
        let (start, end) = period.bounds(self.offset);
        let messages = self
            .db
            .find_messages(&MessageFilter {
                start: Some(start),
                end: Some(end),
                category: focus.map(str::to_string),
                ..Default::default()
            })
            .await?;
        Ok(messages.into_iter().filter(|m| m.category.is_some()).collect())
    }

    /// 按所选类型逐个生成
    pub async fn create_selection(
        &self,
        period: Period,
        selection: DigestSelection,
        focus: Option<String>,
        mode: DigestMode,
    ) -> Result<Vec<DigestResult>, AgentError> {
        let mut results = Vec::new();
        for digest_type in selection.types() {
            let request = DigestRequest {
                period,
                digest_type,
                focus: focus.clone(),
                mode,
            };
            if let Some(result) = self.create(&request).await? {
                results.push(result);
            }
        }
        Ok(results)
    }

    /// 生成并保存摘要；区间内没有已分类消息时返回 None
    pub async fn create(&self, request: &DigestRequest) -> Result<Option<DigestResult>, AgentError> {
        let date = request.period.end;
        let focus = request.focus.as_deref();
        let existing = self.db.digest_for_date(date, request.digest_type, focus).await?;

        let period = match (&request.mode, &existing) {
            (DigestMode::Update, Some(d)) => Period {
                start: d.range_start.min(request.period.start),
                end: d.range_end.max(request.period.end),
            },
            _ => request.period,
        };

        let messages = self.categorized_messages(period, focus).await?;
        if messages.is_empty() {
            tracing::info!(period = %period.describe(), "No categorized messages for digest");
            return Ok(None);
        }

        let groups = group_by_category(&messages);
        let sections: Vec<DigestSection> = join_all(
            groups
                .iter()
                .map(|(category, msgs)| self.section(category, msgs, request.digest_type)),
        )
        .await
        .into_iter()
        .zip(groups.iter())
        .map(|(text, (category, _))| DigestSection {
            category: category.to_string(),
            text,
        })
        .collect();

        let counts: Vec<(&str, usize)> = groups.iter().map(|(c, m)| (*c, m.len())).collect();
        let intro = self.intro(period, messages.len(), &counts, focus).await;
        let text = render_digest(&intro, &sections);

        let record = NewDigest {
            date,
            digest_type: request.digest_type,
            text: text.clone(),
            range_start: period.start,
            range_end: period.end,
            focus_category: request.focus.clone(),
            sections,
        };

        let (digest_id, updated) = match existing {
            Some(d) => {
                self.db.update_digest(d.id, &record).await?;
                (d.id, true)
            }
            None => (self.db.save_digest(&record).await?, false),
        };
        tracing::info!(
            digest_id,
            digest_type = request.digest_type.as_str(),
            messages = messages.len(),
            updated,
            "Digest saved"
        );

        Ok(Some(DigestResult {
            digest_id,
            digest_type: request.digest_type,
            period,
            text,
            message_count: messages.len(),
            updated,
        }))
    }

    async fn section(&self, category: &str, messages: &[&ChannelMessage], digest_type: DigestType) -> String {
        let sources = messages
            .iter()
            .take(MAX_SECTION_MESSAGES)
            .map(|m| truncate_chars(&m.text, MAX_SOURCE_CHARS))
            .collect::<Vec<_>>()
            .join("\n---\n");

        let (volume, max_tokens) = match digest_type {
            DigestType::Brief => ("1 короткий абзац, только самое важное", BRIEF_SECTION_TOKENS),
            DigestType::Detailed => ("2-3 абзаца с пояснениями", self.max_tokens),
        };
        let prompt = format!(
            "Сформируй обзор по категории '{category}' на основе сообщений из официальных Telegram-каналов.\n\n\
             Сообщения:\n{sources}\n\n\
             Требования:\n\
             1. Объедини похожие сообщения, выдели ключевые события.\n\
             2. Используй четкий, лаконичный язык.\n\
             3. Расположи информацию по степени важности.\n\
             4. Объем: {volume}."
        );

        let body = match self
            .llm
            .complete(&[Message::user(prompt)], &CompletionOptions::digest(max_tokens))
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => section_fallback(category),
            Err(e) => {
                tracing::error!(category, error = %e, "Section generation failed");
                section_fallback(category)
            }
        };

        match digest_type {
            DigestType::Brief => body,
            DigestType::Detailed => {
                let links = messages
                    .iter()
                    .map(|m| format!("• {} - {}", preview(m.text.lines().next().unwrap_or(""), 80), self.message_link(m.id)))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("{body}\n\n*Источники:*\n{links}")
            }
        }
    }

    async fn intro(&self, period: Period, total: usize, counts: &[(&str, usize)], focus: Option<&str>) -> String {
        let fallback = format!("Дайджест правовых новостей за {}", period.describe());
        let distribution = counts
            .iter()
            .map(|(c, n)| format!("- {c}: {n}"))
            .collect::<Vec<_>>()
            .join("\n");
        let focus_line = focus.map(|f| format!("\n- Фокус: {f}")).unwrap_or_default();
        let prompt = format!(
            "Напиши краткое вступление к дайджесту правовых новостей за {}.\n\n\
             - Всего сообщений: {total}{focus_line}\n\
             - Распределение по категориям:\n{distribution}\n\n\
             Вступление должно быть лаконичным (1-2 абзаца) и давать общую характеристику новостей.",
            period.describe()
        );

        match self
            .llm
            .complete(&[Message::user(prompt)], &CompletionOptions::digest(INTRO_TOKENS))
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback,
            Err(e) => {
                tracing::warn!(error = %e, "Intro generation failed");
                fallback
            }
        }
    }
}

fn section_fallback(category: &str) -> String {
    format!("За данный период информация по категории '{category}' недоступна из-за технической ошибки.")
}

/// 按类别分组，组的顺序即类别列表顺序
fn group_by_category(messages: &[ChannelMessage]) -> Vec<(&'static str, Vec<&ChannelMessage>)> {
    categories::all()
        .map(|category| {
            let msgs: Vec<&ChannelMessage> = messages
                .iter()
                .filter(|m| m.category.as_deref().and_then(categories::normalize) == Some(category))
                .collect();
            (category, msgs)
        })
        .filter(|(_, msgs)| !msgs.is_empty())
        .collect()
}

/// 拼接全文：引言 + 各分节（`## 标题`）
pub fn render_digest(intro: &str, sections: &[DigestSection]) -> String {
    let mut ordered: Vec<&DigestSection> = sections.iter().collect();
    ordered.sort_by_key(|s| categories::order_of(&s.category));

    let mut text = format!("{}\n\n", intro.trim());
    for section in ordered {
        text.push_str(&format!(
            "## {}\n\n{}\n\n",
            categories::heading(&section.category),
            section.text.trim()
        ));
    }
    text.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::storage::NewChannelMessage;
    use crate::utils::dates::offset_from_hours;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    async fn seed(db: &Database, message_id: i64, text: &str, category: &str) -> i64 {
        let id = db
            .save_message(&NewChannelMessage {
                channel: "dumainfo".into(),
                message_id,
                text: text.into(),
                date: Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap(),
            })
            .await
            .unwrap()
            .unwrap();
        db.update_category(id, category, 4).await.unwrap();
        id
    }

    fn mock() -> Arc<MockLlmClient> {
        Arc::new(MockLlmClient::new().with_responder(|messages| {
            let prompt = &messages[0].content;
            if prompt.starts_with("Напиши краткое вступление") {
                Ok("Вступление".into())
            } else if prompt.contains("'поправки к законам'") {
                Err(LlmError::Request("boom".into()))
            } else {
                Ok("Обзор".into())
            }
        }))
    }

    #[test]
    fn test_render_orders_sections_with_other_last() {
        let sections = vec![
            DigestSection { category: "другое".into(), text: "прочее".into() },
            DigestSection { category: "новые законы".into(), text: "законы".into() },
            DigestSection { category: "законодательные инициативы".into(), text: "инициативы".into() },
        ];
        let text = render_digest("Интро", &sections);
        let pos = |s: &str| text.find(s).unwrap();
        assert!(text.starts_with("Интро"));
        assert!(pos("## ЗАКОНОДАТЕЛЬНЫЕ ИНИЦИАТИВЫ") < pos("## НОВЫЕ ЗАКОНЫ"));
        assert!(pos("## НОВЫЕ ЗАКОНЫ") < pos("## ДРУГИЕ НОВОСТИ"));
    }

    #[tokio::test]
    async fn test_create_brief_and_fallback_section() {
        let db = Database::in_memory().await.unwrap();
        seed(&db, 1, "Закон о маркетплейсах принят", "новые законы").await;
        seed(&db, 2, "Поправки в УК", "поправки к законам").await;
        seed(&db, 3, "Праздничное поздравление", "другое").await;
        let digester = Digester::new(db.clone(), mock(), offset_from_hours(3));

        let request = DigestRequest {
            period: Period::single(day()),
            digest_type: DigestType::Brief,
            focus: None,
            mode: DigestMode::Create,
        };
        let result = digester.create(&request).await.unwrap().unwrap();
        assert_eq!(result.message_count, 3);
        assert!(!result.updated);
        assert!(result.text.starts_with("Вступление"));
        assert!(result.text.contains("недоступна из-за технической ошибки"));
        assert!(result.text.find("## НОВЫЕ ЗАКОНЫ").unwrap() < result.text.find("## ДРУГИЕ НОВОСТИ").unwrap());

        let stored = db.get_digest(result.digest_id).await.unwrap().unwrap();
        assert_eq!(stored.sections.len(), 3);
        assert_eq!(stored.section("новые законы").unwrap().text, "Обзор");

        let again = digester.create(&request).await.unwrap().unwrap();
        assert!(again.updated);
        assert_eq!(again.digest_id, result.digest_id);
        assert_eq!(db.count_digests_for_date(day()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_detailed_contains_deep_links() {
        let db = Database::in_memory().await.unwrap();
        let id = seed(&db, 1, "Верховный суд разъяснил порядок", "новая судебная практика").await;
        let digester = Digester::new(db, mock(), offset_from_hours(3)).with_bot_username(Some("@lawbot".into()));

        let results = digester
            .create_selection(Period::single(day()), DigestSelection::Detailed, None, DigestMode::Create)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].text.contains(&format!("https://t.me/lawbot?start=msg_{id}")));
    }

    #[tokio::test]
    async fn test_focus_and_empty_period() {
        let db = Database::in_memory().await.unwrap();
        seed(&db, 1, "Закон принят", "новые законы").await;
        let digester = Digester::new(db, mock(), offset_from_hours(3));

        let focused = DigestRequest {
            period: Period::single(day()),
            digest_type: DigestType::Brief,
            focus: Some("поправки к законам".into()),
            mode: DigestMode::Create,
        };
        assert!(digester.create(&focused).await.unwrap().is_none());

        let empty = DigestRequest {
            period: Period::single(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
            focus: None,
            ..focused
        };
        assert!(digester.create(&empty).await.unwrap().is_none());
    }
}
