//! 审校：复核低置信度分类，必要时改判

use std::sync::Arc;

use crate::agents::categories::{self, CATEGORY_GUIDE};
use crate::core::AgentError;
use crate::llm::{CompletionOptions, LlmClient};
use crate::memory::Message;
use crate::storage::{ChannelMessage, Database};
use crate::utils::truncate_chars;

/// 改判后写入的置信度
pub const REVIEWED_CONFIDENCE: u8 = 4;
const REVIEW_MAX_TOKENS: u32 = 300;
const MAX_MESSAGE_CHARS: usize = 3000;

fn review_prompt(text: &str, current: &str) -> String {
    format!(
        "Ты - эксперт по анализу правовых новостей. Проверь, правильно ли категоризировано сообщение.\n\n\
         Сообщение:\n{}\n\n\
         Текущая категория: {current}\n\n\
         Возможные категории:\n{CATEGORY_GUIDE}\n\n\
         Особые указания:\n\
         - решение, определение суда или обзор практики - это \"новая судебная практика\";\n\
         - внесение или рассмотрение законопроекта без принятия - это \"законодательные инициативы\";\n\
         - принятие закона в третьем чтении или подписание Президентом - это \"новые законы\".\n\n\
         Верни ответ СТРОГО в формате:\n\
         Правильная категория: [категория]\n\
         Обоснование: [краткое объяснение]",
        truncate_chars(text, MAX_MESSAGE_CHARS)
    )
}

/// 审校回答：(建议类别, 理由)
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub category: Option<&'static str>,
    pub justification: String,
}

pub fn parse_review(response: &str) -> Verdict {
    let mut verdict = Verdict {
        category: None,
        justification: String::new(),
    };
    for line in response.lines() {
        let line = line.trim().trim_start_matches(['*', '-', ' ']);
        if let Some(rest) = line.strip_prefix("Правильная категория:") {
            if verdict.category.is_none() {
                verdict.category = categories::match_category(rest);
            }
        } else if let Some(rest) = line.strip_prefix("Обоснование:") {
            verdict.justification = rest.trim_start_matches(['*', ' ']).trim().to_string();
        }
    }
    verdict
}

/// 单条复核结果
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewOutcome {
    Updated { from: String, to: String },
    Unchanged,
}

/// 复核统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReviewReport {
    pub reviewed: usize,
    pub updated: usize,
    pub errors: usize,
}

impl ReviewReport {
    pub fn summary(&self) -> String {
        format!("Проверено: {}, исправлено: {}", self.reviewed, self.updated)
    }
}

pub struct Critic {
    db: Database,
    llm: Arc<dyn LlmClient>,
}

impl Critic {
    pub fn new(db: Database, llm: Arc<dyn LlmClient>) -> Self {
        Self { db, llm }
    }

    /// 复核一条消息；给出与当前不同的合法类别时改判，并把置信度提到 4
    pub async fn review_message(&self, msg: &ChannelMessage) -> Result<ReviewOutcome, AgentError> {
        let current = msg.category.as_deref().unwrap_or(categories::OTHER);
        let messages = [Message::user(review_prompt(&msg.text, current))];
        let opts = CompletionOptions::classification().with_max_tokens(REVIEW_MAX_TOKENS);
        let response = self.llm.complete(&messages, &opts).await?;

        let verdict = parse_review(&response);
        match verdict.category {
            Some(new) if new != current => {
                self.db.update_category(msg.id, new, REVIEWED_CONFIDENCE).await?;
                tracing::info!(
                    id = msg.id,
                    from = current,
                    to = new,
                    reason = %verdict.justification,
                    "Category corrected"
                );
                Ok(ReviewOutcome::Updated {
                    from: current.to_string(),
                    to: new.to_string(),
                })
            }
            _ => Ok(ReviewOutcome::Unchanged),
        }
    }

    /// 复核置信度不高于 threshold 的消息（至多 limit 条）
    pub async fn review(&self, threshold: u8, limit: u32) -> Result<ReviewReport, AgentError> {
        let messages = self.db.low_confidence_messages(threshold, i64::from(limit)).await?;
        Ok(self.review_messages(&messages).await)
    }

    /// 逐条复核；单条失败只计入 errors
    pub async fn review_messages(&self, messages: &[ChannelMessage]) -> ReviewReport {
        let mut report = ReviewReport::default();
        for msg in messages {
            match self.review_message(msg).await {
                Ok(outcome) => {
                    report.reviewed += 1;
                    if matches!(outcome, ReviewOutcome::Updated { .. }) {
                        report.updated += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(id = msg.id, error = %e, "Review failed");
                    report.errors += 1;
                }
            }
        }
        tracing::info!(
            reviewed = report.reviewed,
            updated = report.updated,
            errors = report.errors,
            "Review finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::llm::MockLlmClient;
    use crate::storage::NewChannelMessage;

    #[test]
    fn test_parse_review() {
        let v = parse_review("Правильная категория: Новая судебная практика\nОбоснование: упомянут ВС РФ");
        assert_eq!(v.category, Some("новая судебная практика"));
        assert_eq!(v.justification, "упомянут ВС РФ");

        let v = parse_review("**Правильная категория:** спорт");
        assert_eq!(v.category, None);
    }

    async fn seed(db: &Database, message_id: i64, category: &str, confidence: u8) -> i64 {
        let id = db
            .save_message(&NewChannelMessage {
                channel: "vsrf_ru".into(),
                message_id,
                text: format!("Определение ВС по делу {message_id}"),
                date: Utc::now(),
            })
            .await
            .unwrap()
            .unwrap();
        db.update_category(id, category, confidence).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_review_updates_only_changed_categories() {
        let db = Database::in_memory().await.unwrap();
        let wrong = seed(&db, 1, "другое", 1).await;
        let right = seed(&db, 2, "новая судебная практика", 2).await;
        let confident = seed(&db, 3, "новые законы", 5).await;

        let mock = Arc::new(MockLlmClient::new().with_responder(|_| {
            Ok("Правильная категория: новая судебная практика\nОбоснование: решение суда".into())
        }));
        let critic = Critic::new(db.clone(), mock.clone());

        let report = critic.review(2, 10).await.unwrap();
        assert_eq!(report, ReviewReport { reviewed: 2, updated: 1, errors: 0 });
        assert_eq!(mock.call_count(), 2);

        let fixed = db.get_message(wrong).await.unwrap().unwrap();
        assert_eq!(fixed.category.as_deref(), Some("новая судебная практика"));
        assert_eq!(fixed.confidence, Some(REVIEWED_CONFIDENCE));

        let kept = db.get_message(right).await.unwrap().unwrap();
        assert_eq!(kept.confidence, Some(2));
        let untouched = db.get_message(confident).await.unwrap().unwrap();
        assert_eq!(untouched.category.as_deref(), Some("новые законы"));
    }

    #[tokio::test]
    async fn test_review_counts_llm_errors() {
        let db = Database::in_memory().await.unwrap();
        seed(&db, 1, "другое", 1).await;
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(crate::llm::LlmError::EmptyResponse);
        let critic = Critic::new(db, mock);

        let report = critic.review(2, 10).await.unwrap();
        assert_eq!(report, ReviewReport { reviewed: 0, updated: 0, errors: 1 });
    }
}
