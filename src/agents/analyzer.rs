//! 分析器：为未分类消息确定类别与置信度

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;

use crate::agents::categories::{self, CATEGORY_GUIDE, OTHER};
use crate::core::AgentError;
use crate::llm::{CompletionOptions, LlmClient};
use crate::memory::Message;
use crate::storage::{ChannelMessage, Database};
use crate::utils::truncate_chars;

/// 送入模型的单条消息最大字符数
const MAX_MESSAGE_CHARS: usize = 3000;
/// 结构化回答缺失置信度时的默认值
const DEFAULT_CONFIDENCE: u8 = 3;

fn classification_prompt(text: &str) -> String {
    format!(
        "Внимательно проанализируй текст из официального Telegram-канала и определи, к какой категории он относится:\n\n\
         {CATEGORY_GUIDE}\n\n\
         Затем укажи уверенность по шкале от 1 до 5 (1 - признаки категории почти отсутствуют, 5 - абсолютно точно).\n\n\
         Текст сообщения:\n{}\n\n\
         Ответ в формате:\n\
         Категория: [название категории]\n\
         Уверенность: [число от 1 до 5]",
        truncate_chars(text, MAX_MESSAGE_CHARS)
    )
}

/// 取行首标签之后的内容（容忍 Markdown 加粗与列表符号）
fn labeled_value<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let line = line.trim().trim_start_matches(['*', '-', '#', ' ']);
    let lower = line.to_lowercase();
    if !lower.starts_with(label) {
        return None;
    }
    // label 为小写 ASCII/Cyrillic，小写化不改变其字节长度
    line.get(label.len()..)
}

fn first_number(s: &str) -> Option<i64> {
    let digits: String = s
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// 解析分类回答，返回 (类别, 置信度 1-5)
///
/// 优先读取 `Категория:` / `Уверенность:` 行；没有结构化回答时在全文中查找类别名，
/// 置信度为 3（`другое` 为 2）；仍无结果则为 (`другое`, 1)
pub fn parse_classification(response: &str) -> (&'static str, u8) {
    let mut category = None;
    let mut confidence = DEFAULT_CONFIDENCE;

    for line in response.lines() {
        if let Some(value) = labeled_value(line, "категория:") {
            if category.is_none() {
                category = categories::match_category(value);
            }
        } else if let Some(value) = labeled_value(line, "уверенность:") {
            confidence = first_number(value)
                .map(|n| n.clamp(1, 5) as u8)
                .unwrap_or(DEFAULT_CONFIDENCE);
        }
    }

    if let Some(category) = category {
        return (category, confidence);
    }
    match categories::match_category(response) {
        Some(c) if c == OTHER => (c, 2),
        Some(c) => (c, 3),
        None => (OTHER, 1),
    }
}

/// 分析结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyzeReport {
    pub analyzed: usize,
    pub per_category: BTreeMap<String, usize>,
    /// 模型调用失败、按 (другое, 1) 记录的条数
    pub fallbacks: usize,
}

impl AnalyzeReport {
    pub fn summary(&self) -> String {
        let parts: Vec<String> = categories::all()
            .filter_map(|c| self.per_category.get(c).map(|n| format!("{c}: {n}")))
            .collect();
        if parts.is_empty() {
            format!("Проанализировано сообщений: {}", self.analyzed)
        } else {
            format!("Проанализировано сообщений: {} ({})", self.analyzed, parts.join(", "))
        }
    }
}

pub struct Analyzer {
    db: Database,
    llm: Arc<dyn LlmClient>,
}

impl Analyzer {
    pub fn new(db: Database, llm: Arc<dyn LlmClient>) -> Self {
        Self { db, llm }
    }

    /// 单条分类；模型报错时退化为 (`другое`, 1)，第二个返回值表示是否退化
    pub async fn classify(&self, text: &str) -> (&'static str, u8, bool) {
        let messages = [Message::user(classification_prompt(text))];
        match self.llm.complete(&messages, &CompletionOptions::classification()).await {
            Ok(response) => {
                let (category, confidence) = parse_classification(&response);
                (category, confidence, false)
            }
            Err(e) => {
                tracing::error!(error = %e, "Classification failed");
                (OTHER, 1, true)
            }
        }
    }

    /// 分类全部未分析消息（至多 limit 条）
    pub async fn analyze(&self, limit: usize, batch_size: usize) -> Result<AnalyzeReport, AgentError> {
        let messages = self.db.unanalyzed_messages(limit as i64).await?;
        self.analyze_messages(&messages, batch_size).await
    }

    /// 分批处理：批内并发，批间串行
    pub async fn analyze_messages(
        &self,
        messages: &[ChannelMessage],
        batch_size: usize,
    ) -> Result<AnalyzeReport, AgentError> {
        let mut report = AnalyzeReport::default();
        if messages.is_empty() {
            tracing::info!("No messages to analyze");
            return Ok(report);
        }
        let batch_size = batch_size.max(1);
        let total_batches = messages.len().div_ceil(batch_size);

        for (index, batch) in messages.chunks(batch_size).enumerate() {
            tracing::debug!(batch = index + 1, total_batches, "Analyzing batch");
            let results = join_all(batch.iter().map(|m| self.classify(&m.text))).await;

            for (msg, (category, confidence, fallback)) in batch.iter().zip(results) {
                if !self.db.update_category(msg.id, category, confidence).await? {
                    continue;
                }
                tracing::debug!(id = msg.id, category, confidence, "Message classified");
                report.analyzed += 1;
                *report.per_category.entry(category.to_string()).or_default() += 1;
                if fallback {
                    report.fallbacks += 1;
                }
            }
        }

        tracing::info!(analyzed = report.analyzed, fallbacks = report.fallbacks, "Analysis finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::storage::NewChannelMessage;

    #[test]
    fn test_parse_structured_answer() {
        assert_eq!(
            parse_classification("Категория: Новые законы\nУверенность: 5"),
            ("новые законы", 5)
        );
        assert_eq!(
            parse_classification("**Категория:** новая судебная практика\n**Уверенность:** 9"),
            ("новая судебная практика", 5)
        );
        assert_eq!(
            parse_classification("Категория: поправки к законам\nУверенность: высокая"),
            ("поправки к законам", 3)
        );
        assert_eq!(parse_classification("Категория: законодательные инициативы"), ("законодательные инициативы", 3));
    }

    #[test]
    fn test_parse_unstructured_answer() {
        assert_eq!(parse_classification("Думаю, это новые законы"), ("новые законы", 3));
        assert_eq!(parse_classification("другое"), (OTHER, 2));
        assert_eq!(parse_classification("Не могу определить"), (OTHER, 1));
        assert_eq!(parse_classification("Категория: спорт\nУверенность: 4"), (OTHER, 1));
    }

    #[test]
    fn test_parse_zero_confidence_is_clamped() {
        assert_eq!(parse_classification("Категория: другое\nУверенность: 0"), (OTHER, 1));
    }

    async fn seed(db: &Database, n: i64) {
        for i in 0..n {
            db.save_message(&NewChannelMessage {
                channel: "dumainfo".into(),
                message_id: i,
                text: format!("Сообщение {i}"),
                date: Utc::now(),
            })
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_analyze_in_batches_with_fallback() {
        let db = Database::in_memory().await.unwrap();
        seed(&db, 3).await;
        let mock = Arc::new(MockLlmClient::new().with_responder(|messages| {
            let prompt = &messages[0].content;
            if prompt.contains("Сообщение 1") {
                Err(LlmError::Request("connection refused".into()))
            } else {
                Ok("Категория: новые законы\nУверенность: 4".into())
            }
        }));
        let analyzer = Analyzer::new(db.clone(), mock.clone());

        let report = analyzer.analyze(10, 2).await.unwrap();
        assert_eq!(report.analyzed, 3);
        assert_eq!(report.fallbacks, 1);
        assert_eq!(report.per_category.get("новые законы"), Some(&2));
        assert_eq!(report.per_category.get(OTHER), Some(&1));
        assert_eq!(mock.call_count(), 3);
        assert_eq!(db.count_unanalyzed().await.unwrap(), 0);
        assert!(report.summary().starts_with("Проанализировано сообщений: 3"));

        let low = db.low_confidence_messages(1, 10).await.unwrap();
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].category.as_deref(), Some(OTHER));
    }

    #[tokio::test]
    async fn test_analyze_nothing() {
        let db = Database::in_memory().await.unwrap();
        let analyzer = Analyzer::new(db, Arc::new(MockLlmClient::new()));
        assert_eq!(analyzer.analyze(10, 5).await.unwrap(), AnalyzeReport::default());
    }
}
