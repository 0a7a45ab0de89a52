//! 数据采集：从官方频道拉取帖子并去重入库
//!
//! 频道来源抽象为 [`ChannelSource`]；默认实现 [`WebPreviewSource`] 解析 `https://t.me/s/<channel>`
//! 公开预览页，按 `?before=<id>` 向前翻页直到越过时间下限。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use html2text::from_read;
use regex::Regex;
use reqwest::Client;

use crate::core::AgentError;
use crate::storage::{Database, NewChannelMessage};

/// 单个频道最多翻页数
const MAX_PAGES: usize = 10;
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

static POST_RE: OnceLock<Regex> = OnceLock::new();
static TEXT_RE: OnceLock<Regex> = OnceLock::new();
static TIME_RE: OnceLock<Regex> = OnceLock::new();

/// 频道中的一条帖子
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPost {
    pub message_id: i64,
    pub text: String,
    pub date: DateTime<Utc>,
}

/// 频道帖子来源
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// 返回 since 之后（含）的帖子，顺序不限
    async fn fetch_since(&self, channel: &str, since: DateTime<Utc>) -> Result<Vec<ChannelPost>, AgentError>;
}

/// 公开预览页 t.me/s/<channel>
pub struct WebPreviewSource {
    client: Client,
    base_url: String,
}

impl WebPreviewSource {
    pub fn new(timeout_secs: u64) -> Self {
        Self::with_base_url("https://t.me/s", timeout_secs)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_page(&self, channel: &str, before: Option<i64>) -> Result<String, AgentError> {
        let mut url = format!("{}/{}", self.base_url, channel);
        if let Some(before) = before {
            url.push_str(&format!("?before={before}"));
        }
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::Source(format!("{channel}: request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(AgentError::Source(format!("{channel}: HTTP {}", resp.status())));
        }
        resp.text()
            .await
            .map_err(|e| AgentError::Source(format!("{channel}: read body: {e}")))
    }
}

#[async_trait]
impl ChannelSource for WebPreviewSource {
    async fn fetch_since(&self, channel: &str, since: DateTime<Utc>) -> Result<Vec<ChannelPost>, AgentError> {
        let mut posts: Vec<ChannelPost> = Vec::new();
        let mut before = None;

        for page in 0..MAX_PAGES {
            let html = self.fetch_page(channel, before).await?;
            let batch = parse_preview_page(&html, channel);
            let Some(oldest) = batch.iter().min_by_key(|p| p.message_id) else {
                break;
            };
            let reached_limit = oldest.date < since;
            let next_before = oldest.message_id;
            tracing::debug!(channel, page, found = batch.len(), "Fetched preview page");

            posts.extend(batch.into_iter().filter(|p| p.date >= since));
            if reached_limit || next_before <= 1 || before == Some(next_before) {
                break;
            }
            before = Some(next_before);
        }

        Ok(posts)
    }
}

/// 预览页 HTML 片段转纯文本
fn html_fragment_to_text(fragment: &str) -> String {
    let normalized = fragment.replace("<br/>", "<br>").replace("<br />", "<br>");
    match from_read(normalized.as_bytes(), 10_000) {
        Ok(text) => text.trim().to_string(),
        Err(_) => normalized.trim().to_string(),
    }
}

/// 解析预览页：每条帖子以 `data-post="<channel>/<id>"` 开头，正文在
/// `tgme_widget_message_text` 中，时间在 `<time datetime=...>` 中；无正文的帖子（纯图片等）跳过
pub fn parse_preview_page(html: &str, channel: &str) -> Vec<ChannelPost> {
    let post_re = POST_RE.get_or_init(|| Regex::new(r#"data-post="([^"/]+)/(\d+)""#).unwrap());
    let text_re = TEXT_RE.get_or_init(|| {
        Regex::new(r#"(?s)<div class="tgme_widget_message_text[^"]*"[^>]*>(.*?)</div>"#).unwrap()
    });
    let time_re = TIME_RE.get_or_init(|| Regex::new(r#"<time[^>]*datetime="([^"]+)""#).unwrap());

    let starts: Vec<(usize, i64)> = post_re
        .captures_iter(html)
        .filter(|c| c[1].eq_ignore_ascii_case(channel))
        .filter_map(|c| {
            let start = c.get(0)?.start();
            let id = c[2].parse::<i64>().ok()?;
            Some((start, id))
        })
        .collect();

    let mut posts = Vec::with_capacity(starts.len());
    for (i, (start, message_id)) in starts.iter().enumerate() {
        let end = starts.get(i + 1).map(|(s, _)| *s).unwrap_or(html.len());
        let block = &html[*start..end];

        let Some(text) = text_re.captures(block).map(|c| html_fragment_to_text(&c[1])) else {
            continue;
        };
        if text.is_empty() {
            continue;
        }
        let Some(date) = time_re
            .captures(block)
            .and_then(|c| DateTime::parse_from_rfc3339(&c[1]).ok())
            .map(|d| d.with_timezone(&Utc))
        else {
            continue;
        };

        posts.push(ChannelPost {
            message_id: *message_id,
            text,
            date,
        });
    }
    posts
}

/// 采集结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectReport {
    /// (频道, 新入库条数)，按配置顺序
    pub per_channel: Vec<(String, usize)>,
    pub total_new: usize,
}

impl CollectReport {
    pub fn summary(&self) -> String {
        let details = self
            .per_channel
            .iter()
            .map(|(ch, n)| format!("@{ch}: {n}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("Собрано новых сообщений: {} ({})", self.total_new, details)
    }
}

/// 采集器
pub struct DataCollector {
    db: Database,
    source: Arc<dyn ChannelSource>,
    channels: Vec<String>,
}

impl DataCollector {
    pub fn new(db: Database, source: Arc<dyn ChannelSource>, channels: Vec<String>) -> Self {
        Self { db, source, channels }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// 采集最近 days_back 天
    pub async fn collect(&self, days_back: u32) -> Result<CollectReport, AgentError> {
        let since = Utc::now() - chrono::Duration::days(i64::from(days_back.max(1)));
        self.collect_since(since).await
    }

    /// 采集 since 之后的帖子；单个频道失败只记日志，不影响其他频道
    pub async fn collect_since(&self, since: DateTime<Utc>) -> Result<CollectReport, AgentError> {
        tracing::info!(channels = ?self.channels, since = %since, "Collecting channel posts");
        let mut report = CollectReport::default();

        for channel in &self.channels {
            let posts = match self.source.fetch_since(channel, since).await {
                Ok(posts) => posts,
                Err(e) => {
                    tracing::error!(channel = %channel, error = %e, "Channel fetch failed");
                    report.per_channel.push((channel.clone(), 0));
                    continue;
                }
            };

            let mut new_count = 0;
            for post in posts.iter().filter(|p| !p.text.trim().is_empty()) {
                let saved = self
                    .db
                    .save_message(&NewChannelMessage {
                        channel: channel.clone(),
                        message_id: post.message_id,
                        text: post.text.clone(),
                        date: post.date,
                    })
                    .await?;
                if saved.is_some() {
                    new_count += 1;
                }
            }
            tracing::info!(
                channel = %channel,
                fetched = posts.len(),
                new = new_count,
                "Channel collected"
            );
            report.per_channel.push((channel.clone(), new_count));
            report.total_new += new_count;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const PAGE: &str = r#"
<div class="tgme_widget_message_wrap js-widget_message_wrap">
  <div class="tgme_widget_message text_not_supported_wrap js-widget_message" data-post="dumainfo/101" data-view="x">
    <div class="tgme_widget_message_text js-message_text" dir="auto">Госдума приняла <b>закон</b> о маркетплейсах.<br/>Вступает в силу с 1 июля.</div>
    <a class="tgme_widget_message_date" href="https://t.me/dumainfo/101"><time datetime="2025-03-14T09:30:00+00:00" class="time">12:30</time></a>
  </div>
</div>
<div class="tgme_widget_message_wrap js-widget_message_wrap">
  <div class="tgme_widget_message js-widget_message" data-post="dumainfo/102">
    <div class="tgme_widget_message_photo_wrap"></div>
    <a class="tgme_widget_message_date"><time datetime="2025-03-14T10:00:00+00:00" class="time">13:00</time></a>
  </div>
</div>
<div class="tgme_widget_message_wrap js-widget_message_wrap">
  <div class="tgme_widget_message js-widget_message" data-post="dumainfo/103">
    <div class="tgme_widget_message_text js-message_text" dir="auto">Внесен законопроект &laquo;Об адвокатуре&raquo;</div>
    <a class="tgme_widget_message_date"><time datetime="2025-03-14T11:15:00+03:00" class="time">11:15</time></a>
  </div>
</div>"#;

    #[test]
    fn test_parse_preview_page() {
        let posts = parse_preview_page(PAGE, "dumainfo");
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].message_id, 101);
        assert!(posts[0].text.contains("закон"));
        assert!(posts[0].text.contains("Вступает в силу"));
        assert!(!posts[0].text.contains("<b>"));
        assert_eq!(posts[1].message_id, 103);
        assert!(posts[1].text.contains("«Об адвокатуре»"));
        assert_eq!(posts[1].date.to_rfc3339(), "2025-03-14T08:15:00+00:00");
    }

    #[test]
    fn test_parse_ignores_other_channels() {
        assert!(parse_preview_page(PAGE, "vsrf_ru").is_empty());
        assert!(parse_preview_page("<html></html>", "dumainfo").is_empty());
    }

    struct FakeSource {
        posts: HashMap<String, Vec<ChannelPost>>,
    }

    #[async_trait]
    impl ChannelSource for FakeSource {
        async fn fetch_since(&self, channel: &str, since: DateTime<Utc>) -> Result<Vec<ChannelPost>, AgentError> {
            match self.posts.get(channel) {
                Some(posts) => Ok(posts.iter().filter(|p| p.date >= since).cloned().collect()),
                None => Err(AgentError::Source(format!("{channel}: HTTP 404"))),
            }
        }
    }

    fn post(id: i64, text: &str, hours_ago: i64) -> ChannelPost {
        ChannelPost {
            message_id: id,
            text: text.to_string(),
            date: Utc::now() - chrono::Duration::hours(hours_ago),
        }
    }

    #[tokio::test]
    async fn test_collect_dedups_and_reports_per_channel() {
        let db = Database::in_memory().await.unwrap();
        let mut posts = HashMap::new();
        posts.insert(
            "dumainfo".to_string(),
            vec![post(1, "Закон принят", 2), post(2, "  ", 3), post(3, "Старое", 72)],
        );
        let source = Arc::new(FakeSource { posts });
        let collector = DataCollector::new(
            db.clone(),
            source,
            vec!["dumainfo".to_string(), "missing".to_string()],
        );

        let report = collector.collect(1).await.unwrap();
        assert_eq!(report.total_new, 1);
        assert_eq!(
            report.per_channel,
            vec![("dumainfo".to_string(), 1), ("missing".to_string(), 0)]
        );

        let again = collector.collect(1).await.unwrap();
        assert_eq!(again.total_new, 0);
        assert!(again.summary().contains("@dumainfo: 0"));
        assert_eq!(db.count_unanalyzed().await.unwrap(), 1);
    }
}
