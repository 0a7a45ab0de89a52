//! LLM 响应缓存（moka，按条目 TTL 过期）
//!
//! 键 = SHA-256(model + 消息 + max_tokens + temperature)。TTL 由用途与 prompt 长度决定，见 [`ttl_for`]。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use sha2::{Digest, Sha256};

use crate::llm::{CompletionOptions, LlmClient, LlmError, Purpose};
use crate::memory::Message;

const HOUR: u64 = 3600;
/// prompt 超过该字符数视为长 prompt，缓存时间缩短
const LONG_PROMPT_CHARS: usize = 5000;

/// 缓存有效期
pub fn ttl_for(purpose: Purpose, prompt_chars: usize) -> Duration {
    if prompt_chars > LONG_PROMPT_CHARS {
        return Duration::from_secs(6 * HOUR);
    }
    match purpose {
        Purpose::Classification => Duration::from_secs(7 * 24 * HOUR),
        Purpose::Digest => Duration::from_secs(12 * HOUR),
        Purpose::Chat => Duration::from_secs(24 * HOUR),
    }
}

#[derive(Clone)]
struct CachedResponse {
    text: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedResponse> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &CachedResponse, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// 可在多个客户端间共享的缓存
#[derive(Clone)]
pub struct ResponseCache {
    inner: Cache<String, CachedResponse>,
}

impl ResponseCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

fn cache_key(model: &str, messages: &[Message], opts: &CompletionOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    for m in messages {
        hasher.update([0u8]);
        hasher.update(m.role.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(m.content.as_bytes());
    }
    hasher.update(opts.max_tokens.to_le_bytes());
    hasher.update(opts.temperature.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// 带缓存的客户端：命中直接返回，未命中时调用 inner 并写入
pub struct CachedLlm {
    inner: Arc<dyn LlmClient>,
    cache: ResponseCache,
}

impl CachedLlm {
    pub fn new(inner: Arc<dyn LlmClient>, cache: ResponseCache) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl LlmClient for CachedLlm {
    async fn complete(&self, messages: &[Message], opts: &CompletionOptions) -> Result<String, LlmError> {
        let key = cache_key(self.inner.model(), messages, opts);
        if let Some(hit) = self.cache.inner.get(&key).await {
            tracing::debug!(key = %&key[..12], "LLM cache hit");
            return Ok(hit.text);
        }

        let text = self.inner.complete(messages, opts).await?;
        let prompt_chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
        self.cache
            .inner
            .insert(
                key,
                CachedResponse {
                    text: text.clone(),
                    ttl: ttl_for(opts.purpose, prompt_chars),
                },
            )
            .await;
        Ok(text)
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_ttl_rules() {
        assert_eq!(ttl_for(Purpose::Classification, 100), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(ttl_for(Purpose::Digest, 100), Duration::from_secs(12 * 3600));
        assert_eq!(ttl_for(Purpose::Chat, 100), Duration::from_secs(24 * 3600));
        assert_eq!(ttl_for(Purpose::Classification, 6000), Duration::from_secs(6 * 3600));
    }

    #[test]
    fn test_cache_key_depends_on_params() {
        let msgs = vec![Message::user("текст")];
        let a = cache_key("m", &msgs, &CompletionOptions::chat(100));
        let b = cache_key("m", &msgs, &CompletionOptions::chat(200));
        let c = cache_key("other", &msgs, &CompletionOptions::chat(100));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, cache_key("m", &msgs, &CompletionOptions::chat(100)));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_second_identical_call_is_served_from_cache() {
        let mock = Arc::new(MockLlmClient::with_replies(["категория"]));
        let llm = CachedLlm::new(mock.clone(), ResponseCache::new(100));
        let msgs = vec![Message::user("Законопроект внесен в Госдуму")];
        let opts = CompletionOptions::classification();

        assert_eq!(llm.complete(&msgs, &opts).await.unwrap(), "категория");
        assert_eq!(llm.complete(&msgs, &opts).await.unwrap(), "категория");
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::EmptyResponse);
        let llm = CachedLlm::new(mock.clone(), ResponseCache::new(100));
        let msgs = vec![Message::user("x")];
        let opts = CompletionOptions::chat(10);

        assert!(llm.complete(&msgs, &opts).await.is_err());
        assert_eq!(llm.complete(&msgs, &opts).await.unwrap(), "Echo from Mock: x");
        assert_eq!(mock.call_count(), 2);
    }
}
