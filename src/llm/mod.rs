//! LLM 层：客户端抽象、OpenAI 兼容实现、Mock，以及超时重试与缓存包装

mod cache;
mod mock;
mod openai;
mod resilient;
mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use cache::{ttl_for, CachedLlm, ResponseCache};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use resilient::{ResilientLlm, TRUNCATED_PROMPT_CHARS};
pub use traits::{CompletionOptions, LlmClient, LlmError, Purpose};

use crate::config::LlmSection;

/// 分类模型与写作模型
#[derive(Clone)]
pub struct LlmClients {
    /// 分析 / 审校
    pub classifier: Arc<dyn LlmClient>,
    /// 摘要 / 问答
    pub writer: Arc<dyn LlmClient>,
}

impl LlmClients {
    /// 测试与离线模式：两个角色共用同一客户端
    pub fn single(client: Arc<dyn LlmClient>) -> Self {
        Self {
            classifier: client.clone(),
            writer: client,
        }
    }
}

/// 按配置组装：OpenAiClient -> ResilientLlm（超时重试） -> CachedLlm（可选）
pub fn create_clients(cfg: &LlmSection) -> LlmClients {
    let timeout = Duration::from_secs(cfg.request_timeout_secs);
    let cache = cfg.cache_enabled.then(|| ResponseCache::new(cfg.cache_capacity));

    let build = |model: &str| -> Arc<dyn LlmClient> {
        let base: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(&cfg.base_url, model, cfg.api_key.as_deref()));
        let resilient: Arc<dyn LlmClient> = Arc::new(ResilientLlm::new(base, timeout));
        match &cache {
            Some(cache) => Arc::new(CachedLlm::new(resilient, cache.clone())),
            None => resilient,
        }
    };

    tracing::info!(
        base_url = %cfg.base_url,
        classifier = %cfg.classifier_model,
        writer = %cfg.writer_model,
        "LLM clients created"
    );

    LlmClients {
        classifier: build(&cfg.classifier_model),
        writer: build(&cfg.writer_model),
    }
}
