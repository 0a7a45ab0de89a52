//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）以及包装层（超时重试、缓存）都实现 LlmClient。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM returned an empty response")]
    EmptyResponse,

    #[error("Invalid LLM request: {0}")]
    InvalidRequest(String),
}

impl LlmError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LlmError::Timeout { .. })
    }
}

/// 调用用途，决定缓存 TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Classification,
    Digest,
    Chat,
}

/// 单次调用参数
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub purpose: Purpose,
}

impl CompletionOptions {
    /// 分类：短输出、低温度
    pub fn classification() -> Self {
        Self {
            max_tokens: 100,
            temperature: 0.1,
            purpose: Purpose::Classification,
        }
    }

    pub fn digest(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            temperature: 0.7,
            purpose: Purpose::Digest,
        }
    }

    pub fn chat(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            temperature: 0.5,
            purpose: Purpose::Chat,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message], opts: &CompletionOptions) -> Result<String, LlmError>;

    /// 模型名（缓存键的一部分）
    fn model(&self) -> &str {
        ""
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
