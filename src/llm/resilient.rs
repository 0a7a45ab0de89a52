//! 超时与重试包装
//!
//! 每次调用都有超时。超时后的重试逐步缩小请求：先把 max_tokens 减半，再把最后一条用户消息截断到
//! [`TRUNCATED_PROMPT_CHARS`] 个字符。其它错误只再试一次。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{CompletionOptions, LlmClient, LlmError};
use crate::memory::{Message, Role};
use crate::utils::truncate_chars;

/// 第二次超时后用户消息保留的字符数
pub const TRUNCATED_PROMPT_CHARS: usize = 1500;
/// 非超时错误的总尝试次数
const OTHER_ERROR_ATTEMPTS: usize = 2;
/// 超时的总尝试次数（原请求 + 减半 tokens + 截断 prompt）
const TIMEOUT_ATTEMPTS: usize = 3;

pub struct ResilientLlm {
    inner: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl ResilientLlm {
    pub fn new(inner: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn call_once(&self, messages: &[Message], opts: &CompletionOptions) -> Result<String, LlmError> {
        match tokio::time::timeout(self.timeout, self.inner.complete(messages, opts)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

/// 截断最后一条 User 消息
fn shrink_prompt(messages: &[Message]) -> Vec<Message> {
    let mut shrunk = messages.to_vec();
    if let Some(last_user) = shrunk.iter_mut().rev().find(|m| m.role == Role::User) {
        last_user.content = truncate_chars(&last_user.content, TRUNCATED_PROMPT_CHARS);
    }
    shrunk
}

#[async_trait]
impl LlmClient for ResilientLlm {
    async fn complete(&self, messages: &[Message], opts: &CompletionOptions) -> Result<String, LlmError> {
        let mut current_messages = messages.to_vec();
        let mut current_opts = opts.clone();
        let mut timeouts = 0;
        let mut others = 0;

        loop {
            match self.call_once(&current_messages, &current_opts).await {
                Ok(text) => return Ok(text),
                Err(err) if err.is_timeout() => {
                    timeouts += 1;
                    if timeouts >= TIMEOUT_ATTEMPTS {
                        tracing::error!(model = self.inner.model(), "LLM timed out {} times, giving up", timeouts);
                        return Err(err);
                    }
                    if timeouts == 1 {
                        current_opts.max_tokens = (current_opts.max_tokens / 2).max(1);
                        tracing::warn!(
                            max_tokens = current_opts.max_tokens,
                            "LLM timeout, retrying with fewer tokens"
                        );
                    } else {
                        current_messages = shrink_prompt(&current_messages);
                        tracing::warn!("LLM timeout again, retrying with truncated prompt");
                    }
                }
                Err(err @ LlmError::InvalidRequest(_)) => return Err(err),
                Err(err) => {
                    others += 1;
                    if others >= OTHER_ERROR_ATTEMPTS {
                        tracing::error!(error = %err, "LLM request failed after {} attempts", others);
                        return Err(err);
                    }
                    tracing::warn!(error = %err, "LLM request failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
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

    #[tokio::test]
    async fn test_timeout_shrinks_tokens_then_prompt() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Timeout { secs: 1 });
        mock.push_error(LlmError::Timeout { secs: 1 });
        mock.push_reply("ok");
        let llm = ResilientLlm::new(mock.clone(), Duration::from_secs(5));

        let long_prompt = "я".repeat(4000);
        let out = llm
            .complete(&[Message::user(long_prompt)], &CompletionOptions::digest(1000))
            .await
            .unwrap();
        assert_eq!(out, "ok");

        let calls = mock.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].1.max_tokens, 1000);
        assert_eq!(calls[1].1.max_tokens, 500);
        assert_eq!(calls[1].0[0].content.chars().count(), 4000);
        assert_eq!(calls[2].0[0].content.chars().count(), TRUNCATED_PROMPT_CHARS);
    }

    #[tokio::test]
    async fn test_three_timeouts_give_up() {
        let mock = Arc::new(MockLlmClient::new());
        for _ in 0..3 {
            mock.push_error(LlmError::Timeout { secs: 1 });
        }
        let llm = ResilientLlm::new(mock.clone(), Duration::from_secs(5));
        let err = llm
            .complete(&[Message::user("q")], &CompletionOptions::chat(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_other_error_retried_once() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Request("connection refused".into()));
        mock.push_error(LlmError::Request("connection refused".into()));
        mock.push_reply("never reached");
        let llm = ResilientLlm::new(mock.clone(), Duration::from_secs(5));
        let err = llm
            .complete(&[Message::user("q")], &CompletionOptions::chat(100))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Request(_)));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_slow_backend_hits_timeout() {
        struct Slow;
        #[async_trait]
        impl LlmClient for Slow {
            async fn complete(&self, _: &[Message], _: &CompletionOptions) -> Result<String, LlmError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("late".into())
            }
        }
        let llm = ResilientLlm::new(Arc::new(Slow), Duration::from_millis(10));
        let err = llm
            .complete(&[Message::user("q")], &CompletionOptions::chat(10))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
