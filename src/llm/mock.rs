//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 先按顺序弹出预设回复；脚本耗尽后交给 responder（默认回显最后一条 User 消息）。
//! 记录每次调用的消息与参数，便于断言。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{CompletionOptions, LlmClient, LlmError};
use crate::memory::{Message, Role};

type Responder = Box<dyn Fn(&[Message]) -> Result<String, LlmError> + Send + Sync>;

/// Mock 客户端
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    responder: Responder,
    calls: Mutex<Vec<(Vec<Message>, CompletionOptions)>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            responder: Box::new(|messages| {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                Ok(format!("Echo from Mock: {}", last_user))
            }),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 以固定脚本构造
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        for r in replies {
            mock.push_reply(r);
        }
        mock
    }

    /// 自定义脚本耗尽后的回复逻辑
    pub fn with_responder(
        mut self,
        responder: impl Fn(&[Message]) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Box::new(responder);
        self
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(reply.into()));
        }
    }

    pub fn push_error(&self, err: LlmError) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(err));
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// 所有调用记录的副本
    pub fn calls(&self) -> Vec<(Vec<Message>, CompletionOptions)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message], opts: &CompletionOptions) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((messages.to_vec(), opts.clone()));
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(reply) => reply,
            None => (self.responder)(messages),
        }
    }

    fn model(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_echo() {
        let mock = MockLlmClient::with_replies(["first"]);
        mock.push_error(LlmError::EmptyResponse);
        let opts = CompletionOptions::chat(100);
        let msgs = vec![Message::user("hello")];

        assert_eq!(mock.complete(&msgs, &opts).await.unwrap(), "first");
        assert_eq!(mock.complete(&msgs, &opts).await, Err(LlmError::EmptyResponse));
        assert_eq!(mock.complete(&msgs, &opts).await.unwrap(), "Echo from Mock: hello");
        assert_eq!(mock.call_count(), 3);
    }
}
