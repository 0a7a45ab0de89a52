//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供推理循环与任务执行器决定是重试还是终止。

use std::time::Duration;

use crate::core::{AgentError, RecoveryAction};
use crate::llm::LlmError;

/// 指数退避上限（秒）
const MAX_BACKOFF_SECS: u64 = 60;

/// 第 attempt 次失败后的等待时间：min(2^attempt, 60) 秒
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 2u64.checked_pow(attempt).unwrap_or(u64::MAX).min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// attempt 为已失败次数（从 1 开始）
    pub fn handle(&self, err: &AgentError, attempt: u32) -> RecoveryAction {
        match err {
            AgentError::JsonParseError(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Предыдущий ответ содержал некорректный JSON: {raw}. \
                 Чтобы вызвать инструмент, выведи ровно один JSON-объект без Markdown и пояснений: \
                 {{\"tool\": \"имя\", \"args\": {{...}}}}. Если инструмент не нужен, ответь обычным текстом."
            )),
            AgentError::HallucinatedTool(name) => RecoveryAction::RetryWithPrompt(format!(
                "Инструмента '{name}' не существует. Используй только инструменты из списка или ответь текстом."
            )),
            AgentError::Timeout(_)
            | AgentError::ToolExecutionFailed(_)
            | AgentError::Source(_)
            | AgentError::Storage(_)
            | AgentError::Llm(LlmError::Timeout { .. })
            | AgentError::Llm(LlmError::Request(_))
            | AgentError::Llm(LlmError::EmptyResponse) => RecoveryAction::RetryAfter(backoff_delay(attempt)),
            AgentError::Llm(LlmError::InvalidRequest(_))
            | AgentError::Workflow(_)
            | AgentError::InvalidInput(_)
            | AgentError::Cancelled => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        assert_eq!(backoff_delay(200), Duration::from_secs(60));
    }

    #[test]
    fn test_recovery_json_parse_error() {
        let engine = RecoveryEngine::new();
        let action = engine.handle(&AgentError::JsonParseError("{bad".into()), 1);
        match action {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("JSON")),
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_hallucinated_tool() {
        let engine = RecoveryEngine::new();
        match engine.handle(&AgentError::HallucinatedTool("fake_tool".into()), 1) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("fake_tool")),
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_timeout_backs_off() {
        let engine = RecoveryEngine::new();
        assert_eq!(
            engine.handle(&AgentError::Timeout(300), 2),
            RecoveryAction::RetryAfter(Duration::from_secs(4))
        );
        assert_eq!(
            engine.handle(&AgentError::Llm(LlmError::Timeout { secs: 30 }), 1),
            RecoveryAction::RetryAfter(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_recovery_cancelled_aborts() {
        let engine = RecoveryEngine::new();
        assert_eq!(engine.handle(&AgentError::Cancelled, 1), RecoveryAction::Abort);
        assert_eq!(
            engine.handle(&AgentError::InvalidInput("bad date".into()), 1),
            RecoveryAction::Abort
        );
    }
}
