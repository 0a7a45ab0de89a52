//! 推理循环：Plan -> Act (Tool) -> Observe -> 下一轮 Plan
//!
//! 步数以 max_steps 为上限；JSON 格式错误时由 RecoveryEngine 注入纠正提示（计为一步）；
//! 每一步前检查取消令牌。所有步骤写入 AgentRunBuilder。

use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, AgentRunBuilder, RecoveryAction, RecoveryEngine};
use crate::memory::Message;
use crate::react::planner::{parse_llm_output, Planner, PlannerOutput};
use crate::tools::ToolExecutor;
use crate::utils::preview;

/// 默认最大步数
pub const DEFAULT_MAX_STEPS: usize = 6;
/// 写入 AgentRun 的观察结果预览长度
const OBSERVATION_PREVIEW_CHARS: usize = 500;

/// 单次循环所需的依赖
pub struct ReactSession<'a> {
    pub planner: &'a Planner,
    pub executor: &'a ToolExecutor,
    pub recovery: &'a RecoveryEngine,
    pub cancel: CancellationToken,
    pub max_steps: usize,
}

impl<'a> ReactSession<'a> {
    pub fn new(
        planner: &'a Planner,
        executor: &'a ToolExecutor,
        recovery: &'a RecoveryEngine,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            planner,
            executor,
            recovery,
            cancel,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }
}

/// 循环结果
#[derive(Debug, Clone, PartialEq)]
pub struct ReactResult {
    pub answer: String,
    pub steps: usize,
    /// 是否因步数上限结束
    pub hit_limit: bool,
}

/// 执行推理循环：history 为会话历史（不含本次问题）
pub async fn react_loop(
    session: &ReactSession<'_>,
    history: &[Message],
    question: &str,
    run: &mut AgentRunBuilder,
) -> Result<ReactResult, AgentError> {
    let mut messages: Vec<Message> = history.to_vec();
    messages.push(Message::user(question.to_string()));

    let (init_prompt, init_completion, _) = session.planner.token_usage();
    let mut last_output = String::new();
    let mut step = 0;
    let mut parse_failures = 0u32;

    let result = loop {
        if session.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        if step >= session.max_steps {
            tracing::warn!(max_steps = session.max_steps, "Reasoning loop hit step limit");
            break ReactResult {
                answer: format!(
                    "{}\n\n(Достигнут лимит шагов рассуждения: {}.)",
                    last_output.trim(),
                    session.max_steps
                ),
                steps: step,
                hit_limit: true,
            };
        }
        step += 1;

        let output = tokio::select! {
            _ = session.cancel.cancelled() => return Err(AgentError::Cancelled),
            out = session.planner.plan(&messages) => out?,
        };
        last_output = output.clone();

        match parse_llm_output(&output) {
            Ok(PlannerOutput::Answer(answer)) => {
                run.record("answer", question, preview(&answer, OBSERVATION_PREVIEW_CHARS));
                break ReactResult {
                    answer,
                    steps: step,
                    hit_limit: false,
                };
            }
            Ok(PlannerOutput::ToolCall(tc)) => {
                let names = session.executor.tool_names();
                let observation = if !names.iter().any(|n| n == &tc.tool) {
                    tracing::warn!(tool = %tc.tool, "LLM requested unknown tool");
                    format!(
                        "Инструмент '{}' не существует. Доступные инструменты: {}",
                        tc.tool,
                        names.join(", ")
                    )
                } else {
                    match session.executor.execute(&tc.tool, tc.args.clone()).await {
                        Ok(r) => r,
                        Err(e) => format!("Ошибка: {e}"),
                    }
                };
                run.record(
                    tc.tool.clone(),
                    tc.args.to_string(),
                    preview(&observation, OBSERVATION_PREVIEW_CHARS),
                );
                messages.push(Message::assistant(output));
                messages.push(Message::user(format!("Результат {}: {}", tc.tool, observation)));
            }
            Err(e) => {
                parse_failures += 1;
                match session.recovery.handle(&e, parse_failures) {
                    RecoveryAction::RetryWithPrompt(prompt) => {
                        tracing::debug!(error = %e, "Injecting correction prompt");
                        run.record("recovery", preview(&output, OBSERVATION_PREVIEW_CHARS), prompt.clone());
                        messages.push(Message::assistant(output));
                        messages.push(Message::user(prompt));
                    }
                    _ => return Err(e),
                }
            }
        }
    };

    let (cur_prompt, cur_completion, _) = session.planner.token_usage();
    run.add_tokens(
        cur_prompt.saturating_sub(init_prompt),
        cur_completion.saturating_sub(init_completion),
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::llm::{CompletionOptions, MockLlmClient};
    use crate::tools::{Tool, ToolRegistry};

    struct CountTool;

    #[async_trait]
    impl Tool for CountTool {
        fn name(&self) -> &str {
            "count_laws"
        }
        fn description(&self) -> &str {
            "count"
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok("3 закона".to_string())
        }
    }

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(CountTool);
        ToolExecutor::new(registry, 5)
    }

    fn planner(mock: Arc<MockLlmClient>) -> Planner {
        Planner::new(mock, "system", CompletionOptions::chat(512))
    }

    #[tokio::test]
    async fn test_tool_observation_feeds_next_step() {
        let mock = Arc::new(MockLlmClient::with_replies([
            r#"{"tool": "count_laws", "args": {}}"#,
            "Сегодня принято 3 закона.",
        ]));
        let planner = planner(mock.clone());
        let executor = executor();
        let recovery = RecoveryEngine::new();
        let session = ReactSession::new(&planner, &executor, &recovery, CancellationToken::new());
        let mut run = AgentRunBuilder::new("t1", "tg:1", "answerer");

        let result = react_loop(&session, &[], "Сколько законов?", &mut run).await.unwrap();
        assert_eq!(result.answer, "Сегодня принято 3 закона.");
        assert_eq!(result.steps, 2);
        assert!(!result.hit_limit);
        assert_eq!(run.step_count(), 2);

        let calls = mock.calls();
        let second = &calls[1].0;
        assert!(second.iter().any(|m| m.content.contains("Результат count_laws: 3 закона")));
    }

    #[tokio::test]
    async fn test_unknown_tool_lists_available_tools() {
        let mock = Arc::new(MockLlmClient::with_replies([
            r#"{"tool": "weather", "args": {}}"#,
            "Не могу узнать погоду.",
        ]));
        let planner = planner(mock.clone());
        let executor = executor();
        let recovery = RecoveryEngine::new();
        let session = ReactSession::new(&planner, &executor, &recovery, CancellationToken::new());
        let mut run = AgentRunBuilder::new("t1", "tg:1", "answerer");

        react_loop(&session, &[], "Погода?", &mut run).await.unwrap();
        let calls = mock.calls();
        assert!(calls[1].0.iter().any(|m| m.content.contains("Доступные инструменты: count_laws")));
    }

    #[tokio::test]
    async fn test_bad_json_injects_correction_and_counts_as_step() {
        let mock = Arc::new(MockLlmClient::with_replies([r#"{"tool": "count_laws", "args": "#, "Ответ"]));
        let planner = planner(mock.clone());
        let executor = executor();
        let recovery = RecoveryEngine::new();
        let session = ReactSession::new(&planner, &executor, &recovery, CancellationToken::new());
        let mut run = AgentRunBuilder::new("t1", "tg:1", "answerer");

        let result = react_loop(&session, &[], "?", &mut run).await.unwrap();
        assert_eq!(result.answer, "Ответ");
        assert_eq!(result.steps, 2);
        assert!(mock.calls()[1].0.iter().any(|m| m.content.contains("JSON")));
    }

    #[tokio::test]
    async fn test_step_limit_returns_last_output() {
        let mock = Arc::new(
            MockLlmClient::new().with_responder(|_| Ok(r#"{"tool": "count_laws", "args": {}}"#.to_string())),
        );
        let planner = planner(mock.clone());
        let executor = executor();
        let recovery = RecoveryEngine::new();
        let session =
            ReactSession::new(&planner, &executor, &recovery, CancellationToken::new()).with_max_steps(3);
        let mut run = AgentRunBuilder::new("t1", "tg:1", "answerer");

        let result = react_loop(&session, &[], "?", &mut run).await.unwrap();
        assert!(result.hit_limit);
        assert_eq!(result.steps, 3);
        assert_eq!(mock.call_count(), 3);
        assert!(result.answer.contains("лимит шагов"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mock = Arc::new(MockLlmClient::new());
        let planner = planner(mock.clone());
        let executor = executor();
        let recovery = RecoveryEngine::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let session = ReactSession::new(&planner, &executor, &recovery, cancel);
        let mut run = AgentRunBuilder::new("t1", "tg:1", "answerer");

        let err = react_loop(&session, &[], "?", &mut run).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(mock.call_count(), 0);
    }
}
