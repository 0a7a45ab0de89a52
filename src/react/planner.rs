//! Planner：调用 LLM 并解析其输出
//!
//! 回复要么是 JSON 工具调用 `{"tool": "...", "args": {...}}`，要么是直接回答；
//! parse_llm_output 从文本中提取 JSON 并解析为 ToolCall 或 Answer。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::llm::{CompletionOptions, LlmClient};
use crate::memory::Message;

/// LLM 返回的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Planner 输出
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 最终回答
    Answer(String),
    /// 需要执行工具
    ToolCall(ToolCall),
}

/// 解析 LLM 输出：含 `"tool"` 字段的 JSON 视为工具调用，其余视为回答；
/// 看起来像工具调用但 JSON 不合法时返回 JsonParseError
pub fn parse_llm_output(output: &str) -> Result<PlannerOutput, AgentError> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            (Some(start), _) => &trimmed[start..],
            _ => return Ok(PlannerOutput::Answer(trimmed.to_string())),
        }
    };

    if !json_str.contains("\"tool\"") {
        return Ok(PlannerOutput::Answer(trimmed.to_string()));
    }

    let parsed: ToolCall = serde_json::from_str(json_str)
        .map_err(|e| AgentError::JsonParseError(format!("{e}: {json_str}")))?;

    if parsed.tool.trim().is_empty() {
        Ok(PlannerOutput::Answer(trimmed.to_string()))
    } else {
        Ok(PlannerOutput::ToolCall(parsed))
    }
}

/// 问答系统提示：角色、工具列表与输出格式
pub fn question_system_prompt(tools_schema: &str, today: &str) -> String {
    format!(
        "Ты помощник по правовым новостям России. Сегодня {today}.\n\
         Отвечай на вопросы пользователя по-русски, опираясь на собранные сообщения официальных каналов и дайджесты.\n\n\
         Доступные инструменты:\n{tools_schema}\n\n\
         Чтобы вызвать инструмент, ответь ровно одним JSON-объектом без пояснений:\n\
         {{\"tool\": \"имя\", \"args\": {{...}}}}\n\
         Когда информации достаточно, ответь обычным текстом без JSON. \
         Если данных нет, честно скажи об этом."
    )
}

/// Planner：持有 LLM、system prompt 与调用参数
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    opts: CompletionOptions,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>, opts: CompletionOptions) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            opts,
        }
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 拼 system + messages 后调用 LLM
    pub async fn plan(&self, messages: &[Message]) -> Result<String, AgentError> {
        let mut full = Vec::with_capacity(messages.len() + 1);
        full.push(Message::system(self.system_prompt.clone()));
        full.extend_from_slice(messages);
        Ok(self.llm.complete(&full, &self.opts).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_answer() {
        let out = parse_llm_output("  Новых законов сегодня не было.  ").unwrap();
        assert_eq!(out, PlannerOutput::Answer("Новых законов сегодня не было.".into()));
    }

    #[test]
    fn test_parse_tool_call_with_surrounding_text() {
        let out = parse_llm_output(r#"Проверю: {"tool": "get_message", "args": {"id": 7}}"#).unwrap();
        match out {
            PlannerOutput::ToolCall(tc) => {
                assert_eq!(tc.tool, "get_message");
                assert_eq!(tc.args["id"], 7);
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_fenced_json_and_missing_args() {
        let out = parse_llm_output("```json\n{\"tool\": \"list_categories\"}\n```").unwrap();
        assert_eq!(
            out,
            PlannerOutput::ToolCall(ToolCall {
                tool: "list_categories".into(),
                args: serde_json::Value::Null,
            })
        );
    }

    #[test]
    fn test_braces_without_tool_are_an_answer() {
        let text = "Статья 5 {в редакции 2024 года} изменена.";
        assert_eq!(parse_llm_output(text).unwrap(), PlannerOutput::Answer(text.into()));
    }

    #[test]
    fn test_malformed_tool_json_is_an_error() {
        let err = parse_llm_output(r#"{"tool": "search_messages", "args": {"query": }"#).unwrap_err();
        assert!(matches!(err, AgentError::JsonParseError(_)));
    }
}
