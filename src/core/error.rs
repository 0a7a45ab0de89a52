//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryWithPrompt / RetryAfter / Abort。

use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;
use crate::storage::StorageError;
use crate::workflow::WorkflowError;

/// Agent 运行过程中可能出现的错误（超时、解析、工具、LLM、存储等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Task timed out after {0}s")]
    Timeout(u64),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Hallucinated tool: {0}")]
    HallucinatedTool(String),

    #[error("Channel source error: {0}")]
    Source(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cancelled")]
    Cancelled,
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 将提示注入下一轮，让 LLM 重试（如 JSON 格式错误）
    RetryWithPrompt(String),
    /// 等待后整体重试（网络 / 超时 / 数据库忙）
    RetryAfter(Duration),
    /// 终止当前任务
    Abort,
}
