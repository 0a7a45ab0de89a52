//! AgentRun：一次推理循环 / 流水线执行的记录
//!
//! 运行期间通过 [`AgentRunBuilder`] 逐步追加步骤；`finish` 消费 builder 得到只读的 [`AgentRun`]，
//! 之后不再提供任何修改方法，存储层也只做 INSERT。

use serde::{Deserialize, Serialize};

use crate::gateway::task_queue::TaskId;

/// 运行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Succeeded" => Some(Self::Succeeded),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// 单步：动作（工具名 / 流水线步骤名 / llm）、输入、观察结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    pub index: usize,
    pub action: String,
    pub input: String,
    pub observation: String,
    /// 毫秒时间戳
    pub at: i64,
}

/// 已完成的运行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    id: String,
    task_id: TaskId,
    session_id: String,
    agent: String,
    status: RunStatus,
    steps: Vec<AgentStep>,
    output: String,
    prompt_tokens: u64,
    completion_tokens: u64,
    started_at: i64,
    finished_at: i64,
}

impl AgentRun {
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
    pub fn agent(&self) -> &str {
        &self.agent
    }
    pub fn status(&self) -> RunStatus {
        self.status
    }
    pub fn steps(&self) -> &[AgentStep] {
        &self.steps
    }
    pub fn output(&self) -> &str {
        &self.output
    }
    pub fn token_usage(&self) -> (u64, u64) {
        (self.prompt_tokens, self.completion_tokens)
    }
    pub fn started_at(&self) -> i64 {
        self.started_at
    }
    pub fn finished_at(&self) -> i64 {
        self.finished_at
    }

    /// 从存储行还原（仅存储层使用）
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: String,
        task_id: TaskId,
        session_id: String,
        agent: String,
        status: RunStatus,
        steps: Vec<AgentStep>,
        output: String,
        tokens: (u64, u64),
        started_at: i64,
        finished_at: i64,
    ) -> Self {
        Self {
            id,
            task_id,
            session_id,
            agent,
            status,
            steps,
            output,
            prompt_tokens: tokens.0,
            completion_tokens: tokens.1,
            started_at,
            finished_at,
        }
    }
}

/// 运行中的记录
#[derive(Debug)]
pub struct AgentRunBuilder {
    id: String,
    task_id: TaskId,
    session_id: String,
    agent: String,
    steps: Vec<AgentStep>,
    prompt_tokens: u64,
    completion_tokens: u64,
    started_at: i64,
}

impl AgentRunBuilder {
    pub fn new(task_id: impl Into<TaskId>, session_id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: format!("run_{}", uuid::Uuid::new_v4()),
            task_id: task_id.into(),
            session_id: session_id.into(),
            agent: agent.into(),
            steps: Vec::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            started_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 同一任务的同一次尝试得到相同 ID，重复写入会被存储拒绝
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.id = format!("run_{}_{attempt}", self.task_id);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn record(&mut self, action: impl Into<String>, input: impl Into<String>, observation: impl Into<String>) {
        let index = self.steps.len();
        self.steps.push(AgentStep {
            index,
            action: action.into(),
            input: input.into(),
            observation: observation.into(),
            at: chrono::Utc::now().timestamp_millis(),
        });
    }

    pub fn add_tokens(&mut self, prompt: u64, completion: u64) {
        self.prompt_tokens += prompt;
        self.completion_tokens += completion;
    }

    pub fn finish(self, status: RunStatus, output: impl Into<String>) -> AgentRun {
        AgentRun {
            id: self.id,
            task_id: self.task_id,
            session_id: self.session_id,
            agent: self.agent,
            status,
            steps: self.steps,
            output: output.into(),
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            started_at: self.started_at,
            finished_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_records_steps_in_order() {
        let mut b = AgentRunBuilder::new("task_1", "tg:1", "answerer");
        b.record("llm", "q", "thinking");
        b.record("search_messages", "{}", "3 results");
        b.add_tokens(10, 5);
        let run = b.finish(RunStatus::Succeeded, "answer");

        assert_eq!(run.steps().len(), 2);
        assert_eq!(run.steps()[1].index, 1);
        assert_eq!(run.steps()[1].action, "search_messages");
        assert_eq!(run.output(), "answer");
        assert_eq!(run.token_usage(), (10, 5));
        assert!(run.finished_at() >= run.started_at());
        assert!(run.id().starts_with("run_"));
    }

    #[test]
    fn test_attempt_ids_are_stable() {
        let a = AgentRunBuilder::new("task_1", "tg:1", "collector").with_attempt(2);
        let b = AgentRunBuilder::new("task_1", "tg:1", "collector").with_attempt(2);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), AgentRunBuilder::new("task_1", "tg:1", "collector").with_attempt(3).id());
    }
}
