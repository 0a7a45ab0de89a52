//! 计划类型定义
//!
//! 场景被编排为若干 PlanStep，步骤之间以依赖连接成 DAG

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::DigestSelection;

pub type StepId = String;

/// 摘要步骤：新建或原地更新当天摘要
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestMode {
    Create,
    Update,
}

/// 步骤动作（对应一个 agent 调用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    /// 采集频道消息
    Collect { days_back: u32 },
    /// 对未分类消息分类
    Analyze { limit: u32, batch_size: usize },
    /// 复核低置信度分类
    Review { threshold: u8, limit: u32 },
    /// 生成摘要
    Digest {
        mode: DigestMode,
        selection: DigestSelection,
        days: u32,
        focus: Option<String>,
    },
}

impl StepAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Collect { .. } => "collect",
            Self::Analyze { .. } => "analyze",
            Self::Review { .. } => "review",
            Self::Digest { .. } => "digest",
        }
    }
}

/// 计划中的一个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: StepId,
    pub action: StepAction,
    pub depends_on: Vec<StepId>,
    pub timeout_secs: u64,
}

/// 步骤执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    /// 等待依赖满足
    Waiting,
    Running,
    Succeeded,
    Failed,
    /// 依赖失败或被取消，未执行
    Skipped,
}

impl StepState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// 场景计划
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// 单步执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub id: StepId,
    pub action: String,
    pub state: StepState,
    pub detail: String,
    pub elapsed_ms: u64,
}

/// 计划执行报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    pub plan: String,
    pub steps: Vec<StepOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl PlanReport {
    pub fn from_outcomes(plan: impl Into<String>, steps: Vec<StepOutcome>) -> Self {
        let count = |state: StepState| steps.iter().filter(|s| s.state == state).count();
        Self {
            plan: plan.into(),
            succeeded: count(StepState::Succeeded),
            failed: count(StepState::Failed),
            skipped: count(StepState::Skipped),
            steps,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    pub fn outcome(&self, id: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// 面向用户的执行总结
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Сценарий «{}»: выполнено {}, ошибок {}, пропущено {}",
            self.plan, self.succeeded, self.failed, self.skipped
        );
        for step in &self.steps {
            let mark = match step.state {
                StepState::Succeeded => "✅",
                StepState::Failed => "❌",
                StepState::Skipped => "⏭",
                StepState::Waiting | StepState::Running => "⏳",
            };
            out.push_str(&format!("\n{mark} {}: {}", step.id, step.detail));
        }
        out
    }
}

/// 计划错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("duplicate step id: {0}")]
    DuplicateStep(StepId),

    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("plan deadlocked, remaining steps: {remaining:?}")]
    Deadlock { remaining: Vec<StepId> },

    #[error("plan cancelled")]
    Cancelled,
}
