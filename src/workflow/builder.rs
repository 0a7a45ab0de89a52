//! 计划构建器

use std::collections::HashSet;

use crate::workflow::types::*;

/// 默认步骤超时（秒）
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// 流式构建 Plan
pub struct PlanBuilder {
    name: String,
    steps: Vec<PlanStep>,
}

impl PlanBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// 添加步骤（无依赖，默认超时）
    pub fn step(mut self, id: impl Into<StepId>, action: StepAction) -> Self {
        self.steps.push(PlanStep {
            id: id.into(),
            action,
            depends_on: Vec::new(),
            timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
        });
        self
    }

    /// 为最近添加的步骤设置超时
    pub fn timeout(mut self, secs: u64) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.timeout_secs = secs;
        }
        self
    }

    /// 为最近添加的步骤追加依赖
    pub fn after(mut self, dependency: impl Into<StepId>) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.depends_on.push(dependency.into());
        }
        self
    }

    /// 最近添加的步骤依赖之前所有已存在的指定步骤（不存在的忽略）
    pub fn after_existing(mut self, candidates: &[&str]) -> Self {
        let existing: HashSet<String> = self.steps.iter().map(|s| s.id.clone()).collect();
        if let Some(step) = self.steps.last_mut() {
            for dep in candidates {
                if existing.contains(*dep) && step.id != *dep {
                    step.depends_on.push((*dep).to_string());
                }
            }
        }
        self
    }

    pub fn has_step(&self, id: &str) -> bool {
        self.steps.iter().any(|s| s.id == id)
    }

    /// 校验：步骤 ID 唯一、依赖存在
    pub fn build(self) -> Result<Plan, WorkflowError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.clone()) {
                return Err(WorkflowError::DuplicateStep(step.id.clone()));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep) {
                    return Err(WorkflowError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        Ok(Plan {
            name: self.name,
            steps: self.steps,
        })
    }
}
