//! 计划依赖图
//!
//! 使用邻接表和入度表实现 DAG 调度

use std::collections::{HashMap, HashSet, VecDeque};

use crate::workflow::types::*;

/// 计划依赖图
pub struct PlanGraph {
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    pub adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 未完成的依赖数
    pub in_degree: HashMap<StepId, usize>,
    /// 计划中的原始顺序，保证调度稳定
    order: Vec<StepId>,
}

impl PlanGraph {
    pub fn new(plan: &Plan) -> Self {
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();

        for step in &plan.steps {
            in_degree.insert(step.id.clone(), 0);
            adjacency.insert(step.id.clone(), Vec::new());
        }

        for step in &plan.steps {
            for dep in &step.depends_on {
                adjacency.entry(dep.clone()).or_default().push(step.id.clone());
                *in_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
        }

        Self {
            adjacency,
            in_degree,
            order: plan.steps.iter().map(|s| s.id.clone()).collect(),
        }
    }

    /// 入度为 0 且仍在等待的步骤（按计划顺序）
    pub fn ready_steps(&self, states: &HashMap<StepId, StepState>) -> Vec<StepId> {
        self.order
            .iter()
            .filter(|id| {
                self.in_degree.get(*id) == Some(&0)
                    && matches!(states.get(*id), Some(StepState::Waiting) | None)
            })
            .cloned()
            .collect()
    }

    /// 步骤成功：下游入度减一，返回新就绪的步骤
    pub fn mark_succeeded(&mut self, step_id: &str) -> Vec<StepId> {
        let mut newly_ready = Vec::new();
        if let Some(dependents) = self.adjacency.get(step_id) {
            for dependent in dependents {
                if let Some(degree) = self.in_degree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        newly_ready.push(dependent.clone());
                    }
                }
            }
        }
        newly_ready
    }

    /// 步骤失败：返回所有传递下游（将被跳过）
    pub fn downstream_of(&self, step_id: &str) -> Vec<StepId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([step_id]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            if let Some(dependents) = self.adjacency.get(current) {
                for dependent in dependents {
                    if seen.insert(dependent.clone()) {
                        out.push(dependent.clone());
                        queue.push_back(dependent);
                    }
                }
            }
        }
        out
    }
}
