//! 计划执行引擎
//!
//! 按波次运行就绪步骤（同一波次并发），单步带超时；失败步骤的下游全部跳过。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::workflow::graph::PlanGraph;
use crate::workflow::types::*;

/// 步骤执行器：由编排器实现，把 StepAction 映射到具体 agent
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// 成功返回面向用户的一行说明
    async fn run_step(&self, step: &PlanStep) -> Result<String, String>;
}

/// 执行计划，直到所有步骤结束、取消或死锁
pub async fn execute_plan(
    plan: &Plan,
    runner: &dyn StepRunner,
    cancel: &CancellationToken,
) -> Result<PlanReport, WorkflowError> {
    let mut graph = PlanGraph::new(plan);
    let mut states: HashMap<StepId, StepState> =
        plan.steps.iter().map(|s| (s.id.clone(), StepState::Waiting)).collect();
    let mut outcomes: HashMap<StepId, StepOutcome> = HashMap::new();

    tracing::info!(plan = %plan.name, steps = plan.steps.len(), "Plan started");

    loop {
        if states.values().all(StepState::is_finished) {
            break;
        }
        if cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }

        let ready = graph.ready_steps(&states);
        if ready.is_empty() {
            let remaining: Vec<StepId> = plan
                .steps
                .iter()
                .filter(|s| !states.get(&s.id).is_some_and(StepState::is_finished))
                .map(|s| s.id.clone())
                .collect();
            tracing::error!(plan = %plan.name, ?remaining, "Plan deadlocked");
            return Err(WorkflowError::Deadlock { remaining });
        }

        for id in &ready {
            states.insert(id.clone(), StepState::Running);
        }

        let wave = ready
            .iter()
            .filter_map(|id| plan.step(id))
            .map(|step| run_one(step, runner, cancel));
        let results = join_all(wave).await;

        for outcome in results {
            states.insert(outcome.id.clone(), outcome.state);
            match outcome.state {
                StepState::Succeeded => {
                    graph.mark_succeeded(&outcome.id);
                }
                _ => {
                    for skipped in graph.downstream_of(&outcome.id) {
                        if states.get(&skipped).is_some_and(StepState::is_finished) {
                            continue;
                        }
                        states.insert(skipped.clone(), StepState::Skipped);
                        let action = plan.step(&skipped).map(|s| s.action.name()).unwrap_or("unknown");
                        outcomes.insert(
                            skipped.clone(),
                            StepOutcome {
                                id: skipped.clone(),
                                action: action.to_string(),
                                state: StepState::Skipped,
                                detail: format!("пропущен: шаг {} не выполнен", outcome.id),
                                elapsed_ms: 0,
                            },
                        );
                    }
                }
            }
            outcomes.insert(outcome.id.clone(), outcome);
        }
    }

    // 按计划顺序输出
    let ordered: Vec<StepOutcome> = plan.steps.iter().filter_map(|s| outcomes.remove(&s.id)).collect();
    let report = PlanReport::from_outcomes(plan.name.clone(), ordered);
    tracing::info!(
        plan = %plan.name,
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        "Plan finished"
    );
    Ok(report)
}

async fn run_one(step: &PlanStep, runner: &dyn StepRunner, cancel: &CancellationToken) -> StepOutcome {
    let started = Instant::now();
    let limit = Duration::from_secs(step.timeout_secs.max(1));

    let (state, detail) = tokio::select! {
        _ = cancel.cancelled() => (StepState::Failed, "отменено".to_string()),
        result = tokio::time::timeout(limit, runner.run_step(step)) => match result {
            Ok(Ok(detail)) => (StepState::Succeeded, detail),
            Ok(Err(e)) => {
                tracing::warn!(step = %step.id, error = %e, "Step failed");
                (StepState::Failed, e)
            }
            Err(_) => {
                tracing::warn!(step = %step.id, timeout_secs = step.timeout_secs, "Step timed out");
                (StepState::Failed, format!("превышено время ожидания ({} с)", step.timeout_secs))
            }
        },
    };

    StepOutcome {
        id: step.id.clone(),
        action: step.action.name().to_string(),
        state,
        detail,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}
