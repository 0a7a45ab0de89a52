//! 场景：根据当前数据状态编排流水线步骤
//!
//! daily_workflow 会跳过没有必要的步骤（近期已采集、没有待分类消息等）；其余场景步骤固定。

use serde::Deserialize;

use crate::config::AgentsSection;
use crate::storage::DigestSelection;
use crate::workflow::{DigestMode, Plan, PlanBuilder, StepAction, WorkflowError};

/// 复核上限：daily_workflow
const DAILY_REVIEW_LIMIT: u32 = 30;
/// 复核上限：full_analysis
const FULL_REVIEW_LIMIT: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    DailyWorkflow,
    UrgentUpdate,
    FullAnalysis,
    DigestOnly,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::DailyWorkflow,
        Scenario::UrgentUpdate,
        Scenario::FullAnalysis,
        Scenario::DigestOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailyWorkflow => "daily_workflow",
            Self::UrgentUpdate => "urgent_update",
            Self::FullAnalysis => "full_analysis",
            Self::DigestOnly => "digest_only",
        }
    }

    /// 精确匹配场景名
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    /// 未知场景名回退到 daily_workflow
    pub fn parse_or_default(name: &str) -> Self {
        Self::from_name(name).unwrap_or_else(|| {
            tracing::warn!(scenario = name, "Unknown scenario, falling back to daily_workflow");
            Self::DailyWorkflow
        })
    }
}

/// 场景参数（来自 TaskKind::Scenario.params）
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScenarioParams {
    #[serde(default = "default_days")]
    pub days: u32,
    #[serde(default = "default_selection")]
    pub selection: DigestSelection,
    #[serde(default)]
    pub focus: Option<String>,
}

impl Default for ScenarioParams {
    fn default() -> Self {
        Self {
            days: default_days(),
            selection: default_selection(),
            focus: None,
        }
    }
}

fn default_days() -> u32 {
    1
}

fn default_selection() -> DigestSelection {
    DigestSelection::Both
}

impl ScenarioParams {
    /// 解析失败时使用默认参数
    pub fn from_value(value: &serde_json::Value) -> Self {
        if value.is_null() {
            return Self::default();
        }
        serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Invalid scenario params, using defaults");
            Self::default()
        })
    }
}

/// 编排前查看的数据状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkspaceState {
    pub unanalyzed: i64,
    pub low_confidence: i64,
    /// 今天已有的摘要数
    pub todays_digests: i64,
    /// 距上次采集的秒数；从未采集为 None
    pub secs_since_collect: Option<i64>,
}

/// 构建场景计划
pub fn build_plan(
    scenario: Scenario,
    state: &WorkspaceState,
    params: &ScenarioParams,
    agents: &AgentsSection,
) -> Result<Plan, WorkflowError> {
    let analyze = |limit: u32| StepAction::Analyze {
        limit,
        batch_size: agents.batch_size,
    };

    let plan = match scenario {
        Scenario::DailyWorkflow => {
            let mut b = PlanBuilder::new(scenario.as_str());
            let interval = i64::try_from(agents.min_collect_interval_secs).unwrap_or(i64::MAX);
            if state.secs_since_collect.map_or(true, |s| s > interval) {
                b = b.step("collect", StepAction::Collect { days_back: 1 });
            }
            if state.unanalyzed > 0 || b.has_step("collect") {
                b = b
                    .step("analyze", analyze(agents.analyze_limit as u32))
                    .after_existing(&["collect"]);
            }
            if state.low_confidence > 0 {
                b = b
                    .step(
                        "review",
                        StepAction::Review {
                            threshold: 2,
                            limit: DAILY_REVIEW_LIMIT,
                        },
                    )
                    .after_existing(&["analyze"]);
            }
            let mode = if state.todays_digests > 0 {
                DigestMode::Update
            } else {
                DigestMode::Create
            };
            b.step(
                "digest",
                StepAction::Digest {
                    mode,
                    selection: DigestSelection::Both,
                    days: 1,
                    focus: None,
                },
            )
            .after_existing(&["collect", "analyze", "review"])
            .build()?
        }
        Scenario::UrgentUpdate => PlanBuilder::new(scenario.as_str())
            .step("collect", StepAction::Collect { days_back: 1 })
            .timeout(180)
            .step("analyze", analyze(50))
            .timeout(120)
            .after("collect")
            .step(
                "digest",
                StepAction::Digest {
                    mode: DigestMode::Update,
                    selection: DigestSelection::Brief,
                    days: 1,
                    focus: None,
                },
            )
            .timeout(120)
            .after("analyze")
            .build()?,
        Scenario::FullAnalysis => PlanBuilder::new(scenario.as_str())
            .step("collect", StepAction::Collect { days_back: 7 })
            .timeout(600)
            .step("analyze", analyze(500))
            .timeout(900)
            .after("collect")
            .step(
                "review",
                StepAction::Review {
                    threshold: 3,
                    limit: FULL_REVIEW_LIMIT,
                },
            )
            .timeout(600)
            .after("analyze")
            .step(
                "digest",
                StepAction::Digest {
                    mode: DigestMode::Create,
                    selection: DigestSelection::Both,
                    days: 7,
                    focus: None,
                },
            )
            .after("review")
            .build()?,
        Scenario::DigestOnly => PlanBuilder::new(scenario.as_str())
            .step(
                "digest",
                StepAction::Digest {
                    mode: DigestMode::Create,
                    selection: params.selection,
                    days: params.days.max(1),
                    focus: params.focus.clone(),
                },
            )
            .build()?,
    };
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(plan: &Plan) -> Vec<&str> {
        plan.steps.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_scenario_names_and_fallback() {
        assert_eq!(Scenario::from_name("Full_Analysis"), Some(Scenario::FullAnalysis));
        assert_eq!(Scenario::parse_or_default("weekly_magic"), Scenario::DailyWorkflow);
        for s in Scenario::ALL {
            assert_eq!(Scenario::from_name(s.as_str()), Some(s));
        }
    }

    #[test]
    fn test_daily_workflow_fresh_start() {
        let plan = build_plan(
            Scenario::DailyWorkflow,
            &WorkspaceState::default(),
            &ScenarioParams::default(),
            &AgentsSection::default(),
        )
        .unwrap();
        assert_eq!(ids(&plan), vec!["collect", "analyze", "digest"]);
        let digest = plan.step("digest").unwrap();
        assert_eq!(digest.depends_on, vec!["collect".to_string(), "analyze".to_string()]);
        assert!(matches!(
            digest.action,
            StepAction::Digest { mode: DigestMode::Create, .. }
        ));
    }

    #[test]
    fn test_daily_workflow_skips_recent_collection() {
        let state = WorkspaceState {
            unanalyzed: 0,
            low_confidence: 3,
            todays_digests: 2,
            secs_since_collect: Some(600),
        };
        let plan = build_plan(
            Scenario::DailyWorkflow,
            &state,
            &ScenarioParams::default(),
            &AgentsSection::default(),
        )
        .unwrap();
        assert_eq!(ids(&plan), vec!["review", "digest"]);
        assert!(plan.step("review").unwrap().depends_on.is_empty());
        assert!(matches!(
            plan.step("digest").unwrap().action,
            StepAction::Digest { mode: DigestMode::Update, .. }
        ));
    }

    #[test]
    fn test_fixed_scenarios() {
        let agents = AgentsSection::default();
        let state = WorkspaceState::default();
        let params = ScenarioParams::default();

        let urgent = build_plan(Scenario::UrgentUpdate, &state, &params, &agents).unwrap();
        assert_eq!(ids(&urgent), vec!["collect", "analyze", "digest"]);
        assert_eq!(urgent.step("collect").unwrap().timeout_secs, 180);
        assert_eq!(
            urgent.step("analyze").unwrap().action,
            StepAction::Analyze { limit: 50, batch_size: agents.batch_size }
        );

        let full = build_plan(Scenario::FullAnalysis, &state, &params, &agents).unwrap();
        assert_eq!(ids(&full), vec!["collect", "analyze", "review", "digest"]);
        assert_eq!(full.step("analyze").unwrap().timeout_secs, 900);
        assert_eq!(full.step("collect").unwrap().action, StepAction::Collect { days_back: 7 });
    }

    #[test]
    fn test_digest_only_uses_params() {
        let params = ScenarioParams::from_value(&serde_json::json!({
            "days": 3,
            "selection": "brief",
            "focus": "новые законы"
        }));
        let plan = build_plan(
            Scenario::DigestOnly,
            &WorkspaceState::default(),
            &params,
            &AgentsSection::default(),
        )
        .unwrap();
        assert_eq!(
            plan.steps[0].action,
            StepAction::Digest {
                mode: DigestMode::Create,
                selection: DigestSelection::Brief,
                days: 3,
                focus: Some("новые законы".into()),
            }
        );
        assert_eq!(ScenarioParams::from_value(&serde_json::json!("junk")), ScenarioParams::default());
    }
}
