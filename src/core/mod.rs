//! 核心编排层：错误与恢复、AgentRun 记录、场景编排、主控处理器、优雅关闭

pub mod agent_run;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod scenario;
pub mod shutdown;

pub use agent_run::{AgentRun, AgentRunBuilder, AgentStep, RunStatus};
pub use error::{AgentError, RecoveryAction};
pub use orchestrator::Orchestrator;
pub use recovery::{backoff_delay, RecoveryEngine};
pub use scenario::{build_plan, Scenario, ScenarioParams, WorkspaceState};
pub use shutdown::{DatabaseCleanup, JoinCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
