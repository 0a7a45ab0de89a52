//! 场景计划：步骤 DAG、构建器与执行引擎

pub mod builder;
pub mod engine;
pub mod graph;
pub mod types;

pub use builder::{PlanBuilder, DEFAULT_STEP_TIMEOUT_SECS};
pub use engine::{execute_plan, StepRunner};
pub use graph::PlanGraph;
pub use types::*;
