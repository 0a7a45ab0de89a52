//! 推理层：Planner 与有界推理循环

pub mod loop_;
pub mod planner;

pub use loop_::{react_loop, ReactResult, ReactSession, DEFAULT_MAX_STEPS};
pub use planner::{parse_llm_output, question_system_prompt, Planner, PlannerOutput, ToolCall};
