//! 推理循环可调用的工具

pub mod executor;
pub mod news;
pub mod registry;

use chrono::FixedOffset;

pub use executor::ToolExecutor;
pub use news::{GetMessageTool, LatestDigestTool, ListCategoriesTool, SearchMessagesTool};
pub use registry::{Tool, ToolRegistry};

use crate::storage::Database;

/// 单次工具调用超时（秒）
pub const TOOL_TIMEOUT_SECS: u64 = 30;

/// 问答使用的默认工具集
pub fn default_registry(db: &Database, offset: FixedOffset) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(LatestDigestTool::new(db.clone()));
    registry.register(SearchMessagesTool::new(db.clone(), offset));
    registry.register(GetMessageTool::new(db.clone(), offset));
    registry.register(ListCategoriesTool);
    registry
}
