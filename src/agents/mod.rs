//! 流水线 agent：采集 -> 分类 -> 审校 -> 摘要

pub mod analyzer;
pub mod categories;
pub mod collector;
pub mod critic;
pub mod digester;

pub use analyzer::{parse_classification, AnalyzeReport, Analyzer};
pub use collector::{ChannelPost, ChannelSource, CollectReport, DataCollector, WebPreviewSource};
pub use critic::{parse_review, Critic, ReviewOutcome, ReviewReport};
pub use digester::{render_digest, DigestRequest, DigestResult, Digester};
