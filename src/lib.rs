//! lawdigest - Telegram 法律新闻摘要智能体
//!
//! 模块划分：
//! - **agents**: 采集、分类、审校、摘要
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器、场景、错误与恢复、AgentRun、优雅关闭
//! - **gateway**: 入站请求、Hub、会话存储、任务队列与执行器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock），超时重试与缓存
//! - **memory**: 问答的短期对话历史
//! - **observability**: 日志初始化
//! - **react**: 问答推理循环
//! - **scheduler**: 定时任务
//! - **storage**: SQLite 持久化
//! - **telegram**: teloxide 接入与出口
//! - **tools**: 推理循环可调用的新闻检索工具
//! - **utils**: 文本与日期工具
//! - **workflow**: 场景计划 DAG 与执行引擎

pub mod agents;
pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod scheduler;
pub mod storage;
pub mod telegram;
pub mod tools;
pub mod utils;
pub mod workflow;
