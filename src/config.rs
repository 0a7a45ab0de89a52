//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `LAWDIGEST__*` 覆盖（双下划线表示嵌套，如 `LAWDIGEST__LLM__BASE_URL=...`）。
//! 另外兼容三个扁平变量：`TELEGRAM_BOT_TOKEN`、`LLM_STUDIO_URL`、`DATABASE_URL`（见 [`apply_env_fallbacks`]）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub database: DatabaseSection,
    pub telegram: TelegramSection,
    pub llm: LlmSection,
    pub queue: QueueSection,
    pub agents: AgentsSection,
    pub scheduler: SchedulerSection,
}

/// [app] 段：应用名、会话历史轮数、会话闲置归档时间
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 推理上下文中保留的历史轮数
    #[serde(default = "default_max_context_turns")]
    pub max_context_turns: usize,
    /// 会话闲置超过该秒数后归档
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_context_turns: default_max_context_turns(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

fn default_max_context_turns() -> usize {
    10
}

fn default_session_idle_secs() -> u64 {
    7 * 24 * 3600
}

/// [database] 段
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("lawdigest.db")
}

fn default_max_connections() -> u32 {
    5
}

/// [telegram] 段：Bot Token 与允许使用 Bot 的用户（为空表示不限制）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelegramSection {
    pub token: Option<String>,
    #[serde(default)]
    pub allowed_users: Vec<i64>,
    /// Bot 的用户名（不含 @），用于生成 `t.me/<bot>?start=msg_<id>` 深链接
    pub bot_username: Option<String>,
}

/// [llm] 段：OpenAI 兼容端点（默认本地 LM Studio）、两个模型、超时与缓存
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub api_key: Option<String>,
    /// 分类 / 审校用模型
    #[serde(default = "default_classifier_model")]
    pub classifier_model: String,
    /// 摘要 / 问答用模型
    #[serde(default = "default_writer_model")]
    pub writer_model: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            classifier_model: default_classifier_model(),
            writer_model: default_writer_model(),
            request_timeout_secs: default_request_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            cache_capacity: default_cache_capacity(),
            cache_enabled: true,
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:1234/v1".to_string()
}

fn default_classifier_model() -> String {
    "qwen2.5-14b-instruct-1m".to_string()
}

fn default_writer_model() -> String {
    "gemma-3-12b-it".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_tokens() -> u32 {
    1500
}

fn default_temperature() -> f32 {
    0.7
}

fn default_cache_capacity() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

/// [queue] 段：并发数、单任务超时、重试次数、清理周期
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_cleanup_hours")]
    pub cleanup_after_hours: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            task_timeout_secs: default_task_timeout(),
            max_retries: default_max_retries(),
            cleanup_after_hours: default_cleanup_hours(),
        }
    }
}

fn default_max_concurrent() -> usize {
    3
}

fn default_task_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_cleanup_hours() -> u64 {
    24
}

/// [agents] 段：采集频道、分批大小、低置信阈值、推理步数上限
#[derive(Debug, Clone, Deserialize)]
pub struct AgentsSection {
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_analyze_limit")]
    pub analyze_limit: usize,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: u8,
    #[serde(default = "default_max_react_steps")]
    pub max_react_steps: usize,
    /// 两次采集之间的最短间隔（秒），daily_workflow 据此决定是否采集
    #[serde(default = "default_collect_interval")]
    pub min_collect_interval_secs: u64,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            batch_size: default_batch_size(),
            analyze_limit: default_analyze_limit(),
            confidence_threshold: default_confidence_threshold(),
            max_react_steps: default_max_react_steps(),
            min_collect_interval_secs: default_collect_interval(),
        }
    }
}

fn default_channels() -> Vec<String> {
    vec!["dumainfo".into(), "sovfedinfo".into(), "vsrf_ru".into()]
}

fn default_batch_size() -> usize {
    5
}

fn default_analyze_limit() -> usize {
    100
}

fn default_confidence_threshold() -> u8 {
    2
}

fn default_max_react_steps() -> usize {
    6
}

fn default_collect_interval() -> u64 {
    1800
}

/// [scheduler] 段：定时任务列表
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// cron 表达式解释所用的时区偏移（小时），默认 UTC+3
    #[serde(default = "default_utc_offset")]
    pub utc_offset_hours: i32,
    #[serde(default = "default_jobs")]
    pub jobs: Vec<JobSpec>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            utc_offset_hours: default_utc_offset(),
            jobs: default_jobs(),
        }
    }
}

/// [[scheduler.jobs]]：every_secs 与 cron 二选一
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub name: String,
    /// collect / analyze / review / 场景名（daily_workflow 等）
    pub action: String,
    pub every_secs: Option<u64>,
    pub cron: Option<String>,
}

fn default_utc_offset() -> i32 {
    3
}

fn default_jobs() -> Vec<JobSpec> {
    vec![
        JobSpec {
            name: "collect".into(),
            action: "collect".into(),
            every_secs: Some(1800),
            cron: None,
        },
        JobSpec {
            name: "analyze".into(),
            action: "analyze".into(),
            every_secs: Some(1800),
            cron: None,
        },
        JobSpec {
            name: "daily_digest".into(),
            action: "daily_workflow".into(),
            every_secs: None,
            cron: Some("0 0 18 * * *".into()),
        },
    ]
}

/// 从 config 目录加载配置，环境变量 LAWDIGEST__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 LAWDIGEST__*（双下划线表示嵌套键）
/// 4. 最后用扁平环境变量补齐未设置的字段
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("LAWDIGEST")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    apply_env_fallbacks(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

/// 兼容旧部署的扁平环境变量；lookup 便于测试注入
pub fn apply_env_fallbacks(cfg: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    if cfg.telegram.token.is_none() {
        cfg.telegram.token = lookup("TELEGRAM_BOT_TOKEN").filter(|t| !t.is_empty());
    }
    if let Some(url) = lookup("LLM_STUDIO_URL") {
        let url = url.trim_end_matches('/');
        cfg.llm.base_url = if url.ends_with("/v1") {
            url.to_string()
        } else {
            format!("{}/v1", url)
        };
    }
    if let Some(url) = lookup("DATABASE_URL") {
        if let Some(path) = sqlite_path_from_url(&url) {
            cfg.database.path = path;
        }
    }
}

/// `sqlite:///lawdigest.db` / `sqlite://x.db` / `sqlite:x.db` -> 文件路径
fn sqlite_path_from_url(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite:///")
        .or_else(|| url.strip_prefix("sqlite://"))
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let rest = rest.split('?').next().unwrap_or(rest);
    if rest.is_empty() {
        None
    } else {
        Some(PathBuf::from(rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.queue.max_concurrent, 3);
        assert_eq!(cfg.queue.task_timeout_secs, 300);
        assert_eq!(cfg.agents.confidence_threshold, 2);
        assert_eq!(cfg.agents.channels.len(), 3);
        assert_eq!(cfg.scheduler.jobs.len(), 3);
        assert_eq!(cfg.llm.base_url, "http://127.0.0.1:1234/v1");
    }

    #[test]
    fn test_env_fallbacks() {
        let mut cfg = AppConfig::default();
        apply_env_fallbacks(&mut cfg, |key| match key {
            "TELEGRAM_BOT_TOKEN" => Some("123:abc".to_string()),
            "LLM_STUDIO_URL" => Some("http://10.0.0.2:1234/".to_string()),
            "DATABASE_URL" => Some("sqlite:///data/law.db".to_string()),
            _ => None,
        });
        assert_eq!(cfg.telegram.token.as_deref(), Some("123:abc"));
        assert_eq!(cfg.llm.base_url, "http://10.0.0.2:1234/v1");
        assert_eq!(cfg.database.path, PathBuf::from("data/law.db"));
    }

    #[test]
    fn test_explicit_token_wins() {
        let mut cfg = AppConfig::default();
        cfg.telegram.token = Some("from-file".into());
        apply_env_fallbacks(&mut cfg, |_| Some("from-env".into()));
        assert_eq!(cfg.telegram.token.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_sqlite_path_from_url() {
        assert_eq!(sqlite_path_from_url("sqlite:x.db?mode=rwc"), Some(PathBuf::from("x.db")));
        assert_eq!(sqlite_path_from_url("postgres://x"), None);
    }
}
