//! lawdigest 入口
//!
//! - `bot` / `run`：Telegram 机器人 + 任务执行器 + 定时调度
//! - `workflow`：执行一次场景（默认 daily_workflow）
//! - `digest`：生成最近 N 天的摘要

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use lawdigest::agents::WebPreviewSource;
use lawdigest::config::{load_config, AppConfig};
use lawdigest::core::{
    DatabaseCleanup, JoinCleanup, Orchestrator, Scenario, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use lawdigest::gateway::{create_session_store, Hub, SessionStore, Task, TaskExecutor, TaskHandler, TaskKind, TaskQueue, CLI_SESSION};
use lawdigest::llm::create_clients;
use lawdigest::scheduler::Scheduler;
use lawdigest::storage::Database;
use lawdigest::telegram::{run_bot, run_notifications, AccessList, TelegramEgress};
use lawdigest::utils::dates::offset_from_hours;
use teloxide::Bot;
use tokio_util::sync::CancellationToken;

/// 频道网页抓取超时（秒）
const SOURCE_TIMEOUT_SECS: u64 = 30;
/// 会话归档与任务清理周期
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Bot,
    Workflow,
    Digest,
    Run,
}

#[derive(Parser, Debug)]
#[command(name = "lawdigest")]
#[command(about = "Telegram digest of Russian legal news")]
struct Cli {
    #[arg(value_enum, default_value_t = Mode::Bot)]
    mode: Mode,

    /// digest 模式的天数
    #[arg(long, default_value_t = 1)]
    days: u32,

    /// workflow 模式的场景名
    #[arg(long)]
    scenario: Option<String>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;
    let secrets = [cfg.telegram.token.clone(), cfg.llm.api_key.clone()];
    lawdigest::observability::init(secrets.into_iter().flatten());

    let db = Database::connect(&cfg.database.path, cfg.database.max_connections)
        .await
        .with_context(|| format!("Failed to open database {}", cfg.database.path.display()))?;
    let sessions = create_session_store(Some(db.clone()), cfg.app.max_context_turns * 2);
    let llm = create_clients(&cfg.llm);
    let source = Arc::new(WebPreviewSource::new(SOURCE_TIMEOUT_SECS));
    let orchestrator = Arc::new(Orchestrator::new(&cfg, db.clone(), sessions.clone(), llm, source));

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    match cli.mode {
        Mode::Workflow => {
            let scenario = cli.scenario.as_deref().unwrap_or(Scenario::DailyWorkflow.as_str());
            let kind = TaskKind::Scenario {
                scenario: scenario.to_string(),
                params: serde_json::Value::Null,
            };
            run_once(orchestrator.as_ref(), kind, shutdown.token()).await?;
        }
        Mode::Digest => {
            let kind = TaskKind::Scenario {
                scenario: Scenario::DigestOnly.as_str().to_string(),
                params: serde_json::json!({ "days": cli.days.max(1), "selection": "both" }),
            };
            run_once(orchestrator.as_ref(), kind, shutdown.token()).await?;
        }
        Mode::Bot | Mode::Run => {
            run_service(&cfg, db.clone(), sessions, orchestrator, shutdown.clone()).await?;
        }
    }

    shutdown.shutdown(ShutdownReason::Completed);
    db.close().await;
    Ok(())
}

/// 一次性模式：直接调用处理器，结果打印到 stdout
async fn run_once(handler: &dyn TaskHandler, kind: TaskKind, cancel: CancellationToken) -> anyhow::Result<()> {
    let task = Task::new(CLI_SESSION, kind);
    let output = handler.handle(&task, cancel).await.context("Task failed")?;
    println!("{}", output.text);
    Ok(())
}

async fn run_service(
    cfg: &AppConfig,
    db: Database,
    sessions: Arc<dyn SessionStore>,
    orchestrator: Arc<Orchestrator>,
    shutdown: Arc<ShutdownManager>,
) -> anyhow::Result<()> {
    let token = cfg
        .telegram
        .token
        .clone()
        .context("Telegram token is not configured (TELEGRAM_BOT_TOKEN or LAWDIGEST__TELEGRAM__TOKEN)")?;
    let offset = offset_from_hours(cfg.scheduler.utc_offset_hours);

    let (queue, notifications) = TaskQueue::with_persistence(db.clone())
        .await
        .context("Failed to restore task queue")?;
    let queue = Arc::new(queue);

    let mut coordinator = ShutdownCoordinator::new().with_timeout(10);

    let executor = TaskExecutor::new(queue.clone(), orchestrator, cfg.queue.max_concurrent);
    coordinator.register(JoinCleanup::new("TaskExecutor", tokio::spawn(executor.run(shutdown.token()))));

    if cfg.scheduler.enabled {
        let scheduler = Scheduler::new(
            queue.clone(),
            &cfg.scheduler.jobs,
            cfg.agents.clone(),
            cfg.queue.clone(),
            offset,
        );
        coordinator.register(JoinCleanup::new("Scheduler", tokio::spawn(scheduler.run(shutdown.token()))));
    }

    tokio::spawn(maintenance(
        queue.clone(),
        sessions.clone(),
        cfg.app.session_idle_secs,
        cfg.queue.cleanup_after_hours,
        shutdown.token(),
    ));

    let bot = Bot::new(token);
    let egress = Arc::new(TelegramEgress::new(bot.clone()));
    tokio::spawn(run_notifications(notifications, sessions.clone(), egress.clone()));

    let hub = Arc::new(Hub::new(db.clone(), queue, sessions, cfg.queue.clone(), offset));
    run_bot(bot, hub, egress, AccessList(cfg.telegram.allowed_users.clone()), shutdown.token()).await;

    shutdown.shutdown(ShutdownReason::Completed);
    coordinator.register(DatabaseCleanup::new(db));
    coordinator.run_cleanup().await;
    Ok(())
}

/// 定期归档闲置会话、清理过期任务
async fn maintenance(
    queue: Arc<TaskQueue>,
    sessions: Arc<dyn SessionStore>,
    idle_secs: u64,
    cleanup_after_hours: u64,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match sessions.archive_idle(idle_secs).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(archived = n, "Archived idle sessions"),
                    Err(e) => tracing::warn!(error = %e, "Session archiving failed"),
                }
                match queue.cleanup(cleanup_after_hours).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(removed = n, "Removed finished tasks"),
                    Err(e) => tracing::warn!(error = %e, "Task cleanup failed"),
                }
            }
        }
    }
}
