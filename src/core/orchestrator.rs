//! 编排器：TaskExecutor 的任务处理器
//!
//! - Question：推理循环 + 新闻工具
//! - Scenario：检查数据状态 -> 编排 Plan -> 执行 DAG
//! - PeriodDigest：区间查找（必要时扩展 ±1 天、补采集）-> 分类 -> 审校 -> 摘要
//! - Collect / Analyze / Review：单个流水线步骤
//!
//! 每次尝试产生一条 AgentRun 并写入存储。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;

use crate::agents::{Analyzer, ChannelSource, Critic, DataCollector, DigestResult, Digester};
use crate::config::{AgentsSection, AppConfig};
use crate::core::scenario::{build_plan, Scenario, ScenarioParams, WorkspaceState};
use crate::core::{AgentError, AgentRun, AgentRunBuilder, RecoveryEngine, RunStatus};
use crate::gateway::{SessionStore, Task, TaskHandler, TaskKind, TaskOutput};
use crate::llm::{CompletionOptions, LlmClients};
use crate::memory::{ConversationMemory, Role};
use crate::react::{question_system_prompt, react_loop, Planner, ReactSession};
use crate::storage::{ChannelMessage, Database, DigestSelection, MessageFilter, StorageError};
use crate::tools::{default_registry, ToolExecutor, TOOL_TIMEOUT_SECS};
use crate::utils::dates::{format_ru_date, local_today, start_of_day, Period};
use crate::workflow::{execute_plan, DigestMode, PlanStep, StepAction, StepRunner, WorkflowError};

/// 问答回复的 token 上限
const ANSWER_MAX_TOKENS: u32 = 1000;

pub struct Orchestrator {
    db: Database,
    sessions: Arc<dyn SessionStore>,
    llm: LlmClients,
    collector: DataCollector,
    analyzer: Analyzer,
    critic: Critic,
    digester: Digester,
    tools: ToolExecutor,
    recovery: RecoveryEngine,
    agents: AgentsSection,
    offset: FixedOffset,
    max_turns: usize,
}

impl Orchestrator {
    pub fn new(
        cfg: &AppConfig,
        db: Database,
        sessions: Arc<dyn SessionStore>,
        llm: LlmClients,
        source: Arc<dyn ChannelSource>,
    ) -> Self {
        let offset = crate::utils::dates::offset_from_hours(cfg.scheduler.utc_offset_hours);
        let collector = DataCollector::new(db.clone(), source, cfg.agents.channels.clone());
        let analyzer = Analyzer::new(db.clone(), llm.classifier.clone());
        let critic = Critic::new(db.clone(), llm.classifier.clone());
        let digester = Digester::new(db.clone(), llm.writer.clone(), offset)
            .with_bot_username(cfg.telegram.bot_username.clone())
            .with_max_tokens(cfg.llm.max_tokens);
        let tools = ToolExecutor::new(default_registry(&db, offset), TOOL_TIMEOUT_SECS);

        Self {
            db,
            sessions,
            llm,
            collector,
            analyzer,
            critic,
            digester,
            tools,
            recovery: RecoveryEngine::new(),
            agents: cfg.agents.clone(),
            offset,
            max_turns: cfg.app.max_context_turns.max(1),
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// 编排前的数据状态
    pub async fn inspect(&self) -> Result<WorkspaceState, AgentError> {
        let today = local_today(self.offset);
        let secs_since_collect = self
            .db
            .last_collected_at()
            .await?
            .map(|ms| (Utc::now().timestamp_millis() - ms) / 1000);
        Ok(WorkspaceState {
            unanalyzed: self.db.count_unanalyzed().await?,
            low_confidence: self.db.count_low_confidence(self.agents.confidence_threshold).await?,
            todays_digests: self.db.count_digests_for_date(today).await?,
            secs_since_collect,
        })
    }

    /// 运行场景，返回执行总结
    pub async fn run_scenario(
        &self,
        scenario: Scenario,
        params: &ScenarioParams,
        cancel: &CancellationToken,
        run: &mut AgentRunBuilder,
    ) -> Result<TaskOutput, AgentError> {
        let state = self.inspect().await?;
        tracing::info!(scenario = scenario.as_str(), ?state, "Planning scenario");
        let plan = build_plan(scenario, &state, params, &self.agents)?;

        let report = match execute_plan(&plan, self, cancel).await {
            Ok(report) => report,
            Err(WorkflowError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => return Err(e.into()),
        };
        for step in &report.steps {
            run.record(step.action.clone(), step.id.clone(), format!("{:?}: {}", step.state, step.detail));
        }

        let data = serde_json::to_value(&report).unwrap_or_default();
        Ok(TaskOutput::text(report.summary()).with_data(data))
    }

    async fn answer_question(
        &self,
        task: &Task,
        text: &str,
        cancel: CancellationToken,
        run: &mut AgentRunBuilder,
    ) -> Result<TaskOutput, AgentError> {
        let stored = match self.sessions.history(&task.session_id, self.max_turns * 2 + 1).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(session = %task.session_id, error = %e, "History unavailable");
                Vec::new()
            }
        };
        let mut history = ConversationMemory::from_history(stored, self.max_turns).messages().to_vec();
        // 入口已把本次问题写进历史
        if history
            .last()
            .is_some_and(|m| m.role == Role::User && m.content == text)
        {
            history.pop();
        }

        let today = format_ru_date(local_today(self.offset));
        let planner = Planner::new(
            self.llm.writer.clone(),
            question_system_prompt(&self.tools.schema_json(), &today),
            CompletionOptions::chat(ANSWER_MAX_TOKENS),
        );
        let session = ReactSession::new(&planner, &self.tools, &self.recovery, cancel)
            .with_max_steps(self.agents.max_react_steps);

        let result = react_loop(&session, &history, text, run).await?;
        Ok(TaskOutput::text(result.answer))
    }

    /// /period：区间内无消息时先扩展 ±1 天，仍为空再补采集
    async fn period_digest(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        selection: DigestSelection,
        cancel: &CancellationToken,
        run: &mut AgentRunBuilder,
    ) -> Result<TaskOutput, AgentError> {
        let requested = Period { start, end };
        let widened = requested.widen(1);

        let mut effective = requested;
        let mut found = self.messages_in(requested, false).await?;
        if found.is_empty() {
            found = self.messages_in(widened, false).await?;
            effective = widened;
        }
        run.record("lookup", effective.describe(), format!("найдено {} сообщений", found.len()));

        if found.is_empty() {
            ensure_active(cancel)?;
            let report = self
                .collector
                .collect_since(start_of_day(widened.start, self.offset))
                .await?;
            run.record("collect", widened.describe(), report.summary());

            found = self.messages_in(requested, false).await?;
            effective = requested;
            if found.is_empty() {
                found = self.messages_in(widened, false).await?;
                effective = widened;
            }
        }

        if found.is_empty() {
            return Ok(TaskOutput::text(format!(
                "За период {} сообщений в официальных каналах не найдено. Попробуйте выбрать другие даты.",
                requested.describe()
            )));
        }

        ensure_active(cancel)?;
        let unanalyzed = self.messages_in(effective, true).await?;
        let analyzed = self.analyzer.analyze_messages(&unanalyzed, self.agents.batch_size).await?;
        run.record("analyze", effective.describe(), analyzed.summary());

        ensure_active(cancel)?;
        let threshold = self.agents.confidence_threshold;
        let doubtful: Vec<ChannelMessage> = self
            .messages_in(effective, false)
            .await?
            .into_iter()
            .filter(|m| m.category.is_some() && m.confidence.is_some_and(|c| c <= threshold))
            .collect();
        let reviewed = self.critic.review_messages(&doubtful).await;
        run.record("review", effective.describe(), reviewed.summary());

        ensure_active(cancel)?;
        let digests = self
            .digester
            .create_selection(effective, selection, None, DigestMode::Create)
            .await?;
        run.record(
            "digest",
            selection.label(),
            format!("сформировано дайджестов: {}", digests.len()),
        );

        if digests.is_empty() {
            return Ok(TaskOutput::text(format!(
                "За период {} не удалось сформировать дайджест: нет классифицированных сообщений.",
                requested.describe()
            )));
        }

        let mut text = String::new();
        if effective != requested {
            text.push_str(&format!(
                "За {} сообщений не найдено, дайджест построен за {}.\n\n",
                requested.describe(),
                effective.describe()
            ));
        }
        text.push_str(&render_results(&digests));
        let ids: Vec<i64> = digests.iter().map(|d| d.digest_id).collect();
        Ok(TaskOutput::text(text).with_data(serde_json::json!({ "digest_ids": ids })))
    }

    async fn messages_in(&self, period: Period, only_unanalyzed: bool) -> Result<Vec<ChannelMessage>, AgentError> {
        let (start, end) = period.bounds(self.offset);
        Ok(self
            .db
            .find_messages(&MessageFilter {
                start: Some(start),
                end: Some(end),
                only_unanalyzed,
                ..Default::default()
            })
            .await?)
    }

    async fn dispatch(
        &self,
        task: &Task,
        cancel: CancellationToken,
        run: &mut AgentRunBuilder,
    ) -> Result<TaskOutput, AgentError> {
        match &task.kind {
            TaskKind::Question { text } => self.answer_question(task, text, cancel, run).await,
            TaskKind::Scenario { scenario, params } => {
                let scenario = Scenario::parse_or_default(scenario);
                let params = ScenarioParams::from_value(params);
                self.run_scenario(scenario, &params, &cancel, run).await
            }
            TaskKind::PeriodDigest { start, end, digest_type } => {
                self.period_digest(*start, *end, *digest_type, &cancel, run).await
            }
            TaskKind::Collect { days_back } => {
                let report = self.collector.collect(*days_back).await?;
                run.record("collect", days_back.to_string(), report.summary());
                Ok(TaskOutput::text(report.summary()))
            }
            TaskKind::Analyze { limit, batch_size } => {
                let report = self.analyzer.analyze(*limit as usize, *batch_size).await?;
                run.record("analyze", limit.to_string(), report.summary());
                Ok(TaskOutput::text(report.summary()))
            }
            TaskKind::Review { threshold, limit } => {
                let report = self.critic.review(*threshold, *limit).await?;
                run.record("review", threshold.to_string(), report.summary());
                Ok(TaskOutput::text(report.summary()))
            }
        }
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), AgentError> {
    if cancel.is_cancelled() {
        Err(AgentError::Cancelled)
    } else {
        Ok(())
    }
}

fn agent_name(kind: &TaskKind) -> &'static str {
    match kind {
        TaskKind::Question { .. } => "answerer",
        TaskKind::Scenario { .. } => "orchestrator",
        TaskKind::PeriodDigest { .. } => "digester",
        TaskKind::Collect { .. } => "collector",
        TaskKind::Analyze { .. } => "analyzer",
        TaskKind::Review { .. } => "critic",
    }
}

fn render_results(digests: &[DigestResult]) -> String {
    digests
        .iter()
        .map(|d| {
            format!(
                "**Дайджест ({}) за {}**\n\n{}",
                d.digest_type.label(),
                d.period.describe(),
                d.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl TaskHandler for Orchestrator {
    async fn handle(&self, task: &Task, cancel: CancellationToken) -> Result<TaskOutput, AgentError> {
        let mut run = run_builder(task);
        tracing::info!(task_id = %task.id, kind = task.kind.name(), attempt = task.attempts, "Handling task");

        let result = self.dispatch(task, cancel, &mut run).await;

        let finished = match &result {
            Ok(output) => run.finish(RunStatus::Succeeded, output.text.clone()),
            Err(e) => run.finish(RunStatus::Failed, e.to_string()),
        };
        self.store_run(&finished).await;
        result
    }

    async fn abandoned(&self, task: &Task, error: &AgentError) {
        let run = run_builder(task).finish(RunStatus::Failed, error.to_string());
        self.store_run(&run).await;
    }
}

fn run_builder(task: &Task) -> AgentRunBuilder {
    AgentRunBuilder::new(task.id.clone(), task.session_id.clone(), agent_name(&task.kind)).with_attempt(task.attempts)
}

impl Orchestrator {
    /// 同一次尝试已写入时（被丢弃的 future 恰好写完）只记 debug
    async fn store_run(&self, run: &AgentRun) {
        match self.db.insert_agent_run(run).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists(_)) => {
                tracing::debug!(run_id = run.id(), "Agent run already stored");
            }
            Err(e) => tracing::error!(task_id = run.task_id(), error = %e, "Failed to store agent run"),
        }
    }
}

#[async_trait]
impl StepRunner for Orchestrator {
    async fn run_step(&self, step: &PlanStep) -> Result<String, String> {
        match &step.action {
            StepAction::Collect { days_back } => self
                .collector
                .collect(*days_back)
                .await
                .map(|r| r.summary())
                .map_err(|e| e.to_string()),
            StepAction::Analyze { limit, batch_size } => self
                .analyzer
                .analyze(*limit as usize, *batch_size)
                .await
                .map(|r| r.summary())
                .map_err(|e| e.to_string()),
            StepAction::Review { threshold, limit } => self
                .critic
                .review(*threshold, *limit)
                .await
                .map(|r| r.summary())
                .map_err(|e| e.to_string()),
            StepAction::Digest {
                mode,
                selection,
                days,
                focus,
            } => {
                let period = Period::last_days(local_today(self.offset), *days);
                let results = self
                    .digester
                    .create_selection(period, *selection, focus.clone(), *mode)
                    .await
                    .map_err(|e| e.to_string())?;
                if results.is_empty() {
                    return Ok(format!("нет классифицированных сообщений за {}", period.describe()));
                }
                Ok(results
                    .iter()
                    .map(|r| {
                        let verb = if r.updated { "обновлён" } else { "создан" };
                        format!("{} дайджест #{} {verb}", r.digest_type.label(), r.digest_id)
                    })
                    .collect::<Vec<_>>()
                    .join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration};

    use super::*;
    use crate::agents::ChannelPost;
    use crate::gateway::MemorySessionStore;
    use crate::llm::MockLlmClient;
    use crate::memory::Message;
    use crate::storage::NewChannelMessage;

    struct StaticSource {
        posts: Vec<ChannelPost>,
    }

    #[async_trait]
    impl ChannelSource for StaticSource {
        async fn fetch_since(&self, _channel: &str, since: DateTime<Utc>) -> Result<Vec<ChannelPost>, AgentError> {
            Ok(self.posts.iter().filter(|p| p.date >= since).cloned().collect())
        }
    }

    fn responder(messages: &[Message]) -> Result<String, crate::llm::LlmError> {
        let prompt = &messages.last().map(|m| m.content.clone()).unwrap_or_default();
        if prompt.contains("Ответ в формате") {
            Ok("Категория: новые законы\nУверенность: 5".into())
        } else if prompt.contains("Правильная категория") {
            Ok("Правильная категория: новые законы\nОбоснование: принят закон".into())
        } else if prompt.starts_with("Напиши краткое вступление") {
            Ok("Главное за период".into())
        } else {
            Ok("Обзор новостей".into())
        }
    }

    async fn orchestrator(posts: Vec<ChannelPost>) -> (Orchestrator, Database) {
        let db = Database::in_memory().await.unwrap();
        let mut cfg = AppConfig::default();
        cfg.agents.channels = vec!["dumainfo".into()];
        let llm = LlmClients::single(Arc::new(MockLlmClient::new().with_responder(responder)));
        let sessions: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new(20));
        let orch = Orchestrator::new(&cfg, db.clone(), sessions, llm, Arc::new(StaticSource { posts }));
        (orch, db)
    }

    #[tokio::test]
    async fn test_daily_workflow_end_to_end() {
        let posts = vec![ChannelPost {
            message_id: 10,
            text: "Президент подписал закон о маркетплейсах".into(),
            date: Utc::now() - Duration::minutes(5),
        }];
        let (orch, db) = orchestrator(posts).await;
        let task = Task::new("scheduler:daily_digest", TaskKind::Scenario {
            scenario: "daily_workflow".into(),
            params: serde_json::Value::Null,
        });

        let output = orch.handle(&task, CancellationToken::new()).await.unwrap();
        assert!(output.text.contains("выполнено 3"), "{}", output.text);
        assert_eq!(db.count_unanalyzed().await.unwrap(), 0);
        let today = local_today(orch.offset());
        assert_eq!(db.count_digests_for_date(today).await.unwrap(), 2);

        let runs = db.runs_for_task(&task.id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status(), RunStatus::Succeeded);
        assert_eq!(runs[0].steps().len(), 3);
    }

    #[tokio::test]
    async fn test_period_digest_widens_range() {
        let (orch, db) = orchestrator(Vec::new()).await;
        let today = local_today(orch.offset());
        let yesterday = today - Duration::days(1);
        let id = db
            .save_message(&NewChannelMessage {
                channel: "dumainfo".into(),
                message_id: 1,
                text: "Закон принят Госдумой".into(),
                date: start_of_day(today, orch.offset()) + Duration::hours(10),
            })
            .await
            .unwrap()
            .unwrap();

        let task = Task::new("tg:1", TaskKind::PeriodDigest {
            start: yesterday,
            end: yesterday,
            digest_type: DigestSelection::Brief,
        });
        let output = orch.handle(&task, CancellationToken::new()).await.unwrap();
        assert!(output.text.contains("сообщений не найдено, дайджест построен"), "{}", output.text);
        assert!(output.text.contains("Дайджест (краткий)"));
        let msg = db.get_message(id).await.unwrap().unwrap();
        assert_eq!(msg.category.as_deref(), Some("новые законы"));
    }

    #[tokio::test]
    async fn test_period_digest_nothing_found() {
        let (orch, _db) = orchestrator(Vec::new()).await;
        let day = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let task = Task::new("tg:1", TaskKind::PeriodDigest {
            start: day,
            end: day,
            digest_type: DigestSelection::Both,
        });
        let output = orch.handle(&task, CancellationToken::new()).await.unwrap();
        assert!(output.text.contains("не найдено"));
    }

    #[tokio::test]
    async fn test_cancelled_scenario_records_failed_run() {
        let (orch, db) = orchestrator(Vec::new()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let task = Task::new("cli", TaskKind::Scenario {
            scenario: "urgent_update".into(),
            params: serde_json::Value::Null,
        });
        let err = orch.handle(&task, cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        let runs = db.runs_for_task(&task.id).await.unwrap();
        assert_eq!(runs[0].status(), RunStatus::Failed);
    }

    struct StalledSource;

    #[async_trait]
    impl ChannelSource for StalledSource {
        async fn fetch_since(&self, _channel: &str, _since: DateTime<Utc>) -> Result<Vec<ChannelPost>, AgentError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_timed_out_attempts_each_record_a_run() {
        let db = Database::in_memory().await.unwrap();
        let mut cfg = AppConfig::default();
        cfg.agents.channels = vec!["dumainfo".into()];
        let llm = LlmClients::single(Arc::new(MockLlmClient::new()));
        let sessions: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new(20));
        let orch = Arc::new(Orchestrator::new(&cfg, db.clone(), sessions, llm, Arc::new(StalledSource)));

        let (queue, mut notifications) = crate::gateway::TaskQueue::new();
        let queue = Arc::new(queue);
        let task = Task::new("scheduler:collect", TaskKind::Collect { days_back: 1 })
            .with_timeout(1)
            .with_max_retries(1);
        let id = queue.submit(task).await.unwrap();

        let shutdown = CancellationToken::new();
        tokio::spawn(crate::gateway::TaskExecutor::new(queue.clone(), orch, 1).run(shutdown.clone()));
        let note = tokio::time::timeout(std::time::Duration::from_secs(20), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        shutdown.cancel();

        assert_eq!(note.status, crate::gateway::TaskStatus::Failed);
        let attempts = queue.get(&id).await.unwrap().attempts;
        assert_eq!(attempts, 2);
        let runs = db.runs_for_task(&id).await.unwrap();
        assert_eq!(runs.len(), attempts as usize);
        assert!(runs.iter().all(|r| r.status() == RunStatus::Failed && r.output().contains("timed out")));
        assert_ne!(runs[0].id(), runs[1].id());
    }
}
