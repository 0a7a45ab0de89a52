//! 定时调度：按间隔或 cron 表达式向任务队列投递任务
//!
//! 每个作业有独立会话 `scheduler:<job>`；上一次投递的任务未结束时，
//! 队列返回 SessionBusy，本次触发直接跳过。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use cron::Schedule;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentsSection, JobSpec, QueueSection};
use crate::gateway::{scheduler_session, QueueError, Task, TaskKind, TaskQueue};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("job '{0}' has neither every_secs nor cron")]
    MissingTrigger(String),

    #[error("job '{job}' has invalid cron expression: {reason}")]
    InvalidCron { job: String, reason: String },
}

/// 触发方式
#[derive(Debug, Clone)]
pub enum Trigger {
    Interval(Duration),
    Cron(Box<Schedule>),
}

impl Trigger {
    /// now 之后的下一次触发时间；cron 按 offset 时区解释
    pub fn next_after(&self, now: DateTime<Utc>, offset: FixedOffset) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(every) => Some(now + *every),
            Self::Cron(schedule) => schedule
                .after(&now.with_timezone(&offset))
                .next()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub name: String,
    pub action: String,
    pub trigger: Trigger,
}

impl ScheduledJob {
    /// every_secs 优先于 cron
    pub fn from_spec(spec: &JobSpec) -> Result<Self, SchedulerError> {
        let trigger = match (spec.every_secs, spec.cron.as_deref()) {
            (Some(secs), _) => Trigger::Interval(Duration::seconds(secs.max(1) as i64)),
            (None, Some(expr)) => {
                let schedule = Schedule::from_str(expr).map_err(|e| SchedulerError::InvalidCron {
                    job: spec.name.clone(),
                    reason: e.to_string(),
                })?;
                Trigger::Cron(Box::new(schedule))
            }
            (None, None) => return Err(SchedulerError::MissingTrigger(spec.name.clone())),
        };
        Ok(Self {
            name: spec.name.clone(),
            action: spec.action.clone(),
            trigger,
        })
    }
}

/// 作业动作 -> 任务内容；非 collect/analyze/review 的动作视为场景名
pub fn job_task(action: &str, agents: &AgentsSection) -> TaskKind {
    match action {
        "collect" => TaskKind::Collect { days_back: 1 },
        "analyze" => TaskKind::Analyze {
            limit: agents.analyze_limit as u32,
            batch_size: agents.batch_size,
        },
        "review" => TaskKind::Review {
            threshold: agents.confidence_threshold,
            limit: 50,
        },
        scenario => TaskKind::Scenario {
            scenario: scenario.to_string(),
            params: serde_json::Value::Null,
        },
    }
}

pub struct Scheduler {
    queue: Arc<TaskQueue>,
    jobs: Vec<ScheduledJob>,
    agents: AgentsSection,
    limits: QueueSection,
    offset: FixedOffset,
    next_fires: HashMap<String, DateTime<Utc>>,
}

impl Scheduler {
    /// 无效作业记录警告后忽略
    pub fn new(
        queue: Arc<TaskQueue>,
        specs: &[JobSpec],
        agents: AgentsSection,
        limits: QueueSection,
        offset: FixedOffset,
    ) -> Self {
        let jobs = specs
            .iter()
            .filter_map(|spec| match ScheduledJob::from_spec(spec) {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping scheduler job");
                    None
                }
            })
            .collect();
        Self {
            queue,
            jobs,
            agents,
            limits,
            offset,
            next_fires: HashMap::new(),
        }
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    pub fn next_fire(&self, job: &str) -> Option<DateTime<Utc>> {
        self.next_fires.get(job).copied()
    }

    /// 计算所有作业的首次触发时间
    pub fn arm(&mut self, now: DateTime<Utc>) {
        for job in &self.jobs {
            if let Some(next) = job.trigger.next_after(now, self.offset) {
                tracing::info!(job = %job.name, next = %next, "Registered scheduler job");
                self.next_fires.insert(job.name.clone(), next);
            }
        }
    }

    /// 投递到期作业并重新排期，返回本次实际入队的作业名
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut fired = Vec::new();
        for job in &self.jobs {
            let due = self.next_fires.get(&job.name).is_some_and(|at| now >= *at);
            if !due {
                continue;
            }

            let task = Task::new(scheduler_session(&job.name), job_task(&job.action, &self.agents))
                .with_limits(&self.limits);
            match self.queue.submit(task).await {
                Ok(id) => {
                    tracing::info!(job = %job.name, task_id = %id, "Scheduler job enqueued");
                    fired.push(job.name.clone());
                }
                Err(QueueError::SessionBusy { active, .. }) => {
                    tracing::info!(job = %job.name, active = %active, "Previous run still active, skipping");
                }
                Err(e) => tracing::error!(job = %job.name, error = %e, "Failed to enqueue scheduler job"),
            }

            match job.trigger.next_after(now, self.offset) {
                Some(next) => {
                    self.next_fires.insert(job.name.clone(), next);
                }
                None => {
                    self.next_fires.remove(&job.name);
                }
            }
        }
        fired
    }

    /// 1 秒节拍，直到 shutdown
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.arm(Utc::now());
        tracing::info!(jobs = self.jobs.len(), "Scheduler started");

        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::SchedulerSection;
    use crate::gateway::TaskOutput;

    fn spec(name: &str, action: &str, every: Option<u64>, cron: Option<&str>) -> JobSpec {
        JobSpec {
            name: name.into(),
            action: action.into(),
            every_secs: every,
            cron: cron.map(String::from),
        }
    }

    #[test]
    fn test_default_jobs_parse() {
        let jobs: Vec<_> = SchedulerSection::default()
            .jobs
            .iter()
            .map(ScheduledJob::from_spec)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(matches!(jobs[2].trigger, Trigger::Cron(_)));
    }

    #[test]
    fn test_invalid_jobs_rejected() {
        assert!(matches!(
            ScheduledJob::from_spec(&spec("x", "collect", None, None)),
            Err(SchedulerError::MissingTrigger(_))
        ));
        assert!(matches!(
            ScheduledJob::from_spec(&spec("x", "collect", None, Some("every day"))),
            Err(SchedulerError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_cron_uses_configured_offset() {
        let job = ScheduledJob::from_spec(&spec("daily", "daily_workflow", None, Some("0 0 18 * * *"))).unwrap();
        let msk = FixedOffset::east_opt(3 * 3600).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        // 18:00 MSK = 15:00 UTC
        assert_eq!(
            job.trigger.next_after(now, msk),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_job_task_mapping() {
        let agents = AgentsSection::default();
        assert_eq!(job_task("collect", &agents), TaskKind::Collect { days_back: 1 });
        assert!(matches!(job_task("analyze", &agents), TaskKind::Analyze { .. }));
        assert!(matches!(
            job_task("urgent_update", &agents),
            TaskKind::Scenario { ref scenario, .. } if scenario == "urgent_update"
        ));
    }

    #[tokio::test]
    async fn test_tick_enqueues_and_skips_busy_session() {
        let (queue, _rx) = TaskQueue::new();
        let queue = Arc::new(queue);
        let mut scheduler = Scheduler::new(
            queue.clone(),
            &[spec("collect", "collect", Some(60), None)],
            AgentsSection::default(),
            QueueSection::default(),
            FixedOffset::east_opt(0).unwrap(),
        );
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        scheduler.arm(start);

        assert!(scheduler.tick(start + Duration::seconds(30)).await.is_empty());
        assert_eq!(scheduler.tick(start + Duration::seconds(60)).await, vec!["collect".to_string()]);
        assert_eq!(scheduler.next_fire("collect"), Some(start + Duration::seconds(120)));

        // 上一次任务仍在队列中
        assert!(scheduler.tick(start + Duration::seconds(120)).await.is_empty());
        assert_eq!(scheduler.next_fire("collect"), Some(start + Duration::seconds(180)));

        let task = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(task.session_id, "scheduler:collect");
        queue.complete(&task.id, TaskOutput::text("ok")).await.unwrap();
        assert_eq!(scheduler.tick(start + Duration::seconds(180)).await.len(), 1);
    }
}
