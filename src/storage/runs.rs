//! AgentRun 持久化：只写一次，不提供更新

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{Database, StorageError, StorageResult};
use crate::core::{AgentRun, AgentStep, RunStatus};

fn row_to_run(row: &SqliteRow) -> StorageResult<AgentRun> {
    let status_raw: String = row.get("status");
    let status = RunStatus::parse(&status_raw)
        .ok_or_else(|| StorageError::Corrupted(format!("agent_runs.status = {status_raw}")))?;
    let steps: Vec<AgentStep> = serde_json::from_str(&row.get::<String, _>("steps"))?;
    Ok(AgentRun::restore(
        row.get("id"),
        row.get("task_id"),
        row.get("session_id"),
        row.get("agent"),
        status,
        steps,
        row.get("output"),
        (
            row.get::<i64, _>("prompt_tokens") as u64,
            row.get::<i64, _>("completion_tokens") as u64,
        ),
        row.get("started_at"),
        row.get("finished_at"),
    ))
}

impl Database {
    /// 写入已完成的运行记录；同一 id 第二次写入返回 AlreadyExists
    pub async fn insert_agent_run(&self, run: &AgentRun) -> StorageResult<()> {
        let steps = serde_json::to_string(run.steps())?;
        let (prompt, completion) = run.token_usage();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO agent_runs
             (id, task_id, session_id, agent, status, steps, output, prompt_tokens, completion_tokens, started_at, finished_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run.id())
        .bind(run.task_id())
        .bind(run.session_id())
        .bind(run.agent())
        .bind(run.status().as_str())
        .bind(&steps)
        .bind(run.output())
        .bind(prompt as i64)
        .bind(completion as i64)
        .bind(run.started_at())
        .bind(run.finished_at())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::AlreadyExists(format!("agent run {}", run.id())));
        }
        Ok(())
    }

    pub async fn runs_for_task(&self, task_id: &str) -> StorageResult<Vec<AgentRun>> {
        let rows = sqlx::query(
            "SELECT id, task_id, session_id, agent, status, steps, output, prompt_tokens, completion_tokens,
                    started_at, finished_at
             FROM agent_runs WHERE task_id = ? ORDER BY started_at ASC",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_run).collect()
    }
}
