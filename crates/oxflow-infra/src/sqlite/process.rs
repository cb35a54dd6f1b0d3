//! SQLite implementation of the process repository.
//!
//! Runs, step attempts, human tasks, and schedule state map one row per
//! record. Enum columns store the serde snake_case form; JSON columns
//! (context, wait_state, completed_steps, output) store serialized values.
//! Idempotency uniqueness is enforced by a partial unique index on
//! `(definition, idempotency_key)`, surfaced as
//! [`RepositoryError::Conflict`].

use chrono::{DateTime, Utc};
use oxflow_core::repository::process::{ProcessRepository, RunFilter};
use oxflow_types::error::RepositoryError;
use oxflow_types::process::{
    HumanTask, ProcessRun, RunStatus, ScheduleState, StepExecution, StepExecutionStatus,
    TaskStatus, WaitState,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed [`ProcessRepository`].
#[derive(Clone)]
pub struct SqliteProcessRepository {
    pool: DatabasePool,
}

impl SqliteProcessRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// snake_case string form of a serde unit enum.
fn enum_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!(
            "expected string-serializable enum, got {other}"
        ))),
        Err(e) => Err(RepositoryError::Query(e.to_string())),
    }
}

fn enum_from_str<T: DeserializeOwned>(s: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid enum value: {s}")))
}

fn json_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    definition: String,
    status: String,
    current_step: Option<String>,
    completed_steps: String,
    idempotency_key: Option<String>,
    wait_state: Option<String>,
    context: String,
    started_at: String,
    ended_at: Option<String>,
    error: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition: row.try_get("definition")?,
            status: row.try_get("status")?,
            current_step: row.try_get("current_step")?,
            completed_steps: row.try_get("completed_steps")?,
            idempotency_key: row.try_get("idempotency_key")?,
            wait_state: row.try_get("wait_state")?,
            context: row.try_get("context")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            error: row.try_get("error")?,
        })
    }

    fn into_run(self) -> Result<ProcessRun, RepositoryError> {
        let completed_steps: Vec<String> = serde_json::from_str(&self.completed_steps)
            .map_err(|e| RepositoryError::Query(format!("invalid completed_steps: {e}")))?;
        let wait_state: Option<WaitState> = self
            .wait_state
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid wait_state: {e}")))
            })
            .transpose()?;
        let context: serde_json::Value = serde_json::from_str(&self.context)
            .map_err(|e| RepositoryError::Query(format!("invalid context: {e}")))?;

        Ok(ProcessRun {
            id: parse_uuid(&self.id)?,
            status: enum_from_str::<RunStatus>(&self.status)?,
            started_at: parse_datetime(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_datetime).transpose()?,
            definition: self.definition,
            current_step: self.current_step,
            completed_steps,
            idempotency_key: self.idempotency_key,
            wait_state,
            context,
            error: self.error,
        })
    }
}

struct StepExecutionRow {
    id: String,
    run_id: String,
    step_name: String,
    attempt: i64,
    status: String,
    output: Option<String>,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl StepExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step_name: row.try_get("step_name")?,
            attempt: row.try_get("attempt")?,
            status: row.try_get("status")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_execution(self) -> Result<StepExecution, RepositoryError> {
        let output = self
            .output
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid step output: {e}")))
            })
            .transpose()?;

        Ok(StepExecution {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            status: enum_from_str::<StepExecutionStatus>(&self.status)?,
            attempt: self.attempt as u32,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            step_name: self.step_name,
            output,
            error: self.error,
        })
    }
}

struct TaskRow {
    id: String,
    run_id: String,
    step_name: String,
    surface: String,
    status: String,
    assignee: Option<String>,
    outcome: Option<String>,
    deadline: Option<String>,
    escalation_deadline: Option<String>,
    escalated_at: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step_name: row.try_get("step_name")?,
            surface: row.try_get("surface")?,
            status: row.try_get("status")?,
            assignee: row.try_get("assignee")?,
            outcome: row.try_get("outcome")?,
            deadline: row.try_get("deadline")?,
            escalation_deadline: row.try_get("escalation_deadline")?,
            escalated_at: row.try_get("escalated_at")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_task(self) -> Result<HumanTask, RepositoryError> {
        Ok(HumanTask {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            status: enum_from_str::<TaskStatus>(&self.status)?,
            deadline: self.deadline.as_deref().map(parse_datetime).transpose()?,
            escalation_deadline: self
                .escalation_deadline
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            escalated_at: self.escalated_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            step_name: self.step_name,
            surface: self.surface,
            assignee: self.assignee,
            outcome: self.outcome,
        })
    }
}

// ---------------------------------------------------------------------------
// ProcessRepository impl
// ---------------------------------------------------------------------------

impl ProcessRepository for SqliteProcessRepository {
    async fn create_run(&self, run: &ProcessRun) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO process_runs
               (id, definition, status, current_step, completed_steps, idempotency_key,
                wait_state, context, started_at, ended_at, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.definition)
        .bind(enum_str(&run.status)?)
        .bind(&run.current_step)
        .bind(json_str(&run.completed_steps)?)
        .bind(&run.idempotency_key)
        .bind(run.wait_state.as_ref().map(json_str).transpose()?)
        .bind(json_str(&run.context)?)
        .bind(format_datetime(&run.started_at))
        .bind(run.ended_at.as_ref().map(format_datetime))
        .bind(&run.error)
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::Conflict(format!(
                "idempotency key {:?} already used for {:?}",
                run.idempotency_key.as_deref().unwrap_or_default(),
                run.definition
            ))),
            Err(e) => Err(query_error(e)),
        }
    }

    async fn update_run(&self, run: &ProcessRun) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE process_runs SET
                 status = ?, current_step = ?, completed_steps = ?, wait_state = ?,
                 context = ?, ended_at = ?, error = ?
               WHERE id = ?"#,
        )
        .bind(enum_str(&run.status)?)
        .bind(&run.current_step)
        .bind(json_str(&run.completed_steps)?)
        .bind(run.wait_state.as_ref().map(json_str).transpose()?)
        .bind(json_str(&run.context)?)
        .bind(run.ended_at.as_ref().map(format_datetime))
        .bind(&run.error)
        .bind(run.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<ProcessRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM process_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|row| RunRow::from_row(&row).map_err(query_error)?.into_run())
            .transpose()
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<ProcessRun>, RepositoryError> {
        let mut sql = String::from("SELECT * FROM process_runs");
        let mut clauses: Vec<&str> = Vec::new();
        if filter.definition.is_some() {
            clauses.push("definition = ?");
        }
        if filter.status.is_some() {
            clauses.push("status = ?");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        // UUIDv7 ids are time-ordered; newest first.
        sql.push_str(" ORDER BY id DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(definition) = &filter.definition {
            query = query.bind(definition);
        }
        if let Some(status) = &filter.status {
            query = query.bind(enum_str(status)?);
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool.reader).await.map_err(query_error)?;
        rows.iter()
            .map(|row| RunRow::from_row(row).map_err(query_error)?.into_run())
            .collect()
    }

    async fn find_run_by_idempotency_key(
        &self,
        definition: &str,
        key: &str,
    ) -> Result<Option<ProcessRun>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM process_runs WHERE definition = ? AND idempotency_key = ?",
        )
        .bind(definition)
        .bind(key)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.map(|row| RunRow::from_row(&row).map_err(query_error)?.into_run())
            .transpose()
    }

    async fn list_active_runs(
        &self,
        definition: &str,
    ) -> Result<Vec<ProcessRun>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM process_runs
               WHERE definition = ? AND status IN ('pending', 'running', 'waiting')
               ORDER BY id ASC"#,
        )
        .bind(definition)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| RunRow::from_row(row).map_err(query_error)?.into_run())
            .collect()
    }

    async fn list_inflight_runs(&self) -> Result<Vec<ProcessRun>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM process_runs
               WHERE status IN ('pending', 'running', 'waiting')
               ORDER BY id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| RunRow::from_row(row).map_err(query_error)?.into_run())
            .collect()
    }

    async fn create_step_execution(
        &self,
        execution: &StepExecution,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO step_executions
               (id, run_id, step_name, attempt, status, output, error, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.run_id.to_string())
        .bind(&execution.step_name)
        .bind(execution.attempt as i64)
        .bind(enum_str(&execution.status)?)
        .bind(execution.output.as_ref().map(json_str).transpose()?)
        .bind(&execution.error)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn update_step_execution(
        &self,
        execution_id: &Uuid,
        status: StepExecutionStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let completed_at = if status != StepExecutionStatus::Running {
            Some(format_datetime(&Utc::now()))
        } else {
            None
        };

        let result = sqlx::query(
            r#"UPDATE step_executions SET
                 status = ?,
                 output = COALESCE(?, output),
                 error = COALESCE(?, error),
                 completed_at = COALESCE(?, completed_at)
               WHERE id = ?"#,
        )
        .bind(enum_str(&status)?)
        .bind(output.map(json_str).transpose()?)
        .bind(error)
        .bind(&completed_at)
        .bind(execution_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_step_executions(
        &self,
        run_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM step_executions WHERE run_id = ? ORDER BY id ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                StepExecutionRow::from_row(row)
                    .map_err(query_error)?
                    .into_execution()
            })
            .collect()
    }

    async fn create_task(&self, task: &HumanTask) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO human_tasks
               (id, run_id, step_name, surface, status, assignee, outcome,
                deadline, escalation_deadline, escalated_at, created_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(task.run_id.to_string())
        .bind(&task.step_name)
        .bind(&task.surface)
        .bind(enum_str(&task.status)?)
        .bind(&task.assignee)
        .bind(&task.outcome)
        .bind(task.deadline.as_ref().map(format_datetime))
        .bind(task.escalation_deadline.as_ref().map(format_datetime))
        .bind(task.escalated_at.as_ref().map(format_datetime))
        .bind(format_datetime(&task.created_at))
        .bind(task.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn update_task(&self, task: &HumanTask) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE human_tasks SET
                 status = ?, assignee = ?, outcome = ?, escalated_at = ?, completed_at = ?
               WHERE id = ?"#,
        )
        .bind(enum_str(&task.status)?)
        .bind(&task.assignee)
        .bind(&task.outcome)
        .bind(task.escalated_at.as_ref().map(format_datetime))
        .bind(task.completed_at.as_ref().map(format_datetime))
        .bind(task.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &Uuid) -> Result<Option<HumanTask>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM human_tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|row| TaskRow::from_row(&row).map_err(query_error)?.into_task())
            .transpose()
    }

    async fn list_open_tasks(&self) -> Result<Vec<HumanTask>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM human_tasks WHERE status IN ('pending', 'assigned') ORDER BY id ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| TaskRow::from_row(row).map_err(query_error)?.into_task())
            .collect()
    }

    async fn get_schedule_state(
        &self,
        schedule: &str,
    ) -> Result<Option<ScheduleState>, RepositoryError> {
        let row = sqlx::query("SELECT schedule, last_fired_at FROM schedule_state WHERE schedule = ?")
            .bind(schedule)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|row| {
            let schedule: String = row.try_get("schedule").map_err(query_error)?;
            let last_fired_at: Option<String> =
                row.try_get("last_fired_at").map_err(query_error)?;
            Ok(ScheduleState {
                schedule,
                last_fired_at: last_fired_at.as_deref().map(parse_datetime).transpose()?,
            })
        })
        .transpose()
    }

    async fn upsert_schedule_state(&self, state: &ScheduleState) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO schedule_state (schedule, last_fired_at) VALUES (?, ?)
               ON CONFLICT(schedule) DO UPDATE SET last_fired_at = excluded.last_fired_at"#,
        )
        .bind(&state.schedule)
        .bind(state.last_fired_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
