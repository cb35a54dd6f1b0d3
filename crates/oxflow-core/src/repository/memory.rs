//! In-memory repository for tests and database-free embedding.
//!
//! DashMap-backed; every operation clones in and out so callers never hold
//! references into the store. Semantics mirror the SQLite implementation,
//! including the idempotency-key uniqueness check.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use oxflow_types::error::RepositoryError;
use oxflow_types::process::{
    HumanTask, ProcessRun, ScheduleState, StepExecution, StepExecutionStatus,
};
use serde_json::Value;
use uuid::Uuid;

use super::process::{ProcessRepository, RunFilter};

/// Cheaply cloneable in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    runs: Arc<DashMap<Uuid, ProcessRun>>,
    step_executions: Arc<DashMap<Uuid, StepExecution>>,
    tasks: Arc<DashMap<Uuid, HumanTask>>,
    schedule_state: Arc<DashMap<String, ScheduleState>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessRepository for MemoryRepository {
    async fn create_run(&self, run: &ProcessRun) -> Result<(), RepositoryError> {
        if let Some(key) = &run.idempotency_key {
            let duplicate = self.runs.iter().any(|entry| {
                entry.value().definition == run.definition
                    && entry.value().idempotency_key.as_deref() == Some(key.as_str())
            });
            if duplicate {
                return Err(RepositoryError::Conflict(format!(
                    "idempotency key {key:?} already used for {:?}",
                    run.definition
                )));
            }
        }
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &ProcessRun) -> Result<(), RepositoryError> {
        if !self.runs.contains_key(&run.id) {
            return Err(RepositoryError::NotFound);
        }
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<ProcessRun>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|entry| entry.value().clone()))
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<ProcessRun>, RepositoryError> {
        let mut runs: Vec<ProcessRun> = self
            .runs
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|run| {
                filter
                    .definition
                    .as_deref()
                    .is_none_or(|d| run.definition == d)
                    && filter.status.is_none_or(|s| run.status == s)
            })
            .collect();
        // UUIDv7 ids are time-ordered; newest first.
        runs.sort_by(|a, b| b.id.cmp(&a.id));
        if let Some(limit) = filter.limit {
            runs.truncate(limit as usize);
        }
        Ok(runs)
    }

    async fn find_run_by_idempotency_key(
        &self,
        definition: &str,
        key: &str,
    ) -> Result<Option<ProcessRun>, RepositoryError> {
        Ok(self
            .runs
            .iter()
            .find(|entry| {
                entry.value().definition == definition
                    && entry.value().idempotency_key.as_deref() == Some(key)
            })
            .map(|entry| entry.value().clone()))
    }

    async fn list_active_runs(
        &self,
        definition: &str,
    ) -> Result<Vec<ProcessRun>, RepositoryError> {
        let mut runs: Vec<ProcessRun> = self
            .runs
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|run| run.definition == definition && run.status.is_active())
            .collect();
        runs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(runs)
    }

    async fn list_inflight_runs(&self) -> Result<Vec<ProcessRun>, RepositoryError> {
        let mut runs: Vec<ProcessRun> = self
            .runs
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|run| run.status.is_active())
            .collect();
        runs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(runs)
    }

    async fn create_step_execution(
        &self,
        execution: &StepExecution,
    ) -> Result<(), RepositoryError> {
        self.step_executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_step_execution(
        &self,
        execution_id: &Uuid,
        status: StepExecutionStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut entry = self
            .step_executions
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        let execution = entry.value_mut();
        execution.status = status;
        if let Some(output) = output {
            execution.output = Some(output.clone());
        }
        if let Some(error) = error {
            execution.error = Some(error.to_string());
        }
        if status != StepExecutionStatus::Running {
            execution.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_step_executions(
        &self,
        run_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let mut executions: Vec<StepExecution> = self
            .step_executions
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|execution| execution.run_id == *run_id)
            .collect();
        executions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(executions)
    }

    async fn create_task(&self, task: &HumanTask) -> Result<(), RepositoryError> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &HumanTask) -> Result<(), RepositoryError> {
        if !self.tasks.contains_key(&task.id) {
            return Err(RepositoryError::NotFound);
        }
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &Uuid) -> Result<Option<HumanTask>, RepositoryError> {
        Ok(self.tasks.get(task_id).map(|entry| entry.value().clone()))
    }

    async fn list_open_tasks(&self) -> Result<Vec<HumanTask>, RepositoryError> {
        let mut tasks: Vec<HumanTask> = self
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|task| task.status.is_open())
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn get_schedule_state(
        &self,
        schedule: &str,
    ) -> Result<Option<ScheduleState>, RepositoryError> {
        Ok(self
            .schedule_state
            .get(schedule)
            .map(|entry| entry.value().clone()))
    }

    async fn upsert_schedule_state(&self, state: &ScheduleState) -> Result<(), RepositoryError> {
        self.schedule_state
            .insert(state.schedule.clone(), state.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use oxflow_types::process::RunStatus;
    use serde_json::json;

    fn make_run(definition: &str, key: Option<&str>) -> ProcessRun {
        ProcessRun {
            id: Uuid::now_v7(),
            definition: definition.into(),
            status: RunStatus::Running,
            current_step: Some("first".into()),
            completed_steps: vec![],
            idempotency_key: key.map(Into::into),
            wait_state: None,
            context: json!({}),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn run_crud_round_trip() {
        let repo = MemoryRepository::new();
        let mut run = make_run("p", None);
        repo.create_run(&run).await.unwrap();

        run.status = RunStatus::Completed;
        run.ended_at = Some(Utc::now());
        repo.update_run(&run).await.unwrap();

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(loaded.ended_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_conflicts() {
        let repo = MemoryRepository::new();
        repo.create_run(&make_run("p", Some("k1"))).await.unwrap();

        let err = repo.create_run(&make_run("p", Some("k1"))).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        // same key under a different definition is fine
        repo.create_run(&make_run("q", Some("k1"))).await.unwrap();

        let found = repo
            .find_run_by_idempotency_key("p", "k1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.definition, "p");
    }

    #[tokio::test]
    async fn list_runs_filters_and_limits() {
        let repo = MemoryRepository::new();
        for _ in 0..3 {
            repo.create_run(&make_run("p", None)).await.unwrap();
        }
        let mut done = make_run("q", None);
        done.status = RunStatus::Completed;
        repo.create_run(&done).await.unwrap();

        let filter = RunFilter { definition: Some("p".into()), ..Default::default() };
        assert_eq!(repo.list_runs(&filter).await.unwrap().len(), 3);

        let filter = RunFilter { status: Some(RunStatus::Completed), ..Default::default() };
        assert_eq!(repo.list_runs(&filter).await.unwrap().len(), 1);

        let filter = RunFilter { limit: Some(2), ..Default::default() };
        assert_eq!(repo.list_runs(&filter).await.unwrap().len(), 2);

        assert_eq!(repo.list_active_runs("p").await.unwrap().len(), 3);
        assert_eq!(repo.list_active_runs("q").await.unwrap().len(), 0);
        assert_eq!(repo.list_inflight_runs().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn step_execution_updates() {
        let repo = MemoryRepository::new();
        let run = make_run("p", None);
        repo.create_run(&run).await.unwrap();

        let execution = StepExecution {
            id: Uuid::now_v7(),
            run_id: run.id,
            step_name: "reserve".into(),
            attempt: 1,
            status: StepExecutionStatus::Running,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        repo.create_step_execution(&execution).await.unwrap();
        repo.update_step_execution(
            &execution.id,
            StepExecutionStatus::Succeeded,
            Some(&json!({"ticket": "T-1"})),
            None,
        )
        .await
        .unwrap();

        let listed = repo.list_step_executions(&run.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, StepExecutionStatus::Succeeded);
        assert!(listed[0].completed_at.is_some());
        assert_eq!(listed[0].output.as_ref().unwrap()["ticket"], json!("T-1"));
    }

    #[tokio::test]
    async fn schedule_state_upserts() {
        let repo = MemoryRepository::new();
        assert!(repo.get_schedule_state("nightly").await.unwrap().is_none());

        let state = ScheduleState { schedule: "nightly".into(), last_fired_at: Some(Utc::now()) };
        repo.upsert_schedule_state(&state).await.unwrap();
        repo.upsert_schedule_state(&state).await.unwrap();

        let loaded = repo.get_schedule_state("nightly").await.unwrap().unwrap();
        assert!(loaded.last_fired_at.is_some());
    }
}
