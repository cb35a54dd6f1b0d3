//! Storage port for the process engine.
//!
//! The durable store is the single source of truth for run, step-execution,
//! task, and schedule state. The engine serializes writes per run id; the
//! repository only has to provide atomic single-row operations.

use oxflow_types::error::RepositoryError;
use oxflow_types::process::{
    HumanTask, ProcessRun, RunStatus, ScheduleState, StepExecution, StepExecutionStatus,
};
use serde_json::Value;
use uuid::Uuid;

/// Filter for [`ProcessRepository::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub definition: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<u32>,
}

/// Persistence operations for runs, step executions, human tasks, and
/// schedule state.
pub trait ProcessRepository: Clone + Send + Sync + 'static {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a new run. Fails with [`RepositoryError::Conflict`] when a run
    /// already exists for the same (definition, idempotency_key).
    fn create_run(
        &self,
        run: &ProcessRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist the full current state of a run.
    fn update_run(
        &self,
        run: &ProcessRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ProcessRun>, RepositoryError>> + Send;

    /// List runs newest-first, applying the filter's definition, status, and
    /// limit.
    fn list_runs(
        &self,
        filter: &RunFilter,
    ) -> impl std::future::Future<Output = Result<Vec<ProcessRun>, RepositoryError>> + Send;

    fn find_run_by_idempotency_key(
        &self,
        definition: &str,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<ProcessRun>, RepositoryError>> + Send;

    /// Non-terminal runs of one definition, oldest-first.
    fn list_active_runs(
        &self,
        definition: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ProcessRun>, RepositoryError>> + Send;

    /// All non-terminal runs, for crash recovery.
    fn list_inflight_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ProcessRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    fn create_step_execution(
        &self,
        execution: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update an attempt's status; terminal statuses also set completion
    /// time.
    fn update_step_execution(
        &self,
        execution_id: &Uuid,
        status: StepExecutionStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All attempts for a run, in start order.
    fn list_step_executions(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Human tasks
    // -----------------------------------------------------------------------

    fn create_task(
        &self,
        task: &HumanTask,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_task(
        &self,
        task: &HumanTask,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_task(
        &self,
        task_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<HumanTask>, RepositoryError>> + Send;

    /// Pending and assigned tasks, for the expiry sweep.
    fn list_open_tasks(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<HumanTask>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Schedule state
    // -----------------------------------------------------------------------

    fn get_schedule_state(
        &self,
        schedule: &str,
    ) -> impl std::future::Future<Output = Result<Option<ScheduleState>, RepositoryError>> + Send;

    fn upsert_schedule_state(
        &self,
        state: &ScheduleState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
