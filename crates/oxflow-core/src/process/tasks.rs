//! Human task lifecycle: assignment, completion, expiry, escalation.
//!
//! Task rows live in the repository; the manager is a thin control surface
//! over them plus a periodic sweep for deadlines. Completing a task is the
//! only way a task-waiting run resumes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use oxflow_types::process::{HumanTask, TaskStatus};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::engine::{EngineError, EngineInner};
use crate::repository::process::ProcessRepository;

/// Control surface for human tasks. Cheap to clone; shares the engine's
/// state.
pub struct TaskManager<R: ProcessRepository> {
    inner: Arc<EngineInner<R>>,
}

impl<R: ProcessRepository> Clone for TaskManager<R> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<R: ProcessRepository> TaskManager<R> {
    pub(crate) fn new(inner: Arc<EngineInner<R>>) -> Self {
        Self { inner }
    }

    pub async fn get(&self, task_id: Uuid) -> Result<HumanTask, EngineError> {
        self.inner
            .repo
            .get_task(&task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    /// All pending and assigned tasks.
    pub async fn list_open(&self) -> Result<Vec<HumanTask>, EngineError> {
        Ok(self.inner.repo.list_open_tasks().await?)
    }

    /// Claim an open task for an assignee.
    pub async fn assign(&self, task_id: Uuid, assignee: &str) -> Result<(), EngineError> {
        let mut task = self.get(task_id).await?;
        if !task.status.is_open() {
            return Err(EngineError::TaskClosed { task_id, status: task.status });
        }
        task.assignee = Some(assignee.to_string());
        task.status = TaskStatus::Assigned;
        self.inner.repo.update_task(&task).await?;
        tracing::info!(task_id = %task_id, assignee, "task assigned");
        Ok(())
    }

    /// Complete a task with one of its declared outcomes. `fields` is the
    /// submitted form data, recorded as the step's output alongside the
    /// outcome name.
    pub async fn complete(
        &self,
        task_id: Uuid,
        outcome: &str,
        fields: Map<String, Value>,
    ) -> Result<(), EngineError> {
        self.inner.complete_task(task_id, outcome, fields).await
    }

    /// One deadline pass over all open tasks: expire tasks past their
    /// deadline, escalate tasks past their escalation deadline. Returns the
    /// number of tasks expired.
    pub async fn sweep(&self) -> Result<usize, EngineError> {
        let now = Utc::now();
        let mut expired = 0;

        for task in self.inner.repo.list_open_tasks().await? {
            if task.deadline.is_some_and(|deadline| deadline <= now) {
                self.inner.expire_task(task.id).await?;
                expired += 1;
                continue;
            }
            // Escalation fires once per task.
            if task.escalated_at.is_none()
                && task
                    .escalation_deadline
                    .is_some_and(|deadline| deadline <= now)
            {
                let mut task = task;
                task.escalated_at = Some(now);
                self.inner.repo.update_task(&task).await?;
                tracing::warn!(
                    task_id = %task.id,
                    run_id = %task.run_id,
                    step = %task.step_name,
                    assignee = task.assignee.as_deref().unwrap_or("unassigned"),
                    "task escalated: overdue without completion"
                );
            }
        }
        Ok(expired)
    }

    /// Run the deadline sweep on an interval until cancelled.
    pub async fn run_sweeper(&self, interval: Duration, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(error) = self.sweep().await {
                tracing::error!(%error, "task sweep failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::engine::ProcessEngine;
    use crate::repository::memory::MemoryRepository;
    use oxflow_types::process::{ProcessDefinition, RunStatus};
    use serde_json::json;

    fn engine() -> ProcessEngine<MemoryRepository> {
        ProcessEngine::new(MemoryRepository::new())
    }

    fn register_approval_process(engine: &ProcessEngine<MemoryRepository>) {
        let yaml = r#"
name: expense-approval
inputs:
  - name: amount
    required: true
steps:
  - name: approval
    kind: human_task
    task:
      surface: approvals
      assignee: "'finance-team'"
      timeout_secs: 3600
      escalation_timeout_secs: 1800
      outcomes:
        - name: approve
          goto: notify
          assignments:
            - field: approved
              value: "true"
        - name: reject
          goto: fail
  - name: notify
    kind: send
    channel: email
    message: "expense ${inputs.amount} approved by ${approval.approver}"
"#;
        let def: ProcessDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        engine.register(def).unwrap();
    }

    async fn wait_for_status(
        engine: &ProcessEngine<MemoryRepository>,
        run_id: Uuid,
        status: RunStatus,
    ) {
        for _ in 0..200 {
            if engine.get_run(run_id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {run_id} never reached {status:?}");
    }

    async fn open_task(tasks: &TaskManager<MemoryRepository>) -> HumanTask {
        for _ in 0..200 {
            if let Some(task) = tasks.list_open().await.unwrap().into_iter().next() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no open task appeared");
    }

    #[tokio::test]
    async fn approve_outcome_resumes_and_completes_run() {
        let engine = engine();
        register_approval_process(&engine);
        let tasks = engine.task_manager();

        let mut inputs = Map::new();
        inputs.insert("amount".into(), json!(250));
        let run_id = engine.start("expense-approval", inputs, None).await.unwrap();
        wait_for_status(&engine, run_id, RunStatus::Waiting).await;

        let task = open_task(&tasks).await;
        assert_eq!(task.run_id, run_id);
        assert_eq!(task.surface, "approvals");
        assert_eq!(task.assignee.as_deref(), Some("finance-team"));
        assert_eq!(task.status, TaskStatus::Assigned);

        let mut fields = Map::new();
        fields.insert("approver".into(), json!("lee"));
        tasks.complete(task.id, "approve", fields).await.unwrap();
        wait_for_status(&engine, run_id, RunStatus::Completed).await;

        let run = engine.get_run(run_id).await.unwrap();
        assert_eq!(run.completed_steps, vec!["approval", "notify"]);
        // outcome and submitted fields land in the step output
        let output = &run.context["step_outputs"]["approval"];
        assert_eq!(output["outcome"], json!("approve"));
        assert_eq!(output["approver"], json!("lee"));
        // assignment ran
        assert_eq!(run.context["variables"]["approved"], json!(true));

        let task = tasks.get(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.outcome.as_deref(), Some("approve"));
    }

    #[tokio::test]
    async fn reject_outcome_fails_the_run() {
        let engine = engine();
        register_approval_process(&engine);
        let tasks = engine.task_manager();

        let mut inputs = Map::new();
        inputs.insert("amount".into(), json!(90));
        let run_id = engine.start("expense-approval", inputs, None).await.unwrap();
        wait_for_status(&engine, run_id, RunStatus::Waiting).await;

        let task = open_task(&tasks).await;
        tasks.complete(task.id, "reject", Map::new()).await.unwrap();
        wait_for_status(&engine, run_id, RunStatus::Failed).await;
    }

    #[tokio::test]
    async fn unknown_outcome_is_rejected_and_task_stays_open() {
        let engine = engine();
        register_approval_process(&engine);
        let tasks = engine.task_manager();

        let mut inputs = Map::new();
        inputs.insert("amount".into(), json!(10));
        let run_id = engine.start("expense-approval", inputs, None).await.unwrap();
        wait_for_status(&engine, run_id, RunStatus::Waiting).await;

        let task = open_task(&tasks).await;
        let err = tasks.complete(task.id, "shrug", Map::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownOutcome { .. }));
        assert!(tasks.get(task.id).await.unwrap().status.is_open());
    }

    #[tokio::test]
    async fn completing_a_closed_task_is_an_error() {
        let engine = engine();
        register_approval_process(&engine);
        let tasks = engine.task_manager();

        let mut inputs = Map::new();
        inputs.insert("amount".into(), json!(10));
        engine.start("expense-approval", inputs, None).await.unwrap();

        let task = open_task(&tasks).await;
        tasks.complete(task.id, "approve", Map::new()).await.unwrap();

        let err = tasks.complete(task.id, "approve", Map::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::TaskClosed { .. }));
    }

    #[tokio::test]
    async fn sweep_expires_overdue_tasks_and_fails_the_run() {
        let engine = engine();
        // zero-second timeout so the task is overdue immediately
        let yaml = r#"
name: instant-expiry
steps:
  - name: approval
    kind: human_task
    task:
      surface: approvals
      timeout_secs: 0
      outcomes:
        - name: approve
          goto: complete
"#;
        let def: ProcessDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        engine.register(def).unwrap();
        let tasks = engine.task_manager();

        let run_id = engine.start("instant-expiry", Map::new(), None).await.unwrap();
        wait_for_status(&engine, run_id, RunStatus::Waiting).await;

        let task = open_task(&tasks).await;
        assert_eq!(tasks.sweep().await.unwrap(), 1);
        wait_for_status(&engine, run_id, RunStatus::Failed).await;

        let run = engine.get_run(run_id).await.unwrap();
        assert!(run.error.as_deref().unwrap().contains("expired"));
        assert_eq!(tasks.get(task.id).await.unwrap().status, TaskStatus::Expired);
    }

    #[tokio::test]
    async fn sweep_escalates_once_without_expiring() {
        let engine = engine();
        let yaml = r#"
name: slow-approval
steps:
  - name: approval
    kind: human_task
    task:
      surface: approvals
      timeout_secs: 3600
      escalation_timeout_secs: 0
      outcomes:
        - name: approve
          goto: complete
"#;
        let def: ProcessDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        engine.register(def).unwrap();
        let tasks = engine.task_manager();

        let run_id = engine.start("slow-approval", Map::new(), None).await.unwrap();
        wait_for_status(&engine, run_id, RunStatus::Waiting).await;
        let task = open_task(&tasks).await;

        assert_eq!(tasks.sweep().await.unwrap(), 0);
        let escalated = tasks.get(task.id).await.unwrap();
        assert!(escalated.escalated_at.is_some());
        assert!(escalated.status.is_open());

        // second sweep leaves the escalation timestamp alone
        assert_eq!(tasks.sweep().await.unwrap(), 0);
        let again = tasks.get(task.id).await.unwrap();
        assert_eq!(again.escalated_at, escalated.escalated_at);
    }

    #[tokio::test]
    async fn assign_claims_an_open_task() {
        let engine = engine();
        let yaml = r#"
name: unassigned
steps:
  - name: review
    kind: human_task
    task:
      surface: reviews
      outcomes:
        - name: done
          goto: complete
"#;
        let def: ProcessDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        engine.register(def).unwrap();
        let tasks = engine.task_manager();

        engine.start("unassigned", Map::new(), None).await.unwrap();
        let task = open_task(&tasks).await;
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assignee.is_none());

        tasks.assign(task.id, "pat").await.unwrap();
        let task = tasks.get(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assignee.as_deref(), Some("pat"));
    }
}
