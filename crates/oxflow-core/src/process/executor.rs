//! Single-step execution: per-attempt timeout, retry loop, and the
//! service / send dispatch.
//!
//! Every attempt is recorded as a step-execution row before it runs and
//! updated when it settles, so the audit trail survives a crash mid-attempt.
//! Backoff sleeps race the run's cancellation token; a cancelled sleep
//! surfaces as [`StepOutcome::Cancelled`] and the engine finalizes the run.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use oxflow_types::process::{StepExecution, StepExecutionStatus};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::handlers::{ChannelTransport, HandlerRegistry};
use super::registry::CompiledStep;
use super::retry::RetryHandler;
use crate::repository::process::ProcessRepository;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Terminal result of executing one step (all retries included).
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(Value),
    Failure(String),
    Cancelled,
}

/// What to invoke for the current step, with inputs already resolved
/// through the run context.
#[derive(Debug, Clone)]
pub enum Invocation {
    Service {
        service: String,
        inputs: Map<String, Value>,
    },
    Send {
        channel: String,
        message: String,
        payload: Map<String, Value>,
    },
}

enum AttemptError {
    /// Retried per the step's policy.
    Retryable(String),
    /// Fails the step immediately (unknown handler, malformed definition).
    Fatal(String),
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes one step to a terminal outcome, applying timeout and retry
/// policy. Shared by the engine's main loop, parallel branches, and
/// compensations.
pub struct StepExecutor<R: ProcessRepository> {
    repo: R,
    handlers: HandlerRegistry,
    transport: Arc<dyn ChannelTransport>,
}

impl<R: ProcessRepository> StepExecutor<R> {
    pub fn new(repo: R, handlers: HandlerRegistry, transport: Arc<dyn ChannelTransport>) -> Self {
        Self { repo, handlers, transport }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Run the retry loop for a service or send step.
    pub async fn execute(
        &self,
        run_id: Uuid,
        step: &CompiledStep,
        invocation: Invocation,
        token: &CancellationToken,
    ) -> StepOutcome {
        let mut attempt: u32 = 1;
        loop {
            if token.is_cancelled() {
                return StepOutcome::Cancelled;
            }

            let execution_id = self
                .record_attempt_start(run_id, &step.name, attempt)
                .await;

            let work = self.invoke(&invocation);
            let result = tokio::select! {
                _ = token.cancelled() => {
                    self.record_attempt_end(execution_id, None, Some("cancelled")).await;
                    return StepOutcome::Cancelled;
                }
                result = async {
                    match step.timeout_secs {
                        Some(secs) => {
                            match tokio::time::timeout(Duration::from_secs(secs), work).await {
                                Ok(result) => result,
                                Err(_) => Err(AttemptError::Retryable(format!(
                                    "step timed out after {secs}s"
                                ))),
                            }
                        }
                        None => work.await,
                    }
                } => result,
            };

            match result {
                Ok(output) => {
                    self.record_attempt_end(execution_id, Some(&output), None).await;
                    tracing::debug!(
                        run_id = %run_id,
                        step = %step.name,
                        attempt,
                        "step attempt succeeded"
                    );
                    return StepOutcome::Success(output);
                }
                Err(AttemptError::Fatal(error)) => {
                    self.record_attempt_end(execution_id, None, Some(&error)).await;
                    return StepOutcome::Failure(error);
                }
                Err(AttemptError::Retryable(error)) => {
                    self.record_attempt_end(execution_id, None, Some(&error)).await;
                    tracing::warn!(
                        run_id = %run_id,
                        step = %step.name,
                        attempt,
                        error = %error,
                        "step attempt failed"
                    );

                    let Some(policy) = &step.retry else {
                        return StepOutcome::Failure(error);
                    };
                    if !RetryHandler::should_retry(policy, attempt) {
                        return StepOutcome::Failure(error);
                    }

                    let delay = RetryHandler::backoff_interval(policy, attempt);
                    tokio::select! {
                        _ = token.cancelled() => return StepOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Invoke a service handler once, outside the retry loop. Used for
    /// compensations, where a failure is recorded but never retried.
    pub async fn call_service_once(
        &self,
        service: &str,
        inputs: Map<String, Value>,
    ) -> Result<Value, String> {
        let Some(handler) = self.handlers.get(service) else {
            return Err(format!("no service handler registered for {service:?}"));
        };
        handler(inputs).await.map_err(|e| e.to_string())
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<Value, AttemptError> {
        match invocation {
            Invocation::Service { service, inputs } => {
                let Some(handler) = self.handlers.get(service) else {
                    // Unknown handler names are a definition problem; no
                    // amount of retrying will register one.
                    return Err(AttemptError::Fatal(format!(
                        "no service handler registered for {service:?}"
                    )));
                };
                handler(inputs.clone())
                    .await
                    .map_err(|e| AttemptError::Retryable(e.to_string()))
            }
            Invocation::Send { channel, message, payload } => {
                self.transport
                    .send(channel, message, payload)
                    .await
                    .map(|()| serde_json::json!({ "channel": channel, "sent": true }))
                    .map_err(|e| AttemptError::Retryable(e.to_string()))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Attempt audit trail (best-effort; the run row is the source of truth)
    // -----------------------------------------------------------------------

    async fn record_attempt_start(&self, run_id: Uuid, step_name: &str, attempt: u32) -> Uuid {
        let execution = StepExecution {
            id: Uuid::now_v7(),
            run_id,
            step_name: step_name.to_string(),
            attempt,
            status: StepExecutionStatus::Running,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        if let Err(error) = self.repo.create_step_execution(&execution).await {
            tracing::error!(run_id = %run_id, step_name, %error, "failed to record step attempt");
        }
        execution.id
    }

    async fn record_attempt_end(
        &self,
        execution_id: Uuid,
        output: Option<&Value>,
        error: Option<&str>,
    ) {
        let status = if error.is_none() {
            StepExecutionStatus::Succeeded
        } else {
            StepExecutionStatus::Failed
        };
        if let Err(repo_error) = self
            .repo
            .update_step_execution(&execution_id, status, output, error)
            .await
        {
            tracing::error!(execution_id = %execution_id, error = %repo_error, "failed to update step attempt");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
