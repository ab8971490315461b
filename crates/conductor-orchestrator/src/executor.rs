//! The built-in [`TaskExecutor`]: guard checks first, then step-by-step execution.

use crate::collaborators::{ExecutionOutcome, TaskExecutor};
use crate::scheduler::{ExecutionContext, Scheduler};
use crate::types::{ExecutionStep, Task, TaskResult, TaskStatus, WorkerDefinition};
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult, HumanInterrupt};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

/// Output of one execution step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    Done(Value),
    /// The step needs a capability the worker does not have.
    Exceeded {
        reason: String,
        hint: Option<String>,
        suggestion: Option<String>,
    },
}

/// Runs a single execution step of a task.
///
/// A runner may report a capability overrun either as
/// [`StepOutput::Exceeded`] or as `ConductorError::CapabilityExceeded`;
/// [`GuardedExecutor`] turns both into the same outcome.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(
        &self,
        worker: &WorkerDefinition,
        task: &Task,
        step: &ExecutionStep,
        ctx: &ExecutionContext<'_>,
    ) -> ConductorResult<StepOutput>;
}

/// Records every step as done.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecklistRunner;

#[async_trait]
impl StepRunner for ChecklistRunner {
    async fn run_step(
        &self,
        worker: &WorkerDefinition,
        _task: &Task,
        step: &ExecutionStep,
        _ctx: &ExecutionContext<'_>,
    ) -> ConductorResult<StepOutput> {
        Ok(StepOutput::Done(json!({
            "action": step.action,
            "tool": step.tool,
            "done_by": worker.id,
        })))
    }
}

/// Checks missing inputs, explicit approval and tool availability, in that
/// order, before handing each execution step to the runner.
pub struct GuardedExecutor<R: StepRunner> {
    runner: R,
}

impl<R: StepRunner> GuardedExecutor<R> {
    /// Wraps `runner` with the input, approval and tool guards.
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    fn blocked(
        task: &Task,
        status: TaskStatus,
        request: Value,
        interrupt: HumanInterrupt,
    ) -> ExecutionOutcome {
        info!(task_id = %task.id, status = %status, "Task blocked on human");
        ExecutionOutcome::Finished {
            result: TaskResult::blocked(task.id.clone(), status, request),
            interrupt: Some(interrupt.for_task(task.id.clone()).for_project(task.project_id.clone())),
        }
    }
}

impl GuardedExecutor<ChecklistRunner> {
    /// Executor backed by [`ChecklistRunner`].
    pub fn checklist() -> Self {
        Self::new(ChecklistRunner)
    }
}

#[async_trait]
impl<R: StepRunner> TaskExecutor for GuardedExecutor<R> {
    async fn execute(
        &self,
        worker: &WorkerDefinition,
        task: &Task,
        ctx: &ExecutionContext<'_>,
    ) -> ConductorResult<ExecutionOutcome> {
        match Scheduler::guard(task, ctx) {
            Some(TaskStatus::InputRequired) => {
                let missing: Vec<_> = task
                    .missing_inputs(ctx.collected_inputs)
                    .into_iter()
                    .cloned()
                    .collect();
                let keys: Vec<&str> = missing.iter().map(|i| i.key.as_str()).collect();
                let request = json!({ "missing_inputs": keys });
                let interrupt = HumanInterrupt::info_request(
                    worker.id.clone(),
                    format!("Task '{}' needs more information", task.name),
                    missing,
                );
                return Ok(Self::blocked(task, TaskStatus::InputRequired, request, interrupt));
            }
            Some(TaskStatus::ApprovalWait) => {
                let interrupt = HumanInterrupt::approval_request(
                    worker.id.clone(),
                    format!("Task '{}' needs approval before it runs", task.name),
                )
                .with_context("task_description", Value::String(task.description.clone()))
                .with_context("approval_points", serde_json::to_value(&task.approval_points)?)
                .with_context("execution_steps", serde_json::to_value(&task.execution_steps)?);
                let request = json!({ "approval_point": "before_execution" });
                return Ok(Self::blocked(task, TaskStatus::ApprovalWait, request, interrupt));
            }
            Some(TaskStatus::AwaitingTool) => {
                let missing = task.missing_tools(ctx.connected_tools);
                let request = json!({ "missing_tools": missing });
                let interrupt = HumanInterrupt::tool_connection(
                    worker.id.clone(),
                    format!("Task '{}' needs tool connections", task.name),
                    &missing,
                );
                return Ok(Self::blocked(task, TaskStatus::AwaitingTool, request, interrupt));
            }
            _ => {}
        }

        let mut outputs = Map::new();
        for step in &task.execution_steps {
            debug!(task_id = %task.id, step = step.step, action = %step.action, "Running step");
            let output = match self.runner.run_step(worker, task, step, ctx).await {
                Ok(output) => output,
                Err(ConductorError::CapabilityExceeded { reason, hint }) => StepOutput::Exceeded {
                    reason,
                    hint,
                    suggestion: None,
                },
                Err(e) => return Err(e),
            };
            match output {
                StepOutput::Done(value) => {
                    outputs.insert(format!("step_{}", step.step), value);
                }
                StepOutput::Exceeded {
                    reason,
                    hint,
                    suggestion,
                } => {
                    return Ok(ExecutionOutcome::CapabilityExceeded {
                        reason,
                        hint,
                        suggestion,
                    });
                }
            }
        }

        Ok(ExecutionOutcome::Finished {
            result: TaskResult::completed(task.id.clone(), Value::Object(outputs)),
            interrupt: None,
        })
    }
}
