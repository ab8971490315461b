//! The shared workflow aggregate and the partial updates steps return.

use crate::types::{
    CompletionReport, EscalationRequest, Goal, Project, Task, TaskResult, TaskStatus, ToolStatus,
    WorkerDefinition, WorkerKind, WorkerRequest,
};
use chrono::{DateTime, Utc};
use conductor_checkpoint::PendingWrite;
use conductor_core::{ConductorError, ConductorResult, HumanInterrupt, HumanResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Coarse workflow stage, used to pick the step a resumed thread re-enters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Initialization,
    CapabilityAnalysis,
    WorkersProvisioned,
    Planning,
    PlanningComplete,
    Executing,
    Completed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Initialization => "initialization",
            Phase::CapabilityAnalysis => "capability_analysis",
            Phase::WorkersProvisioned => "workers_provisioned",
            Phase::Planning => "planning",
            Phase::PlanningComplete => "planning_complete",
            Phase::Executing => "executing",
            Phase::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

fn default_true() -> bool {
    true
}

/// The single aggregate every step reads. Versioned by checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub goal: Goal,
    /// Roster keyed by worker id, coordinator included.
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerDefinition>,
    /// Requests for workers not yet provisioned.
    #[serde(default)]
    pub worker_requests: Vec<WorkerRequest>,
    #[serde(default)]
    pub projects: BTreeMap<String, Project>,
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
    #[serde(default)]
    pub task_results: BTreeMap<String, TaskResult>,
    /// Runnable queue. Every id exists in `tasks`; disjoint from `executing_tasks`.
    #[serde(default)]
    pub pending_tasks: Vec<String>,
    /// Tasks whose execution started in a step that has not yet checkpointed.
    /// `dispatch` takes a task to a terminal or blocked status within one
    /// step, so this is empty at every checkpoint it writes; promotion still
    /// skips any id listed here.
    #[serde(default)]
    pub executing_tasks: Vec<String>,
    /// Open interrupts in creation order.
    #[serde(default)]
    pub pending_interrupts: Vec<HumanInterrupt>,
    /// Append-only, one entry per resolved interrupt.
    #[serde(default)]
    pub human_responses: Vec<HumanResponse>,
    /// How many of `human_responses` the await-human step has reconciled.
    #[serde(default)]
    pub responses_applied: usize,
    /// Union of every input a human ever supplied. Only grows.
    #[serde(default)]
    pub collected_inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub escalations: Vec<EscalationRequest>,
    #[serde(default)]
    pub connected_tools: BTreeMap<String, ToolStatus>,
    #[serde(default)]
    pub phase: Phase,
    /// Set when a step fails; the thread then stops.
    #[serde(default)]
    pub error: Option<String>,
    /// Cleared to end the thread after the current step.
    #[serde(default = "default_true")]
    pub should_continue: bool,
    /// Completion summary, written when the thread finishes.
    #[serde(default)]
    pub report: Option<CompletionReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Fresh state for `goal` with nothing planned yet.
    pub fn new(goal: Goal) -> Self {
        let now = Utc::now();
        Self {
            goal,
            workers: BTreeMap::new(),
            worker_requests: Vec::new(),
            projects: BTreeMap::new(),
            tasks: BTreeMap::new(),
            task_results: BTreeMap::new(),
            pending_tasks: Vec::new(),
            executing_tasks: Vec::new(),
            pending_interrupts: Vec::new(),
            human_responses: Vec::new(),
            responses_applied: 0,
            collected_inputs: BTreeMap::new(),
            escalations: Vec::new(),
            connected_tools: BTreeMap::new(),
            phase: Phase::Initialization,
            error: None,
            should_continue: true,
            report: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Provisioned (non-coordinator) workers.
    pub fn experts(&self) -> impl Iterator<Item = &WorkerDefinition> {
        self.workers
            .values()
            .filter(|w| w.kind == WorkerKind::Expert)
    }

    /// Whether any non-coordinator worker is on the roster.
    pub fn has_experts(&self) -> bool {
        self.experts().next().is_some()
    }

    /// The state as a JSON value, as stored in checkpoints.
    pub fn to_value(&self) -> ConductorResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes a checkpoint snapshot. A snapshot that does not decode is a storage fault.
    pub fn from_value(value: Value) -> ConductorResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| ConductorError::Storage(format!("corrupt workflow snapshot: {e}")))
    }

    /// Builds the end-of-run summary from the current state.
    pub fn completion_report(&self) -> CompletionReport {
        CompletionReport {
            total_projects: self.projects.len(),
            total_tasks: self.tasks.len(),
            completed_tasks: self
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Completed)
                .count(),
            failed_tasks: self
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Failed)
                .count(),
            workers_used: self.workers.len(),
            outputs: self
                .task_results
                .iter()
                .filter_map(|(id, r)| r.output.clone().map(|o| (id.clone(), o)))
                .collect(),
        }
    }
}

macro_rules! state_update {
    ($($field:ident : $ty:ty),* $(,)?) => {
        /// A partial update returned by a step.
        ///
        /// Each `Some` field wholesale-replaces the same field of [`WorkflowState`];
        /// collections are never deep-merged. `goal` has no slot, so it can
        /// never change after the thread starts.
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct StateUpdate {
            $(pub $field: Option<$ty>,)*
        }

        impl StateUpdate {
            /// Merges the update into `state`.
            pub fn apply(self, state: &mut WorkflowState) {
                $(if let Some(value) = self.$field {
                    state.$field = value;
                })*
                state.updated_at = Utc::now();
            }

            /// Whether the update writes no field.
            pub fn is_empty(&self) -> bool {
                true $(&& self.$field.is_none())*
            }

            /// Names of the fields this update writes.
            pub fn channels(&self) -> Vec<&'static str> {
                let mut out = Vec::new();
                $(if self.$field.is_some() {
                    out.push(stringify!($field));
                })*
                out
            }

            /// Encodes the update as pending writes, one per written field.
            pub fn to_writes(&self, step: &str) -> ConductorResult<Vec<PendingWrite>> {
                let mut writes = Vec::new();
                $(if let Some(value) = &self.$field {
                    writes.push(PendingWrite {
                        step: step.to_string(),
                        channel: stringify!($field).to_string(),
                        value: serde_json::to_value(value)?,
                        index: writes.len(),
                    });
                })*
                Ok(writes)
            }

            /// Rebuilds an update from logged pending writes.
            pub fn from_writes(writes: &[PendingWrite]) -> ConductorResult<Self> {
                let mut update = Self::default();
                for write in writes {
                    match write.channel.as_str() {
                        $(stringify!($field) => {
                            update.$field = Some(serde_json::from_value(write.value.clone())?);
                        })*
                        other => {
                            return Err(ConductorError::Storage(format!(
                                "unknown state channel '{other}' in pending writes"
                            )))
                        }
                    }
                }
                Ok(update)
            }
        }
    };
}

state_update! {
    workers: BTreeMap<String, WorkerDefinition>,
    worker_requests: Vec<WorkerRequest>,
    projects: BTreeMap<String, Project>,
    tasks: BTreeMap<String, Task>,
    task_results: BTreeMap<String, TaskResult>,
    pending_tasks: Vec<String>,
    executing_tasks: Vec<String>,
    pending_interrupts: Vec<HumanInterrupt>,
    human_responses: Vec<HumanResponse>,
    responses_applied: usize,
    collected_inputs: BTreeMap<String, Value>,
    escalations: Vec<EscalationRequest>,
    connected_tools: BTreeMap<String, ToolStatus>,
    phase: Phase,
    error: Option<String>,
    should_continue: bool,
    report: Option<CompletionReport>,
}

impl StateUpdate {
    /// An update that stops the workflow with a business-logic error.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(Some(message.into())),
            should_continue: Some(false),
            ..Self::default()
        }
    }
}
