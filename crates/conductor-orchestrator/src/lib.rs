//! Durable workflow engine with dependency scheduling and human-in-the-loop suspension.
//!
//! A workflow thread turns a business goal into provisioned workers, a plan of
//! projects and dependent tasks, and executed results. Every step is
//! checkpointed, so a thread can suspend on a human interrupt, survive a
//! process restart, and resume exactly where it stopped.
//!
//! # Main types
//!
//! - [`WorkflowEngine`]: Runs, suspends, resumes and recovers workflow threads.
//! - [`WorkflowState`]: The shared aggregate every step reads.
//! - [`StateUpdate`]: Partial update a step returns; merged field by field.
//! - [`Scheduler`]: Dependency-aware promotion, guards and worker selection.
//! - [`InterruptLedger`]: Open interrupts and the responses that resolved them.
//! - [`WorkerRegistry`]: Per-worker execution handles and metrics.
//! - [`CapabilityAnalyzer`] / [`TaskExecutor`]: Seams to the external collaborators.

/// Capability analysis and task execution seams.
pub mod collaborators;
/// The durable step/route state machine.
pub mod engine;
/// Guarded, step-by-step task execution.
pub mod executor;
/// Interrupt bookkeeping.
pub mod ledger;
/// Built-in coordinator workers and expert provisioning.
pub mod profiles;
/// Worker handles and execution metrics.
pub mod registry;
/// Step identifiers and routing.
pub mod routing;
/// Task dependency scheduling.
pub mod scheduler;
/// Workflow state and partial updates.
pub mod state;
/// Step implementations.
pub mod steps;
/// Domain records (Goal, Task, Project, WorkerDefinition, etc.).
pub mod types;

pub use collaborators::{
    CapabilityAnalyzer, CapabilityProposal, ExecutionOutcome, PlanningContext, ProjectProposal,
    StaticAnalyzer, TaskExecutor, TaskProposal, WorkPlan, WorkerProposal,
};
pub use engine::{EngineConfig, WorkflowEngine};
pub use executor::{ChecklistRunner, GuardedExecutor, StepOutput, StepRunner};
pub use ledger::InterruptLedger;
pub use registry::{WorkerHandle, WorkerMetrics, WorkerRegistry};
pub use routing::{Route, StepId};
pub use scheduler::{ExecutionContext, Scheduler, TaskGraph};
pub use state::{Phase, StateUpdate, WorkflowState};
pub use steps::Steps;
pub use types::{
    ApprovalKind, ApprovalPoint, CompletionReport, EscalationKind, EscalationRequest,
    ExecutionStep, Goal, Priority, Project, ProjectStatus, Task, TaskResult, TaskStatus, TaskType,
    ToolRequirement, ToolStatus, WorkerDefinition, WorkerKind, WorkerRequest, WorkerStatus,
};
