use thiserror::Error;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the Conductor workflow engine.
///
/// Every variant maps to a stable reason string via [`ConductorError::reason`],
/// which is what callers should match on when reporting failures.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// A human response is missing inputs its interrupt declared as required.
    #[error("Validation error: interrupt {interrupt_id} is missing required inputs: {}", missing.join(", "))]
    Validation {
        /// The interrupt the response was submitted against.
        interrupt_id: String,
        /// The declared required keys absent from the response.
        missing: Vec<String>,
    },

    /// Unknown thread, checkpoint or interrupt id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A task graph that can never make progress (cycle or dangling dependency).
    #[error("Scheduling deadlock: {0}")]
    SchedulingDeadlock(String),

    /// A worker declared that a task exceeds its capability.
    #[error("Capability exceeded: {reason}")]
    CapabilityExceeded {
        /// Human-readable explanation from the worker.
        reason: String,
        /// The capability that would be needed to complete the task.
        hint: Option<String>,
    },

    /// Checkpoint persistence failed. Never downgraded to in-memory state.
    #[error("Storage error: {0}")]
    Storage(String),

    /// `run` was called with a thread id that already has checkpoints.
    #[error("Thread already exists: {0}")]
    ThreadExists(String),

    /// `resume` was called on a thread that is not suspended at an interrupt.
    #[error("Thread is not suspended: {0}")]
    NotSuspended(String),

    /// A single run or resume executed more steps than the configured limit.
    #[error("Step limit of {0} exceeded")]
    StepLimit(usize),

    /// A capability-analysis or task-execution collaborator failed.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// A workflow step found the state inconsistent and could not proceed.
    #[error("Step error: {0}")]
    Step(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Stable, machine-readable reason for this failure.
    pub fn reason(&self) -> &'static str {
        match self {
            ConductorError::Validation { .. } => "validation",
            ConductorError::NotFound(_) => "not_found",
            ConductorError::SchedulingDeadlock(_) => "scheduling_deadlock",
            ConductorError::CapabilityExceeded { .. } => "capability_exceeded",
            ConductorError::Storage(_) => "storage",
            ConductorError::ThreadExists(_) => "thread_exists",
            ConductorError::NotSuspended(_) => "not_suspended",
            ConductorError::StepLimit(_) => "step_limit",
            ConductorError::Collaborator(_) => "collaborator",
            ConductorError::Step(_) => "step",
            ConductorError::Config(_) => "config",
            ConductorError::Json(_) => "json",
            ConductorError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_missing_keys() {
        let err = ConductorError::Validation {
            interrupt_id: "abc".into(),
            missing: vec!["budget".into(), "region".into()],
        };
        assert_eq!(
            err.to_string(),
            "Validation error: interrupt abc is missing required inputs: budget, region"
        );
        assert_eq!(err.reason(), "validation");
    }

    #[test]
    fn test_reason_strings_are_stable() {
        assert_eq!(ConductorError::NotFound("t".into()).reason(), "not_found");
        assert_eq!(ConductorError::Storage("disk".into()).reason(), "storage");
        assert_eq!(
            ConductorError::SchedulingDeadlock("cycle".into()).reason(),
            "scheduling_deadlock"
        );
        assert_eq!(ConductorError::StepLimit(10).reason(), "step_limit");
    }

    #[test]
    fn test_collaborator_and_step_reasons() {
        let err = ConductorError::Collaborator("analyzer offline".into());
        assert_eq!(err.reason(), "collaborator");
        assert_eq!(err.to_string(), "Collaborator error: analyzer offline");
        assert_eq!(ConductorError::Step("bad assignment".into()).reason(), "step");
    }

    #[test]
    fn test_json_error_converts() {
        let err: ConductorError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.reason(), "json");
    }
}
