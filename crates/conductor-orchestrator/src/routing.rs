//! The step catalogue and the routing table between steps.
//!
//! Every routing function is pure: the same post-merge state always
//! yields the same next step.

use crate::scheduler::Scheduler;
use crate::state::{Phase, WorkflowState};
use conductor_core::ConductorError;
use std::fmt;
use std::str::FromStr;

/// Fixed step identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepId {
    Initialize,
    PlanCapabilities,
    PlanWork,
    Dispatch,
    AwaitHuman,
    Finalize,
}

impl StepId {
    /// Every step, in declaration order.
    pub const ALL: [StepId; 6] = [
        StepId::Initialize,
        StepId::PlanCapabilities,
        StepId::PlanWork,
        StepId::Dispatch,
        StepId::AwaitHuman,
        StepId::Finalize,
    ];

    /// Name the step is checkpointed under.
    pub fn as_str(self) -> &'static str {
        match self {
            StepId::Initialize => "initialize",
            StepId::PlanCapabilities => "plan-capabilities",
            StepId::PlanWork => "plan-work",
            StepId::Dispatch => "dispatch",
            StepId::AwaitHuman => "await-human",
            StepId::Finalize => "finalize",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepId {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepId::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| ConductorError::NotFound(format!("step '{s}'")))
    }
}

/// Where control goes after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Step(StepId),
    End,
}

impl Route {
    /// The name recorded as a checkpoint's `next`; `None` for the terminal route.
    pub fn next_name(self) -> Option<String> {
        match self {
            Route::Step(step) => Some(step.as_str().to_string()),
            Route::End => None,
        }
    }

    /// Parses a checkpoint's `next` back into a route.
    pub fn from_next(next: Option<&str>) -> Result<Self, ConductorError> {
        match next {
            Some(name) => Ok(Route::Step(name.parse()?)),
            None => Ok(Route::End),
        }
    }
}

/// Computes the step that follows `after` given the merged state.
pub fn route(after: StepId, state: &WorkflowState) -> Route {
    if state.error.is_some() {
        return Route::End;
    }
    let interrupted = !state.pending_interrupts.is_empty();
    match after {
        StepId::Initialize => {
            if state.should_continue {
                Route::Step(StepId::PlanCapabilities)
            } else {
                Route::End
            }
        }
        StepId::PlanCapabilities => {
            if interrupted {
                Route::Step(StepId::AwaitHuman)
            } else if state.has_experts() {
                Route::Step(StepId::PlanWork)
            } else {
                Route::End
            }
        }
        StepId::PlanWork => {
            if interrupted {
                Route::Step(StepId::AwaitHuman)
            } else if !state.worker_requests.is_empty() {
                Route::Step(StepId::PlanCapabilities)
            } else if !state.pending_tasks.is_empty() {
                Route::Step(StepId::Dispatch)
            } else {
                Route::End
            }
        }
        StepId::Dispatch => {
            if interrupted {
                Route::Step(StepId::AwaitHuman)
            } else if !state.escalations.is_empty() {
                Route::Step(StepId::PlanWork)
            } else if !state.pending_tasks.is_empty() {
                Route::Step(StepId::Dispatch)
            } else if Scheduler::all_terminal(&state.tasks) {
                Route::Step(StepId::Finalize)
            } else {
                Route::Step(StepId::PlanWork)
            }
        }
        StepId::AwaitHuman => Route::Step(resume_target(state.phase)),
        StepId::Finalize => Route::End,
    }
}

/// The step a thread re-enters after `await-human`, chosen by phase.
pub fn resume_target(phase: Phase) -> StepId {
    match phase {
        Phase::CapabilityAnalysis => StepId::PlanCapabilities,
        Phase::Planning => StepId::PlanWork,
        Phase::PlanningComplete | Phase::Executing => StepId::Dispatch,
        _ => StepId::PlanWork,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::profiles::coordinators;
    use crate::types::{Goal, Task, TaskStatus, WorkerKind};
    use conductor_core::HumanInterrupt;

    fn state() -> WorkflowState {
        let mut state = WorkflowState::new(Goal::new("grow revenue"));
        for w in coordinators() {
            state.workers.insert(w.id.clone(), w);
        }
        state
    }

    fn with_expert(mut state: WorkflowState) -> WorkflowState {
        let mut expert = coordinators().remove(0);
        expert.id = "expert-1".into();
        expert.kind = WorkerKind::Expert;
        state.workers.insert(expert.id.clone(), expert);
        state
    }

    #[test]
    fn test_step_names_round_trip() {
        for step in StepId::ALL {
            assert_eq!(step.as_str().parse::<StepId>().unwrap(), step);
        }
        assert!("teleport".parse::<StepId>().is_err());
        assert_eq!(Route::from_next(None).unwrap(), Route::End);
        assert_eq!(
            Route::from_next(Some("await-human")).unwrap(),
            Route::Step(StepId::AwaitHuman)
        );
    }

    #[test]
    fn test_error_always_ends() {
        let mut s = with_expert(state());
        s.error = Some("boom".into());
        s.pending_tasks.push("t".into());
        for step in StepId::ALL {
            assert_eq!(route(step, &s), Route::End);
        }
    }

    #[test]
    fn test_after_initialize() {
        let mut s = state();
        assert_eq!(route(StepId::Initialize, &s), Route::Step(StepId::PlanCapabilities));
        s.should_continue = false;
        assert_eq!(route(StepId::Initialize, &s), Route::End);
    }

    #[test]
    fn test_after_plan_capabilities() {
        let s = state();
        assert_eq!(route(StepId::PlanCapabilities, &s), Route::End);

        let s = with_expert(s);
        assert_eq!(route(StepId::PlanCapabilities, &s), Route::Step(StepId::PlanWork));

        let mut s = s;
        s.pending_interrupts.push(HumanInterrupt::info_request("capability-manager", "?", vec![]));
        assert_eq!(route(StepId::PlanCapabilities, &s), Route::Step(StepId::AwaitHuman));
    }

    #[test]
    fn test_after_dispatch() {
        let mut s = with_expert(state());
        let mut done = Task::new("t1", "p", "a", "b");
        done.status = TaskStatus::Completed;
        s.tasks.insert("t1".into(), done);
        assert_eq!(route(StepId::Dispatch, &s), Route::Step(StepId::Finalize));

        s.tasks.insert("t2".into(), Task::new("t2", "p", "c", "d"));
        assert_eq!(route(StepId::Dispatch, &s), Route::Step(StepId::PlanWork));

        s.pending_tasks.push("t2".into());
        assert_eq!(route(StepId::Dispatch, &s), Route::Step(StepId::Dispatch));
    }

    #[test]
    fn test_resume_target_by_phase() {
        assert_eq!(resume_target(Phase::CapabilityAnalysis), StepId::PlanCapabilities);
        assert_eq!(resume_target(Phase::Planning), StepId::PlanWork);
        assert_eq!(resume_target(Phase::PlanningComplete), StepId::Dispatch);
        assert_eq!(resume_target(Phase::Executing), StepId::Dispatch);
        assert_eq!(resume_target(Phase::WorkersProvisioned), StepId::PlanWork);
    }
}
