//! Seams to the external collaborators: capability analysis and task execution.
//!
//! The engine consumes only the structured shape of what these return.
//! [`StaticAnalyzer`] is a deterministic analyzer that serves a fixed
//! roster and plan, loaded from a JSON or TOML plan file.

use crate::scheduler::ExecutionContext;
use crate::state::WorkflowState;
use crate::types::{
    ApprovalPoint, ExecutionStep, Goal, Priority, Task, TaskResult, TaskType, ToolRequirement,
    WorkerDefinition, WorkerRequest,
};
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult, HumanInterrupt, InputSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// What the analyzer sees when asked for a proposal.
pub struct PlanningContext<'a> {
    pub goal: &'a Goal,
    pub roster: Vec<&'a WorkerDefinition>,
    pub collected_inputs: &'a BTreeMap<String, Value>,
}

impl<'a> PlanningContext<'a> {
    /// Context over the goal, roster and inputs of `state`.
    pub fn from_state(state: &'a WorkflowState) -> Self {
        Self {
            goal: &state.goal,
            roster: state.workers.values().collect(),
            collected_inputs: &state.collected_inputs,
        }
    }
}

/// One proposed expert worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerProposal {
    pub role_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub specialties: Vec<String>,
    /// Tool ids the worker needs.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub limitations: Vec<String>,
}

/// Answer to "which experts does this goal need?".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityProposal {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub workers: Vec<WorkerProposal>,
    /// Questions that must be answered before the roster can be settled.
    #[serde(default)]
    pub missing_information: Vec<String>,
}

/// One proposed task. Dependencies refer to task names in the same plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProposal {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: Priority,
    /// Role name or specialty of the worker that should take the task.
    #[serde(default)]
    pub assigned_role: Option<String>,
    #[serde(default)]
    pub required_inputs: Vec<InputSpec>,
    #[serde(default)]
    pub required_tools: Vec<ToolRequirement>,
    #[serde(default)]
    pub approval_points: Vec<ApprovalPoint>,
    #[serde(default)]
    pub execution_steps: Vec<ExecutionStep>,
    /// Names of tasks in the same plan that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// One proposed project and its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectProposal {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskProposal>,
}

/// Decomposition of the goal into projects and tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkPlan {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub projects: Vec<ProjectProposal>,
    /// Expertise no current worker covers; each becomes a worker request.
    #[serde(default)]
    pub missing_expertise: Vec<String>,
    /// Tool ids the plan as a whole depends on.
    #[serde(default)]
    pub required_tools: Vec<String>,
}

/// Produces structured proposals for the planning steps.
#[async_trait]
pub trait CapabilityAnalyzer: Send + Sync {
    /// Proposes the initial expert roster for the goal.
    async fn propose_workers(&self, ctx: &PlanningContext<'_>)
        -> ConductorResult<CapabilityProposal>;

    /// Designs one worker satisfying a queued request.
    async fn fulfil_request(
        &self,
        request: &WorkerRequest,
        ctx: &PlanningContext<'_>,
    ) -> ConductorResult<WorkerProposal>;

    /// Decomposes the goal into projects and tasks for the current roster.
    async fn plan_work(&self, ctx: &PlanningContext<'_>) -> ConductorResult<WorkPlan>;
}

/// Result of handing one task to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The task finished, failed or blocked; a blocked task carries the interrupt to raise.
    Finished {
        result: TaskResult,
        interrupt: Option<HumanInterrupt>,
    },
    /// The task is beyond the worker's declared capability.
    CapabilityExceeded {
        reason: String,
        hint: Option<String>,
        suggestion: Option<String>,
    },
}

/// Executes a task on behalf of a worker.
///
/// Implementations check missing inputs, then explicit approval, then tool
/// availability, and only then run the task. A capability overrun is
/// returned as [`ExecutionOutcome::CapabilityExceeded`], never as an error.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        worker: &WorkerDefinition,
        task: &Task,
        ctx: &ExecutionContext<'_>,
    ) -> ConductorResult<ExecutionOutcome>;
}

/// Serves a fixed roster and plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticAnalyzer {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub workers: Vec<WorkerProposal>,
    #[serde(default)]
    pub missing_information: Vec<String>,
    #[serde(default)]
    pub plan: WorkPlan,
}

impl StaticAnalyzer {
    /// An analyzer that proposes `workers` and then `plan`.
    pub fn new(workers: Vec<WorkerProposal>, plan: WorkPlan) -> Self {
        Self {
            analysis: String::new(),
            workers,
            missing_information: Vec::new(),
            plan,
        }
    }

    /// Questions returned with the roster proposal.
    pub fn with_missing_information(mut self, questions: Vec<String>) -> Self {
        self.missing_information = questions;
        self
    }

    /// Loads a plan file. `.toml` files are parsed as TOML, anything else as JSON.
    pub fn from_file(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        if is_toml {
            toml::from_str(&content).map_err(|e| {
                ConductorError::Config(format!("invalid plan file {}: {e}", path.display()))
            })
        } else {
            Ok(serde_json::from_str(&content)?)
        }
    }
}

#[async_trait]
impl CapabilityAnalyzer for StaticAnalyzer {
    async fn propose_workers(
        &self,
        _ctx: &PlanningContext<'_>,
    ) -> ConductorResult<CapabilityProposal> {
        Ok(CapabilityProposal {
            analysis: self.analysis.clone(),
            workers: self.workers.clone(),
            missing_information: self.missing_information.clone(),
        })
    }

    async fn fulfil_request(
        &self,
        request: &WorkerRequest,
        _ctx: &PlanningContext<'_>,
    ) -> ConductorResult<WorkerProposal> {
        if request.role_name.trim().is_empty() {
            return Err(ConductorError::Collaborator(format!(
                "worker request from {} names no role",
                request.requested_by
            )));
        }
        let specialties = if request.required_specialties.is_empty() {
            vec![request.role_name.clone()]
        } else {
            request.required_specialties.clone()
        };
        Ok(WorkerProposal {
            role_name: request.role_name.clone(),
            description: request.reason.clone(),
            specialties,
            tools: request.required_tools.clone(),
            limitations: Vec::new(),
        })
    }

    async fn plan_work(&self, _ctx: &PlanningContext<'_>) -> ConductorResult<WorkPlan> {
        Ok(self.plan.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    const PLAN_TOML: &str = r#"
analysis = "one marketer is enough"
missing_information = ["What is the monthly budget?"]

[[workers]]
role_name = "Marketer"
specialties = ["marketing", "campaign"]
tools = ["mailchimp"]

[plan]
required_tools = ["mailchimp"]

[[plan.projects]]
name = "Launch"

[[plan.projects.tasks]]
name = "Draft campaign"
type = "document"
assigned_role = "marketer"

[[plan.projects.tasks]]
name = "Send campaign"
dependencies = ["Draft campaign"]
required_tools = [{ tool_id = "mailchimp" }]
approval_points = [{ point = "before_send" }]
"#;

    #[test]
    fn test_load_toml_plan_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(PLAN_TOML.as_bytes()).unwrap();

        let analyzer = StaticAnalyzer::from_file(file.path()).unwrap();
        assert_eq!(analyzer.workers.len(), 1);
        assert_eq!(analyzer.missing_information.len(), 1);

        let project = &analyzer.plan.projects[0];
        assert_eq!(project.tasks[0].task_type, TaskType::Document);
        let send = &project.tasks[1];
        assert_eq!(send.dependencies, vec!["Draft campaign".to_string()]);
        assert!(send.required_tools[0].required);
        assert_eq!(send.approval_points[0].kind, crate::types::ApprovalKind::Explicit);
    }

    #[test]
    fn test_load_json_plan_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(br#"{"workers":[{"role_name":"Analyst"}]}"#).unwrap();
        let analyzer = StaticAnalyzer::from_file(file.path()).unwrap();
        assert_eq!(analyzer.workers[0].role_name, "Analyst");
        assert!(analyzer.plan.projects.is_empty());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(b"workers = 3").unwrap();
        let err = StaticAnalyzer::from_file(file.path()).unwrap_err();
        assert_eq!(err.reason(), "config");
    }

    #[tokio::test]
    async fn test_fulfil_request_uses_requested_capability() {
        let analyzer = StaticAnalyzer::default();
        let state = WorkflowState::new(Goal::new("g"));
        let ctx = PlanningContext::from_state(&state);
        let request = WorkerRequest {
            requested_by: "work-planner".into(),
            role_name: "legal".into(),
            reason: "contracts need review".into(),
            required_specialties: vec![],
            required_tools: vec!["docusign".into()],
            context: None,
        };
        let proposal = analyzer.fulfil_request(&request, &ctx).await.unwrap();
        assert_eq!(proposal.specialties, vec!["legal".to_string()]);
        assert_eq!(proposal.tools, vec!["docusign".to_string()]);

        let unnamed = WorkerRequest {
            role_name: " ".into(),
            ..request
        };
        let err = analyzer.fulfil_request(&unnamed, &ctx).await.unwrap_err();
        assert_eq!(err.reason(), "collaborator");
    }
}
