use chrono::{DateTime, Utc};
use conductor_core::InputSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Generates a short prefixed id such as `task-1a2b3c4d`.
pub fn short_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &hex[..8])
}

/// The top-level request a workflow thread pursues. Immutable once the thread starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub text: String,
    #[serde(default)]
    pub kpis: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub budget: Option<String>,
    #[serde(default)]
    pub timeline: Option<String>,
}

impl Goal {
    /// A goal with only its text set.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Sets the success measures.
    pub fn with_kpis(mut self, kpis: Vec<String>) -> Self {
        self.kpis = kpis;
        self
    }

    /// Sets the constraints the plan must respect.
    pub fn with_constraints(mut self, constraints: Vec<String>) -> Self {
        self.constraints = constraints;
        self
    }

    /// Sets the budget the plan must fit.
    pub fn with_budget(mut self, budget: impl Into<String>) -> Self {
        self.budget = Some(budget.into());
        self
    }

    /// Sets the deadline or time frame.
    pub fn with_timeline(mut self, timeline: impl Into<String>) -> Self {
        self.timeline = Some(timeline.into());
        self
    }

    /// Attaches free-form background.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Whether a worker is one of the reserved coordinators or a provisioned expert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Coordinator,
    Expert,
}

/// Lifecycle of a worker on the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Busy,
    Inactive,
}

/// A capability unit that tasks are assigned to. Never deleted once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDefinition {
    pub id: String,
    pub kind: WorkerKind,
    pub role_name: String,
    pub description: String,
    #[serde(default)]
    pub specialties: Vec<String>,
    /// Tool ids this worker is able to operate.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub limitations: Vec<String>,
    pub status: WorkerStatus,
    #[serde(default)]
    pub assigned_tasks: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl WorkerDefinition {
    /// Whether the worker is the built-in coordinator.
    pub fn is_coordinator(&self) -> bool {
        self.kind == WorkerKind::Coordinator
    }

    /// Lowercased specialty match against free text.
    pub fn matches_text(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.specialties
            .iter()
            .any(|s| !s.is_empty() && text.contains(&s.to_lowercase()))
    }
}

/// A queued "please create a worker with these capabilities" request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub requested_by: String,
    pub role_name: String,
    pub reason: String,
    #[serde(default)]
    pub required_specialties: Vec<String>,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub context: Option<String>,
}

/// Task and project priority. Ordered from lowest to highest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Status of a project. Advances monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
}

impl ProjectStatus {
    /// Whether moving from `self` to `next` respects
    /// pending → in_progress → completed, or → blocked/cancelled.
    pub fn can_advance_to(self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Completed)
                | (InProgress, Completed)
                | (Pending | InProgress, Blocked | Cancelled)
        )
    }

    /// Whether the project can no longer change status.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ProjectStatus::Completed | ProjectStatus::Blocked | ProjectStatus::Cancelled
        )
    }
}

/// A group of tasks delivering one outcome of the goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub deliverables: Vec<String>,
    /// Task ids in plan order.
    pub task_ids: Vec<String>,
    pub status: ProjectStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Kind of work a task performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Changes an external system.
    #[default]
    Action,
    Document,
    Research,
    /// A decision the human has to make.
    Approval,
}

/// Status of a task.
///
/// `Pending → InputRequired → Pending → ApprovalWait → Pending → AwaitingTool
/// → Pending → Executing → {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InputRequired,
    ApprovalWait,
    AwaitingTool,
    Executing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether the task can no longer be scheduled.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Waiting on a human (inputs, approval or a tool connection).
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            TaskStatus::InputRequired | TaskStatus::ApprovalWait | TaskStatus::AwaitingTool
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InputRequired => "input_required",
            TaskStatus::ApprovalWait => "approval_wait",
            TaskStatus::AwaitingTool => "awaiting_tool",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Connection status of a tool, as reported by the tool-management side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Available,
    Connected,
    NotConnected,
    Error,
    Disabled,
}

impl ToolStatus {
    /// Only `Connected` satisfies a task's tool requirement.
    pub fn is_connected(self) -> bool {
        self == ToolStatus::Connected
    }
}

impl std::str::FromStr for ToolStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "available" => Ok(ToolStatus::Available),
            "connected" => Ok(ToolStatus::Connected),
            "not_connected" => Ok(ToolStatus::NotConnected),
            "error" => Ok(ToolStatus::Error),
            "disabled" => Ok(ToolStatus::Disabled),
            other => Err(format!("unknown tool status '{other}'")),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A tool a task uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequirement {
    pub tool_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub fallback: Option<String>,
}

impl ToolRequirement {
    /// A tool the task cannot run without.
    pub fn required(tool_id: impl Into<String>) -> Self {
        let tool_id = tool_id.into();
        Self {
            name: tool_id.clone(),
            tool_id,
            required: true,
            fallback: None,
        }
    }
}

/// How an approval point is granted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalKind {
    /// Execution waits for an approving response.
    #[default]
    Explicit,
    /// The human is told, nothing waits.
    Notification,
}

/// A point during a task where a human must sign off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalPoint {
    pub point: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "approval_type", default)]
    pub kind: ApprovalKind,
}

/// One step of a task's checklist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step: u32,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub approval_point: Option<String>,
}

/// A unit of work inside a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(default)]
    pub required_inputs: Vec<InputSpec>,
    #[serde(default)]
    pub tools: Vec<ToolRequirement>,
    #[serde(default)]
    pub approval_points: Vec<ApprovalPoint>,
    #[serde(default)]
    pub execution_steps: Vec<ExecutionStep>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Position in plan order, used wherever tasks are visited "in creation order".
    #[serde(default)]
    pub seq: usize,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// A pending, unassigned task in `project_id`.
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            name: name.into(),
            description: description.into(),
            task_type: TaskType::default(),
            priority: Priority::default(),
            status: TaskStatus::Pending,
            required_inputs: Vec::new(),
            tools: Vec::new(),
            approval_points: Vec::new(),
            execution_steps: Vec::new(),
            assigned_to: None,
            dependencies: Vec::new(),
            seq: 0,
            created_at: Utc::now(),
        }
    }

    /// Sets the ids of tasks that must complete first.
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Declares inputs the task needs before it can run.
    pub fn with_inputs(mut self, inputs: Vec<InputSpec>) -> Self {
        self.required_inputs = inputs;
        self
    }

    /// Declares the tools the task uses.
    pub fn with_tools(mut self, tools: Vec<ToolRequirement>) -> Self {
        self.tools = tools;
        self
    }

    /// Adds an explicit approval point.
    pub fn with_approval(mut self, point: impl Into<String>) -> Self {
        self.approval_points.push(ApprovalPoint {
            point: point.into(),
            description: String::new(),
            kind: ApprovalKind::Explicit,
        });
        self
    }

    /// Sets the checklist steps.
    pub fn with_steps(mut self, steps: Vec<ExecutionStep>) -> Self {
        self.execution_steps = steps;
        self
    }

    /// Assigns the task to `worker_id`.
    pub fn assigned(mut self, worker_id: impl Into<String>) -> Self {
        self.assigned_to = Some(worker_id.into());
        self
    }

    /// Sets the plan-order position used to break ties.
    pub fn with_seq(mut self, seq: usize) -> Self {
        self.seq = seq;
        self
    }

    /// Name and description, lowercased, for specialty matching.
    pub fn search_text(&self) -> String {
        format!("{} {}", self.name, self.description).to_lowercase()
    }

    /// Required inputs whose key has not been collected yet.
    pub fn missing_inputs(&self, collected: &BTreeMap<String, Value>) -> Vec<&InputSpec> {
        self.required_inputs
            .iter()
            .filter(|i| i.required && !collected.contains_key(&i.key))
            .collect()
    }

    /// Whether any approval point requires an explicit decision.
    pub fn requires_approval(&self) -> bool {
        self.approval_points
            .iter()
            .any(|ap| ap.kind == ApprovalKind::Explicit)
    }

    /// Required tools that are absent or not in the connected state.
    pub fn missing_tools(&self, connected: &BTreeMap<String, ToolStatus>) -> Vec<String> {
        self.tools
            .iter()
            .filter(|t| t.required)
            .filter(|t| !connected.get(&t.tool_id).is_some_and(|s| s.is_connected()))
            .map(|t| t.tool_id.clone())
            .collect()
    }

    /// Ids of every tool the task references, required or not.
    pub fn tool_ids(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.tool_id.as_str())
    }
}

/// Outcome of one execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// The attempt stopped to ask a human for something.
    #[serde(default)]
    pub interrupt: bool,
    /// What was asked for, when `interrupt` is set.
    #[serde(default)]
    pub request: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

impl TaskResult {
    /// A successful attempt with `output`.
    pub fn completed(task_id: impl Into<String>, output: Value) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Completed,
            output: Some(output),
            error: None,
            interrupt: false,
            request: None,
            recorded_at: Utc::now(),
        }
    }

    /// A failed attempt.
    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            output: None,
            error: Some(error.into()),
            interrupt: false,
            request: None,
            recorded_at: Utc::now(),
        }
    }

    /// A result for an attempt that stopped in a blocked status.
    pub fn blocked(task_id: impl Into<String>, status: TaskStatus, request: Value) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            output: None,
            error: None,
            interrupt: true,
            request: Some(request),
            recorded_at: Utc::now(),
        }
    }

    /// Replaces the output.
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Why a worker escalated a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    ExpertiseExceeded,
    UnclearRequirements,
    DependencyIssue,
    TechnicalLimitation,
}

/// Raised by a worker when a task is beyond its declared capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub task_id: String,
    pub from_worker: String,
    pub reason: String,
    pub kind: EscalationKind,
    /// The capability that would be needed.
    #[serde(default)]
    pub required_capability: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Summary written when a workflow thread finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub total_projects: usize,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub workers_used: usize,
    /// Task id → output payload, for tasks that produced one.
    pub outputs: BTreeMap<String, Value>,
}
