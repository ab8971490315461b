//! Human-in-the-loop interrupt types.
//!
//! These records live in `conductor-core` so that the orchestrator (which
//! raises and reconciles interrupts) and the CLI (which presents them and
//! collects answers) share one representation without circular deps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Options offered on every approval request.
pub const APPROVAL_OPTIONS: [&str; 3] = ["approve", "reject", "request-changes"];

/// Prefix of the input key a human fills in to confirm a tool connection.
pub const TOOL_INPUT_PREFIX: &str = "tool_";

/// What kind of human decision an interrupt asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    /// Missing information the workflow cannot proceed without.
    InfoRequest,
    /// An explicit go/no-go decision before a task runs.
    ApprovalRequest,
    /// One or more tools must be connected.
    ToolConnection,
    /// Something went wrong that a human should look at.
    ErrorReport,
    /// Informational checkpoint; answering it only acknowledges it.
    ProgressReport,
}

impl std::fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterruptKind::InfoRequest => write!(f, "info_request"),
            InterruptKind::ApprovalRequest => write!(f, "approval_request"),
            InterruptKind::ToolConnection => write!(f, "tool_connection"),
            InterruptKind::ErrorReport => write!(f, "error_report"),
            InterruptKind::ProgressReport => write!(f, "progress_report"),
        }
    }
}

fn default_input_type() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

/// Declaration of one input a human is asked to supply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub key: String,
    pub label: String,
    #[serde(rename = "type", default = "default_input_type")]
    pub input_type: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub example: Option<String>,
}

impl InputSpec {
    /// A required text input.
    pub fn required(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            input_type: default_input_type(),
            required: true,
            description: None,
            example: None,
        }
    }

    /// An optional text input.
    pub fn optional(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(key, label)
        }
    }

    /// Sets the expected value type.
    pub fn with_type(mut self, input_type: impl Into<String>) -> Self {
        self.input_type = input_type.into();
        self
    }

    /// Sets the help text shown with the field.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets an example value.
    pub fn with_example(mut self, example: impl Into<String>) -> Self {
        self.example = Some(example.into());
        self
    }
}

/// A structured request for human input that suspends a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanInterrupt {
    /// Generated identity. `created_at` is metadata only.
    pub id: Uuid,
    pub kind: InterruptKind,
    /// Worker (or coordinator) that raised the interrupt.
    pub from_worker: String,
    pub message: String,
    #[serde(default)]
    pub required_inputs: Vec<InputSpec>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HumanInterrupt {
    /// Creates an interrupt with a fresh id and no inputs.
    pub fn new(kind: InterruptKind, from_worker: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            from_worker: from_worker.into(),
            message: message.into(),
            required_inputs: Vec::new(),
            options: Vec::new(),
            context: BTreeMap::new(),
            task_id: None,
            project_id: None,
            created_at: Utc::now(),
        }
    }

    /// Asks the human for the given inputs.
    pub fn info_request(
        from_worker: impl Into<String>,
        message: impl Into<String>,
        inputs: Vec<InputSpec>,
    ) -> Self {
        Self::new(InterruptKind::InfoRequest, from_worker, message).with_inputs(inputs)
    }

    /// Asks for an explicit approve/reject decision.
    pub fn approval_request(from_worker: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(InterruptKind::ApprovalRequest, from_worker, message)
            .with_options(APPROVAL_OPTIONS.iter().map(|o| (*o).to_string()).collect())
    }

    /// Asks the human to connect each tool; one required `tool_<id>` input per tool.
    pub fn tool_connection(
        from_worker: impl Into<String>,
        message: impl Into<String>,
        tool_ids: &[String],
    ) -> Self {
        let inputs = tool_ids
            .iter()
            .map(|tool| {
                InputSpec::required(format!("{TOOL_INPUT_PREFIX}{tool}"), format!("Connect {tool}"))
                    .with_type("connection")
                    .with_description(format!("Connect the {tool} service"))
            })
            .collect();
        Self::new(InterruptKind::ToolConnection, from_worker, message).with_inputs(inputs)
    }

    /// Reports a failure the workflow cannot resolve on its own.
    pub fn error_report(from_worker: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(InterruptKind::ErrorReport, from_worker, message)
    }

    /// Informational report; resolving it only acknowledges the message.
    pub fn progress_report(from_worker: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(InterruptKind::ProgressReport, from_worker, message)
    }

    /// Declares the inputs the human must provide.
    pub fn with_inputs(mut self, inputs: Vec<InputSpec>) -> Self {
        self.required_inputs = inputs;
        self
    }

    /// Replaces the offered choices.
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    /// Attaches a context entry shown with the interrupt.
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Ties the interrupt to a task, which stays blocked while it is open.
    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Ties the interrupt to a project.
    pub fn for_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Keys of the inputs declared as required, in declaration order.
    pub fn required_keys(&self) -> impl Iterator<Item = &str> {
        self.required_inputs
            .iter()
            .filter(|i| i.required)
            .map(|i| i.key.as_str())
    }

    /// Required keys absent from `supplied`.
    pub fn missing_inputs(&self, supplied: &BTreeMap<String, Value>) -> Vec<String> {
        self.required_keys()
            .filter(|key| !supplied.contains_key(*key))
            .map(str::to_string)
            .collect()
    }

    /// Tool ids this interrupt asks to connect, recovered from its input keys.
    pub fn requested_tools(&self) -> Vec<String> {
        if self.kind != InterruptKind::ToolConnection {
            return Vec::new();
        }
        self.required_inputs
            .iter()
            .filter_map(|i| i.key.strip_prefix(TOOL_INPUT_PREFIX))
            .map(str::to_string)
            .collect()
    }

    /// Presentation view of this interrupt for an external UI.
    pub fn display(&self) -> InterruptView {
        InterruptView {
            id: self.id,
            kind: self.kind.to_string(),
            from: self.from_worker.clone(),
            message: self.message.clone(),
            inputs_needed: self
                .required_inputs
                .iter()
                .map(|i| InputPrompt {
                    key: i.key.clone(),
                    label: i.label.clone(),
                    input_type: i.input_type.clone(),
                    required: i.required,
                    hint: i.description.clone().or_else(|| i.example.clone()),
                })
                .collect(),
            options: self.options.clone(),
            context: self.context.clone(),
            task_id: self.task_id.clone(),
            project_id: self.project_id.clone(),
        }
    }
}

/// One input line of an [`InterruptView`].
#[derive(Debug, Clone, Serialize)]
pub struct InputPrompt {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub input_type: String,
    pub required: bool,
    pub hint: Option<String>,
}

/// Flattened, display-oriented form of a [`HumanInterrupt`].
#[derive(Debug, Clone, Serialize)]
pub struct InterruptView {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub from: String,
    pub message: String,
    pub inputs_needed: Vec<InputPrompt>,
    pub options: Vec<String>,
    pub context: BTreeMap<String, Value>,
    pub task_id: Option<String>,
    pub project_id: Option<String>,
}

/// A human's answer to a [`HumanInterrupt`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanResponse {
    pub interrupt_id: Uuid,
    /// Set for approval requests. `None` means the response is not a decision.
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub message: Option<String>,
    /// Task of the resolved interrupt, filled in when the response is accepted.
    #[serde(default)]
    pub task_id: Option<String>,
    pub responded_at: DateTime<Utc>,
}

impl HumanResponse {
    /// An empty response to `interrupt_id`.
    pub fn new(interrupt_id: Uuid) -> Self {
        Self {
            interrupt_id,
            approved: None,
            inputs: BTreeMap::new(),
            message: None,
            task_id: None,
            responded_at: Utc::now(),
        }
    }

    /// An approving decision.
    pub fn approve(interrupt_id: Uuid) -> Self {
        Self {
            approved: Some(true),
            ..Self::new(interrupt_id)
        }
    }

    /// A rejecting decision.
    pub fn reject(interrupt_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            approved: Some(false),
            message: Some(message.into()),
            ..Self::new(interrupt_id)
        }
    }

    /// Adds one input value.
    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    /// Merges `inputs` into the response, replacing existing keys.
    pub fn with_inputs(mut self, inputs: BTreeMap<String, Value>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    /// Whether this response approves the task it references.
    pub fn approves(&self, task_id: &str) -> bool {
        self.approved == Some(true) && self.task_id.as_deref() == Some(task_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interrupt_ids_are_unique() {
        let a = HumanInterrupt::progress_report("w", "one");
        let b = HumanInterrupt::progress_report("w", "two");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_missing_inputs_only_counts_required() {
        let interrupt = HumanInterrupt::info_request(
            "capability-manager",
            "need details",
            vec![
                InputSpec::required("budget", "Budget"),
                InputSpec::optional("notes", "Notes"),
                InputSpec::required("region", "Region"),
            ],
        );
        let mut supplied = BTreeMap::new();
        supplied.insert("region".to_string(), json!("eu"));
        assert_eq!(interrupt.missing_inputs(&supplied), vec!["budget".to_string()]);
    }

    #[test]
    fn test_tool_connection_keys() {
        let interrupt =
            HumanInterrupt::tool_connection("w", "connect", &["slack".into(), "github".into()]);
        let keys: Vec<&str> = interrupt.required_keys().collect();
        assert_eq!(keys, vec!["tool_slack", "tool_github"]);
        assert_eq!(interrupt.requested_tools(), vec!["slack", "github"]);
    }

    #[test]
    fn test_approval_request_has_options() {
        let interrupt = HumanInterrupt::approval_request("w", "ok?").for_task("task-1");
        assert_eq!(interrupt.options.len(), 3);
        assert_eq!(interrupt.task_id.as_deref(), Some("task-1"));
    }

    #[test]
    fn test_input_spec_deserializes_with_defaults() {
        let spec: InputSpec = serde_json::from_value(json!({"key": "k", "label": "K"})).unwrap();
        assert!(spec.required);
        assert_eq!(spec.input_type, "text");
    }

    #[test]
    fn test_display_view() {
        let interrupt = HumanInterrupt::info_request(
            "w",
            "msg",
            vec![InputSpec::required("k", "K").with_example("42")],
        )
        .with_context("reason", json!("because"));
        let view = interrupt.display();
        assert_eq!(view.kind, "info_request");
        assert_eq!(view.inputs_needed[0].hint.as_deref(), Some("42"));
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["type"], "info_request");
    }

    #[test]
    fn test_approves_requires_matching_task() {
        let id = Uuid::new_v4();
        let mut response = HumanResponse::approve(id);
        assert!(!response.approves("task-1"));
        response.task_id = Some("task-1".into());
        assert!(response.approves("task-1"));
        assert!(!response.approves("task-2"));
        assert!(!HumanResponse::reject(id, "no").approves("task-1"));
    }
}
