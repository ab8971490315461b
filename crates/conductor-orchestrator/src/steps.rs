//! The step catalogue.
//!
//! Every step reads the shared state and returns a [`StateUpdate`]; none
//! mutates the state it is given. Collections in an update are complete
//! replacements, so each step clones what it changes.

use crate::collaborators::{
    CapabilityAnalyzer, ExecutionOutcome, PlanningContext, TaskExecutor, WorkPlan,
};
use crate::ledger::InterruptLedger;
use crate::profiles::{coordinators, expert, CAPABILITY_MANAGER, WORK_PLANNER};
use crate::registry::WorkerRegistry;
use crate::routing::StepId;
use crate::scheduler::{ExecutionContext, Scheduler, TaskGraph};
use crate::state::{Phase, StateUpdate, WorkflowState};
use crate::types::{
    short_id, EscalationKind, EscalationRequest, Project, ProjectStatus, Task, TaskResult,
    TaskStatus, ToolStatus, WorkerRequest,
};
use chrono::Utc;
use conductor_core::{
    ConductorError, ConductorResult, HumanInterrupt, InputSpec, TOOL_INPUT_PREFIX,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Interrupt origin for problems found while dispatching.
const DISPATCHER: &str = "dispatcher";

/// Owns the collaborators and the worker registry the steps call into.
pub struct Steps {
    analyzer: Arc<dyn CapabilityAnalyzer>,
    executor: Arc<dyn TaskExecutor>,
    registry: Arc<WorkerRegistry>,
}

impl Steps {
    /// Creates the steps with an empty worker registry.
    pub fn new(analyzer: Arc<dyn CapabilityAnalyzer>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            analyzer,
            executor,
            registry: Arc::new(WorkerRegistry::new()),
        }
    }

    /// The registry holding a handle per rostered worker.
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Runs one step against `state`.
    pub async fn run(&self, step: StepId, state: &WorkflowState) -> ConductorResult<StateUpdate> {
        match step {
            StepId::Initialize => Ok(initialize(state)),
            StepId::PlanCapabilities => self.plan_capabilities(state).await,
            StepId::PlanWork => self.plan_work(state).await,
            StepId::Dispatch => self.dispatch(state).await,
            StepId::AwaitHuman => Ok(await_human(state)),
            StepId::Finalize => Ok(finalize(state)),
        }
    }

    /// Provisions experts: one per queued worker request, plus an initial
    /// roster when no expert exists yet.
    async fn plan_capabilities(&self, state: &WorkflowState) -> ConductorResult<StateUpdate> {
        let ctx = PlanningContext::from_state(state);
        let mut update = StateUpdate::default();
        let mut workers = state.workers.clone();

        if !state.worker_requests.is_empty() {
            for request in &state.worker_requests {
                let proposal = self.analyzer.fulfil_request(request, &ctx).await?;
                let worker = expert(&proposal, CAPABILITY_MANAGER);
                info!(
                    worker_id = %worker.id,
                    role = %worker.role_name,
                    requested_by = %request.requested_by,
                    "Worker provisioned on request"
                );
                workers.insert(worker.id.clone(), worker);
            }
            update.worker_requests = Some(Vec::new());
        }

        if !state.has_experts() {
            let proposal = self.analyzer.propose_workers(&ctx).await?;
            let unanswered: Vec<InputSpec> = proposal
                .missing_information
                .iter()
                .enumerate()
                .map(|(i, question)| {
                    InputSpec::required(format!("capability_info_{i}"), question.clone())
                        .with_type("string")
                        .with_description(question.clone())
                })
                .filter(|spec| !state.collected_inputs.contains_key(&spec.key))
                .collect();

            if !unanswered.is_empty() {
                let questions: Vec<InputSpec> = unanswered
                    .into_iter()
                    .filter(|spec| !already_asked(state, &spec.key))
                    .collect();
                if !questions.is_empty() {
                    info!(questions = questions.len(), "Capability analysis needs more information");
                    let mut ledger = InterruptLedger::from_state(state);
                    ledger.create(
                        HumanInterrupt::info_request(
                            CAPABILITY_MANAGER,
                            "More information is needed to assemble the team",
                            questions,
                        )
                        .with_context("analysis", Value::String(proposal.analysis)),
                    );
                    update.pending_interrupts = Some(ledger.into_parts().0);
                }
                update.workers = Some(workers);
                update.phase = Some(Phase::CapabilityAnalysis);
                return Ok(update);
            }

            for p in &proposal.workers {
                let worker = expert(p, CAPABILITY_MANAGER);
                info!(worker_id = %worker.id, role = %worker.role_name, "Worker provisioned");
                workers.insert(worker.id.clone(), worker);
            }
        }

        let provisioned = workers.values().any(|w| !w.is_coordinator());
        if !provisioned {
            return Ok(StateUpdate::failure(
                "capability analysis proposed no workers for the goal",
            ));
        }
        update.workers = Some(workers);
        update.phase = Some(Phase::WorkersProvisioned);
        Ok(update)
    }

    /// First pass decomposes the goal into projects and tasks; later passes
    /// manage execution.
    async fn plan_work(&self, state: &WorkflowState) -> ConductorResult<StateUpdate> {
        if !state.has_experts() {
            return Ok(StateUpdate::default());
        }
        if !state.projects.is_empty() {
            return Ok(manage_execution(state));
        }

        let plan = self
            .analyzer
            .plan_work(&PlanningContext::from_state(state))
            .await?;
        if plan.projects.iter().all(|p| p.tasks.is_empty()) {
            return Ok(StateUpdate::failure("work plan contains no tasks"));
        }
        debug!(analysis = %plan.analysis, projects = plan.projects.len(), "Work plan received");
        Ok(materialise_plan(state, plan))
    }

    /// Executes the head of the runnable queue.
    async fn dispatch(&self, state: &WorkflowState) -> ConductorResult<StateUpdate> {
        let Some(task_id) = state.pending_tasks.first() else {
            return Ok(StateUpdate::default());
        };
        let Some(task) = state.tasks.get(task_id) else {
            warn!(task_id = %task_id, "Queued task no longer exists");
            return Ok(StateUpdate {
                pending_tasks: Some(state.pending_tasks[1..].to_vec()),
                ..StateUpdate::default()
            });
        };
        let mut task = task.clone();

        let selected = task
            .assigned_to
            .clone()
            .or_else(|| Scheduler::select_worker(&task, &state.workers));
        let Some(worker_id) = selected else {
            warn!(task_id = %task.id, "No worker can take the task");
            let mut ledger = InterruptLedger::from_state(state);
            ledger.create(
                HumanInterrupt::error_report(
                    DISPATCHER,
                    format!("No suitable worker for task '{}'", task.name),
                )
                .with_context("task_name", Value::String(task.name.clone()))
                .for_task(task.id.clone())
                .for_project(task.project_id.clone()),
            );
            return Ok(StateUpdate {
                pending_interrupts: Some(ledger.into_parts().0),
                ..StateUpdate::default()
            });
        };
        let Some(worker) = state.workers.get(&worker_id) else {
            return Err(ConductorError::Step(format!(
                "task {} is assigned to unknown worker {worker_id}",
                task.id
            )));
        };

        let handle = self.registry.get_or_create(worker).await;
        task.assigned_to = Some(worker_id.clone());
        task.status = TaskStatus::Executing;
        info!(task_id = %task.id, worker_id = %worker_id, "Dispatching task");

        let ctx = ExecutionContext::from_state(state);
        let outcome = self.executor.execute(worker, &task, &ctx).await?;
        handle.record(&outcome);

        let mut update = StateUpdate::default();
        let (result, interrupt) = match outcome {
            ExecutionOutcome::Finished { result, interrupt } => (result, interrupt),
            ExecutionOutcome::CapabilityExceeded {
                reason,
                hint,
                suggestion,
            } => {
                warn!(task_id = %task.id, worker_id = %worker_id, reason = %reason, "Task exceeds worker capability");
                let err = ConductorError::CapabilityExceeded {
                    reason: reason.clone(),
                    hint: hint.clone(),
                };
                let escalation = EscalationRequest {
                    task_id: task.id.clone(),
                    from_worker: worker_id.clone(),
                    reason,
                    kind: EscalationKind::ExpertiseExceeded,
                    required_capability: hint,
                    suggestion,
                    created_at: Utc::now(),
                };
                let payload = json!({ "escalation": serde_json::to_value(&escalation)? });
                let mut escalations = state.escalations.clone();
                escalations.push(escalation);
                update.escalations = Some(escalations);
                (
                    TaskResult::failed(task.id.clone(), err.to_string()).with_output(payload),
                    None,
                )
            }
        };

        info!(task_id = %task.id, status = %result.status, "Task attempt recorded");
        task.status = result.status;
        let project_id = task.project_id.clone();
        let task_id = task.id.clone();

        let mut tasks = state.tasks.clone();
        tasks.insert(task_id.clone(), task);
        let mut results = state.task_results.clone();
        results.insert(task_id.clone(), result);

        let mut workers = state.workers.clone();
        if let Some(w) = workers.get_mut(&worker_id) {
            if !w.assigned_tasks.contains(&task_id) {
                w.assigned_tasks.push(task_id.clone());
            }
        }

        if let Some(project) = state.projects.get(&project_id) {
            if project.status.can_advance_to(ProjectStatus::InProgress) {
                let mut projects = state.projects.clone();
                let mut started = project.clone();
                started.status = ProjectStatus::InProgress;
                projects.insert(project_id, started);
                update.projects = Some(projects);
            }
        }

        if let Some(interrupt) = interrupt {
            let mut ledger = InterruptLedger::from_state(state);
            ledger.create(interrupt);
            update.pending_interrupts = Some(ledger.into_parts().0);
        }

        update.pending_tasks = Some(
            state
                .pending_tasks
                .iter()
                .filter(|id| **id != task_id)
                .cloned()
                .collect(),
        );
        update.executing_tasks = Some(
            state
                .executing_tasks
                .iter()
                .filter(|id| **id != task_id)
                .cloned()
                .collect(),
        );
        update.tasks = Some(tasks);
        update.task_results = Some(results);
        update.workers = Some(workers);
        update.phase = Some(Phase::Executing);
        Ok(update)
    }
}

/// Whether an open interrupt already asks for `key`.
fn already_asked(state: &WorkflowState, key: &str) -> bool {
    state
        .pending_interrupts
        .iter()
        .any(|i| i.required_keys().any(|k| k == key))
}

fn initialize(state: &WorkflowState) -> StateUpdate {
    if state.goal.text.trim().is_empty() {
        return StateUpdate::failure("no goal provided");
    }
    let mut workers = state.workers.clone();
    for worker in coordinators() {
        workers.entry(worker.id.clone()).or_insert(worker);
    }
    StateUpdate {
        workers: Some(workers),
        phase: Some(Phase::CapabilityAnalysis),
        ..StateUpdate::default()
    }
}

/// Turns a work plan into projects and tasks, validates the task graph and
/// promotes what can run.
fn materialise_plan(state: &WorkflowState, plan: WorkPlan) -> StateUpdate {
    let mut update = StateUpdate::default();
    let mut ledger = InterruptLedger::from_state(state);

    if !plan.missing_expertise.is_empty() {
        let mut requests = state.worker_requests.clone();
        for expertise in &plan.missing_expertise {
            info!(expertise = %expertise, "Plan requests a new worker");
            requests.push(WorkerRequest {
                requested_by: WORK_PLANNER.to_string(),
                role_name: expertise.clone(),
                reason: format!("the plan needs {expertise} expertise"),
                required_specialties: vec![expertise.clone()],
                required_tools: Vec::new(),
                context: None,
            });
        }
        update.worker_requests = Some(requests);
    }

    let mut missing_tools: Vec<String> = Vec::new();
    for tool in &plan.required_tools {
        let connected = state
            .connected_tools
            .get(tool)
            .is_some_and(|s| s.is_connected());
        if !connected && !missing_tools.contains(tool) {
            missing_tools.push(tool.clone());
        }
    }
    if !missing_tools.is_empty() {
        ledger.create(
            HumanInterrupt::tool_connection(
                WORK_PLANNER,
                "The plan needs these tools connected",
                &missing_tools,
            )
            .with_context("required_tools", json!(missing_tools)),
        );
    }

    // Ids are allocated up front so dependencies can name tasks declared later.
    let mut ids_by_name: HashMap<&str, String> = HashMap::new();
    let allocated: Vec<(String, Vec<String>)> = plan
        .projects
        .iter()
        .map(|project| {
            let task_ids = project
                .tasks
                .iter()
                .map(|t| {
                    let id = short_id("task");
                    ids_by_name.entry(t.name.as_str()).or_insert_with(|| id.clone());
                    id
                })
                .collect();
            (short_id("proj"), task_ids)
        })
        .collect();

    let mut projects = state.projects.clone();
    let mut tasks = state.tasks.clone();
    let mut seq = state.tasks.len();
    for (proposal, (project_id, task_ids)) in plan.projects.iter().zip(&allocated) {
        for (tp, task_id) in proposal.tasks.iter().zip(task_ids) {
            let dependencies = tp
                .dependencies
                .iter()
                .map(|name| {
                    ids_by_name
                        .get(name.as_str())
                        .cloned()
                        .unwrap_or_else(|| name.clone())
                })
                .collect();
            let assigned_to = tp
                .assigned_role
                .as_deref()
                .and_then(|role| Scheduler::find_worker_for_role(role, &state.workers));
            let task = Task {
                id: task_id.clone(),
                project_id: project_id.clone(),
                name: tp.name.clone(),
                description: tp.description.clone(),
                task_type: tp.task_type,
                priority: tp.priority,
                status: TaskStatus::Pending,
                required_inputs: tp.required_inputs.clone(),
                tools: tp.required_tools.clone(),
                approval_points: tp.approval_points.clone(),
                execution_steps: tp.execution_steps.clone(),
                assigned_to,
                dependencies,
                seq,
                created_at: Utc::now(),
            };
            seq += 1;
            tasks.insert(task_id.clone(), task);
        }
        projects.insert(
            project_id.clone(),
            Project {
                id: project_id.clone(),
                name: proposal.name.clone(),
                description: proposal.description.clone(),
                priority: proposal.priority,
                deliverables: proposal.deliverables.clone(),
                task_ids: task_ids.clone(),
                status: ProjectStatus::Pending,
                created_by: WORK_PLANNER.to_string(),
                created_at: Utc::now(),
            },
        );
        info!(project_id = %project_id, tasks = task_ids.len(), "Project planned");
    }

    let mut results = state.task_results.clone();
    let doomed = Scheduler::validate_graph(&tasks);
    if !doomed.is_empty() {
        let cause = if TaskGraph::new(&tasks).has_cycle() {
            "dependency cycle"
        } else {
            "unknown dependency"
        };
        let err = ConductorError::SchedulingDeadlock(format!(
            "{} task(s) can never run ({cause})",
            doomed.len()
        ));
        warn!(tasks = ?doomed, cause, "Unsatisfiable task graph");
        let names: Vec<String> = doomed
            .iter()
            .filter_map(|id| tasks.get(id).map(|t| t.name.clone()))
            .collect();
        for id in &doomed {
            if let Some(task) = tasks.get_mut(id) {
                task.status = TaskStatus::Failed;
                results.insert(id.clone(), TaskResult::failed(id.clone(), err.to_string()));
            }
        }
        ledger.create(
            HumanInterrupt::error_report(WORK_PLANNER, err.to_string())
                .with_context("reason", Value::String(err.reason().to_string()))
                .with_context("tasks", json!(doomed))
                .with_context("task_names", json!(names)),
        );
    }

    let pending = Scheduler::promote(
        &tasks,
        &results,
        &state.pending_tasks,
        &state.executing_tasks,
        ledger.pending(),
    );

    if ledger.pending().len() != state.pending_interrupts.len() {
        update.pending_interrupts = Some(ledger.into_parts().0);
    }
    update.projects = Some(projects);
    update.tasks = Some(tasks);
    update.task_results = Some(results);
    update.pending_tasks = Some(pending);
    update.phase = Some(Phase::PlanningComplete);
    update
}

/// Later passes of `plan-work`: turn escalations into worker requests, fail
/// dependents of failed tasks, promote, advance projects, detect completion.
fn manage_execution(state: &WorkflowState) -> StateUpdate {
    let mut update = StateUpdate::default();
    let mut requests = state.worker_requests.clone();

    if !state.escalations.is_empty() {
        for escalation in &state.escalations {
            match escalation.kind {
                EscalationKind::ExpertiseExceeded => {
                    let role = escalation
                        .required_capability
                        .clone()
                        .unwrap_or_else(|| "specialist".to_string());
                    info!(task_id = %escalation.task_id, role = %role, "Escalation becomes a worker request");
                    requests.push(WorkerRequest {
                        requested_by: WORK_PLANNER.to_string(),
                        role_name: role,
                        reason: escalation.reason.clone(),
                        required_specialties: escalation.required_capability.iter().cloned().collect(),
                        required_tools: Vec::new(),
                        context: Some(format!(
                            "escalated from task {} by {}",
                            escalation.task_id, escalation.from_worker
                        )),
                    });
                }
                other => {
                    warn!(task_id = %escalation.task_id, kind = ?other, "Escalation dropped");
                }
            }
        }
        update.worker_requests = Some(requests.clone());
        update.escalations = Some(Vec::new());
        update.phase = Some(Phase::Planning);
    }

    let mut tasks = state.tasks.clone();
    let mut results = state.task_results.clone();
    let cascaded = Scheduler::cascade_failures(&mut tasks, &mut results);
    if !cascaded.is_empty() {
        warn!(tasks = ?cascaded, "Tasks failed by a failed dependency");
    }

    let pending = Scheduler::promote(
        &tasks,
        &results,
        &state.pending_tasks,
        &state.executing_tasks,
        &state.pending_interrupts,
    );
    if pending != state.pending_tasks {
        update.pending_tasks = Some(pending);
    }

    let advanced = Scheduler::project_statuses(&state.projects, &tasks);
    if !advanced.is_empty() {
        let mut projects = state.projects.clone();
        projects.extend(advanced);
        update.projects = Some(projects);
    }

    if !cascaded.is_empty() {
        update.tasks = Some(tasks.clone());
        update.task_results = Some(results);
    }

    if requests.is_empty() && Scheduler::all_terminal(&tasks) {
        let mut finished = state.clone();
        update.clone().apply(&mut finished);
        info!(tasks = tasks.len(), "Every task is terminal");
        update.report = Some(Some(finished.completion_report()));
        update.phase = Some(Phase::Completed);
        update.should_continue = Some(false);
    }
    update
}

/// Reconciles human responses into the state.
fn await_human(state: &WorkflowState) -> StateUpdate {
    let mut collected = state.collected_inputs.clone();
    for response in &state.human_responses {
        collected.extend(response.inputs.clone());
    }

    let answered: HashSet<_> = state.human_responses.iter().map(|r| r.interrupt_id).collect();
    let open = InterruptLedger::from_parts(
        state
            .pending_interrupts
            .iter()
            .filter(|i| !answered.contains(&i.id))
            .cloned()
            .collect(),
        Vec::new(),
    );

    let mut tools = state.connected_tools.clone();
    let mut tasks = state.tasks.clone();
    let mut results = state.task_results.clone();
    let fresh = state
        .human_responses
        .get(state.responses_applied..)
        .unwrap_or_default();
    for response in fresh {
        for (key, value) in &response.inputs {
            if let Some(tool) = key.strip_prefix(TOOL_INPUT_PREFIX) {
                let status = tool_status(value);
                info!(tool = %tool, status = ?status, "Tool connection reported");
                tools.insert(tool.to_string(), status);
            }
        }
        if response.approved != Some(false) {
            continue;
        }
        let Some(task_id) = &response.task_id else {
            continue;
        };
        if let Some(task) = tasks.get_mut(task_id).filter(|t| !t.status.is_terminal()) {
            info!(task_id = %task_id, "Approval rejected, task failed");
            task.status = TaskStatus::Failed;
            let reason = match &response.message {
                Some(message) => format!("approval rejected: {message}"),
                None => "approval rejected".to_string(),
            };
            results.insert(task_id.clone(), TaskResult::failed(task_id.clone(), reason));
        }
    }

    for task in tasks.values_mut() {
        if task.status.is_blocked() && !open.blocks_task(&task.id) {
            debug!(task_id = %task.id, from = %task.status, "Task unblocked");
            task.status = TaskStatus::Pending;
        }
    }
    Scheduler::cascade_failures(&mut tasks, &mut results);

    let pending = Scheduler::promote(
        &tasks,
        &results,
        &state.pending_tasks,
        &state.executing_tasks,
        open.pending(),
    );

    StateUpdate {
        collected_inputs: Some(collected),
        pending_interrupts: Some(open.into_parts().0),
        connected_tools: Some(tools),
        tasks: Some(tasks),
        task_results: Some(results),
        pending_tasks: Some(pending),
        responses_applied: Some(state.human_responses.len()),
        ..StateUpdate::default()
    }
}

/// A `tool_<id>` input may carry an explicit status; anything else but `false` means connected.
fn tool_status(value: &Value) -> ToolStatus {
    match value {
        Value::String(s) => s.parse().unwrap_or(ToolStatus::Connected),
        Value::Bool(false) => ToolStatus::NotConnected,
        _ => ToolStatus::Connected,
    }
}

fn finalize(state: &WorkflowState) -> StateUpdate {
    let mut update = StateUpdate::default();
    let advanced = Scheduler::project_statuses(&state.projects, &state.tasks);
    if !advanced.is_empty() {
        let mut projects = state.projects.clone();
        projects.extend(advanced);
        update.projects = Some(projects);
    }
    let mut finished = state.clone();
    update.clone().apply(&mut finished);
    let report = finished.completion_report();
    info!(
        completed = report.completed_tasks,
        failed = report.failed_tasks,
        total = report.total_tasks,
        "Workflow finished"
    );
    update.report = Some(Some(report));
    update.phase = Some(Phase::Completed);
    update.should_continue = Some(false);
    update
}
