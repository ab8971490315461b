use crate::ledger::has_approval;
use crate::state::WorkflowState;
use crate::types::{
    Project, ProjectStatus, Task, TaskResult, TaskStatus, ToolStatus, WorkerDefinition,
    WorkerStatus,
};
use conductor_core::{HumanInterrupt, HumanResponse};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Read-only view over a task map with dependency-graph queries.
pub struct TaskGraph<'a> {
    tasks: &'a BTreeMap<String, Task>,
}

impl<'a> TaskGraph<'a> {
    /// Read-only view over `tasks`.
    pub fn new(tasks: &'a BTreeMap<String, Task>) -> Self {
        Self { tasks }
    }

    /// Tasks in plan order (`seq`, then id).
    pub fn in_order(&self) -> Vec<&'a Task> {
        let mut ordered: Vec<&Task> = self.tasks.values().collect();
        ordered.sort_by(|a, b| (a.seq, &a.id).cmp(&(b.seq, &b.id)));
        ordered
    }

    /// Check for cycles in the dependency graph.
    /// Returns true if a cycle is detected.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        for id in self.tasks.keys() {
            if self.dfs_cycle(id, &mut visited) {
                return true;
            }
        }
        false
    }

    fn dfs_cycle(&self, id: &'a str, visited: &mut HashMap<&'a str, u8>) -> bool {
        match visited.get(id) {
            Some(1) => return true,  // back edge = cycle
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(task) = self.tasks.get(id) {
            for dep in &task.dependencies {
                if self.dfs_cycle(dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }

    /// Tasks that can never run: members of a dependency cycle, tasks that
    /// reference an unknown id, and everything that transitively depends on them.
    pub fn unsatisfiable(&self) -> BTreeSet<String> {
        let mut marks: HashMap<&'a str, Mark> = HashMap::new();
        for id in self.tasks.keys() {
            self.satisfiable(id, &mut marks);
        }
        marks
            .into_iter()
            .filter(|(id, mark)| *mark == Mark::Bad && self.tasks.contains_key(*id))
            .map(|(id, _)| id.to_string())
            .collect()
    }

    fn satisfiable(&self, id: &'a str, marks: &mut HashMap<&'a str, Mark>) -> bool {
        match marks.get(id) {
            Some(Mark::InProgress) | Some(Mark::Bad) => return false,
            Some(Mark::Good) => return true,
            None => {}
        }
        let Some(task) = self.tasks.get(id) else {
            marks.insert(id, Mark::Bad);
            return false;
        };
        marks.insert(id, Mark::InProgress);
        let mut ok = true;
        for dep in &task.dependencies {
            // Visit every dependency so cycle members all get marked.
            if !self.satisfiable(dep, marks) {
                ok = false;
            }
        }
        marks.insert(id, if ok { Mark::Good } else { Mark::Bad });
        ok
    }

    /// Whether every dependency of `task` has a completed result.
    pub fn dependencies_completed(task: &Task, results: &BTreeMap<String, TaskResult>) -> bool {
        task.dependencies.iter().all(|dep| {
            results
                .get(dep)
                .is_some_and(|r| r.status == TaskStatus::Completed)
        })
    }

    /// Whether every task is completed or failed.
    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Good,
    Bad,
}

/// Dependency promotion, worker selection and task guards for one workflow.
///
/// Stateless: every operation reads the task maps it is given, so calling
/// any of them redundantly is safe.
pub struct Scheduler;

impl Scheduler {
    /// Recomputes the runnable queue.
    ///
    /// Keeps every queued id that still exists (never demotes), then appends
    /// in plan order each task that is not terminal, not executing, not
    /// already queued, not referenced by an open interrupt, and whose
    /// dependencies all have a completed result.
    pub fn promote(
        tasks: &BTreeMap<String, Task>,
        results: &BTreeMap<String, TaskResult>,
        pending: &[String],
        executing: &[String],
        open_interrupts: &[HumanInterrupt],
    ) -> Vec<String> {
        let mut queue: Vec<String> = Vec::with_capacity(pending.len());
        for id in pending {
            if tasks.contains_key(id) && !executing.contains(id) && !queue.contains(id) {
                queue.push(id.clone());
            }
        }

        let blocked: BTreeSet<&str> = open_interrupts
            .iter()
            .filter_map(|i| i.task_id.as_deref())
            .collect();

        for task in TaskGraph::new(tasks).in_order() {
            if task.status.is_terminal() || task.status == TaskStatus::Executing {
                continue;
            }
            if queue.contains(&task.id) || executing.contains(&task.id) {
                continue;
            }
            if blocked.contains(task.id.as_str()) {
                continue;
            }
            if TaskGraph::dependencies_completed(task, results) {
                debug!(task_id = %task.id, "Task promoted");
                queue.push(task.id.clone());
            }
        }
        queue
    }

    /// Tasks that can never run. See [`TaskGraph::unsatisfiable`].
    pub fn validate_graph(tasks: &BTreeMap<String, Task>) -> BTreeSet<String> {
        TaskGraph::new(tasks).unsatisfiable()
    }

    /// Fails every non-terminal task with a failed dependency, transitively.
    /// Returns the ids that were failed, in plan order.
    pub fn cascade_failures(
        tasks: &mut BTreeMap<String, Task>,
        results: &mut BTreeMap<String, TaskResult>,
    ) -> Vec<String> {
        let mut failed = Vec::new();
        loop {
            let ordered: Vec<(String, Option<String>)> = TaskGraph::new(tasks)
                .in_order()
                .into_iter()
                .filter(|t| !t.status.is_terminal() && t.status != TaskStatus::Executing)
                .map(|t| {
                    let culprit = t
                        .dependencies
                        .iter()
                        .find(|dep| {
                            tasks.get(*dep).is_some_and(|d| d.status == TaskStatus::Failed)
                                || results
                                    .get(*dep)
                                    .is_some_and(|r| r.status == TaskStatus::Failed)
                        })
                        .cloned();
                    (t.id.clone(), culprit)
                })
                .collect();

            let mut changed = false;
            for (id, culprit) in ordered {
                let Some(dep) = culprit else { continue };
                if let Some(task) = tasks.get_mut(&id) {
                    task.status = TaskStatus::Failed;
                    results.insert(
                        id.clone(),
                        TaskResult::failed(id.clone(), format!("dependency {dep} failed")),
                    );
                    failed.push(id);
                    changed = true;
                }
            }
            if !changed {
                return failed;
            }
        }
    }

    /// Picks a worker for an unassigned task.
    ///
    /// Candidates are visited in `(created_at, id)` order. First pass: an
    /// active expert with a specialty appearing in the task's name or
    /// description. Second pass: an active expert sharing a tool id with the
    /// task. Fallback: the first non-coordinator worker of any status.
    pub fn select_worker(
        task: &Task,
        workers: &BTreeMap<String, WorkerDefinition>,
    ) -> Option<String> {
        let experts = experts_in_order(workers);
        let text = task.search_text();
        let active = || experts.iter().filter(|w| w.status == WorkerStatus::Active);

        if let Some(w) = active().find(|w| w.matches_text(&text)) {
            return Some(w.id.clone());
        }
        if let Some(w) =
            active().find(|w| task.tool_ids().any(|t| w.tools.iter().any(|wt| wt == t)))
        {
            return Some(w.id.clone());
        }
        experts.first().map(|w| w.id.clone())
    }

    /// Plan-time assignment: a worker whose role name or a specialty contains
    /// `role`, case-insensitively.
    pub fn find_worker_for_role(
        role: &str,
        workers: &BTreeMap<String, WorkerDefinition>,
    ) -> Option<String> {
        let role = role.trim().to_lowercase();
        if role.is_empty() {
            return None;
        }
        experts_in_order(workers)
            .into_iter()
            .find(|w| {
                w.role_name.to_lowercase().contains(&role)
                    || w.specialties.iter().any(|s| s.to_lowercase().contains(&role))
            })
            .map(|w| w.id.clone())
    }

    /// Evaluates the pre-execution guards in order: inputs, approval, tools.
    /// Returns the blocked status to enter, or `None` if the task may run.
    pub fn guard(task: &Task, ctx: &ExecutionContext<'_>) -> Option<TaskStatus> {
        if !task.missing_inputs(ctx.collected_inputs).is_empty() {
            return Some(TaskStatus::InputRequired);
        }
        if task.requires_approval() && !has_approval(&task.id, ctx.human_responses) {
            return Some(TaskStatus::ApprovalWait);
        }
        if !task.missing_tools(ctx.connected_tools).is_empty() {
            return Some(TaskStatus::AwaitingTool);
        }
        None
    }

    /// Whether every task is completed, failed or cancelled. True for an empty plan.
    pub fn all_terminal(tasks: &BTreeMap<String, Task>) -> bool {
        TaskGraph::new(tasks).all_terminal()
    }

    /// Advances project statuses from their tasks; never moves a project
    /// backwards. Returns only the projects whose status changed.
    pub fn project_statuses(
        projects: &BTreeMap<String, Project>,
        tasks: &BTreeMap<String, Task>,
    ) -> BTreeMap<String, Project> {
        let mut changed = BTreeMap::new();
        for (id, project) in projects {
            let statuses: Vec<TaskStatus> = project
                .task_ids
                .iter()
                .filter_map(|t| tasks.get(t).map(|t| t.status))
                .collect();
            if statuses.is_empty() {
                continue;
            }
            let target = if statuses.iter().all(|s| *s == TaskStatus::Completed) {
                ProjectStatus::Completed
            } else if statuses.iter().all(|s| s.is_terminal()) {
                ProjectStatus::Blocked
            } else if statuses.iter().any(|s| *s != TaskStatus::Pending) {
                ProjectStatus::InProgress
            } else {
                continue;
            };
            if project.status.can_advance_to(target) {
                let mut updated = project.clone();
                updated.status = target;
                changed.insert(id.clone(), updated);
            }
        }
        changed
    }
}

fn experts_in_order(workers: &BTreeMap<String, WorkerDefinition>) -> Vec<&WorkerDefinition> {
    let mut experts: Vec<&WorkerDefinition> =
        workers.values().filter(|w| !w.is_coordinator()).collect();
    experts.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    experts
}

/// What a task is guarded and executed against.
pub struct ExecutionContext<'a> {
    /// Values supplied through resolved interrupts, by key.
    pub collected_inputs: &'a BTreeMap<String, Value>,
    /// Connection status per tool id.
    pub connected_tools: &'a BTreeMap<String, ToolStatus>,
    /// Every recorded human response.
    pub human_responses: &'a [HumanResponse],
}

impl<'a> ExecutionContext<'a> {
    /// Borrows the execution inputs of `state`.
    pub fn from_state(state: &'a WorkflowState) -> Self {
        Self {
            collected_inputs: &state.collected_inputs,
            connected_tools: &state.connected_tools,
            human_responses: &state.human_responses,
        }
    }
}
