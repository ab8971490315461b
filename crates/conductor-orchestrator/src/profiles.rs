use crate::collaborators::WorkerProposal;
use crate::types::{short_id, WorkerDefinition, WorkerKind, WorkerStatus};
use chrono::Utc;

/// Id of the coordinator that provisions expert workers.
pub const CAPABILITY_MANAGER: &str = "capability-manager";

/// Id of the coordinator that decomposes the goal and manages execution.
pub const WORK_PLANNER: &str = "work-planner";

/// The two reserved coordinator workers seeded by `initialize`.
pub fn coordinators() -> Vec<WorkerDefinition> {
    vec![capability_manager(), work_planner()]
}

fn capability_manager() -> WorkerDefinition {
    coordinator(
        CAPABILITY_MANAGER,
        "Capability Manager",
        "Analyses the goal and provisions the expert workers it needs",
        &["capability analysis", "worker provisioning"],
    )
}

fn work_planner() -> WorkerDefinition {
    coordinator(
        WORK_PLANNER,
        "Work Planner",
        "Breaks the goal into projects and tasks and manages their execution",
        &["project planning", "task decomposition", "execution management"],
    )
}

fn coordinator(id: &str, role: &str, description: &str, specialties: &[&str]) -> WorkerDefinition {
    WorkerDefinition {
        id: id.to_string(),
        kind: WorkerKind::Coordinator,
        role_name: role.to_string(),
        description: description.to_string(),
        specialties: specialties.iter().map(|s| (*s).to_string()).collect(),
        tools: Vec::new(),
        limitations: Vec::new(),
        status: WorkerStatus::Active,
        assigned_tasks: Vec::new(),
        created_by: "system".to_string(),
        created_at: Utc::now(),
    }
}

/// Materialises an analyzer proposal as an active expert worker.
pub fn expert(proposal: &WorkerProposal, created_by: &str) -> WorkerDefinition {
    WorkerDefinition {
        id: short_id("expert"),
        kind: WorkerKind::Expert,
        role_name: proposal.role_name.clone(),
        description: proposal.description.clone(),
        specialties: proposal.specialties.clone(),
        tools: proposal.tools.clone(),
        limitations: proposal.limitations.clone(),
        status: WorkerStatus::Active,
        assigned_tasks: Vec::new(),
        created_by: created_by.to_string(),
        created_at: Utc::now(),
    }
}
