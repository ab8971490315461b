use crate::state::WorkflowState;
use conductor_core::{ConductorError, ConductorResult, HumanInterrupt, HumanResponse};
use tracing::debug;
use uuid::Uuid;

/// Bookkeeping for open human interrupts and their resolutions.
///
/// Holds no routing logic. The ledger is rebuilt from a state snapshot,
/// mutated, and its parts written back into a [`crate::StateUpdate`].
#[derive(Debug, Clone, Default)]
pub struct InterruptLedger {
    pending: Vec<HumanInterrupt>,
    responses: Vec<HumanResponse>,
}

impl InterruptLedger {
    /// Rebuilds a ledger from open interrupts and recorded responses.
    pub fn from_parts(pending: Vec<HumanInterrupt>, responses: Vec<HumanResponse>) -> Self {
        Self { pending, responses }
    }

    /// Ledger of a workflow state's interrupts and responses.
    pub fn from_state(state: &WorkflowState) -> Self {
        Self::from_parts(
            state.pending_interrupts.clone(),
            state.human_responses.clone(),
        )
    }

    /// Opens an interrupt and returns its id.
    pub fn create(&mut self, interrupt: HumanInterrupt) -> Uuid {
        let id = interrupt.id;
        debug!(interrupt_id = %id, kind = %interrupt.kind, "Interrupt opened");
        self.pending.push(interrupt);
        id
    }

    /// Open interrupts in creation order.
    pub fn pending(&self) -> &[HumanInterrupt] {
        &self.pending
    }

    /// Whether an open interrupt references `task_id`.
    pub fn blocks_task(&self, task_id: &str) -> bool {
        self.pending
            .iter()
            .any(|i| i.task_id.as_deref() == Some(task_id))
    }

    /// Resolves an open interrupt.
    ///
    /// Fails with `NotFound` if the interrupt is unknown or already resolved,
    /// and with `Validation` listing every declared required key absent from
    /// the response. On failure the ledger is left untouched.
    pub fn submit_response(
        &mut self,
        interrupt_id: Uuid,
        mut response: HumanResponse,
    ) -> ConductorResult<HumanResponse> {
        let Some(position) = self.pending.iter().position(|i| i.id == interrupt_id) else {
            let detail = if self.get_response(interrupt_id).is_some() {
                "already resolved"
            } else {
                "not pending"
            };
            return Err(ConductorError::NotFound(format!(
                "interrupt {interrupt_id} ({detail})"
            )));
        };

        let missing = self.pending[position].missing_inputs(&response.inputs);
        if !missing.is_empty() {
            return Err(ConductorError::Validation {
                interrupt_id: interrupt_id.to_string(),
                missing,
            });
        }

        let interrupt = self.pending.remove(position);
        response.interrupt_id = interrupt_id;
        response.task_id = interrupt.task_id;
        debug!(interrupt_id = %interrupt_id, "Interrupt resolved");
        self.responses.push(response.clone());
        Ok(response)
    }

    /// The recorded response to `interrupt_id`, if it was resolved.
    pub fn get_response(&self, interrupt_id: Uuid) -> Option<&HumanResponse> {
        self.responses.iter().find(|r| r.interrupt_id == interrupt_id)
    }

    /// Splits the ledger into open interrupts and recorded responses.
    pub fn into_parts(self) -> (Vec<HumanInterrupt>, Vec<HumanResponse>) {
        (self.pending, self.responses)
    }
}

/// Whether any response in `responses` approves `task_id`.
pub fn has_approval(task_id: &str, responses: &[HumanResponse]) -> bool {
    responses.iter().any(|r| r.approves(task_id))
}
