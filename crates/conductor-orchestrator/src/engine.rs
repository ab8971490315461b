use crate::collaborators::{CapabilityAnalyzer, TaskExecutor};
use crate::ledger::InterruptLedger;
use crate::registry::WorkerRegistry;
use crate::routing::{route, Route, StepId};
use crate::state::{StateUpdate, WorkflowState};
use crate::steps::Steps;
use crate::types::{Goal, ToolStatus};
use conductor_checkpoint::{Checkpoint, CheckpointMetadata, CheckpointSource, CheckpointStore};
use conductor_core::{ConductorError, ConductorResult, HumanInterrupt, HumanResponse, InterruptView};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

/// Channel recorded on the checkpoint a `resume` writes.
const RESUME_WRITES: &str = "human_responses";
/// Channel recorded on the checkpoint a `connect_tool` writes.
const TOOL_WRITES: &str = "connected_tools";

/// Library-side engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum steps executed by a single `run`/`resume`/`recover` call.
    pub recursion_limit: usize,
    /// Steps the engine suspends in front of.
    pub interrupt_before: Vec<StepId>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recursion_limit: 100,
            interrupt_before: vec![StepId::AwaitHuman],
        }
    }
}

/// The latest checkpoint of a thread, decoded.
struct Cursor {
    checkpoint_id: String,
    step: i64,
    state: WorkflowState,
}

impl Cursor {
    fn load(checkpoint: Checkpoint) -> ConductorResult<(Self, Route)> {
        let next = Route::from_next(checkpoint.metadata.next.as_deref())?;
        let cursor = Self {
            checkpoint_id: checkpoint.id,
            step: checkpoint.metadata.step,
            state: WorkflowState::from_value(checkpoint.state)?,
        };
        Ok((cursor, next))
    }
}

type ThreadLocks = parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive hold on one thread.
///
/// On drop the thread's mutex is released, and its map entry is removed once
/// no other caller holds or waits on it. Clones of the mutex are only taken
/// under the map lock, so a removed entry is never shared.
struct ThreadGuard<'a> {
    locks: &'a ThreadLocks,
    thread_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ThreadGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        drop(self.guard.take());
        let idle = locks
            .get(&self.thread_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.thread_id);
        }
    }
}

/// The durable step/route state machine.
///
/// Each thread runs single-threaded: every mutating operation holds that
/// thread's lock for its whole duration, while distinct threads run fully
/// concurrently. After every step the engine logs the step's update as
/// pending writes against the current checkpoint, merges it, routes, and
/// writes the next checkpoint. It returns to the caller in front of any
/// `interrupt_before` step.
pub struct WorkflowEngine {
    store: Arc<dyn CheckpointStore>,
    steps: Steps,
    config: EngineConfig,
    locks: ThreadLocks,
}

impl WorkflowEngine {
    /// Creates an engine over `store` with default limits.
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        analyzer: Arc<dyn CapabilityAnalyzer>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            store,
            steps: Steps::new(analyzer, executor),
            config: EngineConfig::default(),
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the engine limits.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Current engine limits.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Worker handles created by this engine.
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        self.steps.registry()
    }

    /// The backing checkpoint store.
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Starts a new thread for `goal` and runs it until it ends or suspends.
    pub async fn run(&self, thread_id: &str, goal: Goal) -> ConductorResult<WorkflowState> {
        let _guard = self.lock_thread(thread_id).await;

        if self.store.get(thread_id, None).await?.is_some() {
            return Err(ConductorError::ThreadExists(thread_id.to_string()));
        }
        info!(thread_id = %thread_id, goal = %goal.text, "Thread started");

        let cursor = self
            .commit(
                thread_id,
                None,
                WorkflowState::new(goal),
                CheckpointMetadata::input(StepId::Initialize.as_str()),
            )
            .await?;
        self.drive(thread_id, cursor, Route::Step(StepId::Initialize), false)
            .await
    }

    /// Answers an open interrupt of a suspended thread and continues it.
    ///
    /// The response is validated before anything is written; a missing
    /// required input fails with `Validation` and leaves the thread as it was.
    pub async fn resume(
        &self,
        thread_id: &str,
        response: HumanResponse,
    ) -> ConductorResult<WorkflowState> {
        let _guard = self.lock_thread(thread_id).await;
        let checkpoint = self.latest(thread_id).await?;
        self.resume_from(thread_id, checkpoint, response).await
    }

    /// Like [`resume`](Self::resume), but from an explicit earlier checkpoint.
    /// The new checkpoints fork from it.
    pub async fn resume_at(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        response: HumanResponse,
    ) -> ConductorResult<WorkflowState> {
        let _guard = self.lock_thread(thread_id).await;
        let checkpoint = self
            .store
            .get(thread_id, Some(checkpoint_id))
            .await?
            .ok_or_else(|| {
                ConductorError::NotFound(format!("checkpoint {checkpoint_id} of thread {thread_id}"))
            })?;
        self.resume_from(thread_id, checkpoint, response).await
    }

    async fn resume_from(
        &self,
        thread_id: &str,
        checkpoint: Checkpoint,
        response: HumanResponse,
    ) -> ConductorResult<WorkflowState> {
        let (mut cursor, next) = Cursor::load(checkpoint)?;
        let step = match next {
            Route::Step(step) if self.config.interrupt_before.contains(&step) => step,
            _ => return Err(ConductorError::NotSuspended(thread_id.to_string())),
        };

        let mut ledger = InterruptLedger::from_state(&cursor.state);
        let accepted = ledger.submit_response(response.interrupt_id, response)?;
        info!(
            thread_id = %thread_id,
            interrupt_id = %accepted.interrupt_id,
            approved = ?accepted.approved,
            "Human response accepted"
        );
        let (pending, responses) = ledger.into_parts();
        StateUpdate {
            pending_interrupts: Some(pending),
            human_responses: Some(responses),
            ..StateUpdate::default()
        }
        .apply(&mut cursor.state);

        let metadata = CheckpointMetadata {
            writes: Some(RESUME_WRITES.to_string()),
            ..CheckpointMetadata::update(cursor.step + 1, next.next_name())
        };
        let cursor = self
            .commit(thread_id, Some(cursor.checkpoint_id), cursor.state, metadata)
            .await?;
        self.drive(thread_id, cursor, Route::Step(step), true).await
    }

    /// Records a tool connection status reported by the tool-management side.
    /// The thread's suspension point is preserved; nothing is executed.
    pub async fn connect_tool(
        &self,
        thread_id: &str,
        tool_id: &str,
        status: ToolStatus,
    ) -> ConductorResult<WorkflowState> {
        let _guard = self.lock_thread(thread_id).await;
        let (mut cursor, next) = Cursor::load(self.latest(thread_id).await?)?;

        let mut tools = cursor.state.connected_tools.clone();
        tools.insert(tool_id.to_string(), status);
        StateUpdate {
            connected_tools: Some(tools),
            ..StateUpdate::default()
        }
        .apply(&mut cursor.state);
        info!(thread_id = %thread_id, tool = %tool_id, status = ?status, "Tool status recorded");

        let metadata = CheckpointMetadata {
            writes: Some(TOOL_WRITES.to_string()),
            ..CheckpointMetadata::update(cursor.step + 1, next.next_name())
        };
        let cursor = self
            .commit(thread_id, Some(cursor.checkpoint_id), cursor.state, metadata)
            .await?;
        Ok(cursor.state)
    }

    /// Continues a thread whose process died mid-run.
    ///
    /// Pending writes left against the latest checkpoint belong to a step
    /// whose own checkpoint was never written; they are re-applied instead
    /// of running the step again. A thread suspended at an interrupt stays
    /// suspended.
    pub async fn recover(&self, thread_id: &str) -> ConductorResult<WorkflowState> {
        let _guard = self.lock_thread(thread_id).await;
        let checkpoint = self.latest(thread_id).await?;
        let writes = self.store.get_writes(thread_id, &checkpoint.id).await?;
        let source = checkpoint.metadata.source;
        let resumed = checkpoint.metadata.writes.as_deref() == Some(RESUME_WRITES);
        let (mut cursor, next) = Cursor::load(checkpoint)?;

        if let Some(first) = writes.first() {
            let step: StepId = first.step.parse()?;
            warn!(thread_id = %thread_id, step = %step, writes = writes.len(), "Re-applying pending writes");
            StateUpdate::from_writes(&writes)?.apply(&mut cursor.state);
            let next = route(step, &cursor.state);
            let metadata =
                CheckpointMetadata::step(cursor.step + 1, step.as_str(), next.next_name());
            let cursor = self
                .commit(thread_id, Some(cursor.checkpoint_id), cursor.state, metadata)
                .await?;
            return self.drive(thread_id, cursor, next, false).await;
        }

        match next {
            Route::End => Ok(cursor.state),
            Route::Step(step) if self.config.interrupt_before.contains(&step) => {
                // A resume that died after accepting its response still owes the step.
                let owed = source == CheckpointSource::Update && resumed;
                if owed {
                    info!(thread_id = %thread_id, step = %step, "Finishing interrupted resume");
                }
                self.drive(thread_id, cursor, next, owed).await
            }
            Route::Step(_) => {
                info!(thread_id = %thread_id, "Continuing thread");
                self.drive(thread_id, cursor, next, false).await
            }
        }
    }

    /// Latest state of a thread, `None` if the thread does not exist.
    pub async fn get_state(&self, thread_id: &str) -> ConductorResult<Option<WorkflowState>> {
        match self.store.get(thread_id, None).await? {
            Some(checkpoint) => Ok(Some(WorkflowState::from_value(checkpoint.state)?)),
            None => Ok(None),
        }
    }

    /// Presentation view of the first open interrupt of a thread.
    pub async fn get_pending_interrupt(
        &self,
        thread_id: &str,
    ) -> ConductorResult<Option<InterruptView>> {
        Ok(self
            .pending_interrupts(thread_id)
            .await?
            .first()
            .map(HumanInterrupt::display))
    }

    /// Every open interrupt of a thread, oldest first. Empty for unknown threads.
    pub async fn pending_interrupts(&self, thread_id: &str) -> ConductorResult<Vec<HumanInterrupt>> {
        Ok(self
            .get_state(thread_id)
            .await?
            .map(|s| s.pending_interrupts)
            .unwrap_or_default())
    }

    /// Whether the thread's latest checkpoint is parked in front of an interrupt step.
    pub async fn is_suspended(&self, thread_id: &str) -> ConductorResult<bool> {
        let Some(checkpoint) = self.store.get(thread_id, None).await? else {
            return Ok(false);
        };
        Ok(
            match Route::from_next(checkpoint.metadata.next.as_deref())? {
                Route::Step(step) => self.config.interrupt_before.contains(&step),
                Route::End => false,
            },
        )
    }

    /// Checkpoints of a thread, newest first.
    pub async fn history(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> ConductorResult<Vec<Checkpoint>> {
        self.store.list(thread_id, None, limit).await
    }

    /// Ids of every thread with at least one checkpoint.
    pub async fn threads(&self) -> ConductorResult<Vec<String>> {
        self.store.threads().await
    }

    /// Removes a thread and all its checkpoints.
    pub async fn delete(&self, thread_id: &str) -> ConductorResult<()> {
        let _guard = self.lock_thread(thread_id).await;
        self.store.delete_thread(thread_id).await?;
        info!(thread_id = %thread_id, "Thread deleted");
        Ok(())
    }

    /// Waits for exclusive access to `thread_id`.
    async fn lock_thread(&self, thread_id: &str) -> ThreadGuard<'_> {
        let lock = self
            .locks
            .lock()
            .entry(thread_id.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        ThreadGuard {
            locks: &self.locks,
            thread_id: thread_id.to_string(),
            guard: Some(guard),
        }
    }

    async fn latest(&self, thread_id: &str) -> ConductorResult<Checkpoint> {
        self.store
            .get(thread_id, None)
            .await?
            .ok_or_else(|| ConductorError::NotFound(format!("thread {thread_id}")))
    }

    async fn commit(
        &self,
        thread_id: &str,
        parent_id: Option<String>,
        state: WorkflowState,
        metadata: CheckpointMetadata,
    ) -> ConductorResult<Cursor> {
        let checkpoint = Checkpoint::new(thread_id, parent_id, state.to_value()?, metadata);
        let step = checkpoint.metadata.step;
        let checkpoint_id = self.store.put(&checkpoint).await?;
        debug!(
            thread_id = %thread_id,
            checkpoint_id = %checkpoint_id,
            step,
            next = ?checkpoint.metadata.next,
            "Checkpoint written"
        );
        Ok(Cursor {
            checkpoint_id,
            step,
            state,
        })
    }

    /// Runs steps from `next` until the thread ends or reaches an interrupt
    /// point. With `enter_interrupt` set, the first step runs even if it is an
    /// interrupt point.
    async fn drive(
        &self,
        thread_id: &str,
        mut cursor: Cursor,
        mut next: Route,
        mut enter_interrupt: bool,
    ) -> ConductorResult<WorkflowState> {
        let mut executed = 0usize;
        loop {
            let step = match next {
                Route::End => {
                    info!(thread_id = %thread_id, phase = %cursor.state.phase, "Thread ended");
                    return Ok(cursor.state);
                }
                Route::Step(step) => step,
            };
            if !enter_interrupt && self.config.interrupt_before.contains(&step) {
                info!(
                    thread_id = %thread_id,
                    step = %step,
                    interrupts = cursor.state.pending_interrupts.len(),
                    "Thread suspended"
                );
                return Ok(cursor.state);
            }
            enter_interrupt = false;

            if executed >= self.config.recursion_limit {
                return Err(ConductorError::StepLimit(self.config.recursion_limit));
            }
            executed += 1;

            info!(thread_id = %thread_id, step = %step, "Running step");
            let update = match self.steps.run(step, &cursor.state).await {
                Ok(update) => update,
                Err(e @ ConductorError::Storage(_)) => return Err(e),
                Err(e) => {
                    error!(thread_id = %thread_id, step = %step, error = %e, "Step failed");
                    let mut state = cursor.state;
                    state.error = Some(e.to_string());
                    state.should_continue = false;
                    return Ok(state);
                }
            };

            let writes = update.to_writes(step.as_str())?;
            if !writes.is_empty() {
                self.store
                    .put_writes(thread_id, &cursor.checkpoint_id, &writes)
                    .await?;
            }
            update.apply(&mut cursor.state);
            next = route(step, &cursor.state);
            debug!(thread_id = %thread_id, step = %step, next = ?next, "Routed");

            let metadata = CheckpointMetadata::step(cursor.step + 1, step.as_str(), next.next_name());
            cursor = self
                .commit(thread_id, Some(cursor.checkpoint_id), cursor.state, metadata)
                .await?;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::collaborators::{
        CapabilityAnalyzer, CapabilityProposal, PlanningContext, ProjectProposal, StaticAnalyzer,
        TaskProposal, WorkPlan, WorkerProposal,
    };
    use crate::executor::GuardedExecutor;
    use crate::state::Phase;
    use crate::types::{Priority, TaskType, WorkerRequest};
    use async_trait::async_trait;
    use conductor_checkpoint::InMemoryCheckpointStore;
    use std::time::Duration;
    use tokio::sync::{mpsc, Semaphore};

    /// Parks every `propose_workers` call until a permit is released.
    struct Gated {
        inner: StaticAnalyzer,
        entered: mpsc::UnboundedSender<()>,
        permits: Arc<Semaphore>,
    }

    #[async_trait]
    impl CapabilityAnalyzer for Gated {
        async fn propose_workers(
            &self,
            ctx: &PlanningContext<'_>,
        ) -> ConductorResult<CapabilityProposal> {
            self.entered.send(()).unwrap();
            self.permits.acquire().await.unwrap().forget();
            self.inner.propose_workers(ctx).await
        }

        async fn fulfil_request(
            &self,
            request: &WorkerRequest,
            ctx: &PlanningContext<'_>,
        ) -> ConductorResult<WorkerProposal> {
            self.inner.fulfil_request(request, ctx).await
        }

        async fn plan_work(&self, ctx: &PlanningContext<'_>) -> ConductorResult<WorkPlan> {
            self.inner.plan_work(ctx).await
        }
    }

    fn analyzer() -> StaticAnalyzer {
        let task = TaskProposal {
            name: "Write copy".into(),
            description: "marketing copy".into(),
            task_type: TaskType::Document,
            priority: Priority::Medium,
            assigned_role: None,
            required_inputs: vec![],
            required_tools: vec![],
            approval_points: vec![],
            execution_steps: vec![],
            dependencies: vec![],
        };
        StaticAnalyzer::new(
            vec![WorkerProposal {
                role_name: "Marketer".into(),
                specialties: vec!["marketing".into()],
                ..WorkerProposal::default()
            }],
            WorkPlan {
                projects: vec![ProjectProposal {
                    name: "Launch".into(),
                    description: String::new(),
                    priority: Priority::Medium,
                    deliverables: vec![],
                    tasks: vec![task],
                }],
                ..WorkPlan::default()
            },
        )
    }

    fn engine(store: Arc<InMemoryCheckpointStore>) -> WorkflowEngine {
        WorkflowEngine::new(store, Arc::new(analyzer()), Arc::new(GuardedExecutor::checklist()))
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let engine = engine(store.clone());
        let state = engine.run("t1", Goal::new("launch")).await.unwrap();

        assert_eq!(state.phase, Phase::Completed);
        assert!(!state.should_continue);
        assert!(state.report.is_some());
        assert!(!engine.is_suspended("t1").await.unwrap());

        let history = engine.history("t1", None).await.unwrap();
        let oldest = history.last().unwrap();
        assert_eq!(oldest.metadata.source, CheckpointSource::Input);
        assert_eq!(history[0].metadata.next, None);
        // Each checkpoint chains to the one written before it.
        for pair in history.windows(2) {
            assert_eq!(pair[0].parent_id.as_deref(), Some(pair[1].id.as_str()));
        }
        assert_eq!(engine.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_run_rejects_existing_thread() {
        let engine = engine(Arc::new(InMemoryCheckpointStore::new()));
        engine.run("t1", Goal::new("launch")).await.unwrap();
        let err = engine.run("t1", Goal::new("again")).await.unwrap_err();
        assert_eq!(err.reason(), "thread_exists");
    }

    #[tokio::test]
    async fn test_empty_goal_ends_with_error() {
        let engine = engine(Arc::new(InMemoryCheckpointStore::new()));
        let state = engine.run("t1", Goal::new("")).await.unwrap();
        assert_eq!(state.error.as_deref(), Some("no goal provided"));
        let stored = engine.get_state("t1").await.unwrap().unwrap();
        assert_eq!(stored.error.as_deref(), Some("no goal provided"));
    }

    #[tokio::test]
    async fn test_step_limit() {
        let engine = engine(Arc::new(InMemoryCheckpointStore::new())).with_config(EngineConfig {
            recursion_limit: 2,
            ..EngineConfig::default()
        });
        let err = engine.run("t1", Goal::new("launch")).await.unwrap_err();
        assert_eq!(err.reason(), "step_limit");
    }

    #[tokio::test]
    async fn test_resume_requires_suspension() {
        let engine = engine(Arc::new(InMemoryCheckpointStore::new()));
        let response = HumanResponse::approve(uuid::Uuid::new_v4());
        let err = engine.resume("missing", response.clone()).await.unwrap_err();
        assert_eq!(err.reason(), "not_found");

        engine.run("t1", Goal::new("launch")).await.unwrap();
        let err = engine.resume("t1", response).await.unwrap_err();
        assert_eq!(err.reason(), "not_suspended");
        assert!(engine.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_connect_tool_preserves_next() {
        let engine = engine(Arc::new(InMemoryCheckpointStore::new()));
        engine.run("t1", Goal::new("launch")).await.unwrap();
        let state = engine
            .connect_tool("t1", "crm", ToolStatus::Connected)
            .await
            .unwrap();
        assert_eq!(state.connected_tools["crm"], ToolStatus::Connected);
        let latest = &engine.history("t1", Some(1)).await.unwrap()[0];
        assert_eq!(latest.metadata.source, CheckpointSource::Update);
        assert_eq!(latest.metadata.next, None);
    }

    #[tokio::test]
    async fn test_delete_thread() {
        let engine = engine(Arc::new(InMemoryCheckpointStore::new()));
        engine.run("t1", Goal::new("launch")).await.unwrap();
        assert_eq!(engine.threads().await.unwrap(), vec!["t1".to_string()]);
        engine.delete("t1").await.unwrap();
        assert!(engine.get_state("t1").await.unwrap().is_none());
        assert!(engine.get_pending_interrupt("t1").await.unwrap().is_none());
        assert!(engine.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_delete_waits_for_queued_run_of_same_thread() {
        let (entered_tx, mut entered) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(0));
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(Gated {
                inner: analyzer(),
                entered: entered_tx,
                permits: permits.clone(),
            }),
            Arc::new(GuardedExecutor::checklist()),
        ));

        let first_run = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run("t", Goal::new("launch")).await }
        });
        entered.recv().await.unwrap();
        let first_delete = tokio::spawn({
            let engine = engine.clone();
            async move { engine.delete("t").await }
        });
        let second_run = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run("t", Goal::new("relaunch")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The first run finishes, the delete runs, and the queued run takes over.
        permits.add_permits(1);
        first_run.await.unwrap().unwrap();
        first_delete.await.unwrap().unwrap();
        entered.recv().await.unwrap();

        let second_delete = tokio::spawn({
            let engine = engine.clone();
            async move { engine.delete("t").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second_delete.is_finished());

        permits.add_permits(1);
        let state = second_run.await.unwrap().unwrap();
        assert_eq!(state.goal.text, "relaunch");
        second_delete.await.unwrap().unwrap();

        assert!(engine.history("t", None).await.unwrap().is_empty());
        assert!(engine.locks.lock().is_empty());
    }
}
