use crate::collaborators::ExecutionOutcome;
use crate::types::{TaskStatus, WorkerDefinition};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Execution counters for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerMetrics {
    /// Tasks handed to the worker.
    pub executions: u64,
    pub completed: u64,
    pub failed: u64,
    /// Executions that stopped on a human interrupt.
    pub blocked: u64,
    /// Capability overruns the worker reported.
    pub escalations: u64,
}

/// A provisioned worker, created once per id and reused on every dispatch.
#[derive(Debug)]
pub struct WorkerHandle {
    definition: WorkerDefinition,
    metrics: parking_lot::Mutex<WorkerMetrics>,
}

impl WorkerHandle {
    fn new(definition: WorkerDefinition) -> Self {
        Self {
            definition,
            metrics: parking_lot::Mutex::new(WorkerMetrics::default()),
        }
    }

    /// The worker id.
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// The definition the handle was created from.
    pub fn definition(&self) -> &WorkerDefinition {
        &self.definition
    }

    /// Snapshot of the execution counters.
    pub fn metrics(&self) -> WorkerMetrics {
        *self.metrics.lock()
    }

    /// Record the outcome of one execution.
    pub fn record(&self, outcome: &ExecutionOutcome) {
        let mut metrics = self.metrics.lock();
        metrics.executions += 1;
        match outcome {
            ExecutionOutcome::Finished { result, .. } => match result.status {
                TaskStatus::Completed => metrics.completed += 1,
                TaskStatus::Failed => metrics.failed += 1,
                _ if result.interrupt => metrics.blocked += 1,
                _ => {}
            },
            ExecutionOutcome::CapabilityExceeded { .. } => metrics.escalations += 1,
        }
    }
}

/// Arena of worker handles owned by one engine: `id -> WorkerHandle`.
pub struct WorkerRegistry {
    handles: RwLock<HashMap<String, Arc<WorkerHandle>>>,
}

impl WorkerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the handle for `definition.id`, creating it on first use.
    pub async fn get_or_create(&self, definition: &WorkerDefinition) -> Arc<WorkerHandle> {
        if let Some(handle) = self.handles.read().await.get(&definition.id) {
            return handle.clone();
        }
        let mut handles = self.handles.write().await;
        handles
            .entry(definition.id.clone())
            .or_insert_with(|| {
                debug!(worker_id = %definition.id, role = %definition.role_name, "Worker handle created");
                Arc::new(WorkerHandle::new(definition.clone()))
            })
            .clone()
    }

    /// Handle for `worker_id`, if registered.
    pub async fn get(&self, worker_id: &str) -> Option<Arc<WorkerHandle>> {
        self.handles.read().await.get(worker_id).cloned()
    }

    /// Number of registered workers.
    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    /// Whether no worker is registered.
    pub async fn is_empty(&self) -> bool {
        self.handles.read().await.is_empty()
    }

    /// Metrics of every known worker, ordered by id.
    pub async fn snapshot(&self) -> Vec<(String, WorkerMetrics)> {
        let handles = self.handles.read().await;
        let mut out: Vec<_> = handles
            .values()
            .map(|h| (h.id().to_string(), h.metrics()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Get aggregate metrics across all workers.
    pub async fn aggregate_metrics(&self) -> WorkerMetrics {
        let handles = self.handles.read().await;
        let mut total = WorkerMetrics::default();
        for handle in handles.values() {
            let m = handle.metrics();
            total.executions += m.executions;
            total.completed += m.completed;
            total.failed += m.failed;
            total.blocked += m.blocked;
            total.escalations += m.escalations;
        }
        total
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::collaborators::WorkerProposal;
    use crate::profiles::expert;
    use crate::types::TaskResult;
    use serde_json::json;

    fn worker() -> WorkerDefinition {
        expert(
            &WorkerProposal {
                role_name: "Analyst".into(),
                ..WorkerProposal::default()
            },
            "capability-manager",
        )
    }

    #[tokio::test]
    async fn test_get_or_create_memoizes() {
        let registry = WorkerRegistry::new();
        let def = worker();
        let a = registry.get_or_create(&def).await;
        let b = registry.get_or_create(&def).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(&def.id).await.is_some());
        assert!(registry.get("expert-missing").await.is_none());
    }

    #[tokio::test]
    async fn test_record_outcomes() {
        let registry = WorkerRegistry::new();
        let handle = registry.get_or_create(&worker()).await;

        handle.record(&ExecutionOutcome::Finished {
            result: TaskResult::completed("t1", json!({})),
            interrupt: None,
        });
        handle.record(&ExecutionOutcome::Finished {
            result: TaskResult::blocked("t2", TaskStatus::InputRequired, json!({})),
            interrupt: None,
        });
        handle.record(&ExecutionOutcome::CapabilityExceeded {
            reason: "r".into(),
            hint: None,
            suggestion: None,
        });

        let metrics = handle.metrics();
        assert_eq!(metrics.executions, 3);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.blocked, 1);
        assert_eq!(metrics.escalations, 1);
        assert_eq!(registry.aggregate_metrics().await, metrics);
        assert_eq!(registry.snapshot().await[0].1, metrics);
    }
}
