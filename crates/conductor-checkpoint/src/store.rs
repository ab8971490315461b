use crate::checkpoint::{Checkpoint, PendingWrite};
use async_trait::async_trait;
use conductor_core::ConductorResult;

/// Storage contract for workflow checkpoints.
///
/// Writes for the same thread must be serialized by the caller; stores do not
/// arbitrate races. Any I/O failure is returned as `ConductorError::Storage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Inserts or overwrites the checkpoint keyed by `(thread_id, id)` and returns its id.
    /// Overwriting keeps the checkpoint's original position in creation order.
    async fn put(&self, checkpoint: &Checkpoint) -> ConductorResult<String>;

    /// Loads one checkpoint. With no id, returns the most recently created one.
    async fn get(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> ConductorResult<Option<Checkpoint>>;

    /// Lists a thread's checkpoints newest first. `before` excludes that
    /// checkpoint and everything newer; an unknown `before` id is `NotFound`.
    async fn list(
        &self,
        thread_id: &str,
        before: Option<&str>,
        limit: Option<usize>,
    ) -> ConductorResult<Vec<Checkpoint>>;

    /// Records pending writes against a checkpoint. Idempotent on
    /// `(thread_id, checkpoint_id, step, index)`.
    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        writes: &[PendingWrite],
    ) -> ConductorResult<()>;

    /// Returns the writes recorded against a checkpoint, ordered by step then index.
    async fn get_writes(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> ConductorResult<Vec<PendingWrite>>;

    /// Removes every checkpoint and write of a thread. Unknown threads are a no-op.
    async fn delete_thread(&self, thread_id: &str) -> ConductorResult<()>;

    /// Ids of all threads with at least one checkpoint, sorted.
    async fn threads(&self) -> ConductorResult<Vec<String>>;
}
