use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What produced a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// The initial snapshot written when a thread starts.
    Input,
    /// Written by the engine after a step.
    Loop,
    /// Written by an out-of-band state edit (e.g. a tool connection).
    Update,
}

/// Bookkeeping stored alongside each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// What produced the snapshot.
    pub source: CheckpointSource,
    /// Step counter within the thread. `-1` for the input checkpoint.
    pub step: i64,
    /// Name of the step whose output this snapshot contains.
    #[serde(default)]
    pub writes: Option<String>,
    /// Name of the step the engine will run next. `None` means the thread ended.
    #[serde(default)]
    pub next: Option<String>,
}

impl CheckpointMetadata {
    /// Metadata for the checkpoint written when a run receives its input.
    pub fn input(next: impl Into<String>) -> Self {
        Self {
            source: CheckpointSource::Input,
            step: -1,
            writes: None,
            next: Some(next.into()),
        }
    }

    /// Metadata for the checkpoint written after step number `step`.
    pub fn step(step: i64, writes: impl Into<String>, next: Option<String>) -> Self {
        Self {
            source: CheckpointSource::Loop,
            step,
            writes: Some(writes.into()),
            next,
        }
    }

    /// Metadata for a checkpoint written by an external state update.
    pub fn update(step: i64, next: Option<String>) -> Self {
        Self {
            source: CheckpointSource::Update,
            step,
            writes: None,
            next,
        }
    }
}

/// A persisted snapshot of one workflow thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint id.
    pub id: String,
    /// Thread the checkpoint belongs to.
    pub thread_id: String,
    /// The checkpoint this one follows. `None` for a thread's first checkpoint.
    pub parent_id: Option<String>,
    /// The serialized workflow state. Stores never interpret it.
    pub state: Value,
    pub metadata: CheckpointMetadata,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Creates a checkpoint with a fresh id.
    pub fn new(
        thread_id: impl Into<String>,
        parent_id: Option<String>,
        state: Value,
        metadata: CheckpointMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            parent_id,
            state,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// A single channel write produced by a step, logged before the step's
/// checkpoint so a crash in between can be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    /// Step that produced the write.
    pub step: String,
    /// State field the write targets.
    pub channel: String,
    /// The value written.
    pub value: Value,
    /// Position of the write within its step.
    pub index: usize,
}
