//! Durable checkpoint storage for Conductor workflow threads.
//!
//! A checkpoint is an opaque JSON snapshot of workflow state, chained to its
//! predecessor through `parent_id`. Stores are keyed by `(thread_id,
//! checkpoint_id)`; `put` is an upsert and "latest" is decided by creation
//! order, never by physical storage order.
//!
//! # Main types
//!
//! - [`Checkpoint`]: A persisted snapshot plus identity and metadata.
//! - [`PendingWrite`]: One entry of the per-step write log used for crash recovery.
//! - [`CheckpointStore`]: Async storage contract.
//! - [`InMemoryCheckpointStore`]: Process-local store for tests and ephemeral runs.
//! - [`SqliteCheckpointStore`]: SQLite-backed store (feature `sqlite`).

/// Checkpoint and pending-write records.
pub mod checkpoint;
/// In-memory store.
pub mod memory;
/// SQLite store.
#[cfg(feature = "sqlite")]
pub mod sqlite;
/// The storage trait.
pub mod store;

pub use checkpoint::{Checkpoint, CheckpointMetadata, CheckpointSource, PendingWrite};
pub use memory::InMemoryCheckpointStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCheckpointStore;
pub use store::CheckpointStore;
