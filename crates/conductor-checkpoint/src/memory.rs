use crate::checkpoint::{Checkpoint, PendingWrite};
use crate::store::CheckpointStore;
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

struct Stored {
    seq: u64,
    checkpoint: Checkpoint,
}

#[derive(Default)]
struct ThreadLog {
    checkpoints: HashMap<String, Stored>,
    writes: BTreeMap<(String, String, usize), PendingWrite>,
}

impl ThreadLog {
    /// Checkpoints newest first by `(created_at, seq)`.
    fn ordered(&self) -> Vec<&Stored> {
        let mut entries: Vec<&Stored> = self.checkpoints.values().collect();
        entries.sort_by(|a, b| {
            (b.checkpoint.created_at, b.seq).cmp(&(a.checkpoint.created_at, a.seq))
        });
        entries
    }
}

/// Process-local checkpoint store. Nothing survives a restart.
pub struct InMemoryCheckpointStore {
    threads: RwLock<HashMap<String, ThreadLog>>,
    seq: AtomicU64,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(&self, checkpoint: &Checkpoint) -> ConductorResult<String> {
        let mut threads = self.threads.write();
        let log = threads.entry(checkpoint.thread_id.clone()).or_default();
        match log.checkpoints.get_mut(&checkpoint.id) {
            Some(existing) => existing.checkpoint = checkpoint.clone(),
            None => {
                let seq = self.seq.fetch_add(1, Ordering::SeqCst);
                log.checkpoints.insert(
                    checkpoint.id.clone(),
                    Stored {
                        seq,
                        checkpoint: checkpoint.clone(),
                    },
                );
            }
        }
        Ok(checkpoint.id.clone())
    }

    async fn get(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> ConductorResult<Option<Checkpoint>> {
        let threads = self.threads.read();
        let Some(log) = threads.get(thread_id) else {
            return Ok(None);
        };
        let found = match checkpoint_id {
            Some(id) => log.checkpoints.get(id),
            None => log.ordered().into_iter().next(),
        };
        Ok(found.map(|s| s.checkpoint.clone()))
    }

    async fn list(
        &self,
        thread_id: &str,
        before: Option<&str>,
        limit: Option<usize>,
    ) -> ConductorResult<Vec<Checkpoint>> {
        let threads = self.threads.read();
        let Some(log) = threads.get(thread_id) else {
            return match before {
                Some(id) => Err(ConductorError::NotFound(format!(
                    "checkpoint {id} in thread {thread_id}"
                ))),
                None => Ok(Vec::new()),
            };
        };
        let ordered = log.ordered();
        let start = match before {
            Some(id) => {
                ordered
                    .iter()
                    .position(|s| s.checkpoint.id == id)
                    .ok_or_else(|| {
                        ConductorError::NotFound(format!("checkpoint {id} in thread {thread_id}"))
                    })?
                    + 1
            }
            None => 0,
        };
        Ok(ordered
            .into_iter()
            .skip(start)
            .take(limit.unwrap_or(usize::MAX))
            .map(|s| s.checkpoint.clone())
            .collect())
    }

    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        writes: &[PendingWrite],
    ) -> ConductorResult<()> {
        let mut threads = self.threads.write();
        let log = threads.entry(thread_id.to_string()).or_default();
        for write in writes {
            log.writes.insert(
                (checkpoint_id.to_string(), write.step.clone(), write.index),
                write.clone(),
            );
        }
        Ok(())
    }

    async fn get_writes(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> ConductorResult<Vec<PendingWrite>> {
        let threads = self.threads.read();
        Ok(threads
            .get(thread_id)
            .map(|log| {
                log.writes
                    .iter()
                    .filter(|((cp, _, _), _)| cp == checkpoint_id)
                    .map(|(_, w)| w.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_thread(&self, thread_id: &str) -> ConductorResult<()> {
        self.threads.write().remove(thread_id);
        Ok(())
    }

    async fn threads(&self) -> ConductorResult<Vec<String>> {
        let threads = self.threads.read();
        let mut ids: Vec<String> = threads
            .iter()
            .filter(|(_, log)| !log.checkpoints.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointMetadata;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn checkpoint(thread: &str, parent: Option<String>, n: i64) -> Checkpoint {
        Checkpoint::new(
            thread,
            parent,
            json!({ "n": n }),
            CheckpointMetadata::step(n, "dispatch", Some("dispatch".into())),
        )
    }

    #[tokio::test]
    async fn test_latest_follows_creation_order_not_insertion() {
        let store = InMemoryCheckpointStore::new();
        let mut newer = checkpoint("t", None, 2);
        let mut older = checkpoint("t", None, 1);
        newer.created_at = Utc::now();
        older.created_at = newer.created_at - Duration::seconds(5);

        store.put(&newer).await.unwrap();
        store.put(&older).await.unwrap();

        let latest = store.get("t", None).await.unwrap().unwrap();
        assert_eq!(latest.id, newer.id);
    }

    #[tokio::test]
    async fn test_put_is_upsert() {
        let store = InMemoryCheckpointStore::new();
        let first = checkpoint("t", None, 1);
        let second = checkpoint("t", Some(first.id.clone()), 2);
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        let mut retried = first.clone();
        retried.state = json!({ "n": 10 });
        store.put(&retried).await.unwrap();

        let all = store.list("t", None, None).await.unwrap();
        assert_eq!(all.len(), 2);
        // Overwrite keeps its slot; `second` is still the latest.
        assert_eq!(all[0].id, second.id);
        assert_eq!(all[1].state, json!({ "n": 10 }));
    }

    #[tokio::test]
    async fn test_list_before_and_limit() {
        let store = InMemoryCheckpointStore::new();
        let mut ids = Vec::new();
        let mut parent = None;
        for n in 0..4 {
            let cp = checkpoint("t", parent.clone(), n);
            parent = Some(cp.id.clone());
            ids.push(store.put(&cp).await.unwrap());
        }

        let page = store.list("t", Some(&ids[2]), Some(1)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, ids[1]);

        let err = store.list("t", Some("missing"), None).await.unwrap_err();
        assert_eq!(err.reason(), "not_found");
    }

    #[tokio::test]
    async fn test_writes_are_idempotent_and_deleted_with_thread() {
        let store = InMemoryCheckpointStore::new();
        let cp = checkpoint("t", None, 0);
        store.put(&cp).await.unwrap();
        let write = PendingWrite {
            step: "dispatch".into(),
            channel: "tasks".into(),
            value: json!({}),
            index: 0,
        };
        store.put_writes("t", &cp.id, &[write.clone()]).await.unwrap();
        store.put_writes("t", &cp.id, &[write]).await.unwrap();
        assert_eq!(store.get_writes("t", &cp.id).await.unwrap().len(), 1);

        assert_eq!(store.threads().await.unwrap(), vec!["t".to_string()]);
        store.delete_thread("t").await.unwrap();
        assert!(store.get("t", None).await.unwrap().is_none());
        assert!(store.get_writes("t", &cp.id).await.unwrap().is_empty());
        assert!(store.threads().await.unwrap().is_empty());
    }
}
