use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::core::clock::VectorClock;
use crate::core::path::Path;
use crate::core::record::{MessageIdGen, NodeId, Record};
use crate::core::time::Clock;
use crate::error::MeshResult;
use crate::infrastructure::resolver::{ConflictResolver, Resolution};
use crate::infrastructure::store::Store;
use crate::infrastructure::store_writer::StoreWriter;
use crate::infrastructure::subscriptions::SubscriptionManager;

/// Per-path mutual exclusion. Every commit, local or remote, linearizes
/// through the path's lock, which makes resolver decisions deterministic for
/// any interleaving and keeps per-path clocks monotone.
#[derive(Debug, Default)]
struct PathLockTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

const LOCK_TABLE_SWEEP_THRESHOLD: usize = 1_024;

impl PathLockTable {
    async fn acquire(&self, path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        if locks.len() > LOCK_TABLE_SWEEP_THRESHOLD {
            // Drop locks nobody holds; holders keep theirs alive via the Arc.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// The serialized commit path shared by local writes, flood applies, and
/// sync applies: per-path lock, causal clock bookkeeping, conflict
/// resolution, durable write, subscriber fan-out.
#[derive(Debug)]
pub struct CommitPipeline {
    local_id: NodeId,
    clock: Mutex<VectorClock>,
    time: Arc<dyn Clock>,
    ids: Arc<MessageIdGen>,
    store: Arc<Store>,
    writer: Arc<dyn StoreWriter>,
    resolver: Arc<ConflictResolver>,
    subscriptions: Arc<SubscriptionManager>,
    locks: PathLockTable,
}

/// What a local commit produced.
#[derive(Debug)]
pub struct LocalCommit {
    pub record: Record,
    /// The path held a live (non-tombstoned) value before this commit.
    pub existed: bool,
}

impl CommitPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: NodeId,
        time: Arc<dyn Clock>,
        ids: Arc<MessageIdGen>,
        store: Arc<Store>,
        writer: Arc<dyn StoreWriter>,
        resolver: Arc<ConflictResolver>,
        subscriptions: Arc<SubscriptionManager>,
        recovered_clock: VectorClock,
    ) -> Self {
        // A restarted node resumes causal history from its replayed store
        // instead of re-issuing counters it already used.
        let mut clock = VectorClock::seeded(&local_id);
        clock.merge(&recovered_clock);
        Self {
            clock: Mutex::new(clock),
            local_id,
            time,
            ids,
            store,
            writer,
            resolver,
            subscriptions,
            locks: PathLockTable::default(),
        }
    }

    pub async fn current_clock(&self) -> VectorClock {
        self.clock.lock().await.clone()
    }

    /// Commit a local write (or tombstone) and return the surviving record.
    #[instrument(skip(self, value))]
    pub async fn commit_local(
        &self,
        path: &Path,
        value: Value,
        deleted: bool,
    ) -> MeshResult<LocalCommit> {
        let lock = self.locks.acquire(path.as_str()).await;
        let _guard = lock.lock().await;

        let vector_clock = {
            let mut clock = self.clock.lock().await;
            clock.increment(&self.local_id);
            clock.clone()
        };
        let record = Record {
            value,
            vector_clock,
            origin: self.local_id.clone(),
            timestamp: self.time.now_millis(),
            msg_id: self.ids.next(),
            deleted,
        };

        let current = self.store.record(path).await;
        let existed = current
            .as_ref()
            .map(|record| !record.deleted)
            .unwrap_or(false);
        let resolution = self
            .resolver
            .resolve(path, current.as_ref(), &record);
        if resolution.changed {
            self.writer.write(path, resolution.record.clone()).await?;
        }
        if resolution.payload_changed {
            self.notify(path, &resolution.record);
        }
        Ok(LocalCommit {
            record: resolution.record,
            existed,
        })
    }

    /// Apply a record received from a peer (flood or sync stream).
    pub async fn apply_remote(&self, path: &Path, record: &Record) -> MeshResult<Resolution> {
        let lock = self.locks.acquire(path.as_str()).await;
        let _guard = lock.lock().await;

        // Whatever the resolver decides, this node has now seen the remote
        // history.
        {
            let mut clock = self.clock.lock().await;
            clock.merge(&record.vector_clock);
        }

        let current = self.store.record(path).await;
        let resolution = self.resolver.resolve(path, current.as_ref(), record);
        if resolution.changed {
            self.writer.write(path, resolution.record.clone()).await?;
        }
        if resolution.payload_changed {
            self.notify(path, &resolution.record);
        }
        Ok(resolution)
    }

    fn notify(&self, path: &Path, record: &Record) {
        let value = if record.deleted {
            None
        } else {
            Some(&record.value)
        };
        self.subscriptions.notify(path.as_str(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConflictConfig, StoreConfig};
    use crate::core::time::SystemClock;
    use crate::infrastructure::storage::MemoryStorage;
    use crate::infrastructure::store_writer::default_writer_chain;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    async fn pipeline() -> (Arc<CommitPipeline>, Arc<Store>, Arc<SubscriptionManager>) {
        let store = Arc::new(
            Store::open(Arc::new(MemoryStorage::new()), StoreConfig::default())
                .await
                .unwrap(),
        );
        let subscriptions = Arc::new(SubscriptionManager::new());
        let pipeline = Arc::new(CommitPipeline::new(
            "0000000000000000".to_string(),
            Arc::new(SystemClock),
            Arc::new(MessageIdGen::new("0000000000000000".to_string())),
            store.clone(),
            default_writer_chain(store.clone()),
            Arc::new(ConflictResolver::from_config(&ConflictConfig::default()).unwrap()),
            subscriptions.clone(),
            VectorClock::new(),
        ));
        (pipeline, store, subscriptions)
    }

    #[tokio::test]
    async fn test_local_commits_advance_the_clock() {
        let (pipeline, store, _) = pipeline().await;
        let path = Path::parse("users/bob").unwrap();

        let first = pipeline
            .commit_local(&path, json!(1), false)
            .await
            .unwrap();
        assert!(!first.existed);
        assert_eq!(first.record.vector_clock.get("0000000000000000"), 1);

        let second = pipeline
            .commit_local(&path, json!(2), false)
            .await
            .unwrap();
        assert!(second.existed);
        assert_eq!(second.record.vector_clock.get("0000000000000000"), 2);
        assert_eq!(store.get(&path).await, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_apply_remote_merges_into_node_clock() {
        let (pipeline, store, _) = pipeline().await;
        let path = Path::parse("users/bob").unwrap();

        let mut clock = VectorClock::new();
        clock.increment("1111111111111111");
        clock.increment("1111111111111111");
        let remote = Record {
            value: json!("remote"),
            vector_clock: clock,
            origin: "1111111111111111".to_string(),
            timestamp: 5,
            msg_id: "1111111111111111:1:000001".to_string(),
            deleted: false,
        };

        let resolution = pipeline.apply_remote(&path, &remote).await.unwrap();
        assert!(resolution.changed);
        assert_eq!(store.get(&path).await, Some(json!("remote")));
        assert_eq!(
            pipeline.current_clock().await.get("1111111111111111"),
            2
        );

        // The next local write causally follows the applied remote one.
        let next = pipeline
            .commit_local(&path, json!("local"), false)
            .await
            .unwrap();
        assert!(next
            .record
            .vector_clock
            .dominates(&remote.vector_clock));
    }

    #[tokio::test]
    async fn test_duplicate_apply_is_a_no_op_without_notifications() {
        let (pipeline, _, subscriptions) = pipeline().await;
        let path = Path::parse("users/bob").unwrap();

        let fired = Arc::new(StdMutex::new(0usize));
        let sink = fired.clone();
        let _handle = subscriptions.subscribe(
            "users",
            Arc::new(move |_, _| {
                *sink.lock().unwrap() += 1;
            }),
        );

        let mut clock = VectorClock::new();
        clock.increment("1111111111111111");
        let remote = Record {
            value: json!("x"),
            vector_clock: clock,
            origin: "1111111111111111".to_string(),
            timestamp: 5,
            msg_id: "1111111111111111:0:000001".to_string(),
            deleted: false,
        };

        let first = pipeline.apply_remote(&path, &remote).await.unwrap();
        assert!(first.changed);
        let second = pipeline.apply_remote(&path, &remote).await.unwrap();
        assert!(!second.changed);
        assert!(!second.payload_changed);
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_deletions_as_none() {
        let (pipeline, _, subscriptions) = pipeline().await;
        let path = Path::parse("users/bob").unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let _handle = subscriptions.subscribe(
            "users",
            Arc::new(move |value: Option<&Value>, _| {
                sink.lock().unwrap().push(value.cloned());
            }),
        );

        pipeline
            .commit_local(&path, json!("x"), false)
            .await
            .unwrap();
        pipeline
            .commit_local(&path, Value::Null, true)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[Some(json!("x")), None]);
    }
}
