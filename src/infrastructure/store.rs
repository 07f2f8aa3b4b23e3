use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::core::clock::VectorClock;
use crate::core::message::SyncEntry;
use crate::core::path::{path_is_under, Path};
use crate::core::record::{Record, RecordMeta};
use crate::error::MeshResult;
use crate::infrastructure::storage::Storage;

const STORE_NS: &str = "store/";
const META_NS: &str = "meta/";
const LOG_NS: &str = "log/";

/// The local replicated map: `path -> Record`, with the parallel metadata
/// table, the per-path version-history ring, and a bounded recent-commit log.
///
/// The store does not re-check causality: callers must have passed the
/// record through the conflict resolver and must hold the per-path lock.
/// Commits are durable on the `Storage` collaborator before they become
/// visible in memory.
#[derive(Debug)]
pub struct Store {
    storage: Arc<dyn Storage>,
    config: StoreConfig,
    entries: RwLock<BTreeMap<String, Record>>,
    meta: RwLock<HashMap<String, RecordMeta>>,
    history: RwLock<HashMap<String, VecDeque<Record>>>,
    log_head: Mutex<u64>,
}

impl Store {
    /// Open the store, replaying persisted state into the in-memory index.
    pub async fn open(storage: Arc<dyn Storage>, config: StoreConfig) -> MeshResult<Self> {
        let mut entries = BTreeMap::new();
        let mut history: HashMap<String, VecDeque<Record>> = HashMap::new();
        for (key, value) in storage.scan(STORE_NS).await? {
            let path = key[STORE_NS.len()..].to_string();
            let record: Record = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(e) => {
                    warn!("skipping undecodable record for '{}': {}", path, e);
                    continue;
                }
            };
            history.insert(path.clone(), VecDeque::from([record.clone()]));
            entries.insert(path, record);
        }

        let mut meta = HashMap::new();
        for (key, value) in storage.scan(META_NS).await? {
            let path = key[META_NS.len()..].to_string();
            match serde_json::from_value::<RecordMeta>(value) {
                Ok(record_meta) => {
                    meta.insert(path, record_meta);
                }
                Err(e) => warn!("skipping undecodable metadata for '{}': {}", path, e),
            }
        }
        // Metadata is derivable; backfill paths whose meta entry was lost.
        for (path, record) in &entries {
            meta.entry(path.clone())
                .or_insert_with(|| RecordMeta::from(record));
        }

        let log_head = storage
            .scan(LOG_NS)
            .await?
            .iter()
            .filter_map(|(key, _)| key[LOG_NS.len()..].parse::<u64>().ok())
            .max()
            .map(|head| head + 1)
            .unwrap_or(0);

        info!("store opened with {} paths", entries.len());
        Ok(Self {
            storage,
            config,
            entries: RwLock::new(entries),
            meta: RwLock::new(meta),
            history: RwLock::new(history),
            log_head: Mutex::new(log_head),
        })
    }

    /// Value at `path`, or `None` when absent or tombstoned.
    pub async fn get(&self, path: &Path) -> Option<Value> {
        let entries = self.entries.read().await;
        entries
            .get(path.as_str())
            .filter(|record| !record.deleted)
            .map(|record| record.value.clone())
    }

    pub async fn record(&self, path: &Path) -> Option<Record> {
        self.entries.read().await.get(path.as_str()).cloned()
    }

    pub async fn meta_of(&self, path: &Path) -> Option<RecordMeta> {
        self.meta.read().await.get(path.as_str()).cloned()
    }

    /// Unconditionally replace the record at `path` and append it to the
    /// version history. Durable before it is visible.
    pub async fn commit(&self, path: &Path, record: Record) -> MeshResult<()> {
        let record_json = serde_json::to_value(&record)?;
        let meta_json = serde_json::to_value(RecordMeta::from(&record))?;

        // Storage first: a failed write leaves the in-memory state untouched.
        self.storage
            .put(&format!("{}{}", STORE_NS, path.as_str()), record_json)
            .await?;
        self.storage
            .put(&format!("{}{}", META_NS, path.as_str()), meta_json)
            .await?;
        self.append_commit_log(path, &record).await?;

        {
            let mut entries = self.entries.write().await;
            entries.insert(path.as_str().to_string(), record.clone());
        }
        {
            let mut meta = self.meta.write().await;
            meta.insert(path.as_str().to_string(), RecordMeta::from(&record));
        }
        {
            let mut history = self.history.write().await;
            let ring = history.entry(path.as_str().to_string()).or_default();
            ring.push_front(record);
            while ring.len() > self.config.max_versions {
                ring.pop_back();
            }
        }
        debug!("committed {}", path);
        Ok(())
    }

    /// Bounded append-only log of recent commits: the newest entry overwrites
    /// the slot `max_log_size` behind it.
    async fn append_commit_log(&self, path: &Path, record: &Record) -> MeshResult<()> {
        if self.config.max_log_size == 0 {
            return Ok(());
        }
        let mut head = self.log_head.lock().await;
        let entry = json!({
            "path": path.as_str(),
            "msgId": record.msg_id,
            "origin": record.origin,
            "timestamp": record.timestamp,
        });
        self.storage
            .put(&format!("{}{:016}", LOG_NS, *head), entry)
            .await?;
        if *head >= self.config.max_log_size as u64 {
            let expired = *head - self.config.max_log_size as u64;
            self.storage
                .del(&format!("{}{:016}", LOG_NS, expired))
                .await?;
        }
        *head += 1;
        Ok(())
    }

    /// Lexicographic `{path, value}` walk under `prefix`; tombstones are
    /// invisible here.
    pub async fn scan(&self, prefix: &Path, limit: Option<usize>) -> Vec<(String, Value)> {
        let entries = self.entries.read().await;
        entries
            .range(prefix.as_str().to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix.as_str()))
            .filter(|(path, _)| path_is_under(path, prefix.as_str()))
            .filter(|(_, record)| !record.deleted)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(path, record)| (path.clone(), record.value.clone()))
            .collect()
    }

    /// Newest-first snapshot of the version ring, at most `max_versions`.
    pub async fn history_of(&self, path: &Path) -> Vec<Record> {
        let history = self.history.read().await;
        history
            .get(path.as_str())
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The anti-entropy feed: every entry whose clock the peer's summary
    /// clock does not dominate, optionally restricted to path prefixes.
    pub async fn all_since(
        &self,
        peer_clock: Option<&VectorClock>,
        prefixes: Option<&[String]>,
    ) -> Vec<SyncEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(path, _)| match prefixes {
                Some(prefixes) => prefixes
                    .iter()
                    .any(|prefix| path_is_under(path, prefix)),
                None => true,
            })
            .filter(|(_, record)| match peer_clock {
                Some(peer_clock) => !peer_clock.dominates(&record.vector_clock),
                None => true,
            })
            .map(|(path, record)| SyncEntry {
                path: path.clone(),
                record: record.clone(),
            })
            .collect()
    }

    /// Union of every committed record's clock; used as the sync summary.
    pub async fn summary_clock(&self) -> VectorClock {
        let entries = self.entries.read().await;
        let mut clock = VectorClock::new();
        for record in entries.values() {
            clock.merge(&record.vector_clock);
        }
        clock
    }

    /// Live (non-tombstoned) entry count.
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|record| !record.deleted).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn close(&self) -> MeshResult<()> {
        self.storage.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use crate::infrastructure::storage::MemoryStorage;
    use async_trait::async_trait;
    use serde_json::json;

    fn record(origin: &str, counter: u64, value: Value) -> Record {
        let mut clock = VectorClock::new();
        for _ in 0..counter {
            clock.increment(origin);
        }
        Record {
            value,
            vector_clock: clock,
            origin: origin.to_string(),
            timestamp: counter as i64,
            msg_id: format!("{}:{}:abc123", origin, counter),
            deleted: false,
        }
    }

    async fn open_store() -> Store {
        Store::open(Arc::new(MemoryStorage::new()), StoreConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_and_get() {
        let store = open_store().await;
        let path = Path::parse("users/bob").unwrap();
        store
            .commit(&path, record("n1", 1, json!({"name": "Bob"})))
            .await
            .unwrap();
        assert_eq!(store.get(&path).await, Some(json!({"name": "Bob"})));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_tombstone_reads_as_absent_but_keeps_record() {
        let store = open_store().await;
        let path = Path::parse("users/bob").unwrap();
        store
            .commit(&path, record("n1", 1, json!("x")))
            .await
            .unwrap();
        let mut tombstone = record("n1", 2, Value::Null);
        tombstone.deleted = true;
        store.commit(&path, tombstone).await.unwrap();

        assert_eq!(store.get(&path).await, None);
        assert!(store.record(&path).await.unwrap().deleted);
        assert_eq!(store.len().await, 0);
        // Deletions still flow through anti-entropy.
        assert_eq!(store.all_since(None, None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_prefix_and_limit() {
        let store = open_store().await;
        for (i, path) in ["users/al", "users/bob", "users/bob/tags", "usersx/z"]
            .iter()
            .enumerate()
        {
            store
                .commit(
                    &Path::parse(path).unwrap(),
                    record("n1", i as u64 + 1, json!(i)),
                )
                .await
                .unwrap();
        }

        let all = store
            .scan(&Path::parse("users").unwrap(), None)
            .await;
        let paths: Vec<_> = all.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(paths, vec!["users/al", "users/bob", "users/bob/tags"]);

        let limited = store.scan(&Path::parse("users").unwrap(), Some(2)).await;
        assert_eq!(limited.len(), 2);

        let exact = store.scan(&Path::parse("users/bob").unwrap(), None).await;
        assert_eq!(exact.len(), 2);
    }

    #[tokio::test]
    async fn test_history_ring_is_bounded_newest_first() {
        let store = Store::open(
            Arc::new(MemoryStorage::new()),
            StoreConfig {
                max_versions: 3,
                ..StoreConfig::default()
            },
        )
        .await
        .unwrap();
        let path = Path::parse("counter").unwrap();
        for i in 1..=5u64 {
            store.commit(&path, record("n1", i, json!(i))).await.unwrap();
        }
        let history = store.history_of(&path).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].value, json!(5));
        assert_eq!(history[2].value, json!(3));
    }

    #[tokio::test]
    async fn test_all_since_filters_dominated_entries() {
        let store = open_store().await;
        store
            .commit(&Path::parse("a").unwrap(), record("n1", 1, json!(1)))
            .await
            .unwrap();
        store
            .commit(&Path::parse("b").unwrap(), record("n2", 4, json!(2)))
            .await
            .unwrap();

        // Peer already saw everything from n1 but nothing from n2.
        let mut peer_clock = VectorClock::new();
        peer_clock.increment("n1");
        let missing = store.all_since(Some(&peer_clock), None).await;
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].path, "b");

        assert_eq!(store.all_since(None, None).await.len(), 2);

        let scoped = store
            .all_since(None, Some(&["a".to_string()][..]))
            .await;
        assert_eq!(scoped.len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_replays_records_and_meta() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let store = Store::open(storage.clone(), StoreConfig::default())
                .await
                .unwrap();
            store
                .commit(&Path::parse("users/bob").unwrap(), record("n1", 2, json!("x")))
                .await
                .unwrap();
        }
        let store = Store::open(storage, StoreConfig::default()).await.unwrap();
        let path = Path::parse("users/bob").unwrap();
        assert_eq!(store.get(&path).await, Some(json!("x")));
        let meta = store.meta_of(&path).await.unwrap();
        assert_eq!(meta.origin, "n1");
        assert_eq!(meta.vector_clock.get("n1"), 2);
    }

    /// Storage stub whose writes fail on demand.
    #[derive(Debug, Default)]
    struct FailingStorage {
        fail: std::sync::atomic::AtomicBool,
        inner: MemoryStorage,
    }

    #[async_trait]
    impl Storage for FailingStorage {
        async fn get(&self, key: &str) -> MeshResult<Option<Value>> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: Value) -> MeshResult<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(MeshError::Storage("disk full".to_string()));
            }
            self.inner.put(key, value).await
        }
        async fn del(&self, key: &str) -> MeshResult<bool> {
            self.inner.del(key).await
        }
        async fn scan(&self, prefix: &str) -> MeshResult<Vec<(String, Value)>> {
            self.inner.scan(prefix).await
        }
        async fn close(&self) -> MeshResult<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_memory_untouched() {
        let storage = Arc::new(FailingStorage::default());
        let store = Store::open(storage.clone(), StoreConfig::default())
            .await
            .unwrap();
        let path = Path::parse("users/bob").unwrap();
        store
            .commit(&path, record("n1", 1, json!("old")))
            .await
            .unwrap();

        storage.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let result = store.commit(&path, record("n1", 2, json!("new"))).await;
        assert!(matches!(result, Err(MeshError::Storage(_))));
        assert_eq!(store.get(&path).await, Some(json!("old")));
        assert_eq!(store.history_of(&path).await.len(), 1);
    }
}
