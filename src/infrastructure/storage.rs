use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{MeshError, MeshResult};

/// Narrow persistence collaborator.
///
/// The replication core only needs atomic per-key `put`, prefix `scan`, and
/// durable writes; everything else about the backend is its own business.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> MeshResult<Option<Value>>;
    async fn put(&self, key: &str, value: Value) -> MeshResult<()>;
    async fn del(&self, key: &str) -> MeshResult<bool>;
    /// All `(key, value)` pairs with the given key prefix, in key order.
    async fn scan(&self, prefix: &str) -> MeshResult<Vec<(String, Value)>>;
    async fn close(&self) -> MeshResult<()>;
}

/// In-memory backend for tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Value>>,
    closed: std::sync::atomic::AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> MeshResult<()> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(MeshError::Storage("storage is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> MeshResult<Option<Value>> {
        self.check_open()?;
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> MeshResult<()> {
        self.check_open()?;
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> MeshResult<bool> {
        self.check_open()?;
        Ok(self.entries.lock().await.remove(key).is_some())
    }

    async fn scan(&self, prefix: &str) -> MeshResult<Vec<(String, Value)>> {
        self.check_open()?;
        let entries = self.entries.lock().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn close(&self) -> MeshResult<()> {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

/// One mutation in the file log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
enum LogOp {
    Put { key: String, value: Value },
    Del { key: String },
}

/// Durable backend: an append-only JSON-line log replayed into an in-memory
/// index on open.
///
/// Every `put`/`del` appends one line and flushes before returning, which is
/// what makes `Store::commit` durable. The log is compacted to a plain
/// snapshot when dead entries outnumber live ones.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    inner: Mutex<FileStorageInner>,
}

#[derive(Debug)]
struct FileStorageInner {
    index: BTreeMap<String, Value>,
    writer: Option<BufWriter<File>>,
    /// Log lines written since the last compaction.
    log_lines: usize,
}

const LOG_FILE: &str = "meshkv.log";
const COMPACT_SLACK: usize = 1_024;

impl FileStorage {
    pub async fn open(dir: &str) -> MeshResult<Self> {
        let dir = PathBuf::from(dir);
        std::fs::create_dir_all(&dir).map_err(|e| {
            MeshError::Storage(format!("failed to create data directory: {}", e))
        })?;

        let log_path = dir.join(LOG_FILE);
        let mut index = BTreeMap::new();
        let mut log_lines = 0;

        if log_path.exists() {
            let reader = BufReader::new(File::open(&log_path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                log_lines += 1;
                // A torn final line from a crash is skipped, not fatal.
                let op: LogOp = match serde_json::from_str(&line) {
                    Ok(op) => op,
                    Err(e) => {
                        debug!("skipping malformed log line: {}", e);
                        continue;
                    }
                };
                match op {
                    LogOp::Put { key, value } => {
                        index.insert(key, value);
                    }
                    LogOp::Del { key } => {
                        index.remove(&key);
                    }
                }
            }
        }

        let writer = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?,
        );

        info!(
            "file storage opened at {} with {} keys",
            dir.display(),
            index.len()
        );
        let storage = Self {
            dir,
            inner: Mutex::new(FileStorageInner {
                index,
                writer: Some(writer),
                log_lines,
            }),
        };
        storage.maybe_compact().await?;
        Ok(storage)
    }

    async fn append(&self, op: &LogOp) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        let line = serde_json::to_string(op)?;
        let writer = inner
            .writer
            .as_mut()
            .ok_or_else(|| MeshError::Storage("storage is closed".to_string()))?;
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        inner.log_lines += 1;
        match op {
            LogOp::Put { key, value } => {
                inner.index.insert(key.clone(), value.clone());
            }
            LogOp::Del { key } => {
                inner.index.remove(key);
            }
        }
        Ok(())
    }

    async fn maybe_compact(&self) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.writer.is_none()
            || inner.log_lines <= inner.index.len() * 2 + COMPACT_SLACK
        {
            return Ok(());
        }

        let log_path = self.dir.join(LOG_FILE);
        let tmp_path = self.dir.join(format!("{}.tmp", LOG_FILE));
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for (key, value) in &inner.index {
                let op = LogOp::Put {
                    key: key.clone(),
                    value: value.clone(),
                };
                writeln!(tmp, "{}", serde_json::to_string(&op)?)?;
            }
            tmp.flush()?;
        }
        std::fs::rename(&tmp_path, &log_path)?;

        inner.log_lines = inner.index.len();
        inner.writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&log_path)?,
        ));
        info!("compacted storage log to {} entries", inner.log_lines);
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> MeshResult<Option<Value>> {
        let inner = self.inner.lock().await;
        if inner.writer.is_none() {
            return Err(MeshError::Storage("storage is closed".to_string()));
        }
        Ok(inner.index.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> MeshResult<()> {
        self.append(&LogOp::Put {
            key: key.to_string(),
            value,
        })
        .await?;
        self.maybe_compact().await
    }

    async fn del(&self, key: &str) -> MeshResult<bool> {
        {
            let inner = self.inner.lock().await;
            if inner.writer.is_none() {
                return Err(MeshError::Storage("storage is closed".to_string()));
            }
            if !inner.index.contains_key(key) {
                return Ok(false);
            }
        }
        self.append(&LogOp::Del {
            key: key.to_string(),
        })
        .await?;
        Ok(true)
    }

    async fn scan(&self, prefix: &str) -> MeshResult<Vec<(String, Value)>> {
        let inner = self.inner.lock().await;
        if inner.writer.is_none() {
            return Err(MeshError::Storage("storage is closed".to_string()));
        }
        Ok(inner
            .index
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn close(&self) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(mut writer) = inner.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}
