// Store write path as an explicit decorator chain. The original system
// patched its low-level setter at runtime to bolt on validation and logging;
// here the same layering is composed once at node construction:
// ValidatingWriter -> LoggingWriter -> StoreCommitWriter.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::core::path::Path;
use crate::core::record::Record;
use crate::error::{MeshError, MeshResult};
use crate::infrastructure::store::Store;

/// Longest path accepted by the validating writer.
const MAX_PATH_LEN: usize = 1_024;
/// Deepest value nesting accepted by the validating writer.
const MAX_VALUE_DEPTH: usize = 64;

/// Narrow write seam in front of the store.
#[async_trait]
pub trait StoreWriter: Send + Sync + std::fmt::Debug {
    async fn write(&self, path: &Path, record: Record) -> MeshResult<()>;
}

/// Base writer: commits straight to the store.
#[derive(Debug)]
pub struct StoreCommitWriter {
    store: Arc<Store>,
}

impl StoreCommitWriter {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StoreWriter for StoreCommitWriter {
    async fn write(&self, path: &Path, record: Record) -> MeshResult<()> {
        self.store.commit(path, record).await
    }
}

/// Debug-logs each accepted commit with its origin and clock.
#[derive(Debug)]
pub struct LoggingWriter {
    inner: Arc<dyn StoreWriter>,
}

impl LoggingWriter {
    pub fn new(inner: Arc<dyn StoreWriter>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StoreWriter for LoggingWriter {
    async fn write(&self, path: &Path, record: Record) -> MeshResult<()> {
        debug!(
            "commit {} origin={} msg_id={} deleted={} clock={:?}",
            path, record.origin, record.msg_id, record.deleted, record.vector_clock
        );
        self.inner.write(path, record).await
    }
}

/// Rejects oversize paths and pathologically nested values before they reach
/// the store or the wire.
#[derive(Debug)]
pub struct ValidatingWriter {
    inner: Arc<dyn StoreWriter>,
}

impl ValidatingWriter {
    pub fn new(inner: Arc<dyn StoreWriter>) -> Self {
        Self { inner }
    }

    fn value_depth(value: &Value) -> usize {
        match value {
            Value::Array(items) => {
                1 + items.iter().map(Self::value_depth).max().unwrap_or(0)
            }
            Value::Object(fields) => {
                1 + fields.values().map(Self::value_depth).max().unwrap_or(0)
            }
            _ => 0,
        }
    }
}

#[async_trait]
impl StoreWriter for ValidatingWriter {
    async fn write(&self, path: &Path, record: Record) -> MeshResult<()> {
        if path.as_str().len() > MAX_PATH_LEN {
            return Err(MeshError::InvalidPath(format!(
                "path exceeds {} bytes",
                MAX_PATH_LEN
            )));
        }
        if Self::value_depth(&record.value) > MAX_VALUE_DEPTH {
            return Err(MeshError::InvalidValue(format!(
                "value nesting exceeds {} levels",
                MAX_VALUE_DEPTH
            )));
        }
        if record.deleted && !record.value.is_null() {
            return Err(MeshError::InvalidValue(
                "tombstone records carry a null value".to_string(),
            ));
        }
        self.inner.write(path, record).await
    }
}

/// The chain used by the node.
pub fn default_writer_chain(store: Arc<Store>) -> Arc<dyn StoreWriter> {
    let base: Arc<dyn StoreWriter> = Arc::new(StoreCommitWriter::new(store));
    let logging: Arc<dyn StoreWriter> = Arc::new(LoggingWriter::new(base));
    Arc::new(ValidatingWriter::new(logging))
}
