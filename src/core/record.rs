use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::clock::VectorClock;

/// Opaque node identifier: 16 lowercase hex characters.
pub type NodeId = String;

/// Random node identity for nodes that were not configured with one.
pub fn generate_node_id() -> NodeId {
    format!("{:016x}", rand::random::<u64>())
}

/// The unit stored against a path.
///
/// The same JSON shape is used in memory, on the wire, and in storage.
/// `value` is the user payload; `Value::Null` plus `deleted` marks a
/// tombstone, which keeps participating in conflict resolution so deletions
/// propagate through anti-entropy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub value: Value,
    #[serde(default)]
    pub vector_clock: VectorClock,
    pub origin: NodeId,
    pub timestamp: i64,
    pub msg_id: String,
    #[serde(default)]
    pub deleted: bool,
}

impl Record {
    /// Tag used for the deterministic tie-break between concurrent records.
    pub fn tie_tag(&self) -> String {
        format!("{}|{}", self.origin, self.msg_id)
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }
}

/// Per-path metadata kept parallel to the store. Derivable from the record,
/// persisted separately so anti-entropy can read clocks without values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    pub vector_clock: VectorClock,
    pub timestamp: i64,
    pub origin: NodeId,
    pub deleted: bool,
}

impl From<&Record> for RecordMeta {
    fn from(record: &Record) -> Self {
        Self {
            vector_clock: record.vector_clock.clone(),
            timestamp: record.timestamp,
            origin: record.origin.clone(),
            deleted: record.deleted,
        }
    }
}

/// Mints globally unique message ids: `{origin}:{counter}:{random-suffix}`.
///
/// The monotonic counter orders ids from one node; the random suffix keeps
/// ids unique across restarts that reset the counter.
#[derive(Debug)]
pub struct MessageIdGen {
    origin: NodeId,
    counter: AtomicU64,
}

impl MessageIdGen {
    pub fn new(origin: NodeId) -> Self {
        Self {
            origin,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}:{}:{:06x}",
            self.origin,
            count,
            rand::random::<u32>() & 0xff_ffff
        )
    }
}
