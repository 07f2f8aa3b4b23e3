use serde::{Deserialize, Serialize};

use crate::core::clock::VectorClock;
use crate::core::record::{NodeId, Record};

/// One framed wire message: common fields plus a typed payload.
///
/// Frames are single JSON objects, one per line on the TCP transport. The
/// `msg_id` is the flood de-duplication key; forwarded frames keep the id of
/// the frame they propagate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub msg_id: String,
    pub origin: NodeId,
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: PeerMessage,
}

/// Typed peer-to-peer messages.
///
/// Versioning is additive: receivers tolerate unknown fields, and frames
/// with an unknown `type` decode to `Unknown` and are ignored with a
/// warning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PeerMessage {
    Hello {
        node_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    Put {
        path: String,
        record: Record,
        hop_budget: u32,
    },
    SyncRequest {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<VectorClock>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        paths: Option<Vec<String>>,
        #[serde(default)]
        full: bool,
    },
    SyncResponse {
        request_id: String,
        total_chunks: u32,
        total_entries: u64,
        timestamp: i64,
    },
    SyncChunk {
        request_id: String,
        chunk_index: u32,
        total_chunks: u32,
        entries: Vec<SyncEntry>,
        is_last_chunk: bool,
    },
    SyncProgress {
        request_id: String,
        chunk_index: u32,
        total_chunks: u32,
        progress: f64,
    },
    SyncResume {
        request_id: String,
        missing_chunks: Vec<u32>,
    },
    SyncComplete {
        request_id: String,
    },
    /// Legacy frame from the batched sync dialect; parsed and ignored.
    SyncAck {
        request_id: String,
        batch_index: u32,
        status: String,
    },
    #[serde(other)]
    Unknown,
}

impl PeerMessage {
    /// Sync frames bypass the broadcast queue's overflow drop policy.
    pub fn is_sync(&self) -> bool {
        matches!(
            self,
            PeerMessage::SyncRequest { .. }
                | PeerMessage::SyncResponse { .. }
                | PeerMessage::SyncChunk { .. }
                | PeerMessage::SyncProgress { .. }
                | PeerMessage::SyncResume { .. }
                | PeerMessage::SyncComplete { .. }
                | PeerMessage::SyncAck { .. }
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "hello",
            PeerMessage::Put { .. } => "put",
            PeerMessage::SyncRequest { .. } => "sync-request",
            PeerMessage::SyncResponse { .. } => "sync-response",
            PeerMessage::SyncChunk { .. } => "sync-chunk",
            PeerMessage::SyncProgress { .. } => "sync-progress",
            PeerMessage::SyncResume { .. } => "sync-resume",
            PeerMessage::SyncComplete { .. } => "sync-complete",
            PeerMessage::SyncAck { .. } => "sync-ack",
            PeerMessage::Unknown => "unknown",
        }
    }
}

/// One replicated entry inside a sync chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEntry {
    pub path: String,
    pub record: Record,
}
