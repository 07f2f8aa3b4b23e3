// meshkv - embeddable peer-to-peer key-value replication engine
//
// Every node holds a full copy of a hierarchical key-value store; writes are
// accepted anywhere, flooded over a gossip overlay, reconciled per path by
// pluggable conflict strategies, and re-converged in the background by
// pull-based anti-entropy.

// Core value types: paths, vector clocks, records, wire frames
pub mod core;

// Infrastructure: storage, store, resolver, peers, broadcast, sync
pub mod infrastructure;

// The embeddable node facade
pub mod node;

// Common utilities
pub mod config;
pub mod error;

// Re-exports for convenience
pub use crate::config::{ConflictConfig, NetConfig, NodeConfig, StoreConfig, SyncConfig};
pub use crate::core::{
    Clock, ClockOrdering, Envelope, MessageIdGen, NodeId, OffsetClock, Path, PeerMessage, Record,
    RecordMeta, SyncEntry, SystemClock, VectorClock,
};
pub use crate::error::{MeshError, MeshResult};
pub use crate::infrastructure::{
    AntiEntropyReport, ChannelTransport, ConnectionId, CustomResolver, FileStorage, InMemoryHub,
    MemoryStorage, Storage, Strategy, SubscriptionHandle, TcpTransport, Transport,
};
pub use crate::node::{Node, NodeStats, PutReceipt};
