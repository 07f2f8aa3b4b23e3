// Replication infrastructure: storage, peers, flood overlay, anti-entropy

pub mod broadcaster;
pub mod peer_registry;
pub mod pipeline;
pub mod resolver;
pub mod storage;
pub mod store;
pub mod store_writer;
pub mod subscriptions;
pub mod sync_engine;
pub mod transport;

pub use broadcaster::{BroadcastStats, Broadcaster};
pub use peer_registry::{HelloOutcome, PeerRegistry, PeerSession, PeerState};
pub use pipeline::CommitPipeline;
pub use resolver::{ConflictResolver, CustomResolver, Resolution, Strategy};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use store::Store;
pub use store_writer::{
    default_writer_chain, LoggingWriter, StoreCommitWriter, StoreWriter, ValidatingWriter,
};
pub use subscriptions::{SubscriberFn, SubscriptionHandle, SubscriptionManager};
pub use sync_engine::{AntiEntropyReport, SyncEngine, SyncStats};
pub use transport::{
    ChannelTransport, ConnectionId, Direction, InMemoryHub, TcpTransport, Transport,
    TransportEvent,
};
