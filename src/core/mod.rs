// Core value types shared across the replication engine

pub mod clock;
pub mod message;
pub mod path;
pub mod record;
pub mod time;

pub use clock::{ClockOrdering, VectorClock};
pub use message::{Envelope, PeerMessage, SyncEntry};
pub use path::{path_is_under, Path};
pub use record::{generate_node_id, MessageIdGen, NodeId, Record, RecordMeta};
pub use time::{current_time_millis, Clock, OffsetClock, SystemClock};
