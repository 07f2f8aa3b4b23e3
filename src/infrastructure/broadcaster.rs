use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

use crate::config::NetConfig;
use crate::core::message::{Envelope, PeerMessage};
use crate::core::record::{MessageIdGen, NodeId, Record};
use crate::core::time::Clock;
use crate::infrastructure::peer_registry::PeerRegistry;
use crate::infrastructure::transport::{ConnectionId, Transport};

/// Outbound fan-out for the flood overlay.
///
/// Every frame the node sends leaves through here: one bounded queue per
/// connection, drained by a pump task, so a slow peer never blocks commits.
/// When a queue overflows, the oldest non-sync frame is dropped and the peer
/// is flagged for anti-entropy; sync frames are never dropped.
#[derive(Debug)]
pub struct Broadcaster {
    local_id: NodeId,
    config: NetConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<PeerRegistry>,
    ids: Arc<MessageIdGen>,
    time: Arc<dyn Clock>,
    queues: RwLock<HashMap<ConnectionId, Arc<PeerQueue>>>,
    stats: BroadcastCounters,
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct BroadcastCounters {
    broadcasts: AtomicU64,
    forwards: AtomicU64,
    hop_exhausted: AtomicU64,
    queue_drops: AtomicU64,
    send_failures: AtomicU64,
}

/// Counter snapshot for node statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastStats {
    pub broadcasts: u64,
    pub forwards: u64,
    pub hop_exhausted: u64,
    pub queue_drops: u64,
    pub send_failures: u64,
}

#[derive(Debug)]
struct PeerQueue {
    frames: StdMutex<VecDeque<QueuedFrame>>,
    notify: Notify,
    closed: AtomicBool,
}

#[derive(Debug)]
struct QueuedFrame {
    envelope: Envelope,
    sync: bool,
}

impl PeerQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

impl Broadcaster {
    pub fn new(
        local_id: NodeId,
        config: NetConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<PeerRegistry>,
        ids: Arc<MessageIdGen>,
        time: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            config,
            transport,
            registry,
            ids,
            time,
            queues: RwLock::new(HashMap::new()),
            stats: BroadcastCounters::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Attach a queue and pump for a freshly connected peer.
    pub async fn attach(self: &Arc<Self>, conn: ConnectionId) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let queue = PeerQueue::new();
        self.queues.write().await.insert(conn, queue.clone());

        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            broadcaster.pump(conn, queue).await;
        });
    }

    pub async fn detach(&self, conn: ConnectionId) {
        if let Some(queue) = self.queues.write().await.remove(&conn) {
            queue.close();
        }
    }

    async fn pump(&self, conn: ConnectionId, queue: Arc<PeerQueue>) {
        loop {
            let frame = queue.frames.lock().unwrap().pop_front();
            match frame {
                Some(frame) => {
                    if let Err(e) = self.transport.send(conn, &frame.envelope).await {
                        self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                        warn!("send to connection {} failed: {}", conn, e);
                        queue.close();
                        // Tear the session down; reconnect logic takes over.
                        let _ = self.transport.close_conn(conn).await;
                        break;
                    }
                }
                None => {
                    if queue.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    queue.notify.notified().await;
                }
            }
        }
    }

    /// Queue one frame for one connection, applying the overflow policy.
    async fn enqueue(&self, conn: ConnectionId, envelope: Envelope, sync: bool) {
        if self.closed.load(Ordering::SeqCst) && !sync {
            return;
        }
        let queue = match self.queues.read().await.get(&conn) {
            Some(queue) => queue.clone(),
            None => {
                debug!("no queue for connection {}; dropping frame", conn);
                return;
            }
        };

        let mut dropped = false;
        {
            let mut frames = queue.frames.lock().unwrap();
            if frames.len() >= self.config.max_queue {
                if let Some(index) = frames.iter().position(|frame| !frame.sync) {
                    frames.remove(index);
                    dropped = true;
                } else if !sync {
                    // Queue is all sync traffic; shed the incoming frame.
                    self.stats.queue_drops.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            frames.push_back(QueuedFrame { envelope, sync });
        }
        queue.notify.notify_one();

        if dropped {
            self.stats.queue_drops.fetch_add(1, Ordering::Relaxed);
            self.registry.flag_needs_anti_entropy(conn).await;
        }
    }

    /// Send a freshly minted frame to one connection.
    pub async fn send_payload(&self, conn: ConnectionId, payload: PeerMessage) {
        let sync = payload.is_sync();
        let envelope = Envelope {
            msg_id: self.ids.next(),
            origin: self.local_id.clone(),
            timestamp: self.time.now_millis(),
            payload,
        };
        self.enqueue(conn, envelope, sync).await;
    }

    /// Flood an accepted record to every open peer.
    ///
    /// The frame id is the record's commit id, so nodes that already applied
    /// it drop the frame in the de-duplication check. Used for local writes
    /// (full hop budget) and for changes accepted out of a sync stream.
    pub async fn broadcast_record(&self, path: &str, record: &Record, skip: Option<ConnectionId>) {
        let envelope = Envelope {
            msg_id: record.msg_id.clone(),
            origin: record.origin.clone(),
            timestamp: record.timestamp,
            payload: PeerMessage::Put {
                path: path.to_string(),
                record: record.clone(),
                hop_budget: self.config.max_hops,
            },
        };
        self.fan_out(envelope, skip, &record.origin).await;
        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    /// Re-broadcast an accepted flood frame with a decremented hop budget,
    /// skipping the source connection and the record's origin.
    pub async fn forward_put(&self, envelope: &Envelope, from: ConnectionId) {
        let (path, record, hop_budget) = match &envelope.payload {
            PeerMessage::Put {
                path,
                record,
                hop_budget,
            } => (path, record, *hop_budget),
            _ => return,
        };
        if hop_budget == 0 {
            self.stats.hop_exhausted.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let forwarded = Envelope {
            msg_id: envelope.msg_id.clone(),
            origin: envelope.origin.clone(),
            timestamp: envelope.timestamp,
            payload: PeerMessage::Put {
                path: path.clone(),
                record: record.clone(),
                hop_budget: hop_budget - 1,
            },
        };
        self.fan_out(forwarded, Some(from), &record.origin).await;
        self.stats.forwards.fetch_add(1, Ordering::Relaxed);
    }

    async fn fan_out(&self, envelope: Envelope, skip: Option<ConnectionId>, origin: &NodeId) {
        for (peer_id, conn) in self.registry.open_peers().await {
            if Some(conn) == skip || peer_id == *origin {
                continue;
            }
            self.enqueue(conn, envelope.clone(), false).await;
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
            forwards: self.stats.forwards.load(Ordering::Relaxed),
            hop_exhausted: self.stats.hop_exhausted.load(Ordering::Relaxed),
            queue_drops: self.stats.queue_drops.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting non-sync frames and close every pump. Pumps drain what
    /// is already queued before exiting.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let queues: Vec<_> = self.queues.write().await.drain().collect();
        for (_, queue) in queues {
            queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::VectorClock;
    use crate::core::time::SystemClock;
    use crate::infrastructure::transport::{Direction, InMemoryHub, TransportEvent};
    use serde_json::json;

    fn record(origin: &str) -> Record {
        Record {
            value: json!(1),
            vector_clock: VectorClock::new(),
            origin: origin.to_string(),
            timestamp: 1,
            msg_id: format!("{}:0:000001", origin),
            deleted: false,
        }
    }

    async fn harness() -> (
        Arc<Broadcaster>,
        Arc<PeerRegistry>,
        tokio::sync::mpsc::Receiver<TransportEvent>,
        ConnectionId,
        Arc<crate::infrastructure::transport::ChannelTransport>,
    ) {
        let hub = InMemoryHub::new();
        let local = hub.transport("mem://local");
        let remote = hub.transport("mem://remote");
        let remote_events = remote.take_events().await.unwrap();
        let _local_events = local.take_events().await.unwrap();

        let conn = local.dial("mem://remote").await.unwrap();
        let registry = Arc::new(PeerRegistry::new(
            "0000000000000000".to_string(),
            NetConfig::default(),
        ));
        registry.register(conn, Direction::Outbound, None, 1).await;
        registry
            .handle_hello(conn, &"1111111111111111".to_string(), None, 1)
            .await;

        let broadcaster = Broadcaster::new(
            "0000000000000000".to_string(),
            NetConfig::default(),
            local.clone(),
            registry.clone(),
            Arc::new(MessageIdGen::new("0000000000000000".to_string())),
            Arc::new(SystemClock),
        );
        broadcaster.attach(conn).await;
        (broadcaster, registry, remote_events, conn, remote)
    }

    async fn next_message(
        events: &mut tokio::sync::mpsc::Receiver<TransportEvent>,
    ) -> Envelope {
        loop {
            match events.recv().await.expect("event stream ended") {
                TransportEvent::Message { envelope, .. } => return envelope,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_carries_full_hop_budget() {
        let (broadcaster, _registry, mut remote_events, _conn, _remote) = harness().await;
        let record = record("0000000000000000");
        broadcaster.broadcast_record("users/bob", &record, None).await;

        let envelope = next_message(&mut remote_events).await;
        assert_eq!(envelope.msg_id, record.msg_id);
        match envelope.payload {
            PeerMessage::Put {
                hop_budget, path, ..
            } => {
                assert_eq!(hop_budget, 32);
                assert_eq!(path, "users/bob");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forward_decrements_and_skips_origin() {
        let (broadcaster, _registry, mut remote_events, conn, _remote) = harness().await;

        // A frame that originated at the connected peer is not echoed back.
        let from_peer = record("1111111111111111");
        let envelope = Envelope {
            msg_id: from_peer.msg_id.clone(),
            origin: from_peer.origin.clone(),
            timestamp: 1,
            payload: PeerMessage::Put {
                path: "k".to_string(),
                record: from_peer,
                hop_budget: 5,
            },
        };
        broadcaster.forward_put(&envelope, 999).await;

        // A frame from a third node is forwarded with hop_budget - 1.
        let third = record("2222222222222222");
        let envelope = Envelope {
            msg_id: third.msg_id.clone(),
            origin: third.origin.clone(),
            timestamp: 1,
            payload: PeerMessage::Put {
                path: "k".to_string(),
                record: third,
                hop_budget: 5,
            },
        };
        broadcaster.forward_put(&envelope, 999).await;

        let delivered = next_message(&mut remote_events).await;
        assert_eq!(delivered.origin, "2222222222222222");
        match delivered.payload {
            PeerMessage::Put { hop_budget, .. } => assert_eq!(hop_budget, 4),
            other => panic!("unexpected payload {:?}", other),
        }
        // The skipped frame never arrives; only forward stats moved.
        assert_eq!(broadcaster.stats().forwards, 2);
        let _ = conn;
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_oldest_non_sync() {
        let hub = InMemoryHub::new();
        let local = hub.transport("mem://local");
        let registry = Arc::new(PeerRegistry::new(
            "0000000000000000".to_string(),
            NetConfig::default(),
        ));
        let broadcaster = Broadcaster::new(
            "0000000000000000".to_string(),
            NetConfig {
                max_queue: 2,
                ..NetConfig::default()
            },
            local,
            registry,
            Arc::new(MessageIdGen::new("0000000000000000".to_string())),
            Arc::new(SystemClock),
        );
        // Queue with no pump so frames pile up.
        let queue = PeerQueue::new();
        broadcaster.queues.write().await.insert(7, queue.clone());

        let frame = |id: &str, payload: PeerMessage| Envelope {
            msg_id: id.to_string(),
            origin: "0000000000000000".to_string(),
            timestamp: 1,
            payload,
        };
        let put = PeerMessage::Put {
            path: "k".to_string(),
            record: record("0000000000000000"),
            hop_budget: 1,
        };
        let sync = PeerMessage::SyncComplete {
            request_id: "r".to_string(),
        };

        broadcaster.enqueue(7, frame("m1", put.clone()), false).await;
        broadcaster.enqueue(7, frame("m2", sync.clone()), true).await;
        // Overflow: each new frame sheds the oldest non-sync one; the sync
        // frame is never dropped.
        broadcaster.enqueue(7, frame("m3", put.clone()), false).await;
        broadcaster.enqueue(7, frame("m4", put), false).await;

        let ids: Vec<_> = queue
            .frames
            .lock()
            .unwrap()
            .iter()
            .map(|frame| frame.envelope.msg_id.clone())
            .collect();
        assert_eq!(ids, vec!["m2", "m4"]);
        assert_eq!(broadcaster.stats().queue_drops, 2);
    }

    #[tokio::test]
    async fn test_exhausted_hop_budget_is_not_forwarded() {
        let (broadcaster, _registry, _remote_events, _conn, _remote) = harness().await;
        let third = record("2222222222222222");
        let envelope = Envelope {
            msg_id: third.msg_id.clone(),
            origin: third.origin.clone(),
            timestamp: 1,
            payload: PeerMessage::Put {
                path: "k".to_string(),
                record: third,
                hop_budget: 0,
            },
        };
        broadcaster.forward_put(&envelope, 999).await;
        assert_eq!(broadcaster.stats().forwards, 0);
        assert_eq!(broadcaster.stats().hop_exhausted, 1);
    }
}
