use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::config::NodeConfig;
use crate::core::clock::VectorClock;
use crate::core::message::{Envelope, PeerMessage};
use crate::core::path::Path;
use crate::core::record::{generate_node_id, MessageIdGen, NodeId, Record};
use crate::core::time::{Clock, SystemClock};
use crate::error::{MeshError, MeshResult};
use crate::infrastructure::broadcaster::{BroadcastStats, Broadcaster};
use crate::infrastructure::peer_registry::{HelloOutcome, PeerRegistry, PeerSession};
use crate::infrastructure::pipeline::CommitPipeline;
use crate::infrastructure::resolver::{ConflictResolver, CustomResolver};
use crate::infrastructure::storage::Storage;
use crate::infrastructure::store::Store;
use crate::infrastructure::store_writer::default_writer_chain;
use crate::infrastructure::subscriptions::{SubscriptionHandle, SubscriptionManager};
use crate::infrastructure::sync_engine::{AntiEntropyReport, SyncEngine, SyncStats};
use crate::infrastructure::transport::{
    ConnectionId, Direction, Transport, TransportEvent,
};

/// Grace given to in-flight syncs during shutdown.
const SHUTDOWN_SYNC_GRACE: Duration = Duration::from_secs(2);
/// Poll period of the per-URL reconnect loops while a session is healthy.
const RECONNECT_PROBE: Duration = Duration::from_secs(1);

const STATE_RUNNING: u8 = 0;
const STATE_SHUTTING_DOWN: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// What a successful `put` returns.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PutReceipt {
    pub path: String,
    pub value: Value,
    pub timestamp: i64,
    pub vector_clock: VectorClock,
}

/// Point-in-time node statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub node_id: NodeId,
    pub started_at: DateTime<Utc>,
    pub clock: VectorClock,
    pub store_entries: usize,
    pub subscriptions: usize,
    pub peers: Vec<PeerSession>,
    pub broadcast: BroadcastStats,
    pub sync: SyncStats,
}

/// The embeddable replication node: the facade over the store, resolver,
/// peer overlay, and anti-entropy engine.
///
/// Cheap to clone; all clones share one underlying node. The host owns
/// lifecycle: `Node::start` brings everything up, `close` tears it down.
/// Signal handling stays with the host.
#[derive(Debug, Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

#[derive(Debug)]
struct NodeInner {
    id: NodeId,
    config: NodeConfig,
    started_at: DateTime<Utc>,
    time: Arc<dyn Clock>,
    store: Arc<Store>,
    pipeline: Arc<CommitPipeline>,
    resolver: Arc<ConflictResolver>,
    subscriptions: Arc<SubscriptionManager>,
    registry: Arc<PeerRegistry>,
    broadcaster: Arc<Broadcaster>,
    sync: Arc<SyncEngine>,
    transport: Arc<dyn Transport>,
    state: AtomicU8,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Start a node on the system clock.
    pub async fn start(
        config: NodeConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
    ) -> MeshResult<Node> {
        Self::start_with_clock(config, storage, transport, Arc::new(SystemClock)).await
    }

    /// Start a node with an explicit time source (tests shift it).
    pub async fn start_with_clock(
        config: NodeConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        time: Arc<dyn Clock>,
    ) -> MeshResult<Node> {
        let id = match &config.node_id {
            Some(id) => id.clone(),
            None => generate_node_id(),
        };
        info!("starting node {}", id);

        let store = Arc::new(Store::open(storage, config.store.clone()).await?);
        let resolver = Arc::new(ConflictResolver::from_config(&config.conflict)?);
        let subscriptions = Arc::new(SubscriptionManager::new());
        let ids = Arc::new(MessageIdGen::new(id.clone()));
        let recovered_clock = store.summary_clock().await;
        let pipeline = Arc::new(CommitPipeline::new(
            id.clone(),
            time.clone(),
            ids.clone(),
            store.clone(),
            default_writer_chain(store.clone()),
            resolver.clone(),
            subscriptions.clone(),
            recovered_clock,
        ));
        let registry = Arc::new(PeerRegistry::new(id.clone(), config.net.clone()));
        let broadcaster = Broadcaster::new(
            id.clone(),
            config.net.clone(),
            transport.clone(),
            registry.clone(),
            ids,
            time.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sync = SyncEngine::new(
            config.sync.clone(),
            store.clone(),
            pipeline.clone(),
            registry.clone(),
            broadcaster.clone(),
            time.clone(),
            shutdown_rx.clone(),
        );

        transport.start().await?;
        let events = transport.take_events().await.ok_or_else(|| {
            MeshError::Internal("transport event stream already taken".to_string())
        })?;

        let node = Node {
            inner: Arc::new(NodeInner {
                id,
                config,
                started_at: Utc::now(),
                time,
                store,
                pipeline,
                resolver,
                subscriptions,
                registry,
                broadcaster,
                sync,
                transport,
                state: AtomicU8::new(STATE_RUNNING),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(node.clone().event_loop(events)));
        for url in node.inner.config.peers.clone() {
            tasks.push(tokio::spawn(node.clone().maintain_peer(url)));
        }
        *node.inner.tasks.lock().await = tasks;

        node.inner.sync.start_periodic();
        Ok(node)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.id
    }

    fn ensure_running(&self) -> MeshResult<()> {
        if self.inner.state.load(Ordering::SeqCst) != STATE_RUNNING {
            return Err(MeshError::ShuttingDown);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Host API
    // -----------------------------------------------------------------

    /// Commit a local write and flood it to the overlay. Returns once the
    /// commit is durable.
    #[instrument(skip(self, value))]
    pub async fn put(&self, path: &str, value: Value) -> MeshResult<PutReceipt> {
        self.ensure_running()?;
        let path = Path::parse(path)?;
        let commit = self
            .inner
            .pipeline
            .commit_local(&path, value, false)
            .await?;
        // Remember our own frame id so the echo is dropped, then flood.
        self.inner
            .registry
            .seen_before(&commit.record.msg_id)
            .await;
        self.inner
            .broadcaster
            .broadcast_record(path.as_str(), &commit.record, None)
            .await;
        Ok(PutReceipt {
            path: path.as_str().to_string(),
            value: commit.record.value.clone(),
            timestamp: commit.record.timestamp,
            vector_clock: commit.record.vector_clock.clone(),
        })
    }

    /// Read a value; absent and tombstoned paths are both `None`.
    pub async fn get(&self, path: &str) -> MeshResult<Option<Value>> {
        let path = Path::parse(path)?;
        Ok(self.inner.store.get(&path).await)
    }

    /// Delete a path (a tombstone write). Returns whether a live value
    /// existed.
    #[instrument(skip(self))]
    pub async fn del(&self, path: &str) -> MeshResult<bool> {
        self.ensure_running()?;
        let path = Path::parse(path)?;
        let commit = self
            .inner
            .pipeline
            .commit_local(&path, Value::Null, true)
            .await?;
        self.inner
            .registry
            .seen_before(&commit.record.msg_id)
            .await;
        self.inner
            .broadcaster
            .broadcast_record(path.as_str(), &commit.record, None)
            .await;
        Ok(commit.existed)
    }

    /// Ordered `{path, value}` pairs under a prefix.
    pub async fn scan(
        &self,
        prefix: &str,
        limit: Option<usize>,
    ) -> MeshResult<Vec<(String, Value)>> {
        let prefix = Path::parse(prefix)?;
        Ok(self.inner.store.scan(&prefix, limit).await)
    }

    /// Subscribe to commits under a prefix. The handle unsubscribes.
    pub fn subscribe<F>(&self, prefix: &str, callback: F) -> MeshResult<SubscriptionHandle>
    where
        F: Fn(Option<&Value>, &str) + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let prefix = Path::parse(prefix)?;
        Ok(self
            .inner
            .subscriptions
            .subscribe(prefix.as_str(), Arc::new(callback)))
    }

    /// Newest-first version history for a path.
    pub async fn version_history(&self, path: &str) -> MeshResult<Vec<Record>> {
        let path = Path::parse(path)?;
        Ok(self.inner.store.history_of(&path).await)
    }

    /// Swap the named strategy for a path prefix at runtime.
    pub fn set_conflict_strategy(&self, prefix: &str, strategy: &str) -> MeshResult<()> {
        let prefix = Path::parse(prefix)?;
        self.inner.resolver.set_strategy(prefix.as_str(), strategy)
    }

    /// Install a custom resolver function for a path prefix.
    pub fn register_conflict_resolver(
        &self,
        prefix: &str,
        resolver: CustomResolver,
    ) -> MeshResult<()> {
        let prefix = Path::parse(prefix)?;
        self.inner
            .resolver
            .register_custom(prefix.as_str(), resolver);
        Ok(())
    }

    /// Sync with every open peer now, optionally scoped to a prefix, and
    /// wait for all sessions to settle.
    pub async fn run_anti_entropy(&self, prefix: Option<&str>) -> MeshResult<AntiEntropyReport> {
        self.ensure_running()?;
        let prefixes = match prefix {
            Some(prefix) => Some(vec![Path::parse(prefix)?.as_str().to_string()]),
            None => None,
        };
        Ok(self.inner.sync.run_anti_entropy(prefixes).await)
    }

    pub async fn stats(&self) -> NodeStats {
        NodeStats {
            node_id: self.inner.id.clone(),
            started_at: self.inner.started_at,
            clock: self.inner.pipeline.current_clock().await,
            store_entries: self.inner.store.len().await,
            subscriptions: self.inner.subscriptions.len(),
            peers: self.inner.registry.sessions_snapshot().await,
            broadcast: self.inner.broadcaster.stats(),
            sync: self.inner.sync.stats(),
        }
    }

    /// Orderly shutdown: refuse new writes, let syncs settle briefly, close
    /// outbound then inbound sessions, flush storage. A second close is a
    /// no-op.
    pub async fn close(&self) -> MeshResult<()> {
        if self
            .inner
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_SHUTTING_DOWN,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }
        info!("node {} shutting down", self.inner.id);
        let _ = self.inner.shutdown_tx.send(true);

        self.inner.sync.graceful_shutdown(SHUTDOWN_SYNC_GRACE).await;
        self.inner.broadcaster.close().await;

        // Outbound sessions first, then inbound.
        let mut sessions = self.inner.registry.sessions_snapshot().await;
        sessions.sort_by_key(|session| match session.direction {
            Direction::Outbound => 0,
            Direction::Inbound => 1,
        });
        for session in sessions {
            self.inner.registry.mark_closing(session.conn).await;
            let _ = self.inner.transport.close_conn(session.conn).await;
        }
        self.inner.transport.shutdown().await?;
        self.inner.store.close().await?;

        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
        info!("node {} closed", self.inner.id);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------

    async fn event_loop(self, mut events: mpsc::Receiver<TransportEvent>) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        debug!("event loop for node {} stopped", self.inner.id);
    }

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { conn, direction } => {
                let now = self.inner.time.now_millis();
                self.inner.registry.register(conn, direction, None, now).await;
                self.inner.broadcaster.attach(conn).await;
                self.inner
                    .broadcaster
                    .send_payload(
                        conn,
                        PeerMessage::Hello {
                            node_id: self.inner.id.clone(),
                            url: self.inner.config.public_url.clone(),
                        },
                    )
                    .await;
            }
            TransportEvent::Message { conn, envelope } => {
                self.inner
                    .registry
                    .touch(conn, self.inner.time.now_millis())
                    .await;
                self.handle_message(conn, envelope).await;
            }
            TransportEvent::Disconnected { conn } => {
                self.inner.broadcaster.detach(conn).await;
                if let Some(session) = self.inner.registry.mark_disconnected(conn).await {
                    if let Some(peer_id) = session.peer_id {
                        debug!("peer {} disconnected", peer_id);
                        self.inner.sync.on_peer_disconnected(&peer_id).await;
                    }
                }
            }
        }
    }

    async fn handle_message(&self, conn: ConnectionId, envelope: Envelope) {
        match envelope.payload.clone() {
            PeerMessage::Hello { node_id, url } => {
                self.handle_hello(conn, node_id, url).await;
            }
            PeerMessage::Put { path, record, .. } => {
                self.handle_put(conn, &envelope, path, record).await;
            }
            PeerMessage::SyncRequest {
                request_id,
                since,
                paths,
                full,
            } => {
                if let Some(peer_id) = self.inner.registry.peer_of(conn).await {
                    self.inner
                        .sync
                        .handle_sync_request(&peer_id, conn, request_id, since, paths, full)
                        .await;
                }
            }
            PeerMessage::SyncResponse {
                request_id,
                total_chunks,
                total_entries,
                ..
            } => {
                if let Some(peer_id) = self.inner.registry.peer_of(conn).await {
                    self.inner
                        .sync
                        .handle_sync_response(&peer_id, &request_id, total_chunks, total_entries)
                        .await;
                }
            }
            PeerMessage::SyncChunk {
                request_id,
                chunk_index,
                total_chunks,
                entries,
                ..
            } => {
                if let Some(peer_id) = self.inner.registry.peer_of(conn).await {
                    self.inner
                        .sync
                        .handle_sync_chunk(
                            &peer_id,
                            &request_id,
                            chunk_index,
                            total_chunks,
                            entries,
                        )
                        .await;
                }
            }
            PeerMessage::SyncProgress {
                request_id,
                chunk_index,
                total_chunks,
                ..
            } => {
                if let Some(peer_id) = self.inner.registry.peer_of(conn).await {
                    self.inner
                        .sync
                        .handle_sync_progress(&peer_id, &request_id, chunk_index, total_chunks)
                        .await;
                }
            }
            PeerMessage::SyncResume {
                request_id,
                missing_chunks,
            } => {
                if let Some(peer_id) = self.inner.registry.peer_of(conn).await {
                    self.inner
                        .sync
                        .handle_sync_resume(&peer_id, conn, request_id, missing_chunks)
                        .await;
                }
            }
            PeerMessage::SyncComplete { request_id } => {
                if let Some(peer_id) = self.inner.registry.peer_of(conn).await {
                    self.inner
                        .sync
                        .handle_sync_complete(&peer_id, &request_id)
                        .await;
                }
            }
            PeerMessage::SyncAck { .. } => {
                debug!("ignoring legacy sync-ack frame from connection {}", conn);
            }
            PeerMessage::Unknown => {
                warn!(
                    "ignoring unknown message type from connection {} (msg {})",
                    conn, envelope.msg_id
                );
            }
        }
    }

    async fn handle_hello(&self, conn: ConnectionId, node_id: NodeId, url: Option<String>) {
        let now = self.inner.time.now_millis();
        match self
            .inner
            .registry
            .handle_hello(conn, &node_id, url, now)
            .await
        {
            HelloOutcome::Accepted { peer_id, replaced } => {
                if let Some(replaced) = replaced {
                    self.inner.broadcaster.detach(replaced).await;
                    let _ = self.inner.transport.close_conn(replaced).await;
                }
                self.inner.sync.on_peer_open(peer_id, conn);
            }
            HelloOutcome::RejectedSelf | HelloOutcome::RejectedDuplicate => {
                self.inner.broadcaster.detach(conn).await;
                let _ = self.inner.transport.close_conn(conn).await;
            }
            HelloOutcome::UnknownConnection => {
                warn!("hello for untracked connection {}", conn);
            }
        }
    }

    async fn handle_put(
        &self,
        conn: ConnectionId,
        envelope: &Envelope,
        path: String,
        record: Record,
    ) {
        // Duplicate frames die here, before any application.
        if self.inner.registry.seen_before(&envelope.msg_id).await {
            return;
        }
        let parsed = match Path::parse(&path) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("dropping put with invalid path '{}': {}", path, e);
                return;
            }
        };
        match self.inner.pipeline.apply_remote(&parsed, &record).await {
            Ok(resolution) => {
                // Re-broadcast is gated by the hop budget; application above
                // was the resolver's call alone.
                if resolution.changed {
                    self.inner.broadcaster.forward_put(envelope, conn).await;
                }
            }
            Err(e) => {
                warn!("failed to apply update for '{}': {}", path, e);
            }
        }
    }

    // -----------------------------------------------------------------
    // Outbound connection upkeep
    // -----------------------------------------------------------------

    /// Keep one configured peer URL dialed, with exponential backoff capped
    /// at `reconnect_max_ms`. Stops only at shutdown (or when the URL turns
    /// out to be this node).
    async fn maintain_peer(self, url: String) {
        let initial = self.inner.config.net.reconnect_initial_ms;
        let cap = self.inner.config.net.reconnect_max_ms;
        let mut backoff = initial;
        let mut shutdown = self.inner.shutdown_tx.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.inner.registry.is_self_url(&url).await {
                break;
            }
            if self.inner.registry.has_session_for_url(&url).await {
                backoff = initial;
                tokio::select! {
                    _ = sleep(RECONNECT_PROBE) => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            }

            match self.inner.transport.dial(&url).await {
                Ok(conn) => {
                    debug!("dialed {} on connection {}", url, conn);
                    self.inner
                        .registry
                        .register(
                            conn,
                            Direction::Outbound,
                            Some(url.clone()),
                            self.inner.time.now_millis(),
                        )
                        .await;
                    backoff = initial;
                }
                Err(e) => {
                    debug!("dial {} failed: {}; retrying in {} ms", url, e, backoff);
                    tokio::select! {
                        _ = sleep(Duration::from_millis(backoff)) => {}
                        _ = shutdown.changed() => break,
                    }
                    backoff = (backoff * 2).min(cap);
                }
            }
        }
    }
}
