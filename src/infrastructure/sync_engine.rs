use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::core::clock::VectorClock;
use crate::core::message::{PeerMessage, SyncEntry};
use crate::core::path::Path;
use crate::core::record::NodeId;
use crate::core::time::Clock;
use crate::error::MeshResult;
use crate::infrastructure::broadcaster::Broadcaster;
use crate::infrastructure::peer_registry::PeerRegistry;
use crate::infrastructure::pipeline::CommitPipeline;
use crate::infrastructure::store::Store;
use crate::infrastructure::transport::ConnectionId;

/// Delay between a peer handshake completing and the first sync with it.
const ON_OPEN_SYNC_DELAY: Duration = Duration::from_secs(1);
/// Emit a progress frame every this many chunks on long pushes.
const PROGRESS_EVERY_CHUNKS: u32 = 10;

/// Pull-side state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullPhase {
    Requested,
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug)]
struct PullState {
    request_id: String,
    conn: ConnectionId,
    phase: PullPhase,
    total_chunks: Option<u32>,
    received: HashSet<u32>,
    entries_applied: u64,
    deadline: Instant,
}

/// One in-flight pull from a peer; the driver task and the message handlers
/// meet at this handle. Progress is signalled over a watch channel so every
/// waiter keeps its own change cursor and no wakeup is lost.
#[derive(Debug)]
struct PullHandle {
    state: StdMutex<PullState>,
    progress: watch::Sender<u64>,
}

impl PullHandle {
    fn settled(&self) -> Option<bool> {
        match self.state.lock().unwrap().phase {
            PullPhase::Complete => Some(true),
            PullPhase::Failed => Some(false),
            _ => None,
        }
    }

    fn wake(&self) {
        self.progress.send_modify(|version| *version += 1);
    }
}

/// One in-flight push to a peer; the chunk snapshot is retained so a
/// sync-resume can re-send missing chunks without recomputing the feed.
#[derive(Debug)]
struct PushState {
    request_id: String,
    chunks: Arc<Vec<Vec<SyncEntry>>>,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct SyncCounters {
    runs: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    entries_applied: AtomicU64,
    requests_served: AtomicU64,
    chunks_sent: AtomicU64,
}

/// Counter snapshot for node statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub runs: u64,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
    pub entries_applied: u64,
    pub requests_served: u64,
    pub chunks_sent: u64,
}

/// Outcome of one `run_anti_entropy` invocation.
#[derive(Debug, Clone, Serialize)]
pub struct AntiEntropyReport {
    pub peers: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Anti-entropy engine: periodic, on-connect, and manual reconciliation.
///
/// Pull-based: the initiator advertises its causal clock, the responder
/// streams back every record that clock does not dominate, in bounded
/// chunks, and the initiator applies them through the resolver. Missing
/// chunks are recovered with sync-resume; whole attempts are retried up to
/// `max_attempts` before the peer is marked failed until its next connect.
#[derive(Debug)]
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<Store>,
    pipeline: Arc<CommitPipeline>,
    registry: Arc<PeerRegistry>,
    broadcaster: Arc<Broadcaster>,
    time: Arc<dyn Clock>,
    pulls: Mutex<HashMap<NodeId, Arc<PullHandle>>>,
    pushes: Mutex<HashMap<NodeId, PushState>>,
    /// Peers whose last sync exhausted its retries; periodic sync skips them
    /// until they reconnect.
    failed_peers: Mutex<HashSet<NodeId>>,
    stats: SyncCounters,
    shutdown: watch::Receiver<bool>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        store: Arc<Store>,
        pipeline: Arc<CommitPipeline>,
        registry: Arc<PeerRegistry>,
        broadcaster: Arc<Broadcaster>,
        time: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            pipeline,
            registry,
            broadcaster,
            time,
            pulls: Mutex::new(HashMap::new()),
            pushes: Mutex::new(HashMap::new()),
            failed_peers: Mutex::new(HashSet::new()),
            stats: SyncCounters::default(),
            shutdown,
        })
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn whole_sync_timeout(&self, chunks: u32) -> Duration {
        let floor = Duration::from_millis(self.config.initial_timeout_ms);
        floor.max(Duration::from_secs(chunks as u64))
    }

    // -----------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------

    /// Periodic trigger: every `interval`, sync each open peer whose last
    /// sync is older than half the interval.
    pub fn start_periodic(self: &Arc<Self>) {
        let interval_ms = match self.config.interval_ms {
            Some(interval_ms) => interval_ms,
            None => {
                debug!("periodic sync disabled; manual anti-entropy only");
                return;
            }
        };
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                engine.periodic_round(interval_ms).await;
            }
        });
    }

    async fn periodic_round(self: &Arc<Self>, interval_ms: u64) {
        let now = self.time.now_millis();
        let failed = self.failed_peers.lock().await.clone();
        for (peer_id, conn) in self.registry.open_peers().await {
            if failed.contains(&peer_id) {
                continue;
            }
            let fresh = match self.registry.session(conn).await.and_then(|s| s.last_sync_at) {
                Some(last_sync) => now - last_sync < (interval_ms / 2) as i64,
                None => false,
            };
            if fresh {
                continue;
            }
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.sync_with_peer(peer_id, conn, None).await;
            });
        }
    }

    /// On-connect trigger: schedule a sync shortly after the handshake.
    pub fn on_peer_open(self: &Arc<Self>, peer_id: NodeId, conn: ConnectionId) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.failed_peers.lock().await.remove(&peer_id);
            sleep(ON_OPEN_SYNC_DELAY).await;
            if !engine.shutting_down() {
                engine.sync_with_peer(peer_id, conn, None).await;
            }
        });
    }

    /// Manual trigger: sync every open peer, optionally scoped to prefixes,
    /// and settle all sessions before returning.
    #[instrument(skip(self))]
    pub async fn run_anti_entropy(
        self: &Arc<Self>,
        prefixes: Option<Vec<String>>,
    ) -> AntiEntropyReport {
        let peers = self.registry.open_peers().await;
        let mut futures = Vec::new();
        for (peer_id, conn) in peers.iter().cloned() {
            let engine = Arc::clone(self);
            let prefixes = prefixes.clone();
            futures.push(async move { engine.sync_with_peer(peer_id, conn, prefixes).await });
        }
        let outcomes = futures::future::join_all(futures).await;
        let completed = outcomes.iter().filter(|ok| **ok).count();
        AntiEntropyReport {
            peers: peers.len(),
            completed,
            failed: peers.len() - completed,
        }
    }

    /// Drop-in shutdown: give in-flight pulls a short grace to settle.
    pub async fn graceful_shutdown(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            if self.pulls.lock().await.is_empty() || Instant::now() >= deadline {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        let pushes: Vec<_> = {
            let mut pushes = self.pushes.lock().await;
            pushes.drain().collect()
        };
        for (_, push) in pushes {
            push.task.abort();
        }
    }

    // -----------------------------------------------------------------
    // Pull side (initiator)
    // -----------------------------------------------------------------

    /// Run one sync with a peer; returns true when the pull completed.
    /// A second caller for the same peer awaits the in-flight pull instead
    /// of starting another.
    pub async fn sync_with_peer(
        self: &Arc<Self>,
        peer_id: NodeId,
        conn: ConnectionId,
        prefixes: Option<Vec<String>>,
    ) -> bool {
        let handle = {
            let mut pulls = self.pulls.lock().await;
            if let Some(existing) = pulls.get(&peer_id) {
                let existing = existing.clone();
                drop(pulls);
                return self.await_settled(&existing).await;
            }
            let (progress, _) = watch::channel(0);
            let handle = Arc::new(PullHandle {
                state: StdMutex::new(PullState {
                    request_id: Uuid::new_v4().to_string(),
                    conn,
                    phase: PullPhase::Requested,
                    total_chunks: None,
                    received: HashSet::new(),
                    entries_applied: 0,
                    deadline: Instant::now()
                        + Duration::from_millis(self.config.initial_timeout_ms),
                }),
                progress,
            });
            pulls.insert(peer_id.clone(), handle.clone());
            handle
        };

        self.stats.runs.fetch_add(1, Ordering::Relaxed);
        let completed = self.drive_pull(&peer_id, &handle, prefixes).await;
        self.pulls.lock().await.remove(&peer_id);
        // Release anyone who piggybacked on this pull.
        handle.wake();

        if completed {
            let entries_applied = handle.state.lock().unwrap().entries_applied;
            debug!(
                "sync with {} complete; {} entries applied",
                peer_id, entries_applied
            );
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
            self.registry
                .set_last_sync(&peer_id, self.time.now_millis())
                .await;
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            self.failed_peers.lock().await.insert(peer_id.clone());
            info!("sync with {} failed; deferring to next connect", peer_id);
        }
        completed
    }

    async fn drive_pull(
        &self,
        peer_id: &NodeId,
        handle: &Arc<PullHandle>,
        prefixes: Option<Vec<String>>,
    ) -> bool {
        let mut attempt: u32 = 1;
        let mut progress = self.subscribe(handle);
        let mut shutdown = self.shutdown.clone();
        self.send_request(handle, &prefixes).await;

        loop {
            if let Some(completed) = handle.settled() {
                return completed;
            }
            if self.shutting_down() {
                handle.state.lock().unwrap().phase = PullPhase::Failed;
                return false;
            }

            let deadline = handle.state.lock().unwrap().deadline;
            tokio::select! {
                _ = progress.changed() => continue,
                _ = shutdown.changed() => continue,
                _ = sleep_until(deadline) => {}
            }
            // The deadline may have been pushed out while we slept.
            if handle.state.lock().unwrap().deadline > Instant::now() {
                continue;
            }

            if attempt >= self.config.max_attempts {
                warn!("sync with {} timed out after {} attempts", peer_id, attempt);
                handle.state.lock().unwrap().phase = PullPhase::Failed;
                return false;
            }
            attempt += 1;
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = sleep(Duration::from_millis(self.config.retry_interval_ms)) => {}
                _ = shutdown.changed() => {}
            }
            if self.shutting_down() {
                handle.state.lock().unwrap().phase = PullPhase::Failed;
                return false;
            }

            // Resume when partial progress exists, else start afresh.
            let resume = {
                let state = handle.state.lock().unwrap();
                match state.total_chunks {
                    Some(total) if !state.received.is_empty() => Some(
                        (0..total)
                            .filter(|index| !state.received.contains(index))
                            .collect::<Vec<_>>(),
                    ),
                    _ => None,
                }
            };
            match resume {
                Some(missing) => {
                    debug!(
                        "resuming sync with {} ({} chunks missing)",
                        peer_id,
                        missing.len()
                    );
                    let (conn, request_id) = {
                        let mut state = handle.state.lock().unwrap();
                        state.deadline =
                            Instant::now() + self.whole_sync_timeout(missing.len() as u32);
                        (state.conn, state.request_id.clone())
                    };
                    self.broadcaster
                        .send_payload(
                            conn,
                            PeerMessage::SyncResume {
                                request_id,
                                missing_chunks: missing,
                            },
                        )
                        .await;
                }
                None => {
                    debug!("restarting sync with {} (attempt {})", peer_id, attempt);
                    {
                        let mut state = handle.state.lock().unwrap();
                        state.request_id = Uuid::new_v4().to_string();
                        state.phase = PullPhase::Requested;
                        state.total_chunks = None;
                        state.received.clear();
                        state.deadline = Instant::now()
                            + Duration::from_millis(self.config.initial_timeout_ms);
                    }
                    self.send_request(handle, &prefixes).await;
                }
            }
        }
    }

    async fn send_request(&self, handle: &Arc<PullHandle>, prefixes: &Option<Vec<String>>) {
        let (conn, request_id) = {
            let state = handle.state.lock().unwrap();
            (state.conn, state.request_id.clone())
        };
        let summary = self.pipeline.current_clock().await;
        let since = (!summary.is_zero()).then_some(summary);
        let full = since.is_none();
        self.broadcaster
            .send_payload(
                conn,
                PeerMessage::SyncRequest {
                    request_id,
                    since,
                    paths: prefixes.clone(),
                    full,
                },
            )
            .await;
    }

    async fn pull_handle_for(&self, peer_id: &NodeId, request_id: &str) -> Option<Arc<PullHandle>> {
        let pulls = self.pulls.lock().await;
        let handle = pulls.get(peer_id)?;
        let matches = handle.state.lock().unwrap().request_id == request_id;
        matches.then(|| handle.clone())
    }

    pub async fn handle_sync_response(
        &self,
        peer_id: &NodeId,
        request_id: &str,
        total_chunks: u32,
        total_entries: u64,
    ) {
        let handle = match self.pull_handle_for(peer_id, request_id).await {
            Some(handle) => handle,
            None => {
                debug!("stale sync-response from {}", peer_id);
                return;
            }
        };
        debug!(
            "sync with {}: {} entries in {} chunks",
            peer_id, total_entries, total_chunks
        );
        {
            let mut state = handle.state.lock().unwrap();
            state.phase = PullPhase::InProgress;
            state.total_chunks = Some(total_chunks);
            state.deadline = Instant::now() + self.whole_sync_timeout(total_chunks);
        }
        handle.wake();
    }

    pub async fn handle_sync_chunk(
        &self,
        peer_id: &NodeId,
        request_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        entries: Vec<SyncEntry>,
    ) {
        let handle = match self.pull_handle_for(peer_id, request_id).await {
            Some(handle) => handle,
            None => {
                debug!("stale sync-chunk from {}", peer_id);
                return;
            }
        };
        let conn = handle.state.lock().unwrap().conn;

        let mut applied: u64 = 0;
        for entry in entries {
            match self.apply_entry(conn, &entry).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    // One bad entry never aborts the stream.
                    warn!("skipping sync entry '{}': {}", entry.path, e);
                }
            }
        }
        self.stats.entries_applied.fetch_add(applied, Ordering::Relaxed);

        {
            let mut state = handle.state.lock().unwrap();
            state.phase = PullPhase::InProgress;
            state.total_chunks.get_or_insert(total_chunks);
            state.received.insert(chunk_index);
            state.entries_applied += applied;
        }
        handle.wake();
    }

    async fn apply_entry(&self, from_conn: ConnectionId, entry: &SyncEntry) -> MeshResult<()> {
        let path = Path::parse(&entry.path)?;
        let resolution = self.pipeline.apply_remote(&path, &entry.record).await?;
        if resolution.changed {
            // An accepted entry re-enters the flood under its own commit id,
            // so neighbours that missed it converge without their own pull;
            // nodes that saw it drop the frame in the de-dup check.
            self.registry.seen_before(&resolution.record.msg_id).await;
            self.broadcaster
                .broadcast_record(&entry.path, &resolution.record, Some(from_conn))
                .await;
        }
        Ok(())
    }

    pub async fn handle_sync_progress(
        &self,
        peer_id: &NodeId,
        request_id: &str,
        chunk_index: u32,
        total_chunks: u32,
    ) {
        if self.pull_handle_for(peer_id, request_id).await.is_some() {
            debug!(
                "sync with {}: {}/{} chunks",
                peer_id,
                chunk_index + 1,
                total_chunks
            );
        }
    }

    pub async fn handle_sync_complete(&self, peer_id: &NodeId, request_id: &str) {
        let handle = match self.pull_handle_for(peer_id, request_id).await {
            Some(handle) => handle,
            None => return,
        };

        let resume = {
            let mut state = handle.state.lock().unwrap();
            let total = state.total_chunks.unwrap_or(0);
            let missing: Vec<u32> = (0..total)
                .filter(|index| !state.received.contains(index))
                .collect();
            if missing.is_empty() {
                state.phase = PullPhase::Complete;
                None
            } else {
                state.deadline = Instant::now() + self.whole_sync_timeout(missing.len() as u32);
                Some((state.conn, state.request_id.clone(), missing))
            }
        };

        if let Some((conn, request_id, missing)) = resume {
            debug!(
                "sync with {} completed with {} chunks missing; resuming",
                peer_id,
                missing.len()
            );
            self.broadcaster
                .send_payload(
                    conn,
                    PeerMessage::SyncResume {
                        request_id,
                        missing_chunks: missing,
                    },
                )
                .await;
        }
        handle.wake();
    }

    fn subscribe(&self, handle: &Arc<PullHandle>) -> watch::Receiver<u64> {
        handle.progress.subscribe()
    }

    async fn await_settled(&self, handle: &Arc<PullHandle>) -> bool {
        let mut progress = self.subscribe(handle);
        loop {
            if let Some(completed) = handle.settled() {
                return completed;
            }
            if progress.changed().await.is_err() {
                // Driver is gone; report whatever phase it left behind.
                return handle.settled().unwrap_or(false);
            }
        }
    }

    // -----------------------------------------------------------------
    // Push side (responder)
    // -----------------------------------------------------------------

    /// Serve a sync-request: snapshot the feed, stream it in chunks, and
    /// retain the snapshot for resume. One in-flight push per peer.
    pub async fn handle_sync_request(
        self: &Arc<Self>,
        peer_id: &NodeId,
        conn: ConnectionId,
        request_id: String,
        since: Option<VectorClock>,
        paths: Option<Vec<String>>,
        full: bool,
    ) {
        if self.shutting_down() {
            return;
        }
        let since = if full { None } else { since };
        let entries = self
            .store
            .all_since(since.as_ref(), paths.as_deref())
            .await;
        let total_entries = entries.len() as u64;
        let chunks: Arc<Vec<Vec<SyncEntry>>> = Arc::new(
            entries
                .chunks(self.config.chunk_size.max(1))
                .map(|chunk| chunk.to_vec())
                .collect(),
        );
        self.stats.requests_served.fetch_add(1, Ordering::Relaxed);
        debug!(
            "serving sync-request from {}: {} entries in {} chunks",
            peer_id,
            total_entries,
            chunks.len()
        );

        let engine = Arc::clone(self);
        let task_request_id = request_id.clone();
        let task_chunks = chunks.clone();
        let task = tokio::spawn(async move {
            let total_chunks = task_chunks.len() as u32;
            engine
                .broadcaster
                .send_payload(
                    conn,
                    PeerMessage::SyncResponse {
                        request_id: task_request_id.clone(),
                        total_chunks,
                        total_entries,
                        timestamp: engine.time.now_millis(),
                    },
                )
                .await;
            engine
                .stream_chunks(conn, &task_request_id, &task_chunks, None)
                .await;
            engine
                .broadcaster
                .send_payload(
                    conn,
                    PeerMessage::SyncComplete {
                        request_id: task_request_id,
                    },
                )
                .await;
        });

        let previous = self.pushes.lock().await.insert(
            peer_id.clone(),
            PushState {
                request_id,
                chunks,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    /// Re-send the chunks a resume names, from the retained snapshot.
    pub async fn handle_sync_resume(
        self: &Arc<Self>,
        peer_id: &NodeId,
        conn: ConnectionId,
        request_id: String,
        missing_chunks: Vec<u32>,
    ) {
        let chunks = {
            let pushes = self.pushes.lock().await;
            match pushes.get(peer_id) {
                Some(push) if push.request_id == request_id => push.chunks.clone(),
                _ => {
                    warn!(
                        "sync-resume from {} for unknown request {}; ignoring",
                        peer_id, request_id
                    );
                    return;
                }
            }
        };

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine
                .stream_chunks(conn, &request_id, &chunks, Some(&missing_chunks))
                .await;
            engine
                .broadcaster
                .send_payload(conn, PeerMessage::SyncComplete { request_id })
                .await;
        });
    }

    async fn stream_chunks(
        &self,
        conn: ConnectionId,
        request_id: &str,
        chunks: &Arc<Vec<Vec<SyncEntry>>>,
        only: Option<&[u32]>,
    ) {
        let total_chunks = chunks.len() as u32;
        let mut sent: u32 = 0;
        for (index, chunk) in chunks.iter().enumerate() {
            let index = index as u32;
            if let Some(only) = only {
                if !only.contains(&index) {
                    continue;
                }
            }
            self.broadcaster
                .send_payload(
                    conn,
                    PeerMessage::SyncChunk {
                        request_id: request_id.to_string(),
                        chunk_index: index,
                        total_chunks,
                        entries: chunk.clone(),
                        is_last_chunk: index + 1 == total_chunks,
                    },
                )
                .await;
            sent += 1;
            self.stats.chunks_sent.fetch_add(1, Ordering::Relaxed);
            if total_chunks > PROGRESS_EVERY_CHUNKS && sent % PROGRESS_EVERY_CHUNKS == 0 {
                self.broadcaster
                    .send_payload(
                        conn,
                        PeerMessage::SyncProgress {
                            request_id: request_id.to_string(),
                            chunk_index: index,
                            total_chunks,
                            progress: f64::from(index + 1) / f64::from(total_chunks),
                        },
                    )
                    .await;
            }
        }
    }

    // -----------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------

    /// A peer's connection died: fail its pull and drop its push.
    pub async fn on_peer_disconnected(&self, peer_id: &NodeId) {
        if let Some(handle) = self.pulls.lock().await.get(peer_id) {
            handle.state.lock().unwrap().phase = PullPhase::Failed;
            handle.wake();
        }
        if let Some(push) = self.pushes.lock().await.remove(peer_id) {
            push.task.abort();
        }
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            runs: self.stats.runs.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            entries_applied: self.stats.entries_applied.load(Ordering::Relaxed),
            requests_served: self.stats.requests_served.load(Ordering::Relaxed),
            chunks_sent: self.stats.chunks_sent.load(Ordering::Relaxed),
        }
    }
}
