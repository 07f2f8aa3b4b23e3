use std::collections::{HashMap, HashSet};

use lru::LruCache;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::core::record::NodeId;
use crate::infrastructure::transport::{ConnectionId, Direction};

/// Connection lifecycle as tracked per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerState {
    Dialing,
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// One live connection to a peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSession {
    pub conn: ConnectionId,
    /// Known after the hello handshake.
    pub peer_id: Option<NodeId>,
    #[serde(skip)]
    pub direction: Direction,
    /// Dial URL for outbound sessions; advertised URL for inbound ones.
    pub url: Option<String>,
    pub state: PeerState,
    pub opened_at: i64,
    pub last_seen_at: i64,
    pub last_sync_at: Option<i64>,
    /// Set when the broadcast queue dropped frames for this peer; cleared by
    /// the next completed sync.
    pub needs_anti_entropy: bool,
}

/// Outcome of processing a hello frame.
#[derive(Debug, PartialEq, Eq)]
pub enum HelloOutcome {
    /// Session is open; `replaced` is a duplicate connection to close.
    Accepted {
        peer_id: NodeId,
        replaced: Option<ConnectionId>,
    },
    /// The remote end is this node itself.
    RejectedSelf,
    /// An outbound session to this peer already exists; the new inbound
    /// connection loses.
    RejectedDuplicate,
    /// Hello arrived for a connection the registry no longer tracks.
    UnknownConnection,
}

/// Tracks peer sessions and suppresses duplicate flood messages.
///
/// All mutation goes through `&self` methods behind internal locks; other
/// components hold the registry as a shared capability handle.
#[derive(Debug)]
pub struct PeerRegistry {
    local_id: NodeId,
    config: NetConfig,
    sessions: RwLock<HashMap<ConnectionId, PeerSession>>,
    by_peer: RwLock<HashMap<NodeId, ConnectionId>>,
    seen: Mutex<LruCache<String, ()>>,
    /// URLs that turned out to be this node; reconnect loops skip them.
    self_urls: Mutex<HashSet<String>>,
}

impl PeerRegistry {
    pub fn new(local_id: NodeId, config: NetConfig) -> Self {
        Self {
            local_id,
            config,
            sessions: RwLock::new(HashMap::new()),
            by_peer: RwLock::new(HashMap::new()),
            seen: Mutex::new(LruCache::unbounded()),
            self_urls: Mutex::new(HashSet::new()),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Track a new connection. Idempotent: the dialer and the event loop may
    /// both announce the same connection, whichever ran first wins and a
    /// later call only fills in a missing URL.
    pub async fn register(
        &self,
        conn: ConnectionId,
        direction: Direction,
        url: Option<String>,
        now: i64,
    ) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&conn) {
            if session.url.is_none() {
                session.url = url;
            }
            return;
        }
        let session = PeerSession {
            conn,
            peer_id: None,
            direction,
            url,
            state: PeerState::Handshaking,
            opened_at: now,
            last_seen_at: now,
            last_sync_at: None,
            needs_anti_entropy: false,
        };
        sessions.insert(conn, session);
    }

    /// Arbitrate the hello handshake. When both a dial-out and a dial-in
    /// exist for the same peer, an established outbound wins over a new
    /// inbound; otherwise the older session is closed.
    pub async fn handle_hello(
        &self,
        conn: ConnectionId,
        peer_id: &NodeId,
        url: Option<String>,
        now: i64,
    ) -> HelloOutcome {
        if *peer_id == self.local_id {
            let dialed = {
                let sessions = self.sessions.read().await;
                sessions.get(&conn).and_then(|s| s.url.clone())
            };
            if let Some(url) = dialed {
                warn!("peer URL {} is this node; disabling reconnect", url);
                self.self_urls.lock().await.insert(url);
            }
            self.sessions.write().await.remove(&conn);
            return HelloOutcome::RejectedSelf;
        }

        let existing_conn = self.by_peer.read().await.get(peer_id).copied();
        let mut replaced = None;
        if let Some(existing_conn) = existing_conn.filter(|existing| *existing != conn) {
            let mut sessions = self.sessions.write().await;
            let new_direction = match sessions.get(&conn) {
                Some(session) => session.direction,
                None => return HelloOutcome::UnknownConnection,
            };
            let existing_direction = sessions.get(&existing_conn).map(|s| s.direction);
            if new_direction == Direction::Inbound
                && existing_direction == Some(Direction::Outbound)
            {
                debug!(
                    "dropping duplicate inbound connection from {} (outbound exists)",
                    peer_id
                );
                sessions.remove(&conn);
                return HelloOutcome::RejectedDuplicate;
            }
            // Otherwise the older session loses.
            sessions.remove(&existing_conn);
            replaced = Some(existing_conn);
        }

        {
            let mut sessions = self.sessions.write().await;
            let session = match sessions.get_mut(&conn) {
                Some(session) => session,
                None => return HelloOutcome::UnknownConnection,
            };
            session.peer_id = Some(peer_id.clone());
            session.state = PeerState::Open;
            session.last_seen_at = now;
            if session.url.is_none() {
                session.url = url;
            }
        }
        self.by_peer.write().await.insert(peer_id.clone(), conn);
        info!("peer {} is open on connection {}", peer_id, conn);
        HelloOutcome::Accepted {
            peer_id: peer_id.clone(),
            replaced,
        }
    }

    /// Remove the session for a dead connection and report who it was.
    pub async fn mark_disconnected(&self, conn: ConnectionId) -> Option<PeerSession> {
        let session = self.sessions.write().await.remove(&conn)?;
        if let Some(peer_id) = &session.peer_id {
            let mut by_peer = self.by_peer.write().await;
            if by_peer.get(peer_id) == Some(&conn) {
                by_peer.remove(peer_id);
            }
        }
        Some(session)
    }

    /// De-duplication check: the first sighting of `msg_id` returns `false`
    /// and remembers it; repeats return `true`. On overflow the oldest 10%
    /// of the cache is evicted.
    pub async fn seen_before(&self, msg_id: &str) -> bool {
        let mut seen = self.seen.lock().await;
        if seen.contains(msg_id) {
            seen.promote(msg_id);
            return true;
        }
        if seen.len() >= self.config.message_cache_size {
            let evict = (self.config.message_cache_size / 10).max(1);
            for _ in 0..evict {
                seen.pop_lru();
            }
        }
        seen.put(msg_id.to_string(), ());
        false
    }

    pub async fn open_peers(&self) -> Vec<(NodeId, ConnectionId)> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|session| session.state == PeerState::Open)
            .filter_map(|session| {
                session
                    .peer_id
                    .clone()
                    .map(|peer_id| (peer_id, session.conn))
            })
            .collect()
    }

    pub async fn conn_of(&self, peer_id: &NodeId) -> Option<ConnectionId> {
        self.by_peer.read().await.get(peer_id).copied()
    }

    pub async fn peer_of(&self, conn: ConnectionId) -> Option<NodeId> {
        let sessions = self.sessions.read().await;
        sessions.get(&conn).and_then(|session| session.peer_id.clone())
    }

    pub async fn session(&self, conn: ConnectionId) -> Option<PeerSession> {
        self.sessions.read().await.get(&conn).cloned()
    }

    pub async fn touch(&self, conn: ConnectionId, now: i64) {
        if let Some(session) = self.sessions.write().await.get_mut(&conn) {
            session.last_seen_at = now;
        }
    }

    pub async fn set_last_sync(&self, peer_id: &NodeId, now: i64) {
        let conn = match self.conn_of(peer_id).await {
            Some(conn) => conn,
            None => return,
        };
        if let Some(session) = self.sessions.write().await.get_mut(&conn) {
            session.last_sync_at = Some(now);
            session.needs_anti_entropy = false;
        }
    }

    pub async fn flag_needs_anti_entropy(&self, conn: ConnectionId) {
        if let Some(session) = self.sessions.write().await.get_mut(&conn) {
            if !session.needs_anti_entropy {
                session.needs_anti_entropy = true;
                debug!("peer on connection {} flagged for anti-entropy", conn);
            }
        }
    }

    /// Is some session (handshaking or open) already using this URL?
    pub async fn has_session_for_url(&self, url: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions.values().any(|session| {
            session.url.as_deref() == Some(url)
                && matches!(
                    session.state,
                    PeerState::Dialing | PeerState::Handshaking | PeerState::Open
                )
        })
    }

    pub async fn is_self_url(&self, url: &str) -> bool {
        self.self_urls.lock().await.contains(url)
    }

    pub async fn sessions_snapshot(&self) -> Vec<PeerSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn mark_closing(&self, conn: ConnectionId) {
        if let Some(session) = self.sessions.write().await.get_mut(&conn) {
            session.state = PeerState::Closing;
        }
    }
}
