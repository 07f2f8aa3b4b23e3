use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::message::Envelope;
use crate::error::{MeshError, MeshResult};

pub type ConnectionId = u64;

/// Direction of a connection as seen from the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Events surfaced by a transport to the node's event loop.
#[derive(Debug)]
pub enum TransportEvent {
    Connected {
        conn: ConnectionId,
        direction: Direction,
    },
    Message {
        conn: ConnectionId,
        envelope: Envelope,
    },
    Disconnected {
        conn: ConnectionId,
    },
}

/// Narrow network collaborator: dial, send, and a single event stream.
/// Framing, sockets, and shutdown mechanics stay behind this seam.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Start accepting inbound connections (no-op for client-only setups).
    async fn start(&self) -> MeshResult<()>;
    async fn dial(&self, url: &str) -> MeshResult<ConnectionId>;
    async fn send(&self, conn: ConnectionId, envelope: &Envelope) -> MeshResult<()>;
    async fn close_conn(&self, conn: ConnectionId) -> MeshResult<()>;
    /// The event stream; yields `None` after the first call.
    async fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;
    async fn shutdown(&self) -> MeshResult<()>;
}

const EVENT_CHANNEL_CAPACITY: usize = 4_096;
const WRITE_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// TCP transport: one JSON frame per line.
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TcpConn {
    writer_tx: mpsc::Sender<String>,
    reader: JoinHandle<()>,
}

/// Newline-delimited JSON over TCP.
#[derive(Debug)]
pub struct TcpTransport {
    me: Weak<TcpTransport>,
    port: Option<u16>,
    next_conn: AtomicU64,
    conns: RwLock<HashMap<ConnectionId, TcpConn>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(port: Option<u16>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            port,
            next_conn: AtomicU64::new(1),
            conns: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            listener_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn strip_scheme(url: &str) -> &str {
        url.strip_prefix("tcp://").unwrap_or(url)
    }

    fn handle(&self) -> MeshResult<Arc<TcpTransport>> {
        self.me
            .upgrade()
            .ok_or_else(|| MeshError::PeerTransport("transport is gone".to_string()))
    }

    async fn register_stream(
        self: &Arc<Self>,
        stream: TcpStream,
        direction: Direction,
    ) -> ConnectionId {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (read_half, mut write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(WRITE_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(line) = writer_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err()
                    || write_half.write_all(b"\n").await.is_err()
                {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let transport = Arc::clone(self);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Envelope>(&line) {
                            Ok(envelope) => {
                                if transport
                                    .events_tx
                                    .send(TransportEvent::Message { conn, envelope })
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(e) => warn!("dropping undecodable frame: {}", e),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("connection {} read error: {}", conn, e);
                        break;
                    }
                }
            }
            transport.drop_conn(conn, true).await;
        });

        self.conns
            .write()
            .await
            .insert(conn, TcpConn { writer_tx, reader });
        let _ = self
            .events_tx
            .send(TransportEvent::Connected { conn, direction })
            .await;
        conn
    }

    async fn drop_conn(&self, conn: ConnectionId, notify: bool) {
        let removed = self.conns.write().await.remove(&conn);
        if removed.is_some() && notify && !self.closed.load(Ordering::SeqCst) {
            let _ = self
                .events_tx
                .send(TransportEvent::Disconnected { conn })
                .await;
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self) -> MeshResult<()> {
        let port = match self.port {
            Some(port) => port,
            None => return Ok(()),
        };
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| MeshError::Config(format!("failed to bind port {}: {}", port, e)))?;
        info!("listening on port {}", port);

        let transport = self.handle()?;
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("accepted connection from {}", addr);
                        transport.register_stream(stream, Direction::Inbound).await;
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                    }
                }
            }
        });
        *self.listener_task.lock().await = Some(task);
        Ok(())
    }

    async fn dial(&self, url: &str) -> MeshResult<ConnectionId> {
        let transport = self.handle()?;
        let stream = TcpStream::connect(Self::strip_scheme(url))
            .await
            .map_err(|e| MeshError::PeerTransport(format!("dial {} failed: {}", url, e)))?;
        Ok(transport.register_stream(stream, Direction::Outbound).await)
    }

    async fn send(&self, conn: ConnectionId, envelope: &Envelope) -> MeshResult<()> {
        let line = serde_json::to_string(envelope)?;
        let writer_tx = {
            let conns = self.conns.read().await;
            conns
                .get(&conn)
                .map(|c| c.writer_tx.clone())
                .ok_or_else(|| MeshError::PeerTransport(format!("connection {} is gone", conn)))?
        };
        writer_tx
            .send(line)
            .await
            .map_err(|_| MeshError::PeerTransport(format!("connection {} closed", conn)))
    }

    async fn close_conn(&self, conn: ConnectionId) -> MeshResult<()> {
        if let Some(handle) = self.conns.write().await.remove(&conn) {
            handle.reader.abort();
            if !self.closed.load(Ordering::SeqCst) {
                let _ = self
                    .events_tx
                    .send(TransportEvent::Disconnected { conn })
                    .await;
            }
        }
        Ok(())
    }

    async fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().await.take()
    }

    async fn shutdown(&self) -> MeshResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.listener_task.lock().await.take() {
            task.abort();
        }
        let conns: Vec<_> = self.conns.write().await.drain().collect();
        for (_, handle) in conns {
            handle.reader.abort();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process transport for multi-node tests.
// ---------------------------------------------------------------------------

/// Rendezvous for in-process transports, keyed by a synthetic address.
#[derive(Debug, Default)]
pub struct InMemoryHub {
    transports: StdMutex<HashMap<String, Weak<ChannelTransport>>>,
}

impl InMemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport bound to `addr` and register it with the hub.
    pub fn transport(self: &Arc<Self>, addr: &str) -> Arc<ChannelTransport> {
        let transport = ChannelTransport::new(Arc::clone(self), addr);
        self.transports
            .lock()
            .unwrap()
            .insert(addr.to_string(), Arc::downgrade(&transport));
        transport
    }

    fn lookup(&self, addr: &str) -> Option<Arc<ChannelTransport>> {
        self.transports
            .lock()
            .unwrap()
            .get(addr)
            .and_then(Weak::upgrade)
    }

    fn remove(&self, addr: &str) {
        self.transports.lock().unwrap().remove(addr);
    }
}

#[derive(Debug, Clone)]
struct ChannelLink {
    remote: Weak<ChannelTransport>,
    remote_conn: ConnectionId,
}

/// Channel-backed transport: frames hop directly between event queues.
/// Used by the integration tests to build whole meshes in one process.
#[derive(Debug)]
pub struct ChannelTransport {
    me: Weak<ChannelTransport>,
    hub: Arc<InMemoryHub>,
    addr: String,
    next_conn: AtomicU64,
    links: StdMutex<HashMap<ConnectionId, ChannelLink>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    closed: AtomicBool,
}

impl ChannelTransport {
    fn new(hub: Arc<InMemoryHub>, addr: &str) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            hub,
            addr: addr.to_string(),
            next_conn: AtomicU64::new(1),
            links: StdMutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn allocate(&self, link: ChannelLink) -> ConnectionId {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.links.lock().unwrap().insert(conn, link);
        conn
    }

    async fn emit(&self, event: TransportEvent) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.events_tx.send(event).await;
        }
    }

    fn take_link(&self, conn: ConnectionId) -> Option<ChannelLink> {
        self.links.lock().unwrap().remove(&conn)
    }

    fn link(&self, conn: ConnectionId) -> Option<ChannelLink> {
        self.links.lock().unwrap().get(&conn).cloned()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn start(&self) -> MeshResult<()> {
        Ok(())
    }

    async fn dial(&self, url: &str) -> MeshResult<ConnectionId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::PeerTransport("transport is closed".to_string()));
        }
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| MeshError::PeerTransport("transport is gone".to_string()))?;
        let remote = self
            .hub
            .lookup(url)
            .filter(|remote| !remote.closed.load(Ordering::SeqCst))
            .ok_or_else(|| MeshError::PeerTransport(format!("no listener at {}", url)))?;

        // Allocate both halves of the link before surfacing either event.
        let local_conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let remote_conn = remote.allocate(ChannelLink {
            remote: Arc::downgrade(&me),
            remote_conn: local_conn,
        });
        self.links.lock().unwrap().insert(
            local_conn,
            ChannelLink {
                remote: Arc::downgrade(&remote),
                remote_conn,
            },
        );

        self.emit(TransportEvent::Connected {
            conn: local_conn,
            direction: Direction::Outbound,
        })
        .await;
        remote
            .emit(TransportEvent::Connected {
                conn: remote_conn,
                direction: Direction::Inbound,
            })
            .await;
        Ok(local_conn)
    }

    async fn send(&self, conn: ConnectionId, envelope: &Envelope) -> MeshResult<()> {
        let link = self
            .link(conn)
            .ok_or_else(|| MeshError::PeerTransport(format!("connection {} is gone", conn)))?;
        let remote = link
            .remote
            .upgrade()
            .filter(|remote| !remote.closed.load(Ordering::SeqCst))
            .ok_or_else(|| MeshError::PeerTransport("peer transport is gone".to_string()))?;
        remote
            .emit(TransportEvent::Message {
                conn: link.remote_conn,
                envelope: envelope.clone(),
            })
            .await;
        Ok(())
    }

    async fn close_conn(&self, conn: ConnectionId) -> MeshResult<()> {
        if let Some(link) = self.take_link(conn) {
            self.emit(TransportEvent::Disconnected { conn }).await;
            if let Some(remote) = link.remote.upgrade() {
                if remote.take_link(link.remote_conn).is_some() {
                    remote
                        .emit(TransportEvent::Disconnected {
                            conn: link.remote_conn,
                        })
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().await.take()
    }

    async fn shutdown(&self) -> MeshResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.hub.remove(&self.addr);
        let links: Vec<_> = {
            let mut links = self.links.lock().unwrap();
            links.drain().collect()
        };
        for (_, link) in links {
            if let Some(remote) = link.remote.upgrade() {
                if remote.take_link(link.remote_conn).is_some() {
                    remote
                        .emit(TransportEvent::Disconnected {
                            conn: link.remote_conn,
                        })
                        .await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::PeerMessage;

    fn hello(from: &str) -> Envelope {
        Envelope {
            msg_id: format!("{}:0:1", from),
            origin: from.to_string(),
            timestamp: 1,
            payload: PeerMessage::Hello {
                node_id: from.to_string(),
                url: None,
            },
        }
    }

    #[tokio::test]
    async fn test_channel_transport_round_trip() {
        let hub = InMemoryHub::new();
        let a = hub.transport("mem://a");
        let b = hub.transport("mem://b");
        let mut a_events = a.take_events().await.unwrap();
        let mut b_events = b.take_events().await.unwrap();

        let conn = a.dial("mem://b").await.unwrap();
        assert!(matches!(
            a_events.recv().await.unwrap(),
            TransportEvent::Connected {
                direction: Direction::Outbound,
                ..
            }
        ));
        let b_conn = match b_events.recv().await.unwrap() {
            TransportEvent::Connected {
                conn,
                direction: Direction::Inbound,
            } => conn,
            other => panic!("unexpected event {:?}", other),
        };

        a.send(conn, &hello("aaaaaaaaaaaaaaaa")).await.unwrap();
        match b_events.recv().await.unwrap() {
            TransportEvent::Message { conn, envelope } => {
                assert_eq!(conn, b_conn);
                assert_eq!(envelope.origin, "aaaaaaaaaaaaaaaa");
            }
            other => panic!("unexpected event {:?}", other),
        }

        b.close_conn(b_conn).await.unwrap();
        assert!(matches!(
            a_events.recv().await.unwrap(),
            TransportEvent::Disconnected { .. }
        ));
        assert!(a.send(conn, &hello("aaaaaaaaaaaaaaaa")).await.is_err());
    }

    #[tokio::test]
    async fn test_dial_unknown_address_fails() {
        let hub = InMemoryHub::new();
        let a = hub.transport("mem://a");
        assert!(a.dial("mem://missing").await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_peers() {
        let hub = InMemoryHub::new();
        let a = hub.transport("mem://a");
        let b = hub.transport("mem://b");
        let _a_events = a.take_events().await.unwrap();
        let mut b_events = b.take_events().await.unwrap();

        a.dial("mem://b").await.unwrap();
        let _ = b_events.recv().await.unwrap();

        a.shutdown().await.unwrap();
        assert!(matches!(
            b_events.recv().await.unwrap(),
            TransportEvent::Disconnected { .. }
        ));
        assert!(hub.lookup("mem://a").is_none());
    }
}
