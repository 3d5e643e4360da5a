//! Peer directory: node discovery, the authenticated mesh, and the
//! reconnect/heartbeat lifecycle (§4.3).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, ChangeEvent};
use crate::error::{Error, Result};
use crate::pb::Payload;
use crate::wire::{self, Keypair, PeerConn, PeerId};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const PEER_TTL_SECS: i64 = 60;
const DISCOVERY_POLL: Duration = Duration::from_millis(500);

pub type NotifyHandler = Arc<dyn Fn(PeerId, Payload) + Send + Sync>;

#[derive(Clone)]
enum SessionState {
    NotConnected,
    Connecting,
    Connected(Arc<PeerConn>),
}

struct PeerSession {
    peer_id: PeerId,
    address: String,
    port: u16,
    desired: std::sync::atomic::AtomicBool,
    state: Mutex<SessionState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub id: String,
    pub state: &'static str,
    pub remote_address: Option<String>,
}

pub struct PeerDirectory {
    pub self_id: PeerId,
    keypair: Keypair,
    catalog: Arc<Catalog>,
    advertise_addr: String,
    advertise_port: u16,
    sessions: RwLock<HashMap<PeerId, Arc<PeerSession>>>,
    handlers: RwLock<HashMap<i32, NotifyHandler>>,
}

impl PeerDirectory {
    pub fn new(catalog: Arc<Catalog>, advertise_addr: String, advertise_port: u16) -> Arc<Self> {
        let keypair = Keypair::generate();
        Arc::new(PeerDirectory {
            self_id: keypair.peer_id.clone(),
            keypair,
            catalog,
            advertise_addr,
            advertise_port,
            sessions: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        })
    }

    pub fn register_handler(&self, payload_type: i32, handler: NotifyHandler) {
        self.handlers.write().insert(payload_type, handler);
    }

    pub fn list(&self) -> Vec<PeerSummary> {
        self.sessions
            .read()
            .values()
            .map(|s| {
                let state = s.state.lock().clone();
                let (label, addr) = match state {
                    SessionState::NotConnected => ("NotConnected", None),
                    SessionState::Connecting => ("Connecting", None),
                    SessionState::Connected(conn) => ("Connected", Some(conn.remote_addr().to_string())),
                };
                PeerSummary { id: s.peer_id.to_string(), state: label, remote_address: addr }
            })
            .collect()
    }

    /// Starts the accept loop, self-heartbeat, and peer discovery tasks.
    /// Blocks until the listener is bound (startup ordering requirement
    /// shared with the catalog's change-stream: callers should not proceed
    /// until mesh participation is possible), then returns with the work
    /// spawned in the background.
    pub async fn start(self: &Arc<Self>, listen_addr: &str, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| Error::Fatal(format!("cluster listen failed on {listen_addr}: {e}")))?;

        let now = now_secs();
        self.catalog
            .heartbeat_peer(self.self_id.as_str(), &self.advertise_addr, self.advertise_port, now)?;

        tokio::spawn(Self::accept_loop(self.clone(), listener, cancel.clone()));
        tokio::spawn(Self::heartbeat_loop(self.clone(), cancel.clone()));
        tokio::spawn(Self::discovery_loop(self.clone(), cancel));
        Ok(())
    }

    pub async fn shutdown(&self) {
        for session in self.sessions.read().values() {
            if let SessionState::Connected(conn) = session.state.lock().clone() {
                conn.close();
            }
        }
        let _ = self.catalog.delete_peer(self.self_id.as_str());
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            tokio::spawn(Self::handle_inbound(self.clone(), stream, addr, cancel.clone()));
                        }
                        Err(e) => tracing::warn!("cluster accept failed: {e}"),
                    }
                }
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr, cancel: CancellationToken) {
        let remote_peer = match wire::handshake(&mut stream, &self.keypair, HANDSHAKE_TIMEOUT).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("inbound handshake from {addr} failed: {e}");
                return;
            }
        };
        self.adopt_connection(remote_peer, stream, addr, cancel).await;
    }

    /// Installs a freshly handshaken connection, deduplicating against a
    /// session that is already `Connected` (the peer dialed us while we
    /// were also dialing it).
    async fn adopt_connection(
        self: Arc<Self>,
        remote_peer: PeerId,
        stream: TcpStream,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) {
        let session = {
            let mut sessions = self.sessions.write();
            sessions
                .entry(remote_peer.clone())
                .or_insert_with(|| {
                    Arc::new(PeerSession {
                        peer_id: remote_peer.clone(),
                        address: addr.ip().to_string(),
                        port: addr.port(),
                        desired: std::sync::atomic::AtomicBool::new(true),
                        state: Mutex::new(SessionState::NotConnected),
                    })
                })
                .clone()
        };

        {
            let mut state = session.state.lock();
            if matches!(*state, SessionState::Connected(_)) {
                tracing::debug!("duplicate connection from {remote_peer}, closing new one");
                return;
            }
            let (read_half, write_half) = stream.into_split();
            let conn = Arc::new(PeerConn::new(remote_peer.clone(), addr, write_half));
            *state = SessionState::Connected(conn.clone());
            drop(state);
            tokio::spawn(Self::run_reader(self.clone(), session.clone(), conn, read_half, cancel));
        }
    }

    /// Dials a discovered peer; on success installs the connection the same
    /// way the accept path does.
    async fn dial(self: Arc<Self>, session: Arc<PeerSession>, cancel: CancellationToken) {
        loop {
            if !session.desired.load(std::sync::atomic::Ordering::Acquire) || cancel.is_cancelled() {
                return;
            }
            *session.state.lock() = SessionState::Connecting;
            let target = format!("{}:{}", session.address, session.port);
            let outcome = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await;
            let stream = match outcome {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    tracing::debug!("dial {target} failed: {e}");
                    self.schedule_reconnect(session.clone(), cancel.clone());
                    return;
                }
                Err(_) => {
                    tracing::debug!("dial {target} timed out");
                    self.schedule_reconnect(session.clone(), cancel.clone());
                    return;
                }
            };
            let mut stream = stream;
            let addr: SocketAddr = stream.peer_addr().unwrap_or_else(|_| target.parse().unwrap());
            match wire::handshake(&mut stream, &self.keypair, HANDSHAKE_TIMEOUT).await {
                Ok(remote_peer) => {
                    self.clone().adopt_connection(remote_peer, stream, addr, cancel.clone()).await;
                    return;
                }
                Err(e) => {
                    tracing::debug!("handshake with {target} failed: {e}");
                    self.schedule_reconnect(session.clone(), cancel.clone());
                    return;
                }
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, session: Arc<PeerSession>, cancel: CancellationToken) {
        *session.state.lock() = SessionState::NotConnected;
        if !session.desired.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let jitter_ms = 1000 + rand::thread_rng().gen_range(0..2000);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {}
            }
            if session.desired.load(std::sync::atomic::Ordering::Acquire) {
                this.dial(session, cancel).await;
            }
        });
    }

    async fn run_reader(
        self: Arc<Self>,
        session: Arc<PeerSession>,
        conn: Arc<PeerConn>,
        mut read_half: OwnedReadHalf,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = conn.cancellation().cancelled() => break,
                _ = cancel.cancelled() => { conn.close(); break; }
                frame = wire::read_frame(&mut read_half) => {
                    match frame {
                        Ok(payload) => self.dispatch(conn.remote_peer().clone(), payload),
                        Err(e) => {
                            tracing::debug!("peer {} read error: {e}", conn.remote_peer());
                            conn.close();
                            break;
                        }
                    }
                }
            }
        }
        if session.desired.load(std::sync::atomic::Ordering::Acquire) {
            self.schedule_reconnect(session, cancel);
        } else {
            *session.state.lock() = SessionState::NotConnected;
        }
    }

    fn dispatch(&self, from: PeerId, payload: Payload) {
        let handler = self.handlers.read().get(&payload.r#type).cloned();
        if let Some(handler) = handler {
            handler(from, payload);
        }
    }

    pub async fn notify_topic(&self, peer_id: &PeerId, tenant_id: &str, topic: &str, data: Vec<u8>) -> Result<()> {
        let session = self
            .sessions
            .read()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no such peer {peer_id}")))?;
        let conn = match session.state.lock().clone() {
            SessionState::Connected(conn) => conn,
            _ => return Err(Error::Transport(format!("peer {peer_id} not connected"))),
        };
        let payload = Payload {
            r#type: crate::pb::PayloadType::TopicNotify as i32,
            tenant_id: tenant_id.to_string(),
            topic_name: topic.to_string(),
            topic_data: data,
            ..Default::default()
        };
        conn.write(&payload).await
    }

    async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let now = now_secs();
                    if let Err(e) = self.catalog.heartbeat_peer(self.self_id.as_str(), &self.advertise_addr, self.advertise_port, now) {
                        tracing::warn!("peer heartbeat failed: {e}");
                    }
                }
            }
        }
    }

    /// Long-polls the `PeerRecord` change feed (§9: no native change-stream
    /// over SQLite, so this emulates one with a short-period poll) and
    /// drives session transitions from insert/delete events.
    async fn discovery_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut resume_token = 0i64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(DISCOVERY_POLL) => {}
            }
            let changes = match self.catalog.watch_peers(resume_token) {
                Ok((changes, next)) => {
                    resume_token = next;
                    changes
                }
                Err(e) => {
                    tracing::warn!("peer change-stream poll failed: {e}");
                    continue;
                }
            };
            let cutoff = now_secs() - PEER_TTL_SECS;
            for change in changes {
                match change {
                    ChangeEvent::Upserted { key, document } => {
                        if key == self.self_id.as_str() || document.heartbeat_at < cutoff {
                            continue;
                        }
                        self.ensure_connecting(PeerId(key), document.address, document.port, cancel.clone());
                    }
                    ChangeEvent::Deleted { key } => {
                        if key == self.self_id.as_str() {
                            continue;
                        }
                        if let Some(session) = self.sessions.read().get(&PeerId(key)) {
                            session.desired.store(false, std::sync::atomic::Ordering::Release);
                            if let SessionState::Connected(conn) = session.state.lock().clone() {
                                conn.close();
                            }
                        }
                    }
                }
            }
        }
    }

    fn ensure_connecting(self: &Arc<Self>, peer_id: PeerId, address: String, port: u16, cancel: CancellationToken) {
        let session = {
            let mut sessions = self.sessions.write();
            sessions
                .entry(peer_id.clone())
                .or_insert_with(|| {
                    Arc::new(PeerSession {
                        peer_id: peer_id.clone(),
                        address,
                        port,
                        desired: std::sync::atomic::AtomicBool::new(true),
                        state: Mutex::new(SessionState::NotConnected),
                    })
                })
                .clone()
        };
        session.desired.store(true, std::sync::atomic::Ordering::Release);
        let should_dial = matches!(*session.state.lock(), SessionState::NotConnected);
        if should_dial {
            tokio::spawn(self.clone().dial(session, cancel));
        }
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Best-effort discovery of this host's externally-reachable address: the
/// local endpoint of a UDP socket "connected" to a public address, which
/// never sends a packet but makes the kernel pick the outbound interface.
pub fn detect_local_address() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
