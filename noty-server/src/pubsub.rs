//! Cluster-wide pub/sub plane (§4.5): local fan-out, remote fan-out over the
//! peer mesh, and the change-stream-driven remote topic index.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::{Catalog, ChangeEvent};
use crate::directory::PeerDirectory;
use crate::error::Result;
use crate::pb::{Payload, PayloadType};
use crate::wire::PeerId;

const INBOUND_CHANNEL_CAPACITY: usize = 16;
const DISCOVERY_POLL: Duration = Duration::from_millis(500);
const SUBSCRIPTION_TTL_SECS: i64 = 3600;
const SUBSCRIPTION_REFRESH: Duration = Duration::from_secs(10);

pub type SubscribeKey = Uuid;
pub type Handler = Arc<dyn Fn(HandlerEvent) + Send + Sync>;

#[derive(Clone)]
pub struct HandlerEvent {
    pub tenant_id: String,
    pub topic: String,
    pub data: Arc<Vec<u8>>,
    pub key: SubscribeKey,
}

fn topic_key(tenant_id: &str, topic: &str) -> String {
    format!("{tenant_id}|{topic}")
}

#[derive(Default)]
struct TopicContext {
    handlers: HashMap<SubscribeKey, Handler>,
}

#[derive(Default)]
struct Inner {
    local: HashMap<String, TopicContext>,
    local_by_key: HashMap<SubscribeKey, (String, String, String)>,
    remote: HashMap<String, HashSet<PeerId>>,
}

pub struct PubSub {
    self_peer: PeerId,
    catalog: Arc<Catalog>,
    directory: Arc<PeerDirectory>,
    inner: RwLock<Inner>,
    inbound_tx: mpsc::Sender<(String, String, Vec<u8>)>,
}

impl PubSub {
    pub fn new(self_peer: PeerId, catalog: Arc<Catalog>, directory: Arc<PeerDirectory>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let plane = Arc::new(PubSub {
            self_peer,
            catalog,
            directory: directory.clone(),
            inner: RwLock::new(Inner::default()),
            inbound_tx,
        });

        let dispatch_target = plane.clone();
        directory.register_handler(
            PayloadType::TopicNotify as i32,
            Arc::new(move |_from, payload: Payload| {
                dispatch_target.enqueue_remote(payload.tenant_id, payload.topic_name, payload.topic_data);
            }),
        );

        tokio::spawn(Self::inbound_worker(plane.clone(), inbound_rx));
        plane
    }

    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(Self::discovery_loop(self.clone(), cancel.clone()));
        tokio::spawn(Self::refresh_loop(self.clone(), cancel));
    }

    pub fn subscribe(&self, tenant_id: &str, topic: &str, handler: Handler) -> Result<SubscribeKey> {
        let key = Uuid::new_v4();
        let tk = topic_key(tenant_id, topic);
        let was_first = {
            let mut inner = self.inner.write();
            let ctx = inner.local.entry(tk.clone()).or_default();
            let first = ctx.handlers.is_empty();
            ctx.handlers.insert(key, handler);
            inner.local_by_key.insert(key, (tenant_id.to_string(), topic.to_string(), tk.clone()));
            first
        };
        if was_first {
            let now = now_secs();
            self.catalog.upsert_subscription(tenant_id, topic, self.self_peer.as_str(), now)?;
        }
        Ok(key)
    }

    pub fn unsubscribe(&self, keys: &[SubscribeKey]) {
        for key in keys {
            let removed = {
                let mut inner = self.inner.write();
                let Some((tenant_id, topic, tk)) = inner.local_by_key.remove(key) else {
                    continue;
                };
                let emptied = if let Some(ctx) = inner.local.get_mut(&tk) {
                    ctx.handlers.remove(key);
                    if ctx.handlers.is_empty() {
                        inner.local.remove(&tk);
                        true
                    } else {
                        false
                    }
                } else {
                    false
                };
                emptied.then_some((tenant_id, topic))
            };
            if let Some((tenant_id, topic)) = removed {
                if let Err(e) = self.catalog.delete_subscription(&tenant_id, &topic, self.self_peer.as_str()) {
                    tracing::warn!("failed to delete subscription record: {e}");
                }
            }
        }
    }

    /// Best-effort: a failed handler or unreachable peer is logged, never
    /// surfaced. Returns once every dispatch has completed.
    pub async fn publish(&self, tenant_id: &str, topic: &str, data: Vec<u8>) -> Result<()> {
        let tk = topic_key(tenant_id, topic);
        let (handlers, peers) = {
            let inner = self.inner.read();
            let handlers: Vec<(SubscribeKey, Handler)> = inner
                .local
                .get(&tk)
                .map(|ctx| ctx.handlers.iter().map(|(k, h)| (*k, h.clone())).collect())
                .unwrap_or_default();
            let peers: Vec<PeerId> = inner.remote.get(&tk).map(|s| s.iter().cloned().collect()).unwrap_or_default();
            (handlers, peers)
        };

        let data = Arc::new(data);
        let mut tasks = Vec::with_capacity(handlers.len());
        for (key, handler) in handlers {
            let event = HandlerEvent {
                tenant_id: tenant_id.to_string(),
                topic: topic.to_string(),
                data: data.clone(),
                key,
            };
            tasks.push(tokio::spawn(async move { handler(event) }));
        }
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("local subscriber handler panicked: {e}");
            }
        }

        let remote_data = (*data).clone();
        let mut remote_futs = Vec::with_capacity(peers.len());
        for peer in peers {
            let directory = self.directory.clone();
            let tenant_id = tenant_id.to_string();
            let topic = topic.to_string();
            let data = remote_data.clone();
            remote_futs.push(async move {
                if let Err(e) = directory.notify_topic(&peer, &tenant_id, &topic, data).await {
                    tracing::debug!("publish to peer {peer} failed (best-effort): {e}");
                }
            });
        }
        futures::future::join_all(remote_futs).await;
        Ok(())
    }

    fn enqueue_remote(&self, tenant_id: String, topic: String, data: Vec<u8>) {
        if let Err(e) = self.inbound_tx.try_send((tenant_id, topic, data)) {
            tracing::warn!("remote notify inbound queue full or closed, dropping: {e}");
        }
    }

    /// Fans inbound `TOPIC_NOTIFY` payloads to local handlers only — never
    /// re-forwarded to other peers, which is what keeps the mesh loop-free.
    async fn inbound_worker(self: Arc<Self>, mut rx: mpsc::Receiver<(String, String, Vec<u8>)>) {
        while let Some((tenant_id, topic, data)) = rx.recv().await {
            let tk = topic_key(&tenant_id, &topic);
            let handlers: Vec<(SubscribeKey, Handler)> = {
                let inner = self.inner.read();
                inner
                    .local
                    .get(&tk)
                    .map(|ctx| ctx.handlers.iter().map(|(k, h)| (*k, h.clone())).collect())
                    .unwrap_or_default()
            };
            let data = Arc::new(data);
            for (key, handler) in handlers {
                let event = HandlerEvent { tenant_id: tenant_id.clone(), topic: topic.clone(), data: data.clone(), key };
                tokio::spawn(async move { handler(event) });
            }
        }
    }

    async fn discovery_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut resume_token = 0i64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(DISCOVERY_POLL) => {}
            }
            let changes = match self.catalog.watch_subscriptions(resume_token) {
                Ok((changes, next)) => {
                    resume_token = next;
                    changes
                }
                Err(e) => {
                    tracing::warn!("subscription change-stream poll failed: {e}");
                    continue;
                }
            };
            let cutoff = now_secs() - SUBSCRIPTION_TTL_SECS;
            let mut inner = self.inner.write();
            for change in changes {
                match change {
                    ChangeEvent::Upserted { document, .. } => {
                        if document.peer_id == self.self_peer.as_str() || document.heartbeat_at < cutoff {
                            continue;
                        }
                        let tk = topic_key(&document.tenant_id, &document.topic);
                        inner.remote.entry(tk).or_default().insert(PeerId(document.peer_id));
                    }
                    ChangeEvent::Deleted { key } => {
                        // key = "tenant|topic|peerId"
                        let mut parts = key.rsplitn(2, '|');
                        let Some(peer_id) = parts.next() else { continue };
                        let Some(tk) = parts.next() else { continue };
                        if peer_id == self.self_peer.as_str() {
                            continue;
                        }
                        if let Some(set) = inner.remote.get_mut(tk) {
                            set.remove(&PeerId(peer_id.to_string()));
                            if set.is_empty() {
                                inner.remote.remove(tk);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn refresh_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SUBSCRIPTION_REFRESH);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let now = now_secs();
            let topics: Vec<(String, String)> = {
                let inner = self.inner.read();
                inner
                    .local_by_key
                    .values()
                    .map(|(tenant_id, topic, _)| (tenant_id.clone(), topic.clone()))
                    .collect()
            };
            for (tenant_id, topic) in topics {
                if let Err(e) = self.catalog.upsert_subscription(&tenant_id, &topic, self.self_peer.as_str(), now) {
                    tracing::warn!("subscription heartbeat failed for {tenant_id}/{topic}: {e}");
                }
            }
        }
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_plane() -> (Arc<PubSub>, Arc<Catalog>) {
        let catalog = Arc::new(Catalog::open(":memory:").unwrap());
        let directory = PeerDirectory::new(catalog.clone(), "127.0.0.1".into(), 0);
        (PubSub::new(directory.self_id.clone(), catalog.clone(), directory), catalog)
    }

    #[tokio::test]
    async fn local_publish_delivers_to_each_handler_once() {
        let (plane, _catalog) = test_plane();
        let count = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(parking_lot::Mutex::new(None));
        let count2 = count.clone();
        let received2 = received.clone();
        plane
            .subscribe(
                "t1",
                "hello",
                Arc::new(move |ev: HandlerEvent| {
                    count2.fetch_add(1, Ordering::SeqCst);
                    *received2.lock() = Some((ev.tenant_id, ev.topic, (*ev.data).clone()));
                }),
            )
            .unwrap();
        plane.publish("t1", "hello", b"hi".to_vec()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let got = received.lock().clone().unwrap();
        assert_eq!(got, ("t1".to_string(), "hello".to_string(), b"hi".to_vec()));
    }

    #[tokio::test]
    async fn subscribing_twice_delivers_twice() {
        let (plane, _catalog) = test_plane();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let c2 = count.clone();
        let k1 = plane.subscribe("t1", "x", Arc::new(move |_| { c1.fetch_add(1, Ordering::SeqCst); })).unwrap();
        let k2 = plane.subscribe("t1", "x", Arc::new(move |_| { c2.fetch_add(1, Ordering::SeqCst); })).unwrap();
        assert_ne!(k1, k2);
        plane.publish("t1", "x", b"d".to_vec()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribing_unknown_key_is_a_no_op() {
        let (plane, _catalog) = test_plane();
        plane.unsubscribe(&[Uuid::new_v4()]);
    }
}
