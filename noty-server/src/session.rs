//! Client session protocol (§4.7): one `Payload` Request in, one `Payload`
//! Response out, plus asynchronous `TopicNotify` pushes for subscriptions the
//! session owns. The carrier (websocket in `web.rs`) only needs to hand raw
//! frames in and drain `out_rx` — everything else lives here.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use prost::Message as _;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::catalog::{Catalog, NotificationRecord};
use crate::pb::{
    FetchNotificationsResponse, Payload, PayloadType, RequestMethod,
};
use crate::pubsub::{HandlerEvent, PubSub, SubscribeKey};

const OUTBOUND_CHANNEL_CAPACITY: usize = 32;
const DEFAULT_FETCH_LIMIT: u32 = 10;
const MAX_FETCH_LIMIT: u32 = 100;

/// ACL interceptor hook for `TopicSubscribe`. The default is permissive;
/// deployments that need per-topic authorization provide their own.
#[async_trait]
pub trait Acl: Send + Sync {
    async fn can_subscribe(&self, tenant_id: &str, account_id: &str, topic: &str) -> bool;
}

pub struct PermissiveAcl;

#[async_trait]
impl Acl for PermissiveAcl {
    async fn can_subscribe(&self, _tenant_id: &str, _account_id: &str, _topic: &str) -> bool {
        true
    }
}

pub struct Session {
    tenant_id: String,
    account_id: String,
    catalog: Arc<Catalog>,
    pubsub: Arc<PubSub>,
    acl: Arc<dyn Acl>,
    out_tx: mpsc::Sender<Vec<u8>>,
    owned_keys: Mutex<Vec<SubscribeKey>>,
}

impl Session {
    pub fn new(
        tenant_id: String,
        account_id: String,
        catalog: Arc<Catalog>,
        pubsub: Arc<PubSub>,
        acl: Arc<dyn Acl>,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let session = Arc::new(Session { tenant_id, account_id, catalog, pubsub, acl, out_tx, owned_keys: Mutex::new(Vec::new()) });
        (session, out_rx)
    }

    /// Releases every subscription this session holds. Idempotent.
    pub fn close(&self) {
        let keys: Vec<SubscribeKey> = self.owned_keys.lock().drain(..).collect();
        self.pubsub.unsubscribe(&keys);
    }

    /// Decodes one inbound frame and, for a well-formed Request, pushes its
    /// Response onto the outbound channel. Malformed or non-Request frames
    /// are dropped silently (the wire contract has no error-frame variant).
    pub async fn handle_frame(&self, bytes: &[u8]) {
        let req = match Payload::decode(bytes) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("malformed session frame, dropping: {e}");
                return;
            }
        };
        if req.r#type != PayloadType::Request as i32 {
            return;
        }
        let resp = match RequestMethod::try_from(req.request_method) {
            Ok(RequestMethod::TopicSubscribe) => self.handle_subscribe(&req).await,
            Ok(RequestMethod::TopicUnsubscribe) => self.handle_unsubscribe(&req),
            Ok(RequestMethod::StartNotification) => self.handle_start_notification(&req),
            Ok(RequestMethod::FetchNotifications) => self.handle_fetch(&req),
            Ok(RequestMethod::MarkNotifications) => self.handle_mark(&req),
            _ => return,
        };
        let _ = self.out_tx.send(resp.encode_to_vec()).await;
    }

    fn response_to(request_id: &[u8]) -> Payload {
        Payload { r#type: PayloadType::Response as i32, request_id: request_id.to_vec(), ..Default::default() }
    }

    /// Subscribes to `topic` in this session's tenant and registers a
    /// handler that forwards every publish as a `TopicNotify` frame.
    fn subscribe_topic(&self, topic: String) -> crate::error::Result<SubscribeKey> {
        let out_tx = self.out_tx.clone();
        let key = self.pubsub.subscribe(
            &self.tenant_id,
            &topic,
            Arc::new(move |event: HandlerEvent| {
                let notify = Payload {
                    r#type: PayloadType::TopicNotify as i32,
                    tenant_id: event.tenant_id,
                    topic_name: event.topic,
                    topic_data: (*event.data).clone(),
                    ..Default::default()
                };
                let _ = out_tx.try_send(notify.encode_to_vec());
            }),
        )?;
        self.owned_keys.lock().push(key);
        Ok(key)
    }

    async fn handle_subscribe(&self, req: &Payload) -> Payload {
        let mut resp = Self::response_to(&req.request_id);
        let topic = req.topic_name.clone();
        if !self.acl.can_subscribe(&self.tenant_id, &self.account_id, &topic).await {
            resp.response_ok = false;
            return resp;
        }
        match self.subscribe_topic(topic) {
            Ok(key) => {
                resp.response_ok = true;
                resp.subscribe_key = key.to_string();
            }
            Err(e) => {
                tracing::warn!("topic subscribe failed: {e}");
                resp.response_ok = false;
            }
        }
        resp
    }

    fn handle_unsubscribe(&self, req: &Payload) -> Payload {
        let mut resp = Self::response_to(&req.request_id);
        let Ok(key) = Uuid::parse_str(&req.subscribe_key) else {
            resp.response_ok = false;
            return resp;
        };
        let owned = {
            let mut keys = self.owned_keys.lock();
            let had = keys.contains(&key);
            keys.retain(|k| *k != key);
            had
        };
        if owned {
            self.pubsub.unsubscribe(&[key]);
        }
        resp.response_ok = owned;
        resp
    }

    fn handle_start_notification(&self, req: &Payload) -> Payload {
        let mut resp = Self::response_to(&req.request_id);
        let topic = format!("opennoty$/account/{}/notification", self.account_id);
        match self.subscribe_topic(topic) {
            Ok(key) => {
                resp.response_ok = true;
                resp.subscribe_key = key.to_string();
            }
            Err(e) => {
                tracing::warn!("start-notification subscribe failed: {e}");
                resp.response_ok = false;
            }
        }
        resp
    }

    fn handle_fetch(&self, req: &Payload) -> Payload {
        let mut resp = Self::response_to(&req.request_id);
        let request = req.fetch_notification_request.clone().unwrap_or_default();
        let limit = match request.limits {
            0 => DEFAULT_FETCH_LIMIT,
            n => n.min(MAX_FETCH_LIMIT),
        };
        let continue_token = (!request.continue_token.is_empty()).then_some(request.continue_token.as_str());

        match self.catalog.notifications(&self.tenant_id, &self.account_id, continue_token, limit) {
            Ok(rows) => {
                let next_token = rows.last().map(|r| r.id.clone()).unwrap_or_default();
                let items = rows.iter().map(|r| notification_json(r).to_string()).collect();
                resp.response_ok = true;
                resp.fetch_notification_response =
                    Some(FetchNotificationsResponse { item: items, continue_token: next_token });
            }
            Err(e) => {
                tracing::warn!("fetch notifications failed: {e}");
                resp.response_ok = false;
            }
        }
        resp
    }

    fn handle_mark(&self, req: &Payload) -> Payload {
        let mut resp = Self::response_to(&req.request_id);
        let request = req.mark_notifications_request.clone().unwrap_or_default();
        let outcome = self.catalog.mark_notifications(
            &self.tenant_id,
            &self.account_id,
            &request.mark_read_ids,
            &request.unmark_read_ids,
            &request.delete_ids,
        );
        match outcome {
            Ok(()) => resp.response_ok = true,
            Err(e) => {
                tracing::warn!("mark notifications failed: {e}");
                resp.response_ok = false;
            }
        }
        resp
    }
}

fn notification_json(record: &NotificationRecord) -> serde_json::Value {
    json!({
        "id": record.id,
        "subject": record.subject,
        "step": record.step,
        "readMarked": record.read_marked,
        "deleted": record.deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::PeerDirectory;

    fn test_session(catalog: Arc<Catalog>) -> (Arc<Session>, mpsc::Receiver<Vec<u8>>) {
        let directory = PeerDirectory::new(catalog.clone(), "127.0.0.1".into(), 0);
        let pubsub = PubSub::new(directory.self_id.clone(), catalog.clone(), directory);
        Session::new("tenant-1".into(), "acct-1".into(), catalog, pubsub, Arc::new(PermissiveAcl))
    }

    #[tokio::test]
    async fn subscribe_then_publish_delivers_topic_notify() {
        let catalog = Arc::new(Catalog::open(":memory:").unwrap());
        let (session, mut out_rx) = test_session(catalog);

        let sub_req = Payload {
            r#type: PayloadType::Request as i32,
            request_id: b"req-1".to_vec(),
            request_method: RequestMethod::TopicSubscribe as i32,
            topic_name: "hello".into(),
            ..Default::default()
        };
        session.handle_frame(&sub_req.encode_to_vec()).await;
        let resp = Payload::decode(out_rx.recv().await.unwrap().as_slice()).unwrap();
        assert!(resp.response_ok);
        assert!(!resp.subscribe_key.is_empty());

        session.pubsub.publish("tenant-1", "hello", b"hi".to_vec()).await.unwrap();
        let notify = Payload::decode(out_rx.recv().await.unwrap().as_slice()).unwrap();
        assert_eq!(notify.r#type, PayloadType::TopicNotify as i32);
        assert_eq!(notify.topic_name, "hello");
        assert_eq!(notify.topic_data, b"hi");
    }

    #[tokio::test]
    async fn unsubscribe_rejects_keys_not_owned_by_this_session() {
        let catalog = Arc::new(Catalog::open(":memory:").unwrap());
        let (session, mut out_rx) = test_session(catalog);
        let unsub = Payload {
            r#type: PayloadType::Request as i32,
            request_id: b"req-2".to_vec(),
            request_method: RequestMethod::TopicUnsubscribe as i32,
            subscribe_key: Uuid::new_v4().to_string(),
            ..Default::default()
        };
        session.handle_frame(&unsub.encode_to_vec()).await;
        let resp = Payload::decode(out_rx.recv().await.unwrap().as_slice()).unwrap();
        assert!(!resp.response_ok);
    }

    #[tokio::test]
    async fn mark_notifications_scopes_to_tenant_and_account() {
        let catalog = Arc::new(Catalog::open(":memory:").unwrap());
        let n1 = catalog
            .insert_notification(NotificationRecord {
                id: String::new(),
                tenant_id: "tenant-1".into(),
                account_id: "acct-1".into(),
                subject: "hi".into(),
                step: serde_json::Value::Null,
                read_marked: false,
                deleted: false,
            })
            .unwrap();
        let (session, mut out_rx) = test_session(catalog.clone());

        let mark = Payload {
            r#type: PayloadType::Request as i32,
            request_id: b"req-3".to_vec(),
            request_method: RequestMethod::MarkNotifications as i32,
            mark_notifications_request: Some(crate::pb::MarkNotificationsRequest {
                mark_read_ids: vec![n1.id.clone()],
                unmark_read_ids: vec![],
                delete_ids: vec![],
            }),
            ..Default::default()
        };
        session.handle_frame(&mark.encode_to_vec()).await;
        let resp = Payload::decode(out_rx.recv().await.unwrap().as_slice()).unwrap();
        assert!(resp.response_ok);

        let rows = catalog.notifications("tenant-1", "acct-1", None, 10).unwrap();
        assert!(rows[0].read_marked);
    }
}
