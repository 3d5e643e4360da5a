//! Leader-driven workflow engine (§4.6): durable events drive a per-flow
//! state machine; only the elected leader advances pending events.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, EventRecord, EventType, FlowState, WorkflowRecord};
use crate::election::{LeaderElection, Role};
use crate::error::{Error, Result};
use crate::mail::{MailAddress, MailSender, SendMailParams};
use crate::notify::NotificationFacade;
use crate::taskqueue::BrokerClient;
use crate::template::Templates;

static WORKFLOW_NAME_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex"));

/// `api_model.DigestTiming`: only `event` has an executing code path in the
/// original (window starts at the triggering event); `schedule` is accepted
/// for forward-compatible deserialization but is otherwise inert (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DigestTiming {
    #[default]
    Event,
    Schedule,
}

/// One step of a workflow's flow, keyed by a JSON `type` discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FlowStep {
    #[serde(rename = "notification")]
    Notification { subject_template: String },
    #[serde(rename = "email")]
    Email { subject_template: String, content_template: String },
    #[serde(rename = "digest")]
    Digest {
        #[serde(rename = "eventTime")]
        event_time_secs: i64,
        #[serde(default)]
        timing: DigestTiming,
    },
}

fn parse_flow(flow: &Value) -> Result<Vec<FlowStep>> {
    serde_json::from_value(flow.clone()).map_err(|e| Error::Validation(format!("malformed workflow flow: {e}")))
}

fn validate_workflow_name(name: &str) -> Result<()> {
    if WORKFLOW_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!("workflow name '{name}' is not URL-safe")))
    }
}

fn tenant_id_of(event: &EventRecord) -> Result<String> {
    event
        .tenant
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Validation(format!("event {} missing tenant.id", event.id)))
}

fn account_id_of(event: &EventRecord) -> Result<String> {
    event
        .subscriber
        .get("accountId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Validation(format!("event {} missing subscriber.accountId", event.id)))
}

pub struct WorkflowEngine {
    catalog: Arc<Catalog>,
    notify: Arc<NotificationFacade>,
    mail: Arc<dyn MailSender>,
    templates: Arc<Templates>,
    broker: Arc<dyn BrokerClient>,
    broker_routing_key_prefix: String,
    tick_lock: tokio::sync::Mutex<()>,
}

impl WorkflowEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        notify: Arc<NotificationFacade>,
        mail: Arc<dyn MailSender>,
        templates: Arc<Templates>,
        broker: Arc<dyn BrokerClient>,
        broker_routing_key_prefix: String,
    ) -> Self {
        WorkflowEngine {
            catalog,
            notify,
            mail,
            templates,
            broker,
            broker_routing_key_prefix,
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn create_workflow(&self, name: &str, flow: Value) -> Result<WorkflowRecord> {
        validate_workflow_name(name)?;
        parse_flow(&flow)?;
        self.catalog.create_workflow(name, flow)
    }

    pub fn latest_workflow(&self, name: &str) -> Result<WorkflowRecord> {
        self.catalog
            .latest_workflow(name)?
            .ok_or_else(|| Error::not_found(format!("workflow '{name}'")))
    }

    pub async fn trigger(&self, name: &str, tenant: Value, subscriber: Value, event: Value) -> Result<String> {
        let workflow = self.latest_workflow(name)?;
        let flow = parse_flow(&workflow.flow)?;
        let record = EventRecord {
            id: String::new(),
            tenant,
            subscriber,
            workflow_name: name.to_string(),
            workflow_revision: workflow.revision,
            event_type: EventType::Trigger,
            next_after_at: 0,
            finished: false,
            data: event,
            flow_state: vec![FlowState::Waiting; flow.len()],
            flow_error: vec![None; flow.len()],
            digest_data: None,
        };
        let inserted = self.catalog.insert_event(record)?;

        let routing_key = format!("{}trigger", self.broker_routing_key_prefix);
        if let Err(e) = self.broker.publish(&routing_key, inserted.id.as_bytes()).await {
            tracing::debug!("advisory task-queue hint failed (ignored, leader poll is authoritative): {e}");
        }
        Ok(inserted.id)
    }

    /// Runs until cancelled, ticking only while this node holds the leader
    /// role. Role transitions are observed via a `watch` channel rather than
    /// the callback list the spec describes in prose — the idiomatic async
    /// equivalent (see DESIGN.md).
    pub async fn run(self: Arc<Self>, election: Arc<LeaderElection>, cancel: CancellationToken) {
        let mut role_rx = election.subscribe();
        loop {
            if matches!(*role_rx.borrow(), Role::Leader) {
                self.clone().run_while_leader(&mut role_rx, cancel.clone()).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = role_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_while_leader(self: &Arc<Self>, role_rx: &mut tokio::sync::watch::Receiver<Role>, cancel: CancellationToken) {
        tracing::info!("workflow engine: became leader, starting tick loop");
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = role_rx.changed() => {
                    if changed.is_err() || !matches!(*role_rx.borrow(), Role::Leader) {
                        tracing::info!("workflow engine: lost leadership, stopping tick loop");
                        return;
                    }
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        let _guard = self.tick_lock.lock().await;
        let now = now_secs();
        let due = match self.catalog.due_events(now) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!("failed to query due events: {e}");
                return;
            }
        };
        for event in due {
            let workflow = match self.catalog.workflow_revision(&event.workflow_name, event.workflow_revision) {
                Ok(Some(wf)) => wf,
                Ok(None) => {
                    tracing::warn!("event {} references missing workflow {}@{}", event.id, event.workflow_name, event.workflow_revision);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("failed to load workflow for event {}: {e}", event.id);
                    continue;
                }
            };
            let flow = match parse_flow(&workflow.flow) {
                Ok(flow) => flow,
                Err(e) => {
                    tracing::warn!("event {} has an unparsable flow: {e}", event.id);
                    continue;
                }
            };
            if let Err(e) = self.handle_queued(event.clone(), &flow).await {
                tracing::warn!("event {} processing aborted this tick, will retry: {e}", event.id);
            }
        }
    }

    /// Advances one event through its flow until it hits a digest step, runs
    /// out of steps, or a database write fails. The database-write failure
    /// case propagates so the caller leaves `finished=false` for a retry;
    /// step execution failures are captured per-index instead.
    async fn handle_queued(&self, mut event: EventRecord, flow: &[FlowStep]) -> Result<()> {
        for i in 0..flow.len() {
            if event.flow_state[i] == FlowState::Processed {
                continue;
            }
            if let FlowStep::Digest { event_time_secs, .. } = &flow[i] {
                if event.event_type == EventType::Trigger {
                    // A fresh trigger collapses into the tenant/account's open
                    // aggregator instead of carrying its own flow forward.
                    let tenant_id = tenant_id_of(&event)?;
                    let account_id = account_id_of(&event)?;
                    self.catalog.upsert_digest_event(
                        &tenant_id,
                        &account_id,
                        now_secs(),
                        *event_time_secs,
                        i,
                        flow.len(),
                        &event.tenant,
                        &event.subscriber,
                        &event.workflow_name,
                        event.workflow_revision,
                        &event.id,
                    )?;
                    event.finished = true;
                    self.catalog.save_event(&event)?;
                    return Ok(());
                }
                // This event is itself the aggregator; its digest step is
                // satisfied by construction once it becomes due.
                event.flow_state[i] = FlowState::Processed;
                self.catalog.save_event(&event)?;
                continue;
            }

            match self.execute_step(&event, &flow[i]).await {
                Ok(()) => event.flow_state[i] = FlowState::Processed,
                Err(e) => {
                    event.flow_state[i] = FlowState::Error;
                    event.flow_error[i] = Some(e.to_string());
                }
            }
            self.catalog.save_event(&event)?;
        }
        event.finished = true;
        self.catalog.save_event(&event)?;
        Ok(())
    }

    async fn execute_step(&self, event: &EventRecord, step: &FlowStep) -> Result<()> {
        let tenant_id = tenant_id_of(event)?;
        let account_id = account_id_of(event)?;
        let step_ctx = self.render_context(event)?;
        let render_ctx = json!({"tenant": event.tenant, "subscriber": event.subscriber, "step": step_ctx});

        match step {
            FlowStep::Notification { subject_template } => {
                let subject = self.templates.render(subject_template, &render_ctx)?;
                self.notify.notify(&tenant_id, &account_id, subject, step_ctx).await?;
                Ok(())
            }
            FlowStep::Email { subject_template, content_template } => {
                let subject = self.templates.render(subject_template, &render_ctx)?;
                let html = self.templates.render(content_template, &render_ctx)?;
                let full_name = event.subscriber.get("fullName").and_then(Value::as_str).unwrap_or_default();
                let address = event.subscriber.get("email").and_then(Value::as_str).unwrap_or_default();
                self.mail
                    .send(&SendMailParams {
                        to: vec![MailAddress { name: full_name.to_string(), address: address.to_string() }],
                        subject,
                        html,
                    })
                    .await
            }
            FlowStep::Digest { .. } => unreachable!("digest steps are intercepted before execute_step"),
        }
    }

    /// §4.6 "Render context for digest vs trigger".
    fn render_context(&self, event: &EventRecord) -> Result<Value> {
        match event.event_type {
            EventType::Digest => {
                let ids = event.digest_data.as_ref().map(|d| d.event_ids.clone()).unwrap_or_default();
                let children = self.catalog.events_by_ids(&ids)?;
                if children.len() != ids.len() {
                    return Err(Error::Validation(format!(
                        "digest event {} consistency check failed: expected {} children, found {}",
                        event.id,
                        ids.len(),
                        children.len()
                    )));
                }
                let events: Vec<Value> = children.into_iter().map(|c| c.data).collect();
                Ok(json!({"digest": true, "totalCount": events.len(), "events": events}))
            }
            EventType::Trigger => Ok(json!({"digest": false, "totalCount": 1, "events": [event.data.clone()]})),
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
    use crate::taskqueue::NullBroker;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingMail {
        sent: Mutex<Vec<SendMailParams>>,
    }

    #[async_trait]
    impl MailSender for RecordingMail {
        async fn send(&self, params: &SendMailParams) -> Result<()> {
            self.sent.lock().unwrap().push(SendMailParams {
                to: params.to.iter().map(|a| MailAddress { name: a.name.clone(), address: a.address.clone() }).collect(),
                subject: params.subject.clone(),
                html: params.html.clone(),
            });
            Ok(())
        }
    }

    fn engine_with_mail() -> (Arc<WorkflowEngine>, Arc<RecordingMail>, Arc<Catalog>) {
        let catalog = Arc::new(Catalog::open(":memory:").unwrap());
        let pubsub_catalog = catalog.clone();
        let directory = crate::directory::PeerDirectory::new(pubsub_catalog.clone(), "127.0.0.1".into(), 0);
        let pubsub = crate::pubsub::PubSub::new(directory.self_id.clone(), pubsub_catalog, directory);
        let notify = Arc::new(NotificationFacade::new(catalog.clone(), pubsub));
        let templates = Arc::new(Templates::new(catalog.clone(), "en-US").unwrap());
        let mail = Arc::new(RecordingMail { sent: Mutex::new(Vec::new()) });
        let engine = Arc::new(WorkflowEngine::new(
            catalog.clone(),
            notify,
            mail.clone(),
            templates,
            Arc::new(NullBroker),
            "noty.".into(),
        ));
        (engine, mail, catalog)
    }

    #[tokio::test]
    async fn digest_collapses_n_triggers_into_one_email() {
        let (engine, mail, catalog) = engine_with_mail();
        let flow = json!([
            {"type": "digest", "eventTime": 5},
            {"type": "email", "subjectTemplate": "TestMail: Today, {{ subscriber.fullName }}'s activities: {{ step.totalCount }}", "contentTemplate": "body"},
        ]);
        engine.create_workflow("user-activity", flow).unwrap();

        let tenant = json!({"id": "tenant-1"});
        let subscriber = json!({"accountId": "acct-1", "fullName": "Ada", "email": "ada@example.com"});

        for i in 0..3 {
            engine
                .trigger("user-activity", tenant.clone(), subscriber.clone(), json!({"TEST": format!("{i}")}))
                .await
                .unwrap();
        }

        // First tick: all three trigger events hit the digest step and
        // collapse into a single aggregator event.
        for ev in catalog.due_events(now_secs()).unwrap() {
            let wf = catalog.workflow_revision(&ev.workflow_name, ev.workflow_revision).unwrap().unwrap();
            let flow = parse_flow(&wf.flow).unwrap();
            engine.handle_queued(ev, &flow).await.unwrap();
        }

        // Advance past the digest window and let the leader tick process
        // the aggregator event.
        let later = now_secs() + 6;
        let due = catalog.due_events(later).unwrap();
        assert_eq!(due.len(), 1);
        let digest_event = due.into_iter().next().unwrap();
        assert_eq!(digest_event.event_type, EventType::Digest);
        let wf = catalog.workflow_revision(&digest_event.workflow_name, digest_event.workflow_revision).unwrap().unwrap();
        let flow = parse_flow(&wf.flow).unwrap();
        engine.handle_queued(digest_event, &flow).await.unwrap();

        let sent = mail.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.contains("Today, Ada's activities: 3"), "subject was: {}", sent[0].subject);
    }

    #[tokio::test]
    async fn replaying_handle_queued_does_not_resend_processed_steps() {
        let (engine, mail, catalog) = engine_with_mail();
        let flow = json!([{"type": "email", "subjectTemplate": "hi", "contentTemplate": "body"}]);
        engine.create_workflow("welcome", flow.clone()).unwrap();
        let tenant = json!({"id": "tenant-1"});
        let subscriber = json!({"accountId": "acct-1", "fullName": "Ada", "email": "ada@example.com"});
        let id = engine.trigger("welcome", tenant, subscriber, json!({})).await.unwrap();

        let parsed_flow = parse_flow(&flow).unwrap();
        let event = catalog.due_events(now_secs()).unwrap().into_iter().find(|e| e.id == id).unwrap();
        engine.handle_queued(event.clone(), &parsed_flow).await.unwrap();
        assert_eq!(mail.sent.lock().unwrap().len(), 1);

        // Re-running on the now-finished event must not resend.
        let reloaded = catalog.events_by_ids(&[id]).unwrap().into_iter().next().unwrap();
        assert!(reloaded.finished);
        engine.handle_queued(reloaded, &parsed_flow).await.unwrap();
        assert_eq!(mail.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn digest_step_defaults_timing_to_event_and_accepts_schedule() {
        let bare = json!({"type": "digest", "eventTime": 5});
        let step: FlowStep = serde_json::from_value(bare).unwrap();
        assert!(matches!(step, FlowStep::Digest { timing: DigestTiming::Event, .. }));

        let scheduled = json!({"type": "digest", "eventTime": 5, "timing": "schedule"});
        let step: FlowStep = serde_json::from_value(scheduled).unwrap();
        assert!(matches!(step, FlowStep::Digest { timing: DigestTiming::Schedule, .. }));
    }
}
