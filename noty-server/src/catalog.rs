//! Shared catalog adapter.
//!
//! Grounded on the teacher's `Db` (a single `rusqlite::Connection` wrapped in
//! a struct with one concrete method per concern) and on the original's
//! generic `MongoKVStore[D]` + `mongo_leader`/`mongo_util` packages. Mongo's
//! change-stream and TTL-index primitives have no SQLite equivalent, so both
//! are emulated here exactly as described in the design notes: every row
//! carries a monotonically increasing `seq` (the SQLite rowid), deletions are
//! recorded in a side `tombstones` table (SQLite does not retain deleted
//! rows), and "TTL expiry" is a `heartbeat_at` filter applied at read time
//! plus an eager reap on write.
//!
//! Every collection gets its own concrete CRUD surface rather than a generic
//! `Catalog<D>` — the original's generics don't carry over cleanly to
//! per-collection SQL schemas, and the teacher's own `Db` favors concrete
//! methods over a generic store.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One step's outcome within an `EventRecord`'s flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowState {
    Waiting,
    Processed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Trigger,
    Digest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DigestData {
    pub event_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub address: String,
    pub port: u16,
    pub heartbeat_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub key: String,
    pub peer_id: String,
    pub heartbeat_at: i64,
}

pub enum LeaseOutcome {
    Leader,
    Follower { holder: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub tenant_id: String,
    pub topic: String,
    pub peer_id: String,
    pub heartbeat_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub name: String,
    pub revision: i64,
    pub flow: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub tenant: serde_json::Value,
    pub subscriber: serde_json::Value,
    pub workflow_name: String,
    pub workflow_revision: i64,
    pub event_type: EventType,
    pub next_after_at: i64,
    pub finished: bool,
    pub data: serde_json::Value,
    pub flow_state: Vec<FlowState>,
    pub flow_error: Vec<Option<String>>,
    pub digest_data: Option<DigestData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub tenant_id: String,
    pub account_id: String,
    pub subject: String,
    pub step: serde_json::Value,
    pub read_marked: bool,
    pub deleted: bool,
}

/// One entry from a collection's change feed, emulated via long-poll (§9).
#[derive(Debug, Clone)]
pub enum ChangeEvent<D> {
    Upserted { key: String, document: D },
    Deleted { key: String },
}

fn fresh_hex_id() -> String {
    let bytes: [u8; 12] = rand::random();
    hex::encode(bytes)
}

pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

impl Catalog {
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| Error::Fatal(format!("catalog open failed: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        let catalog = Catalog { conn: Arc::new(Mutex::new(conn)) };
        catalog.init()?;
        Ok(catalog)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS peers (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                peer_id TEXT UNIQUE NOT NULL,
                address TEXT NOT NULL,
                port INTEGER NOT NULL,
                heartbeat_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS leases (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT UNIQUE NOT NULL,
                peer_id TEXT NOT NULL,
                heartbeat_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS subscriptions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                heartbeat_at INTEGER NOT NULL,
                UNIQUE(tenant_id, topic, peer_id)
            );
            CREATE TABLE IF NOT EXISTS workflows (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                revision INTEGER NOT NULL,
                flow TEXT NOT NULL,
                UNIQUE(name, revision)
            );
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE NOT NULL,
                tenant TEXT NOT NULL,
                subscriber TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                workflow_revision INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                next_after_at INTEGER NOT NULL,
                finished INTEGER NOT NULL,
                data TEXT NOT NULL,
                flow_state TEXT NOT NULL,
                flow_error TEXT NOT NULL,
                digest_data TEXT
            );
            CREATE INDEX IF NOT EXISTS events_due ON events(finished, next_after_at);
            CREATE TABLE IF NOT EXISTS notifications (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE NOT NULL,
                tenant_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                step TEXT NOT NULL,
                read_marked INTEGER NOT NULL,
                deleted INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS notifications_account ON notifications(account_id, id);
            CREATE TABLE IF NOT EXISTS i18ns (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                locale TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                UNIQUE(locale, key)
            );
            CREATE TABLE IF NOT EXISTS tombstones (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                key TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| Error::Fatal(format!("catalog schema init failed: {e}")))?;
        Ok(())
    }

    fn tombstone(&self, conn: &Connection, collection: &str, key: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO tombstones (collection, key) VALUES (?1, ?2)",
            params![collection, key],
        )?;
        Ok(())
    }

    // ---- peers ----

    pub fn heartbeat_peer(&self, peer_id: &str, address: &str, port: u16, now: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO peers (peer_id, address, port, heartbeat_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(peer_id) DO UPDATE SET address=excluded.address, port=excluded.port, heartbeat_at=excluded.heartbeat_at",
            params![peer_id, address, port as i64, now],
        )?;
        Ok(())
    }

    pub fn delete_peer(&self, peer_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM peers WHERE peer_id = ?1", params![peer_id])?;
        self.tombstone(&conn, "peers", peer_id)?;
        Ok(())
    }

    pub fn live_peers(&self, cutoff: i64) -> Result<Vec<PeerRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT peer_id, address, port, heartbeat_at FROM peers WHERE heartbeat_at >= ?1",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |row| {
                Ok(PeerRecord {
                    peer_id: row.get(0)?,
                    address: row.get(1)?,
                    port: row.get::<_, i64>(2)? as u16,
                    heartbeat_at: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn watch_peers(&self, resume_token: i64) -> Result<(Vec<ChangeEvent<PeerRecord>>, i64)> {
        self.poll_changes(resume_token, "peers", |row| {
            Ok(PeerRecord {
                peer_id: row.get(1)?,
                address: row.get(2)?,
                port: row.get::<_, i64>(3)? as u16,
                heartbeat_at: row.get(4)?,
            })
        })
    }

    // ---- leases ----

    /// Insert-if-absent / refresh-if-owned. A uniqueness violation on the
    /// insert attempt means another peer already holds the lease.
    pub fn upsert_lease(&self, key: &str, peer_id: &str, now: i64, ttl_secs: i64) -> Result<LeaseOutcome> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM leases WHERE key = ?1 AND heartbeat_at < ?2",
            params![key, now - ttl_secs],
        )?;

        let refreshed = conn.execute(
            "UPDATE leases SET heartbeat_at = ?1 WHERE key = ?2 AND peer_id = ?3",
            params![now, key, peer_id],
        )?;
        if refreshed == 1 {
            return Ok(LeaseOutcome::Leader);
        }

        let insert = conn.execute(
            "INSERT INTO leases (key, peer_id, heartbeat_at) VALUES (?1, ?2, ?3)",
            params![key, peer_id, now],
        );
        match insert {
            Ok(_) => Ok(LeaseOutcome::Leader),
            Err(e) => {
                let err: Error = e.into();
                if err.is_unique_violation() {
                    let holder: String = conn.query_row(
                        "SELECT peer_id FROM leases WHERE key = ?1",
                        params![key],
                        |row| row.get(0),
                    )?;
                    Ok(LeaseOutcome::Follower { holder })
                } else {
                    Err(err)
                }
            }
        }
    }

    // ---- subscriptions ----

    pub fn upsert_subscription(&self, tenant_id: &str, topic: &str, peer_id: &str, now: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let existed: Option<i64> = conn
            .query_row(
                "SELECT seq FROM subscriptions WHERE tenant_id=?1 AND topic=?2 AND peer_id=?3",
                params![tenant_id, topic, peer_id],
                |row| row.get(0),
            )
            .optional()?;
        conn.execute(
            "INSERT INTO subscriptions (tenant_id, topic, peer_id, heartbeat_at) VALUES (?1,?2,?3,?4)
             ON CONFLICT(tenant_id, topic, peer_id) DO UPDATE SET heartbeat_at=excluded.heartbeat_at",
            params![tenant_id, topic, peer_id, now],
        )?;
        Ok(existed.is_none())
    }

    pub fn delete_subscription(&self, tenant_id: &str, topic: &str, peer_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM subscriptions WHERE tenant_id=?1 AND topic=?2 AND peer_id=?3",
            params![tenant_id, topic, peer_id],
        )?;
        self.tombstone(&conn, "subscriptions", &format!("{tenant_id}|{topic}|{peer_id}"))?;
        Ok(())
    }

    pub fn watch_subscriptions(&self, resume_token: i64) -> Result<(Vec<ChangeEvent<SubscriptionRecord>>, i64)> {
        self.poll_changes(resume_token, "subscriptions", |row| {
            Ok(SubscriptionRecord {
                tenant_id: row.get(1)?,
                topic: row.get(2)?,
                peer_id: row.get(3)?,
                heartbeat_at: row.get(4)?,
            })
        })
    }

    // ---- workflows ----

    pub fn create_workflow(&self, name: &str, flow: serde_json::Value) -> Result<WorkflowRecord> {
        let conn = self.conn.lock();
        let latest: Option<i64> = conn
            .query_row(
                "SELECT MAX(revision) FROM workflows WHERE name=?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let revision = latest.map(|r| r + 1).unwrap_or(0);
        let flow_text = serde_json::to_string(&flow)?;
        conn.execute(
            "INSERT INTO workflows (name, revision, flow) VALUES (?1, ?2, ?3)",
            params![name, revision, flow_text],
        )?;
        Ok(WorkflowRecord { name: name.to_string(), revision, flow })
    }

    pub fn latest_workflow(&self, name: &str) -> Result<Option<WorkflowRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT name, revision, flow FROM workflows WHERE name=?1 ORDER BY revision DESC LIMIT 1",
            params![name],
            Self::decode_workflow,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn workflow_revision(&self, name: &str, revision: i64) -> Result<Option<WorkflowRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT name, revision, flow FROM workflows WHERE name=?1 AND revision=?2",
            params![name, revision],
            Self::decode_workflow,
        )
        .optional()
        .map_err(Into::into)
    }

    fn decode_workflow(row: &Row) -> rusqlite::Result<WorkflowRecord> {
        let flow_text: String = row.get(2)?;
        let flow = serde_json::from_str(&flow_text).unwrap_or(serde_json::Value::Null);
        Ok(WorkflowRecord { name: row.get(0)?, revision: row.get(1)?, flow })
    }

    // ---- events ----

    pub fn insert_event(&self, mut event: EventRecord) -> Result<EventRecord> {
        if event.id.is_empty() {
            event.id = fresh_hex_id();
        }
        let conn = self.conn.lock();
        Self::write_event(&conn, &event, true)?;
        Ok(event)
    }

    pub fn save_event(&self, event: &EventRecord) -> Result<()> {
        let conn = self.conn.lock();
        Self::write_event(&conn, event, false)
    }

    fn write_event(conn: &Connection, event: &EventRecord, insert: bool) -> Result<()> {
        let event_type = match event.event_type {
            EventType::Trigger => "trigger",
            EventType::Digest => "digest",
        };
        let flow_state = serde_json::to_string(&event.flow_state)?;
        let flow_error = serde_json::to_string(&event.flow_error)?;
        let digest_data = event
            .digest_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        if insert {
            conn.execute(
                "INSERT INTO events (id, tenant, subscriber, workflow_name, workflow_revision, event_type, next_after_at, finished, data, flow_state, flow_error, digest_data)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    event.id,
                    event.tenant.to_string(),
                    event.subscriber.to_string(),
                    event.workflow_name,
                    event.workflow_revision,
                    event_type,
                    event.next_after_at,
                    event.finished as i64,
                    event.data.to_string(),
                    flow_state,
                    flow_error,
                    digest_data,
                ],
            )?;
        } else {
            conn.execute(
                "UPDATE events SET next_after_at=?2, finished=?3, flow_state=?4, flow_error=?5, digest_data=?6 WHERE id=?1",
                params![event.id, event.next_after_at, event.finished as i64, flow_state, flow_error, digest_data],
            )?;
        }
        Ok(())
    }

    pub fn due_events(&self, now: i64) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tenant, subscriber, workflow_name, workflow_revision, event_type, next_after_at, finished, data, flow_state, flow_error, digest_data
             FROM events WHERE finished = 0 AND next_after_at <= ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![now], Self::decode_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn events_by_ids(&self, ids: &[String]) -> Result<Vec<EventRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, tenant, subscriber, workflow_name, workflow_revision, event_type, next_after_at, finished, data, flow_state, flow_error, digest_data
             FROM events WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let rows = stmt
            .query_map(params.as_slice(), Self::decode_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn decode_event(row: &Row) -> rusqlite::Result<EventRecord> {
        let event_type_text: String = row.get(5)?;
        let event_type = if event_type_text == "digest" { EventType::Digest } else { EventType::Trigger };
        let tenant_text: String = row.get(1)?;
        let subscriber_text: String = row.get(2)?;
        let data_text: String = row.get(8)?;
        let flow_state_text: String = row.get(9)?;
        let flow_error_text: String = row.get(10)?;
        let digest_data_text: Option<String> = row.get(11)?;
        Ok(EventRecord {
            id: row.get(0)?,
            tenant: serde_json::from_str(&tenant_text).unwrap_or(serde_json::Value::Null),
            subscriber: serde_json::from_str(&subscriber_text).unwrap_or(serde_json::Value::Null),
            workflow_name: row.get(3)?,
            workflow_revision: row.get(4)?,
            event_type,
            next_after_at: row.get(6)?,
            finished: row.get::<_, i64>(7)? != 0,
            data: serde_json::from_str(&data_text).unwrap_or(serde_json::Value::Null),
            flow_state: serde_json::from_str(&flow_state_text).unwrap_or_default(),
            flow_error: serde_json::from_str(&flow_error_text).unwrap_or_default(),
            digest_data: digest_data_text.and_then(|t| serde_json::from_str(&t).ok()),
        })
    }

    /// The digest step's atomic aggregator upsert (§4.6). Keyed on exactly
    /// `(tenant.id, subscriber.accountId, eventType=digest, nextAfterAt >=
    /// now)` — not on `workflow_name`, matching the original's
    /// `upsertLastDigest` (`tenant.id`/`subscriber.accountId`/`eventType`/
    /// `nextAfterAt: {$gte: now}`): two different workflows triggered for the
    /// same tenant/account inside the same window collapse into one
    /// aggregator, the same as the original.
    pub fn upsert_digest_event(
        &self,
        tenant_id: &str,
        account_id: &str,
        now: i64,
        event_time_secs: i64,
        pre_marked_through: usize,
        flow_len: usize,
        meta_tenant: &serde_json::Value,
        meta_subscriber: &serde_json::Value,
        workflow_name: &str,
        workflow_revision: i64,
        triggering_id: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, digest_data FROM events
             WHERE event_type = 'digest' AND finished = 0 AND next_after_at >= ?1
             AND json_extract(tenant, '$.id') = ?2 AND json_extract(subscriber, '$.accountId') = ?3
             LIMIT 1",
        )?;
        let existing: Option<(String, Option<String>)> = stmt
            .query_row(params![now, tenant_id, account_id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        drop(stmt);

        match existing {
            Some((id, digest_data_text)) => {
                let mut digest_data: DigestData = digest_data_text
                    .and_then(|t| serde_json::from_str(&t).ok())
                    .unwrap_or_default();
                digest_data.event_ids.push(triggering_id.to_string());
                let encoded = serde_json::to_string(&digest_data)?;
                conn.execute(
                    "UPDATE events SET digest_data = ?2 WHERE id = ?1",
                    params![id, encoded],
                )?;
            }
            None => {
                let mut flow_state = vec![FlowState::Processed; pre_marked_through];
                flow_state.resize(flow_len, FlowState::Waiting);
                let flow_error: Vec<Option<String>> = vec![None; flow_len];
                let event = EventRecord {
                    id: fresh_hex_id(),
                    tenant: meta_tenant.clone(),
                    subscriber: meta_subscriber.clone(),
                    workflow_name: workflow_name.to_string(),
                    workflow_revision,
                    event_type: EventType::Digest,
                    next_after_at: now + event_time_secs,
                    finished: false,
                    data: serde_json::Value::Null,
                    flow_state,
                    flow_error,
                    digest_data: Some(DigestData { event_ids: vec![triggering_id.to_string()] }),
                };
                Self::write_event(&conn, &event, true)?;
            }
        }
        Ok(())
    }

    // ---- notifications ----

    pub fn insert_notification(&self, mut record: NotificationRecord) -> Result<NotificationRecord> {
        if record.id.is_empty() {
            record.id = fresh_hex_id();
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO notifications (id, tenant_id, account_id, subject, step, read_marked, deleted)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                record.id,
                record.tenant_id,
                record.account_id,
                record.subject,
                record.step.to_string(),
                record.read_marked as i64,
                record.deleted as i64,
            ],
        )?;
        Ok(record)
    }

    pub fn notifications(
        &self,
        tenant_id: &str,
        account_id: &str,
        continue_token: Option<&str>,
        limit: u32,
    ) -> Result<Vec<NotificationRecord>> {
        let conn = self.conn.lock();
        let sql = if continue_token.is_some() {
            "SELECT id, tenant_id, account_id, subject, step, read_marked, deleted FROM notifications
             WHERE tenant_id=?1 AND account_id=?2 AND id < ?3 ORDER BY id DESC LIMIT ?4"
        } else {
            "SELECT id, tenant_id, account_id, subject, step, read_marked, deleted FROM notifications
             WHERE tenant_id=?1 AND account_id=?2 ORDER BY id DESC LIMIT ?4"
        };
        let mut stmt = conn.prepare(sql)?;
        let decode = |row: &Row| {
            let step_text: String = row.get(4)?;
            Ok(NotificationRecord {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                account_id: row.get(2)?,
                subject: row.get(3)?,
                step: serde_json::from_str(&step_text).unwrap_or(serde_json::Value::Null),
                read_marked: row.get::<_, i64>(5)? != 0,
                deleted: row.get::<_, i64>(6)? != 0,
            })
        };
        let rows = if let Some(token) = continue_token {
            stmt.query_map(params![tenant_id, account_id, token, limit], decode)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            stmt.query_map(params![tenant_id, account_id, limit], decode)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }

    pub fn mark_notifications(
        &self,
        tenant_id: &str,
        account_id: &str,
        mark_read_ids: &[String],
        unmark_read_ids: &[String],
        delete_ids: &[String],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let apply = |ids: &[String], sql_set: &str| -> Result<()> {
                if ids.is_empty() {
                    return Ok(());
                }
                let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                let sql = format!(
                    "UPDATE notifications SET {sql_set} WHERE tenant_id=? AND account_id=? AND id IN ({placeholders})"
                );
                let mut stmt_params: Vec<&dyn rusqlite::ToSql> = vec![&tenant_id, &account_id];
                stmt_params.extend(ids.iter().map(|s| s as &dyn rusqlite::ToSql));
                tx.execute(&sql, stmt_params.as_slice())?;
                Ok(())
            };
            apply(mark_read_ids, "read_marked = 1")?;
            apply(unmark_read_ids, "read_marked = 0")?;
            apply(delete_ids, "deleted = 1")?;
        }
        tx.commit()?;
        Ok(())
    }

    // ---- i18n ----

    pub fn all_i18n(&self) -> Result<Vec<(String, String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT locale, key, value FROM i18ns")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- ambient ----

    fn ping(&self) -> Result<()> {
        self.conn.lock().execute_batch("SELECT 1")?;
        Ok(())
    }

    // ---- change-feed machinery ----

    fn poll_changes<D>(
        &self,
        resume_token: i64,
        table: &str,
        decode: impl Fn(&Row) -> rusqlite::Result<D>,
    ) -> Result<(Vec<ChangeEvent<D>>, i64)> {
        let conn = self.conn.lock();
        let mut max_seq = resume_token;
        let mut events = Vec::new();

        let mut stmt = conn.prepare(&format!("SELECT * FROM {table} WHERE seq > ?1 ORDER BY seq"))?;
        let mut rows = stmt.query(params![resume_token])?;
        while let Some(row) = rows.next()? {
            let seq: i64 = row.get(0)?;
            max_seq = max_seq.max(seq);
            let document = decode(row)?;
            let key = Self::row_key(table, row)?;
            events.push((seq, ChangeEvent::Upserted { key, document }));
        }
        drop(stmt);

        let mut tomb_stmt = conn.prepare(
            "SELECT seq, key FROM tombstones WHERE collection = ?1 AND seq > ?2 ORDER BY seq",
        )?;
        let mut tomb_rows = tomb_stmt.query(params![table, resume_token])?;
        while let Some(row) = tomb_rows.next()? {
            let seq: i64 = row.get(0)?;
            max_seq = max_seq.max(seq);
            let key: String = row.get(1)?;
            events.push((seq, ChangeEvent::Deleted { key }));
        }

        events.sort_by_key(|(seq, _)| *seq);
        Ok((events.into_iter().map(|(_, e)| e).collect(), max_seq))
    }

    fn row_key(table: &str, row: &Row) -> rusqlite::Result<String> {
        match table {
            "peers" => row.get(1),
            "subscriptions" => {
                let tenant_id: String = row.get(1)?;
                let topic: String = row.get(2)?;
                let peer_id: String = row.get(3)?;
                Ok(format!("{tenant_id}|{topic}|{peer_id}"))
            }
            _ => row.get(1),
        }
    }
}

#[async_trait::async_trait]
impl crate::health::Provider for Catalog {
    async fn check(&self) -> crate::health::Health {
        match self.ping() {
            Ok(()) => crate::health::Health::up(),
            Err(e) => crate::health::Health::down(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_upsert_grants_one_leader() {
        let catalog = Catalog::open(":memory:").unwrap();
        let first = catalog.upsert_lease("workflow-engine", "node-a", 100, 10).unwrap();
        assert!(matches!(first, LeaseOutcome::Leader));
        let second = catalog.upsert_lease("workflow-engine", "node-b", 101, 10).unwrap();
        assert!(matches!(second, LeaseOutcome::Follower { holder } if holder == "node-a"));
        // The holder refreshing its own lease still wins.
        let refreshed = catalog.upsert_lease("workflow-engine", "node-a", 105, 10).unwrap();
        assert!(matches!(refreshed, LeaseOutcome::Leader));
    }

    #[test]
    fn lease_expires_after_ttl_and_is_reclaimable() {
        let catalog = Catalog::open(":memory:").unwrap();
        catalog.upsert_lease("workflow-engine", "node-a", 0, 10).unwrap();
        let reclaimed = catalog.upsert_lease("workflow-engine", "node-b", 20, 10).unwrap();
        assert!(matches!(reclaimed, LeaseOutcome::Leader));
    }

    #[test]
    fn live_peers_excludes_rows_past_ttl() {
        let catalog = Catalog::open(":memory:").unwrap();
        catalog.heartbeat_peer("node-a", "10.0.0.1", 7946, 100).unwrap();
        catalog.heartbeat_peer("node-b", "10.0.0.2", 7946, 10).unwrap();
        let live = catalog.live_peers(50).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].peer_id, "node-a");
    }

    #[test]
    fn watch_peers_reports_upserts_and_deletes_with_resumable_token() {
        let catalog = Catalog::open(":memory:").unwrap();
        catalog.heartbeat_peer("node-a", "10.0.0.1", 7946, 1).unwrap();
        let (changes, token) = catalog.watch_peers(0).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], ChangeEvent::Upserted { key, .. } if key == "node-a"));

        catalog.delete_peer("node-a").unwrap();
        let (changes, next_token) = catalog.watch_peers(token).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], ChangeEvent::Deleted { key } if key == "node-a"));
        assert!(next_token > token);

        // Resuming from the latest token sees nothing further.
        let (changes, _) = catalog.watch_peers(next_token).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn create_workflow_assigns_incrementing_revisions() {
        let catalog = Catalog::open(":memory:").unwrap();
        let v0 = catalog.create_workflow("welcome", serde_json::json!([])).unwrap();
        let v1 = catalog.create_workflow("welcome", serde_json::json!([{"type": "email"}])).unwrap();
        assert_eq!(v0.revision, 0);
        assert_eq!(v1.revision, 1);
        let latest = catalog.latest_workflow("welcome").unwrap().unwrap();
        assert_eq!(latest.revision, 1);
        assert_eq!(catalog.workflow_revision("welcome", 0).unwrap().unwrap().revision, 0);
    }

    fn sample_event() -> EventRecord {
        EventRecord {
            id: String::new(),
            tenant: serde_json::json!({"id": "t1"}),
            subscriber: serde_json::json!({"accountId": "a1"}),
            workflow_name: "welcome".into(),
            workflow_revision: 0,
            event_type: EventType::Trigger,
            next_after_at: 0,
            finished: false,
            data: serde_json::json!({"k": "v"}),
            flow_state: vec![FlowState::Waiting],
            flow_error: vec![None],
            digest_data: None,
        }
    }

    #[test]
    fn due_events_only_returns_unfinished_events_at_or_before_now() {
        let catalog = Catalog::open(":memory:").unwrap();
        let mut future = sample_event();
        future.next_after_at = 1000;
        catalog.insert_event(future).unwrap();
        let due_now = catalog.insert_event(sample_event()).unwrap();

        let due = catalog.due_events(50).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, due_now.id);
    }

    #[test]
    fn save_event_round_trips_flow_state_and_finished() {
        let catalog = Catalog::open(":memory:").unwrap();
        let mut event = catalog.insert_event(sample_event()).unwrap();
        event.flow_state[0] = FlowState::Processed;
        event.finished = true;
        catalog.save_event(&event).unwrap();

        let reloaded = catalog.events_by_ids(&[event.id.clone()]).unwrap().into_iter().next().unwrap();
        assert!(reloaded.finished);
        assert_eq!(reloaded.flow_state[0], FlowState::Processed);
    }

    #[test]
    fn upsert_digest_event_collapses_repeated_triggers_into_one_aggregator() {
        let catalog = Catalog::open(":memory:").unwrap();
        let tenant = serde_json::json!({"id": "t1"});
        let subscriber = serde_json::json!({"accountId": "a1"});
        for i in 0..3 {
            catalog
                .upsert_digest_event("t1", "a1", 0, 5, 0, 2, &tenant, &subscriber, "welcome", 0, &format!("trig-{i}"))
                .unwrap();
        }
        let due = catalog.due_events(10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].digest_data.as_ref().unwrap().event_ids.len(), 3);
        assert_eq!(due[0].event_type, EventType::Digest);
    }

    #[test]
    fn mark_notifications_only_touches_requested_ids() {
        let catalog = Catalog::open(":memory:").unwrap();
        let make = |subject: &str| NotificationRecord {
            id: String::new(),
            tenant_id: "t1".into(),
            account_id: "a1".into(),
            subject: subject.into(),
            step: serde_json::Value::Null,
            read_marked: false,
            deleted: false,
        };
        let n1 = catalog.insert_notification(make("one")).unwrap();
        let n2 = catalog.insert_notification(make("two")).unwrap();
        let n3 = catalog.insert_notification(make("three")).unwrap();

        catalog.mark_notifications("t1", "a1", &[n1.id.clone(), n3.id.clone()], &[], &[n2.id.clone()]).unwrap();

        let rows = catalog.notifications("t1", "a1", None, 10).unwrap();
        let by_id = |id: &str| rows.iter().find(|r| r.id == id).unwrap();
        assert!(by_id(&n1.id).read_marked);
        assert!(by_id(&n3.id).read_marked);
        assert!(by_id(&n2.id).deleted);
        assert!(!by_id(&n2.id).read_marked);
    }

    #[test]
    fn notifications_pagination_covers_every_row_without_duplicates() {
        let catalog = Catalog::open(":memory:").unwrap();
        let make = |subject: &str| NotificationRecord {
            id: String::new(),
            tenant_id: "t1".into(),
            account_id: "a1".into(),
            subject: subject.into(),
            step: serde_json::Value::Null,
            read_marked: false,
            deleted: false,
        };
        for i in 0..5 {
            catalog.insert_notification(make(&format!("n{i}"))).unwrap();
        }

        let mut seen = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = catalog.notifications("t1", "a1", token.as_deref(), 2).unwrap();
            if page.is_empty() {
                break;
            }
            token = Some(page.last().unwrap().id.clone());
            seen.extend(page.into_iter().map(|r| r.subject));
        }
        seen.sort();
        assert_eq!(seen, vec!["n0", "n1", "n2", "n3", "n4"]);
    }
}
