//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{CanonicalMessage, Channel};
use crate::store::migrations;
use crate::store::traits::{
    AppendOutcome, Database, DeliveryEvent, DeliveryStatus, TaskKind, TaskRun, TaskStatus,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn flag(b: bool) -> i64 {
    i64::from(b)
}

const MESSAGE_COLUMNS: &str = "external_id, thread_id, sender_id, sender_name, sender_is_agent, \
     text, channel, created_at, reply_to, subject, is_group, mentions_agent";

/// Map a libsql Row to a CanonicalMessage.
fn row_to_message(row: &libsql::Row) -> Result<CanonicalMessage, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("message row: {e}"));
    let channel_str: String = row.get(6).map_err(parse)?;
    let channel: Channel = channel_str
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let created_str: String = row.get(7).map_err(parse)?;

    Ok(CanonicalMessage {
        id: row.get(0).map_err(parse)?,
        thread_id: row.get(1).map_err(parse)?,
        sender_id: row.get(2).ok(),
        sender_name: row.get(3).ok(),
        sender_is_agent: row.get::<i64>(4).map_err(parse)? != 0,
        text: row.get(5).map_err(parse)?,
        channel,
        created_at: parse_datetime(&created_str),
        reply_to: row.get(8).map_err(parse)?,
        subject: row.get(9).ok(),
        is_group: row.get::<i64>(10).map_err(parse)? != 0,
        mentions_agent: row.get::<i64>(11).map_err(parse)? != 0,
    })
}

const DELIVERY_COLUMNS: &str = "message_id, provider_id, channel, status, error, created_at";

fn row_to_delivery(row: &libsql::Row) -> Result<DeliveryEvent, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("delivery row: {e}"));
    let status: String = row.get(3).map_err(parse)?;
    let created_str: String = row.get(5).map_err(parse)?;
    Ok(DeliveryEvent {
        message_id: row.get(0).ok(),
        provider_id: row.get(1).ok(),
        channel: row.get(2).map_err(parse)?,
        status: DeliveryStatus::from_provider(&status),
        error: row.get(4).ok(),
        created_at: parse_datetime(&created_str),
    })
}

const TASK_COLUMNS: &str =
    "id, thread_id, kind, status, subject, trigger_id, created_at, updated_at";

fn row_to_task_run(row: &libsql::Row) -> Result<TaskRun, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("task_run row: {e}"));
    let kind: String = row.get(2).map_err(parse)?;
    let kind = match kind.as_str() {
        "welcome_email" => TaskKind::WelcomeEmail,
        other => {
            return Err(DatabaseError::Serialization(format!(
                "unknown task kind: {other}"
            )));
        }
    };
    let status: String = row.get(3).map_err(parse)?;
    let created_str: String = row.get(6).map_err(parse)?;
    let updated_str: String = row.get(7).map_err(parse)?;
    Ok(TaskRun {
        id: row.get(0).map_err(parse)?,
        thread_id: row.get(1).map_err(parse)?,
        kind,
        status: TaskStatus::parse(&status),
        subject: row.get(4).map_err(parse)?,
        trigger_id: row.get(5).map_err(parse)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn get_history(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<CanonicalMessage>, DatabaseError> {
        let conn = self.conn();
        // Newest first so LIMIT keeps the tail; reversed below.
        let limit = limit.map_or(-1, |n| n as i64);
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1
                     ORDER BY created_at DESC, seq DESC LIMIT ?2"
                ),
                params![thread_id, limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_history: {e}")))?;

        let mut messages = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => messages.push(row_to_message(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("get_history: {e}"))),
            }
        }
        messages.reverse();
        Ok(messages)
    }

    async fn append_message(
        &self,
        message: &CanonicalMessage,
    ) -> Result<AppendOutcome, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn();
        let affected = conn
            .execute(
                "INSERT INTO messages (id, thread_id, external_id, channel, sender_id, sender_name,
                    sender_is_agent, text, reply_to, subject, is_group, mentions_agent,
                    created_at, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(thread_id, external_id) DO NOTHING",
                params![
                    id.clone(),
                    message.thread_id.as_str(),
                    message.id.as_str(),
                    message.channel.as_str(),
                    opt_text(message.sender_id.as_deref()),
                    opt_text(message.sender_name.as_deref()),
                    flag(message.sender_is_agent),
                    message.text.as_str(),
                    message.reply_to.as_str(),
                    opt_text(message.subject.as_deref()),
                    flag(message.is_group),
                    flag(message.mentions_agent),
                    format_datetime(&message.created_at),
                    format_datetime(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_message: {e}")))?;

        if affected == 0 {
            debug!(
                thread_id = %message.thread_id,
                message_id = %message.id,
                "Message already stored"
            );
            return Ok(AppendOutcome::Duplicate);
        }

        debug!(
            thread_id = %message.thread_id,
            message_id = %message.id,
            agent = message.sender_is_agent,
            "Message appended"
        );
        Ok(AppendOutcome::Inserted(id))
    }

    async fn get_message(
        &self,
        thread_id: &str,
        external_id: &str,
    ) -> Result<Option<CanonicalMessage>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE thread_id = ?1 AND external_id = ?2 LIMIT 1"
                ),
                params![thread_id, external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_message: {e}"))),
        }
    }

    // ── Deliveries ──────────────────────────────────────────────────

    async fn record_delivery_event(&self, event: &DeliveryEvent) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO delivery_events (message_id, provider_id, channel, status, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                opt_text(event.message_id.as_deref()),
                opt_text(event.provider_id.as_deref()),
                event.channel.as_str(),
                event.status.as_str(),
                opt_text(event.error.as_deref()),
                format_datetime(&event.created_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_delivery_event: {e}")))?;

        debug!(
            message_id = ?event.message_id,
            provider_id = ?event.provider_id,
            status = event.status.as_str(),
            "Delivery event recorded"
        );
        Ok(())
    }

    async fn latest_delivery_event(
        &self,
        provider_id: &str,
    ) -> Result<Option<DeliveryEvent>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {DELIVERY_COLUMNS} FROM delivery_events WHERE provider_id = ?1
                     ORDER BY seq DESC LIMIT 1"
                ),
                params![provider_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_delivery_event: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_delivery(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_delivery_event: {e}"))),
        }
    }

    async fn delivery_events_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<DeliveryEvent>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {DELIVERY_COLUMNS} FROM delivery_events WHERE message_id = ?1
                     ORDER BY seq ASC"
                ),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delivery_events_for_message: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_delivery(&row) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("Skipping delivery row: {e}"),
            }
        }
        Ok(events)
    }

    // ── Task runs ───────────────────────────────────────────────────

    async fn open_task_run(
        &self,
        thread_id: &str,
        kind: TaskKind,
    ) -> Result<Option<TaskRun>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM task_runs
                     WHERE thread_id = ?1 AND kind = ?2 AND status = 'pending'
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![thread_id, kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("open_task_run: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("open_task_run: {e}"))),
        }
    }

    async fn task_run_for_trigger(
        &self,
        thread_id: &str,
        trigger_id: &str,
    ) -> Result<Option<TaskRun>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM task_runs WHERE thread_id = ?1 AND trigger_id = ?2
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![thread_id, trigger_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("task_run_for_trigger: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("task_run_for_trigger: {e}"))),
        }
    }

    async fn create_task_run(
        &self,
        thread_id: &str,
        kind: TaskKind,
        subject: &str,
        trigger_id: &str,
    ) -> Result<TaskRun, DatabaseError> {
        let now = Utc::now();
        let run = TaskRun {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            kind,
            status: TaskStatus::Pending,
            subject: subject.to_string(),
            trigger_id: trigger_id.to_string(),
            created_at: now,
            updated_at: now,
        };

        let conn = self.conn();
        conn.execute(
            "INSERT INTO task_runs (id, thread_id, kind, status, subject, trigger_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                run.id.as_str(),
                thread_id,
                kind.as_str(),
                run.status.as_str(),
                subject,
                trigger_id,
                format_datetime(&now),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_task_run: {e}")))?;

        info!(id = %run.id, thread_id, kind = kind.as_str(), "Task run created");
        Ok(run)
    }

    async fn update_task_run_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE task_runs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), format_datetime(&Utc::now()), id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("update_task_run_status: {e}")))?;

        debug!(id, status = status.as_str(), "Task run status updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn message(id: &str, thread: &str, secs: i64, agent: bool, text: &str) -> CanonicalMessage {
        let base = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap();
        CanonicalMessage {
            id: id.into(),
            thread_id: thread.into(),
            sender_id: (!agent).then(|| "whatsapp:15551234567".to_string()),
            sender_name: (!agent).then(|| "Jane".to_string()),
            sender_is_agent: agent,
            text: text.into(),
            channel: Channel::WhatsApp,
            created_at: base + Duration::seconds(secs),
            reply_to: thread.into(),
            subject: None,
            is_group: false,
            mentions_agent: false,
        }
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let original = message("m1", "t1", 0, false, "Hi");
        let outcome = db.append_message(&original).await.unwrap();
        assert!(matches!(outcome, AppendOutcome::Inserted(_)));

        let history = db.get_history("t1", None).await.unwrap();
        assert_eq!(history, vec![original]);
    }

    #[tokio::test]
    async fn duplicate_append_is_detected() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let msg = message("m1", "t1", 0, false, "Hi");
        db.append_message(&msg).await.unwrap();
        assert!(db.append_message(&msg).await.unwrap().is_duplicate());
        assert_eq!(db.get_history("t1", None).await.unwrap().len(), 1);

        // Same external id in another thread is a different message.
        let other = message("m1", "t2", 0, false, "Hi");
        assert!(!db.append_message(&other).await.unwrap().is_duplicate());
    }

    #[tokio::test]
    async fn history_orders_by_time_then_insertion() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.append_message(&message("late", "t1", 10, false, "second"))
            .await
            .unwrap();
        db.append_message(&message("early", "t1", 0, false, "first"))
            .await
            .unwrap();
        db.append_message(&message("tie-a", "t1", 10, true, "third"))
            .await
            .unwrap();

        let texts: Vec<String> = db
            .get_history("t1", None)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn history_limit_keeps_most_recent() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        for i in 0..5 {
            db.append_message(&message(&format!("m{i}"), "t1", i, false, &i.to_string()))
                .await
                .unwrap();
        }
        let texts: Vec<String> = db
            .get_history("t1", Some(2))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, ["3", "4"]);
    }

    #[tokio::test]
    async fn get_message_is_thread_scoped() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.append_message(&message("m1", "t1", 0, false, "Hi"))
            .await
            .unwrap();
        let stored = db.get_message("t1", "m1").await.unwrap().unwrap();
        assert_eq!(stored.text, "Hi");
        assert!(db.get_message("t2", "m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delivery_events_append_only() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut event = DeliveryEvent {
            message_id: Some("reply:m1".into()),
            provider_id: None,
            channel: "sms".into(),
            status: DeliveryStatus::Pending,
            error: None,
            created_at: Utc::now(),
        };
        db.record_delivery_event(&event).await.unwrap();
        event.provider_id = Some("SM123".into());
        event.status = DeliveryStatus::Sent;
        db.record_delivery_event(&event).await.unwrap();
        db.record_delivery_event(&DeliveryEvent {
            message_id: None,
            provider_id: Some("SM123".into()),
            channel: "sms".into(),
            status: DeliveryStatus::Delivered,
            error: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let events = db.delivery_events_for_message("reply:m1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, DeliveryStatus::Pending);

        let latest = db.latest_delivery_event("SM123").await.unwrap().unwrap();
        assert_eq!(latest.status, DeliveryStatus::Delivered);
        assert!(db.latest_delivery_event("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn task_run_lifecycle() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        assert!(
            db.open_task_run("t1", TaskKind::WelcomeEmail)
                .await
                .unwrap()
                .is_none()
        );

        let run = db
            .create_task_run("t1", TaskKind::WelcomeEmail, "jane@example.com", "m7")
            .await
            .unwrap();
        let open = db
            .open_task_run("t1", TaskKind::WelcomeEmail)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(open.id, run.id);
        assert_eq!(open.subject, "jane@example.com");

        db.update_task_run_status(&run.id, TaskStatus::Completed)
            .await
            .unwrap();
        assert!(
            db.open_task_run("t1", TaskKind::WelcomeEmail)
                .await
                .unwrap()
                .is_none()
        );

        let by_trigger = db.task_run_for_trigger("t1", "m7").await.unwrap().unwrap();
        assert_eq!(by_trigger.status, TaskStatus::Completed);
        assert!(db.task_run_for_trigger("t1", "m8").await.unwrap().is_none());
        assert!(db.task_run_for_trigger("t2", "m7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("concierge.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.append_message(&message("m1", "t1", 0, false, "Hi"))
                .await
                .unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.get_history("t1", None).await.unwrap().len(), 1);
    }
}
