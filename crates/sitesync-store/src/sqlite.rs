//! SQLite implementation of the EventLog trait.
//!
//! This is the primary storage backend for Sitesync. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking.
//!
//! Status transitions are read-modify-write cycles inside an `IMMEDIATE`
//! transaction, so they serialize against other processes sharing the same
//! database file as well as against other tasks in this process.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;

use sitesync_core::{
    DeliveryStatus, EventId, PollRun, PollingState, Resolution, SiteId, SyncEvent, SyncMetrics,
    WebhookDelivery, WorkspaceId, CLAIM_EXPIRED_ERROR, FORCE_COMPLETED_ERROR,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{EventFilter, EventLog};

const EVENT_COLUMNS: &str = "event_id, workspace_id, event_type, entity_type, entity_id, payload,
    changed_fields, sites_to_sync, sites_synced, status, retry_count, max_retries, triggered_by,
    source, created_at, processed_at, next_retry_at, claimed_at, error_message";

const DELIVERY_COLUMNS: &str = "delivery_id, sync_event_id, workspace_id, target_site_id,
    target_url, attempt_number, status, scheduled_at, sent_at, response_received_at,
    http_status_code, response_body, error_message, duration_ms";

const POLLING_COLUMNS: &str = "workspace_id, last_poll_at, next_poll_at, last_change_detected_at,
    is_polling_active, consecutive_failures, max_failures, last_error";

const METRICS_COLUMNS: &str = "workspace_id, date, events_generated, events_processed,
    events_failed, webhooks_sent, webhooks_delivered, webhooks_failed, avg_delivery_latency_ms,
    max_delivery_latency_ms, polls_executed, polls_failed, changes_detected_by_polling, computed_at";

/// SQLite-based event log.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteEventLog {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventLog {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation on the connection off the async runtime.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Load, mutate and write back one event inside an IMMEDIATE transaction.
    ///
    /// `f` returns whether it changed the event; unchanged events are not
    /// written.
    async fn transition<F, T>(&self, id: EventId, f: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut SyncEvent) -> Option<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut event) = load_event(&tx, id)? else {
                return Ok(None);
            };
            let outcome = f(&mut event);
            if outcome.is_some() {
                save_event(&tx, &event)?;
            }
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Column helpers
// ─────────────────────────────────────────────────────────────────────────────

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn opt_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(millis)
}

fn conversion_error<E>(col: &str, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    tracing::warn!(column = col, error = %err, "undecodable column value");
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
}

fn ts_col(row: &Row<'_>, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(col)?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms))
}

fn opt_ts_col(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(col)?;
    ms.map(|ms| {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms))
    })
    .transpose()
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, col: &str) -> rusqlite::Result<T> {
    let text: String = row.get(col)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(col, e))
}

fn parsed_col<T>(row: &Row<'_>, col: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(col)?;
    text.parse().map_err(|e| conversion_error(col, e))
}

fn u64_col(row: &Row<'_>, col: &str) -> rusqlite::Result<u64> {
    let value: i64 = row.get(col)?;
    Ok(value.max(0) as u64)
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<SyncEvent> {
    Ok(SyncEvent {
        event_id: parsed_col(row, "event_id")?,
        workspace_id: WorkspaceId::new(row.get::<_, String>("workspace_id")?),
        event_type: row.get("event_type")?,
        entity_type: parsed_col(row, "entity_type")?,
        entity_id: row.get("entity_id")?,
        payload: json_col(row, "payload")?,
        changed_fields: json_col(row, "changed_fields")?,
        sites_to_sync: json_col(row, "sites_to_sync")?,
        sites_synced: json_col(row, "sites_synced")?,
        status: parsed_col(row, "status")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        triggered_by: row.get("triggered_by")?,
        source: parsed_col(row, "source")?,
        created_at: ts_col(row, "created_at")?,
        processed_at: opt_ts_col(row, "processed_at")?,
        next_retry_at: opt_ts_col(row, "next_retry_at")?,
        claimed_at: opt_ts_col(row, "claimed_at")?,
        error_message: row.get("error_message")?,
    })
}

fn row_to_delivery(row: &Row<'_>) -> rusqlite::Result<WebhookDelivery> {
    let duration_ms: Option<i64> = row.get("duration_ms")?;
    Ok(WebhookDelivery {
        delivery_id: parsed_col(row, "delivery_id")?,
        sync_event_id: parsed_col(row, "sync_event_id")?,
        workspace_id: WorkspaceId::new(row.get::<_, String>("workspace_id")?),
        target_site_id: SiteId::new(row.get::<_, String>("target_site_id")?),
        target_url: row.get("target_url")?,
        attempt_number: row.get("attempt_number")?,
        status: parsed_col(row, "status")?,
        scheduled_at: ts_col(row, "scheduled_at")?,
        sent_at: opt_ts_col(row, "sent_at")?,
        response_received_at: opt_ts_col(row, "response_received_at")?,
        http_status_code: row.get("http_status_code")?,
        response_body: row.get("response_body")?,
        error_message: row.get("error_message")?,
        duration_ms: duration_ms.map(|ms| ms.max(0) as u64),
    })
}

fn row_to_polling(row: &Row<'_>) -> rusqlite::Result<PollingState> {
    Ok(PollingState {
        workspace_id: WorkspaceId::new(row.get::<_, String>("workspace_id")?),
        last_poll_at: opt_ts_col(row, "last_poll_at")?,
        next_poll_at: ts_col(row, "next_poll_at")?,
        last_change_detected_at: opt_ts_col(row, "last_change_detected_at")?,
        is_polling_active: row.get("is_polling_active")?,
        consecutive_failures: row.get("consecutive_failures")?,
        max_failures: row.get("max_failures")?,
        last_error: row.get("last_error")?,
    })
}

fn row_to_poll_run(row: &Row<'_>) -> rusqlite::Result<PollRun> {
    Ok(PollRun {
        workspace_id: WorkspaceId::new(row.get::<_, String>("workspace_id")?),
        started_at: ts_col(row, "started_at")?,
        finished_at: ts_col(row, "finished_at")?,
        changes_detected: row.get("changes_detected")?,
        error: row.get("error")?,
    })
}

fn row_to_metrics(row: &Row<'_>) -> rusqlite::Result<SyncMetrics> {
    Ok(SyncMetrics {
        workspace_id: WorkspaceId::new(row.get::<_, String>("workspace_id")?),
        date: parsed_col::<NaiveDate>(row, "date")?,
        events_generated: u64_col(row, "events_generated")?,
        events_processed: u64_col(row, "events_processed")?,
        events_failed: u64_col(row, "events_failed")?,
        webhooks_sent: u64_col(row, "webhooks_sent")?,
        webhooks_delivered: u64_col(row, "webhooks_delivered")?,
        webhooks_failed: u64_col(row, "webhooks_failed")?,
        avg_delivery_latency_ms: row.get("avg_delivery_latency_ms")?,
        max_delivery_latency_ms: u64_col(row, "max_delivery_latency_ms")?,
        polls_executed: u64_col(row, "polls_executed")?,
        polls_failed: u64_col(row, "polls_failed")?,
        changes_detected_by_polling: u64_col(row, "changes_detected_by_polling")?,
        computed_at: ts_col(row, "computed_at")?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Blocking queries shared by several operations
// ─────────────────────────────────────────────────────────────────────────────

fn load_event(conn: &Connection, id: EventId) -> Result<Option<SyncEvent>> {
    conn.query_row(
        &format!("SELECT {EVENT_COLUMNS} FROM sync_events WHERE event_id = ?1"),
        params![id.to_string()],
        row_to_event,
    )
    .optional()
    .map_err(StoreError::from)
}

/// Mark an event's delivery rows in `statuses` as failed with `reason`.
fn abandon_deliveries(
    conn: &Connection,
    id: EventId,
    statuses: &[DeliveryStatus],
    reason: &str,
    now: DateTime<Utc>,
) -> Result<usize> {
    let statuses = statuses
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let closed = conn.execute(
        &format!(
            "UPDATE webhook_deliveries SET
                status = 'failed', error_message = ?2,
                duration_ms = CASE WHEN sent_at IS NULL THEN NULL ELSE MAX(?3 - sent_at, 0) END
             WHERE sync_event_id = ?1 AND status IN ({statuses})"
        ),
        params![id.to_string(), reason, millis(now)],
    )?;
    Ok(closed)
}

/// Write back the mutable columns of an event.
fn save_event(conn: &Connection, event: &SyncEvent) -> Result<()> {
    let updated = conn.execute(
        "UPDATE sync_events SET
            sites_synced = ?2, status = ?3, retry_count = ?4, processed_at = ?5,
            next_retry_at = ?6, claimed_at = ?7, error_message = ?8
         WHERE event_id = ?1",
        params![
            event.event_id.to_string(),
            serde_json::to_string(&event.sites_synced)?,
            event.status.as_str(),
            event.retry_count,
            opt_millis(event.processed_at),
            opt_millis(event.next_retry_at),
            opt_millis(event.claimed_at),
            event.error_message,
        ],
    )?;
    if updated == 0 {
        return Err(StoreError::NotFound(format!("event {}", event.event_id)));
    }
    Ok(())
}

fn query_events(conn: &Connection, filter: &EventFilter) -> Result<Vec<SyncEvent>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(ws) = &filter.workspace_id {
        clauses.push("workspace_id = ?");
        values.push(Value::Text(ws.to_string()));
    }
    if let Some(status) = filter.status {
        clauses.push("status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(kind) = filter.entity_type {
        clauses.push("entity_type = ?");
        values.push(Value::Text(kind.as_str().to_string()));
    }
    if let Some(entity_id) = &filter.entity_id {
        clauses.push("entity_id = ?");
        values.push(Value::Text(entity_id.clone()));
    }
    if let Some(since) = filter.created_since {
        clauses.push("created_at >= ?");
        values.push(Value::Integer(millis(since)));
    }
    if let Some(until) = filter.created_until {
        clauses.push("created_at < ?");
        values.push(Value::Integer(millis(until)));
    }

    let mut sql = format!("SELECT {EVENT_COLUMNS} FROM sync_events");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC, event_id DESC");
    if let Some(limit) = filter.limit {
        sql.push_str(" LIMIT ?");
        values.push(Value::Integer(limit as i64));
    }

    let mut stmt = conn.prepare(&sql)?;
    let events = stmt
        .query_map(params_from_iter(values.iter()), row_to_event)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn create_event(&self, event: &SyncEvent) -> Result<()> {
        let event = event.clone();
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO sync_events ({EVENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                             ?16, ?17, ?18, ?19)"
                ),
                params![
                    event.event_id.to_string(),
                    event.workspace_id.as_str(),
                    event.event_type,
                    event.entity_type.as_str(),
                    event.entity_id,
                    serde_json::to_string(&event.payload)?,
                    serde_json::to_string(&event.changed_fields)?,
                    serde_json::to_string(&event.sites_to_sync)?,
                    serde_json::to_string(&event.sites_synced)?,
                    event.status.as_str(),
                    event.retry_count,
                    event.max_retries,
                    event.triggered_by,
                    event.source.as_str(),
                    millis(event.created_at),
                    opt_millis(event.processed_at),
                    opt_millis(event.next_retry_at),
                    opt_millis(event.claimed_at),
                    event.error_message,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_event(&self, id: EventId) -> Result<Option<SyncEvent>> {
        self.run(move |conn| load_event(conn, id)).await
    }

    async fn list_due_events(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SyncEvent>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM sync_events
                 WHERE status = 'pending'
                    OR (status = 'retrying' AND (next_retry_at IS NULL OR next_retry_at <= ?1))
                 ORDER BY created_at, event_id
                 LIMIT ?2"
            ))?;
            let events = stmt
                .query_map(params![millis(now), limit as i64], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
        .await
    }

    async fn claim_event(&self, id: EventId, now: DateTime<Utc>) -> Result<Option<SyncEvent>> {
        self.transition(id, move |event| event.claim(now).then(|| event.clone()))
            .await
    }

    async fn mark_site_synced(&self, id: EventId, site: &SiteId) -> Result<bool> {
        let site = site.clone();
        let marked = self
            .transition(id, move |event| event.mark_site_synced(&site).then_some(()))
            .await?;
        if marked.is_none() && self.get_event(id).await?.is_none() {
            return Err(StoreError::NotFound(format!("event {id}")));
        }
        Ok(marked.is_some())
    }

    async fn finish_event(
        &self,
        id: EventId,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let resolution = resolution.clone();
        let finished = self
            .transition(id, move |event| {
                (event.status == sitesync_core::EventStatus::Processing).then(|| {
                    resolution.apply(event, now);
                })
            })
            .await?;
        Ok(finished.is_some())
    }

    async fn requeue_event(&self, id: EventId) -> Result<bool> {
        let requeued = self
            .transition(id, |event| event.requeue().then_some(()))
            .await?;
        Ok(requeued.is_some())
    }

    async fn force_complete_event(&self, id: EventId, now: DateTime<Utc>) -> Result<bool> {
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut event) = load_event(&tx, id)? else {
                return Ok(false);
            };
            if !event.force_complete(now) {
                return Ok(false);
            }
            save_event(&tx, &event)?;
            abandon_deliveries(
                &tx,
                id,
                &[
                    DeliveryStatus::Pending,
                    DeliveryStatus::RetryScheduled,
                    DeliveryStatus::Sending,
                ],
                FORCE_COMPLETED_ERROR,
                now,
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn release_stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stale = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM sync_events
                     WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at <= ?1)"
                ))?;
                let rows = stmt
                    .query_map(params![millis(cutoff)], row_to_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            for mut event in stale.iter().cloned() {
                event.abandoned_resolution(now).apply(&mut event, now);
                save_event(&tx, &event)?;
                abandon_deliveries(
                    &tx,
                    event.event_id,
                    &[DeliveryStatus::Sending],
                    CLAIM_EXPIRED_ERROR,
                    now,
                )?;
            }
            tx.commit()?;
            Ok(stale.len() as u64)
        })
        .await
    }

    async fn prune_terminal_events(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM webhook_deliveries WHERE sync_event_id IN (
                    SELECT event_id FROM sync_events
                    WHERE status IN ('completed', 'failed') AND created_at < ?1
                 )",
                params![millis(cutoff)],
            )?;
            let pruned = tx.execute(
                "DELETE FROM sync_events
                 WHERE status IN ('completed', 'failed') AND created_at < ?1",
                params![millis(cutoff)],
            )?;
            tx.commit()?;
            Ok(pruned as u64)
        })
        .await
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<SyncEvent>> {
        let filter = filter.clone();
        self.run(move |conn| query_events(conn, &filter)).await
    }

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        let d = delivery.clone();
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO webhook_deliveries ({DELIVERY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    d.delivery_id.to_string(),
                    d.sync_event_id.to_string(),
                    d.workspace_id.as_str(),
                    d.target_site_id.as_str(),
                    d.target_url,
                    d.attempt_number,
                    d.status.as_str(),
                    millis(d.scheduled_at),
                    opt_millis(d.sent_at),
                    opt_millis(d.response_received_at),
                    d.http_status_code,
                    d.response_body,
                    d.error_message,
                    d.duration_ms.map(|ms| ms as i64),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        let d = delivery.clone();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE webhook_deliveries SET
                    target_url = ?2, status = ?3, scheduled_at = ?4, sent_at = ?5,
                    response_received_at = ?6, http_status_code = ?7, response_body = ?8,
                    error_message = ?9, duration_ms = ?10
                 WHERE delivery_id = ?1",
                params![
                    d.delivery_id.to_string(),
                    d.target_url,
                    d.status.as_str(),
                    millis(d.scheduled_at),
                    opt_millis(d.sent_at),
                    opt_millis(d.response_received_at),
                    d.http_status_code,
                    d.response_body,
                    d.error_message,
                    d.duration_ms.map(|ms| ms as i64),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("delivery {}", d.delivery_id)));
            }
            Ok(())
        })
        .await
    }

    async fn deliveries_for_event(&self, id: EventId) -> Result<Vec<WebhookDelivery>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries
                 WHERE sync_event_id = ?1
                 ORDER BY target_site_id, attempt_number"
            ))?;
            let rows = stmt
                .query_map(params![id.to_string()], row_to_delivery)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn list_deliveries(
        &self,
        workspace_id: &WorkspaceId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>> {
        let ws = workspace_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries
                 WHERE workspace_id = ?1
                   AND COALESCE(sent_at, scheduled_at) >= ?2
                   AND COALESCE(sent_at, scheduled_at) < ?3
                 ORDER BY COALESCE(sent_at, scheduled_at)"
            ))?;
            let rows = stmt
                .query_map(params![ws, millis(since), millis(until)], row_to_delivery)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn get_polling_state(&self, workspace_id: &WorkspaceId) -> Result<Option<PollingState>> {
        let ws = workspace_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {POLLING_COLUMNS} FROM polling_states WHERE workspace_id = ?1"),
                params![ws],
                row_to_polling,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn upsert_polling_state(&self, state: &PollingState) -> Result<()> {
        let s = state.clone();
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO polling_states ({POLLING_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    s.workspace_id.as_str(),
                    opt_millis(s.last_poll_at),
                    millis(s.next_poll_at),
                    opt_millis(s.last_change_detected_at),
                    s.is_polling_active,
                    s.consecutive_failures,
                    s.max_failures,
                    s.last_error,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_due_polling(&self, now: DateTime<Utc>) -> Result<Vec<PollingState>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {POLLING_COLUMNS} FROM polling_states
                 WHERE is_polling_active = 1 AND next_poll_at <= ?1
                 ORDER BY next_poll_at"
            ))?;
            let rows = stmt
                .query_map(params![millis(now)], row_to_polling)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn claim_poll_lease(
        &self,
        workspace_id: &WorkspaceId,
        expected: DateTime<Utc>,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let ws = workspace_id.to_string();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE polling_states SET next_poll_at = ?4
                 WHERE workspace_id = ?1 AND next_poll_at = ?2 AND next_poll_at <= ?3
                   AND is_polling_active = 1",
                params![ws, millis(expected), millis(now), millis(lease_until)],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    async fn record_poll_run(&self, run: &PollRun) -> Result<()> {
        let r = run.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO poll_runs (workspace_id, started_at, finished_at, changes_detected, error)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    r.workspace_id.as_str(),
                    millis(r.started_at),
                    millis(r.finished_at),
                    r.changes_detected,
                    r.error,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_poll_runs(
        &self,
        workspace_id: &WorkspaceId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PollRun>> {
        let ws = workspace_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT workspace_id, started_at, finished_at, changes_detected, error
                 FROM poll_runs
                 WHERE workspace_id = ?1 AND started_at >= ?2 AND started_at < ?3
                 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![ws, millis(since), millis(until)], row_to_poll_run)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn upsert_metrics(&self, metrics: &SyncMetrics) -> Result<()> {
        let m = metrics.clone();
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO sync_metrics ({METRICS_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    m.workspace_id.as_str(),
                    m.date.to_string(),
                    m.events_generated as i64,
                    m.events_processed as i64,
                    m.events_failed as i64,
                    m.webhooks_sent as i64,
                    m.webhooks_delivered as i64,
                    m.webhooks_failed as i64,
                    m.avg_delivery_latency_ms,
                    m.max_delivery_latency_ms as i64,
                    m.polls_executed as i64,
                    m.polls_failed as i64,
                    m.changes_detected_by_polling as i64,
                    millis(m.computed_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_metrics(
        &self,
        workspace_id: &WorkspaceId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SyncMetrics>> {
        let ws = workspace_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {METRICS_COLUMNS} FROM sync_metrics
                 WHERE workspace_id = ?1 AND date >= ?2 AND date <= ?3
                 ORDER BY date"
            ))?;
            let rows = stmt
                .query_map(
                    params![ws, from.to_string(), to.to_string()],
                    row_to_metrics,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn active_workspaces(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<WorkspaceId>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT workspace_id FROM sync_events WHERE created_at >= ?1 AND created_at < ?2
                 UNION
                 SELECT workspace_id FROM webhook_deliveries
                 WHERE COALESCE(sent_at, scheduled_at) >= ?1 AND COALESCE(sent_at, scheduled_at) < ?2
                 UNION
                 SELECT workspace_id FROM poll_runs WHERE started_at >= ?1 AND started_at < ?2
                 ORDER BY 1",
            )?;
            let rows = stmt
                .query_map(params![millis(since), millis(until)], |row| {
                    row.get::<_, String>(0).map(WorkspaceId::new)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use sitesync_core::{
        ChangeKind, DeliveryStatus, EntityKind, EventDraft, EventSource, EventStatus, FieldMap,
        PollingPolicy,
    };
    use crate::traits::EventLogExt;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn make_event(sites: &[&str], created: DateTime<Utc>) -> SyncEvent {
        let draft = EventDraft {
            workspace_id: WorkspaceId::from("ws-1"),
            entity_kind: EntityKind::Product,
            change: ChangeKind::Updated,
            entity_id: "p-1".into(),
            payload: json!({"price": "12.00"}).as_object().cloned().unwrap(),
            changed_fields: vec!["price".into()],
            triggered_by: None,
            source: EventSource::Detector,
        };
        SyncEvent::new(
            draft,
            sites.iter().map(|s| SiteId::from(*s)).collect(),
            8,
            created,
        )
    }

    #[tokio::test]
    async fn test_event_roundtrip() {
        let log = SqliteEventLog::open_memory().unwrap();
        let event = make_event(&["a", "b"], at(1_000));
        log.create_event(&event).await.unwrap();

        let loaded = log.get_event(event.event_id).await.unwrap().unwrap();
        assert_eq!(loaded, event);
    }

    #[tokio::test]
    async fn test_claim_is_compare_and_set() {
        let log = SqliteEventLog::open_memory().unwrap();
        let event = make_event(&["a"], at(0));
        log.create_event(&event).await.unwrap();

        let claimed = log.claim_event(event.event_id, at(1)).await.unwrap();
        assert_eq!(claimed.unwrap().status, EventStatus::Processing);
        assert!(log.claim_event(event.event_id, at(1)).await.unwrap().is_none());
        assert!(log.list_due_events(at(1), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_site_synced_is_idempotent() {
        let log = SqliteEventLog::open_memory().unwrap();
        let event = make_event(&["a", "b"], at(0));
        log.create_event(&event).await.unwrap();

        let site = SiteId::from("a");
        assert!(log.mark_site_synced(event.event_id, &site).await.unwrap());
        assert!(!log.mark_site_synced(event.event_id, &site).await.unwrap());
        assert!(log
            .mark_site_synced(EventId::new(), &site)
            .await
            .is_err());

        let loaded = log.get_event(event.event_id).await.unwrap().unwrap();
        assert_eq!(loaded.sites_synced.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_schedule_persists() {
        let log = SqliteEventLog::open_memory().unwrap();
        let event = make_event(&["a"], at(0));
        log.create_event(&event).await.unwrap();
        log.claim_event(event.event_id, at(1)).await.unwrap();

        let finished = log
            .finish_event(
                event.event_id,
                &Resolution::Retry {
                    next_retry_at: at(5),
                    error: "HTTP 503".into(),
                },
                at(2),
            )
            .await
            .unwrap();
        assert!(finished);

        let loaded = log.get_event(event.event_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, EventStatus::Retrying);
        assert_eq!(loaded.next_retry_at, Some(at(5)));
        assert_eq!(loaded.retry_count, 1);
        assert!(log.list_due_events(at(4), 10).await.unwrap().is_empty());
        assert_eq!(log.list_due_events(at(5), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_rows() {
        let log = SqliteEventLog::open_memory().unwrap();
        let event = make_event(&["a"], at(0));
        log.create_event(&event).await.unwrap();

        let mut delivery = WebhookDelivery::queued(
            event.event_id,
            event.workspace_id.clone(),
            SiteId::from("a"),
            "https://a.example",
            1,
            DeliveryStatus::Pending,
            at(0),
        );
        log.insert_delivery(&delivery).await.unwrap();

        delivery.start_sending("https://a.example/api/webhook/workspace-update", at(1));
        delivery.record_response(500, "upstream down", at(1) + ChronoDuration::milliseconds(250));
        log.update_delivery(&delivery).await.unwrap();

        let rows = log.deliveries_for_event(event.event_id).await.unwrap();
        assert_eq!(rows, vec![delivery.clone()]);

        let window = log
            .list_deliveries(&event.workspace_id, at(0), at(10))
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].duration_ms, Some(250));

        let mut dup = delivery.clone();
        dup.delivery_id = sitesync_core::DeliveryId::new();
        assert!(log.insert_delivery(&dup).await.is_err());
    }

    #[tokio::test]
    async fn test_polling_state_and_lease() {
        let log = SqliteEventLog::open_memory().unwrap();
        let policy = PollingPolicy::default();
        let ws = WorkspaceId::from("ws-1");
        let state = PollingState::start(ws.clone(), &policy, at(0));
        log.upsert_polling_state(&state).await.unwrap();

        assert_eq!(log.get_polling_state(&ws).await.unwrap(), Some(state.clone()));
        assert!(log.list_due_polling(at(59)).await.unwrap().is_empty());
        assert_eq!(log.list_due_polling(at(60)).await.unwrap().len(), 1);

        assert!(log
            .claim_poll_lease(&ws, state.next_poll_at, at(60), at(360))
            .await
            .unwrap());
        assert!(!log
            .claim_poll_lease(&ws, state.next_poll_at, at(60), at(360))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_metrics_upsert_replaces() {
        let log = SqliteEventLog::open_memory().unwrap();
        let ws = WorkspaceId::from("ws-1");
        let date = at(0).date_naive();
        let mut metrics = SyncMetrics::compute(ws.clone(), date, &[], &[], &[], at(10));
        log.upsert_metrics(&metrics).await.unwrap();

        metrics.events_generated = 4;
        metrics.avg_delivery_latency_ms = 12.5;
        log.upsert_metrics(&metrics).await.unwrap();

        let loaded = log.get_metrics(&ws, date).await.unwrap().unwrap();
        assert_eq!(loaded, metrics);
        assert_eq!(log.list_metrics(&ws, date, date).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_claims_and_prune() {
        let log = SqliteEventLog::open_memory().unwrap();
        let event = make_event(&["a"], at(0));
        log.create_event(&event).await.unwrap();
        log.claim_event(event.event_id, at(10)).await.unwrap();

        assert_eq!(log.release_stale_claims(at(10), at(400)).await.unwrap(), 1);
        let loaded = log.get_event(event.event_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, EventStatus::Retrying);

        assert!(log.force_complete_event(event.event_id, at(401)).await.unwrap());
        assert_eq!(log.prune_terminal_events(at(1)).await.unwrap(), 1);
        assert!(log.get_event(event.event_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_released_and_force_completed_rows_are_closed() {
        let log = SqliteEventLog::open_memory().unwrap();
        let event = make_event(&["a"], at(0));
        log.create_event(&event).await.unwrap();
        log.claim_event(event.event_id, at(10)).await.unwrap();

        let mut first = WebhookDelivery::queued(
            event.event_id,
            event.workspace_id.clone(),
            SiteId::from("a"),
            "https://a.example",
            1,
            DeliveryStatus::Pending,
            at(10),
        );
        first.start_sending("https://a.example/api/webhook/workspace-update", at(11));
        log.insert_delivery(&first).await.unwrap();

        assert_eq!(log.release_stale_claims(at(100), at(14)).await.unwrap(), 1);
        let rows = log.deliveries_for_event(event.event_id).await.unwrap();
        assert_eq!(rows[0].status, DeliveryStatus::Failed);
        assert_eq!(rows[0].error_message.as_deref(), Some(CLAIM_EXPIRED_ERROR));
        assert_eq!(rows[0].duration_ms, Some(3_000));

        let second = WebhookDelivery::queued(
            event.event_id,
            event.workspace_id.clone(),
            SiteId::from("a"),
            "https://a.example",
            2,
            DeliveryStatus::RetryScheduled,
            at(20),
        );
        log.insert_delivery(&second).await.unwrap();
        assert!(log.force_complete_event(event.event_id, at(30)).await.unwrap());
        assert!(!log.force_complete_event(event.event_id, at(31)).await.unwrap());

        let rows = log.deliveries_for_event(event.event_id).await.unwrap();
        assert_eq!(rows[1].status, DeliveryStatus::Failed);
        assert_eq!(rows[1].error_message.as_deref(), Some(FORCE_COMPLETED_ERROR));
        assert_eq!(rows[0].error_message.as_deref(), Some(CLAIM_EXPIRED_ERROR));
        assert!(log.get_event(event.event_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sitesync.db");
        let event = make_event(&["a"], at(0));
        {
            let log = SqliteEventLog::open(&path).unwrap();
            log.create_event(&event).await.unwrap();
        }
        let reopened = SqliteEventLog::open(&path).unwrap();
        assert!(reopened.get_event(event.event_id).await.unwrap().is_some());
    }
}
