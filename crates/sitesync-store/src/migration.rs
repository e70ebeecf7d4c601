//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.
//!
//! Timestamps are stored as Unix milliseconds, dates as `YYYY-MM-DD`, and
//! structured fields as JSON text.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, chrono::Utc::now().timestamp_millis()],
            )?;
            tracing::debug!(version, "applied schema migration");
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per sync-worthy change
        CREATE TABLE sync_events (
            event_id TEXT PRIMARY KEY,           -- UUID v4, idempotency key
            workspace_id TEXT NOT NULL,
            event_type TEXT NOT NULL,            -- e.g. product.updated
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL,               -- JSON object of allowlisted fields
            changed_fields TEXT NOT NULL,        -- JSON array, allowlist order
            sites_to_sync TEXT NOT NULL,         -- JSON array of site ids
            sites_synced TEXT NOT NULL,          -- JSON array of site ids
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL,
            triggered_by TEXT,
            source TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            processed_at INTEGER,
            next_retry_at INTEGER,
            claimed_at INTEGER,
            error_message TEXT
        );

        -- One row per delivery attempt
        CREATE TABLE webhook_deliveries (
            delivery_id TEXT PRIMARY KEY,
            sync_event_id TEXT NOT NULL,
            workspace_id TEXT NOT NULL,
            target_site_id TEXT NOT NULL,
            target_url TEXT NOT NULL,
            attempt_number INTEGER NOT NULL,
            status TEXT NOT NULL,
            scheduled_at INTEGER NOT NULL,
            sent_at INTEGER,
            response_received_at INTEGER,
            http_status_code INTEGER,
            response_body TEXT,                  -- truncated to 1000 chars
            error_message TEXT,
            duration_ms INTEGER,

            UNIQUE(sync_event_id, target_site_id, attempt_number)
        );

        -- Reconciler bookkeeping, one row per workspace
        CREATE TABLE polling_states (
            workspace_id TEXT PRIMARY KEY,
            last_poll_at INTEGER,
            next_poll_at INTEGER NOT NULL,
            last_change_detected_at INTEGER,
            is_polling_active INTEGER NOT NULL DEFAULT 1,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            max_failures INTEGER NOT NULL,
            last_error TEXT
        );

        -- Log of executed sweeps
        CREATE TABLE poll_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            workspace_id TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            changes_detected INTEGER NOT NULL,
            error TEXT
        );

        -- Daily rollups
        CREATE TABLE sync_metrics (
            workspace_id TEXT NOT NULL,
            date TEXT NOT NULL,
            events_generated INTEGER NOT NULL,
            events_processed INTEGER NOT NULL,
            events_failed INTEGER NOT NULL,
            webhooks_sent INTEGER NOT NULL,
            webhooks_delivered INTEGER NOT NULL,
            webhooks_failed INTEGER NOT NULL,
            avg_delivery_latency_ms REAL NOT NULL,
            max_delivery_latency_ms INTEGER NOT NULL,
            polls_executed INTEGER NOT NULL,
            polls_failed INTEGER NOT NULL,
            changes_detected_by_polling INTEGER NOT NULL,
            computed_at INTEGER NOT NULL,
            PRIMARY KEY (workspace_id, date)
        );

        -- Indexes for common queries
        CREATE INDEX idx_events_due ON sync_events(status, next_retry_at);
        CREATE INDEX idx_events_workspace ON sync_events(workspace_id, created_at);
        CREATE INDEX idx_events_entity ON sync_events(workspace_id, entity_type, entity_id, created_at);
        CREATE INDEX idx_deliveries_event ON webhook_deliveries(sync_event_id, target_site_id);
        CREATE INDEX idx_deliveries_workspace ON webhook_deliveries(workspace_id, sent_at);
        CREATE INDEX idx_polling_due ON polling_states(is_polling_active, next_poll_at);
        CREATE INDEX idx_poll_runs_workspace ON poll_runs(workspace_id, started_at);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "sync_events",
            "webhook_deliveries",
            "polling_states",
            "poll_runs",
            "sync_metrics",
            "schema_migrations",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
