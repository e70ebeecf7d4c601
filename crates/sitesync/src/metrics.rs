//! Daily metrics and sync health.
//!
//! Metrics rows are derived data: each one is recomputed from the event
//! log, the delivery attempts and the poll-run log of its day, then
//! upserted. Running an aggregation twice yields the same row.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use sitesync_core::{Clock, SyncHealth, SyncMetrics, WorkspaceId};
use sitesync_store::{EventFilter, EventLog};
use tracing::{debug, info};

use crate::error::Result;

/// Configuration for the metrics and maintenance worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// How often today's and yesterday's rows are recomputed.
    pub interval: Duration,
    /// Terminal events older than this are pruned. `None` keeps everything.
    pub retention: Option<Duration>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            retention: Some(Duration::from_secs(30 * 24 * 60 * 60)),
        }
    }
}

/// Recomputes [`SyncMetrics`] rows.
pub struct MetricsAggregator {
    log: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
}

/// `[start of date, start of next day)` in UTC.
fn day_window(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date.and_time(chrono::NaiveTime::MIN).and_utc();
    (start, start + chrono::Duration::days(1))
}

impl MetricsAggregator {
    pub fn new(log: Arc<dyn EventLog>, clock: Arc<dyn Clock>) -> Self {
        Self { log, clock }
    }

    /// Recompute and store the row for one workspace and date.
    pub async fn aggregate(&self, workspace_id: &WorkspaceId, date: NaiveDate) -> Result<SyncMetrics> {
        let (since, until) = day_window(date);
        let events = self
            .log
            .list_events(&EventFilter::workspace(workspace_id).created_between(since, until))
            .await?;
        let deliveries = self.log.list_deliveries(workspace_id, since, until).await?;
        let runs = self.log.list_poll_runs(workspace_id, since, until).await?;

        let metrics = SyncMetrics::compute(
            workspace_id.clone(),
            date,
            &events,
            &deliveries,
            &runs,
            self.clock.now(),
        );
        self.log.upsert_metrics(&metrics).await?;
        debug!(%workspace_id, %date, events = metrics.events_generated, "metrics recomputed");
        Ok(metrics)
    }

    /// Recompute every workspace with activity on `date`.
    pub async fn aggregate_day(&self, date: NaiveDate) -> Result<Vec<SyncMetrics>> {
        let (since, until) = day_window(date);
        let workspaces = self.log.active_workspaces(since, until).await?;
        let mut rows = Vec::with_capacity(workspaces.len());
        for workspace_id in &workspaces {
            rows.push(self.aggregate(workspace_id, date).await?);
        }
        if !rows.is_empty() {
            info!(%date, workspaces = rows.len(), "daily metrics aggregated");
        }
        Ok(rows)
    }

    /// Recompute today and yesterday.
    pub async fn aggregate_recent(&self) -> Result<Vec<SyncMetrics>> {
        let today = self.clock.now().date_naive();
        let mut rows = Vec::new();
        if let Some(yesterday) = today.pred_opt() {
            rows.extend(self.aggregate_day(yesterday).await?);
        }
        rows.extend(self.aggregate_day(today).await?);
        Ok(rows)
    }

    /// Stored rows for `from..=to`, oldest first.
    pub async fn daily(
        &self,
        workspace_id: &WorkspaceId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SyncMetrics>> {
        Ok(self.log.list_metrics(workspace_id, from, to).await?)
    }

    /// Health over the last `window`.
    pub async fn health(&self, workspace_id: &WorkspaceId, window: Duration) -> Result<SyncHealth> {
        let until = self.clock.now();
        let since = until - chrono::Duration::milliseconds(window.as_millis() as i64);
        let events = self
            .log
            .list_events(&EventFilter::workspace(workspace_id).created_between(since, until))
            .await?;
        let deliveries = self.log.list_deliveries(workspace_id, since, until).await?;
        let polling = self.log.get_polling_state(workspace_id).await?;

        Ok(SyncHealth::compute(
            workspace_id.clone(),
            since,
            until,
            &events,
            &deliveries,
            polling.as_ref(),
        ))
    }
}
