//! Daily sync metrics and health summaries.
//!
//! Both are pure functions over rows read from the event log, so a day can
//! be recomputed any number of times with the same result.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::delivery::{DeliveryStatus, WebhookDelivery};
use crate::event::{EventStatus, SyncEvent};
use crate::polling::{PollRun, PollingState};
use crate::types::WorkspaceId;

/// Counters for one workspace on one UTC date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub workspace_id: WorkspaceId,
    pub date: NaiveDate,
    pub events_generated: u64,
    pub events_processed: u64,
    pub events_failed: u64,
    pub webhooks_sent: u64,
    pub webhooks_delivered: u64,
    pub webhooks_failed: u64,
    pub avg_delivery_latency_ms: f64,
    pub max_delivery_latency_ms: u64,
    pub polls_executed: u64,
    pub polls_failed: u64,
    pub changes_detected_by_polling: u64,
    pub computed_at: DateTime<Utc>,
}

impl SyncMetrics {
    /// Compute metrics for `date` from that day's rows.
    ///
    /// Events are attributed to the day they were created, deliveries to the
    /// day they were sent, poll runs to the day they started. Rows from other
    /// days are ignored.
    pub fn compute(
        workspace_id: WorkspaceId,
        date: NaiveDate,
        events: &[SyncEvent],
        deliveries: &[WebhookDelivery],
        runs: &[PollRun],
        now: DateTime<Utc>,
    ) -> Self {
        let on_day = |ts: DateTime<Utc>| ts.date_naive() == date;

        let day_events: Vec<&SyncEvent> = events.iter().filter(|e| on_day(e.created_at)).collect();
        let sent: Vec<&WebhookDelivery> = deliveries
            .iter()
            .filter(|d| d.sent_at.map_or(false, on_day))
            .collect();
        let day_runs: Vec<&PollRun> = runs.iter().filter(|r| on_day(r.started_at)).collect();

        let latencies: Vec<u64> = sent
            .iter()
            .filter(|d| d.status.is_terminal())
            .filter_map(|d| d.duration_ms)
            .collect();
        let avg_delivery_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
        };

        Self {
            workspace_id,
            date,
            events_generated: day_events.len() as u64,
            events_processed: count(&day_events, |e| e.status == EventStatus::Completed),
            events_failed: count(&day_events, |e| e.status == EventStatus::Failed),
            webhooks_sent: sent.len() as u64,
            webhooks_delivered: count(&sent, |d| d.status == DeliveryStatus::Delivered),
            webhooks_failed: count(&sent, |d| d.status.is_failure()),
            avg_delivery_latency_ms,
            max_delivery_latency_ms: latencies.iter().copied().max().unwrap_or(0),
            polls_executed: day_runs.len() as u64,
            polls_failed: count(&day_runs, |r| !r.succeeded()),
            changes_detected_by_polling: day_runs.iter().map(|r| r.changes_detected as u64).sum(),
            computed_at: now,
        }
    }

    /// Share of sent webhooks that were delivered, or `None` if none were sent.
    pub fn delivery_success_rate(&self) -> Option<f64> {
        (self.webhooks_sent > 0).then(|| self.webhooks_delivered as f64 / self.webhooks_sent as f64)
    }
}

fn count<T>(items: &[&T], pred: impl Fn(&T) -> bool) -> u64 {
    items.iter().filter(|item| pred(**item)).count() as u64
}

/// Sync health of a workspace over a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHealth {
    pub workspace_id: WorkspaceId,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub events_total: u64,
    pub events_completed: u64,
    pub events_failed: u64,
    /// Pending, processing or retrying.
    pub events_in_flight: u64,
    pub deliveries_attempted: u64,
    pub deliveries_succeeded: u64,
    /// Delivered attempts over finished attempts; 1.0 when nothing was sent.
    pub success_rate: f64,
    pub polling_active: bool,
    pub polling_failures: u32,
    pub last_poll_at: Option<DateTime<Utc>>,
}

impl SyncHealth {
    /// Summarize events created and attempts finished within the window.
    pub fn compute(
        workspace_id: WorkspaceId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        events: &[SyncEvent],
        deliveries: &[WebhookDelivery],
        polling: Option<&PollingState>,
    ) -> Self {
        let in_window = |ts: DateTime<Utc>| ts >= since && ts < until;

        let events: Vec<&SyncEvent> = events.iter().filter(|e| in_window(e.created_at)).collect();
        let finished: Vec<&WebhookDelivery> = deliveries
            .iter()
            .filter(|d| d.status.is_terminal() && d.sent_at.map_or(false, in_window))
            .collect();

        let deliveries_succeeded = count(&finished, |d| d.is_delivered());
        let success_rate = if finished.is_empty() {
            1.0
        } else {
            deliveries_succeeded as f64 / finished.len() as f64
        };

        Self {
            workspace_id,
            since,
            until,
            events_total: events.len() as u64,
            events_completed: count(&events, |e| e.status == EventStatus::Completed),
            events_failed: count(&events, |e| e.status == EventStatus::Failed),
            events_in_flight: count(&events, |e| !e.status.is_terminal()),
            deliveries_attempted: finished.len() as u64,
            deliveries_succeeded,
            success_rate,
            polling_active: polling.map_or(false, |p| p.is_polling_active),
            polling_failures: polling.map_or(0, |p| p.consecutive_failures),
            last_poll_at: polling.and_then(|p| p.last_poll_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::AttemptFailure;
    use crate::entity::{ChangeKind, EntityKind, FieldMap};
    use crate::event::{EventDraft, EventSource, DEFAULT_MAX_RETRIES};
    use crate::types::{EventId, SiteId};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeSet;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn event(created: DateTime<Utc>, status: EventStatus) -> SyncEvent {
        let draft = EventDraft {
            workspace_id: WorkspaceId::from("ws"),
            entity_kind: EntityKind::Post,
            change: ChangeKind::Created,
            entity_id: "post-1".into(),
            payload: FieldMap::new(),
            changed_fields: vec![],
            triggered_by: None,
            source: EventSource::Detector,
        };
        let sites: BTreeSet<SiteId> = [SiteId::from("a")].into();
        let mut event = SyncEvent::new(draft, sites, DEFAULT_MAX_RETRIES, created);
        event.status = status;
        event
    }

    fn attempt(sent: DateTime<Utc>, ok: bool, latency_ms: i64) -> WebhookDelivery {
        let mut d = WebhookDelivery::queued(
            EventId::new(),
            WorkspaceId::from("ws"),
            SiteId::from("a"),
            "u",
            1,
            DeliveryStatus::Pending,
            sent,
        );
        d.start_sending("u", sent);
        let done = sent + Duration::milliseconds(latency_ms);
        if ok {
            d.record_response(200, "ok", done);
        } else {
            d.record_failure(&AttemptFailure::Error("refused".into()), done);
        }
        d
    }

    #[test]
    fn test_compute_counts_only_the_day() {
        let day = at(0).date_naive();
        let next_day = at(86_400 + 10);
        let events = vec![
            event(at(10), EventStatus::Completed),
            event(at(20), EventStatus::Failed),
            event(next_day, EventStatus::Completed),
        ];
        let deliveries = vec![attempt(at(10), true, 100), attempt(at(20), false, 300)];
        let runs = vec![
            PollRun {
                workspace_id: WorkspaceId::from("ws"),
                started_at: at(30),
                finished_at: at(31),
                changes_detected: 2,
                error: None,
            },
            PollRun {
                workspace_id: WorkspaceId::from("ws"),
                started_at: at(90),
                finished_at: at(91),
                changes_detected: 0,
                error: Some("timeout".into()),
            },
        ];

        let m = SyncMetrics::compute(WorkspaceId::from("ws"), day, &events, &deliveries, &runs, at(100));
        assert_eq!(m.events_generated, 2);
        assert_eq!(m.events_processed, 1);
        assert_eq!(m.events_failed, 1);
        assert_eq!(m.webhooks_sent, 2);
        assert_eq!(m.webhooks_delivered, 1);
        assert_eq!(m.webhooks_failed, 1);
        assert_eq!(m.avg_delivery_latency_ms, 200.0);
        assert_eq!(m.max_delivery_latency_ms, 300);
        assert_eq!(m.polls_executed, 2);
        assert_eq!(m.polls_failed, 1);
        assert_eq!(m.changes_detected_by_polling, 2);
        assert_eq!(m.delivery_success_rate(), Some(0.5));
    }

    #[test]
    fn test_compute_is_deterministic() {
        let day = at(0).date_naive();
        let events = vec![event(at(10), EventStatus::Completed)];
        let a = SyncMetrics::compute(WorkspaceId::from("ws"), day, &events, &[], &[], at(100));
        let b = SyncMetrics::compute(WorkspaceId::from("ws"), day, &events, &[], &[], at(100));
        assert_eq!(a, b);
    }

    #[test]
    fn test_health_with_no_traffic() {
        let health = SyncHealth::compute(WorkspaceId::from("ws"), at(0), at(3600), &[], &[], None);
        assert_eq!(health.success_rate, 1.0);
        assert_eq!(health.events_total, 0);
        assert!(!health.polling_active);
    }

    #[test]
    fn test_health_success_rate() {
        let deliveries = vec![
            attempt(at(10), true, 5),
            attempt(at(20), true, 5),
            attempt(at(30), false, 5),
            attempt(at(7200), false, 5),
        ];
        let events = vec![event(at(5), EventStatus::Retrying)];
        let health = SyncHealth::compute(WorkspaceId::from("ws"), at(0), at(3600), &events, &deliveries, None);
        assert_eq!(health.deliveries_attempted, 3);
        assert!((health.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(health.events_in_flight, 1);
    }
}
