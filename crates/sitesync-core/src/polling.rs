//! Per-workspace polling state for the reconciliation backstop.
//!
//! ```text
//! active ──sweep ok──▶ active
//! active ──sweep err──▶ active (failures += 1, linear backoff)
//!        ──failures ≥ max_failures──▶ inactive ──rearm──▶ active
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::WorkspaceId;

/// Default sweep cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound for failure backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30 * 60);
/// Consecutive failures before polling disables itself.
pub const DEFAULT_MAX_FAILURES: u32 = 10;

/// Polling cadence and failure handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingPolicy {
    pub interval: Duration,
    pub max_backoff: Duration,
    pub max_failures: u32,
    /// How far a sweep pushes `next_poll_at` while it runs.
    pub lease: Duration,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_failures: DEFAULT_MAX_FAILURES,
            lease: Duration::from_secs(5 * 60),
        }
    }
}

impl PollingPolicy {
    /// Delay before the next sweep after `failures` consecutive failures.
    pub fn failure_backoff(&self, failures: u32) -> Duration {
        self.interval
            .saturating_mul(failures.max(1))
            .min(self.max_backoff)
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(delay.as_millis() as i64)
}

/// Polling bookkeeping for one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingState {
    pub workspace_id: WorkspaceId,
    /// Cursor: entities modified after this instant are swept next.
    pub last_poll_at: Option<DateTime<Utc>>,
    pub next_poll_at: DateTime<Utc>,
    pub last_change_detected_at: Option<DateTime<Utc>>,
    pub is_polling_active: bool,
    pub consecutive_failures: u32,
    pub max_failures: u32,
    pub last_error: Option<String>,
}

impl PollingState {
    /// Start polling a workspace. Changes before `now` are not swept.
    pub fn start(workspace_id: WorkspaceId, policy: &PollingPolicy, now: DateTime<Utc>) -> Self {
        Self {
            workspace_id,
            last_poll_at: Some(now),
            next_poll_at: after(now, policy.interval),
            last_change_detected_at: None,
            is_polling_active: true,
            consecutive_failures: 0,
            max_failures: policy.max_failures,
            last_error: None,
        }
    }

    /// Whether a sweep should run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_polling_active && self.next_poll_at <= now
    }

    /// The `next_poll_at` a sweep writes while it holds the lease.
    pub fn lease_until(policy: &PollingPolicy, now: DateTime<Utc>) -> DateTime<Utc> {
        after(now, policy.lease)
    }

    /// Record a successful sweep that started at `started_at`.
    pub fn record_success(
        &mut self,
        policy: &PollingPolicy,
        started_at: DateTime<Utc>,
        changes: u32,
        now: DateTime<Utc>,
    ) {
        self.last_poll_at = Some(started_at);
        self.next_poll_at = after(now, policy.interval);
        self.consecutive_failures = 0;
        self.last_error = None;
        if changes > 0 {
            self.last_change_detected_at = Some(now);
        }
    }

    /// Record a failed sweep. The cursor is left in place so the window is
    /// swept again.
    pub fn record_failure(&mut self, policy: &PollingPolicy, error: &str, now: DateTime<Utc>) {
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
        self.next_poll_at = after(now, policy.failure_backoff(self.consecutive_failures));
        if self.consecutive_failures >= self.max_failures {
            self.is_polling_active = false;
        }
    }

    /// Stop polling without touching the failure counters.
    pub fn stop(&mut self) {
        self.is_polling_active = false;
    }

    /// Re-enable polling after it stopped or disabled itself.
    pub fn rearm(&mut self, policy: &PollingPolicy, now: DateTime<Utc>) {
        self.is_polling_active = true;
        self.consecutive_failures = 0;
        self.max_failures = policy.max_failures;
        self.last_error = None;
        self.next_poll_at = now;
    }
}

/// Log entry for one executed sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRun {
    pub workspace_id: WorkspaceId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub changes_detected: u32,
    pub error: Option<String>,
}

impl PollRun {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}
