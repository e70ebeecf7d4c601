//! Webhook delivery attempts.
//!
//! Every HTTP attempt for an (event, site) pair is its own
//! [`WebhookDelivery`] row. A row only moves forward within its own attempt:
//!
//! ```text
//! pending / retry_scheduled ──▶ sending ──▶ delivered | failed | timeout
//! ```
//!
//! A later attempt always gets a new row with a higher `attempt_number`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{DeliveryId, EventId, SiteId, WorkspaceId};

/// Response bodies are stored up to this many characters.
pub const MAX_RESPONSE_BODY_CHARS: usize = 1000;

/// Status of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Delivered,
    Failed,
    Timeout,
    RetryScheduled,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 6] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Sending,
        DeliveryStatus::Delivered,
        DeliveryStatus::Failed,
        DeliveryStatus::Timeout,
        DeliveryStatus::RetryScheduled,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Timeout => "timeout",
            DeliveryStatus::RetryScheduled => "retry_scheduled",
        }
    }

    /// Whether the attempt has finished.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered | DeliveryStatus::Failed | DeliveryStatus::Timeout
        )
    }

    /// Whether the attempt finished unsuccessfully.
    pub const fn is_failure(&self) -> bool {
        matches!(self, DeliveryStatus::Failed | DeliveryStatus::Timeout)
    }

    /// Whether the attempt has not started yet.
    pub const fn is_queued(&self) -> bool {
        matches!(self, DeliveryStatus::Pending | DeliveryStatus::RetryScheduled)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeliveryStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::unknown("delivery status", s))
    }
}

/// Why an attempt failed without an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// The request did not complete within the time box.
    Timeout(String),
    /// Anything else: refused connection, DNS, TLS, missing site.
    Error(String),
}

impl AttemptFailure {
    fn status(&self) -> DeliveryStatus {
        match self {
            AttemptFailure::Timeout(_) => DeliveryStatus::Timeout,
            AttemptFailure::Error(_) => DeliveryStatus::Failed,
        }
    }

    fn message(&self) -> &str {
        match self {
            AttemptFailure::Timeout(msg) | AttemptFailure::Error(msg) => msg,
        }
    }
}

/// One HTTP attempt for one (event, site) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub delivery_id: DeliveryId,
    pub sync_event_id: EventId,
    pub workspace_id: WorkspaceId,
    pub target_site_id: SiteId,
    pub target_url: String,
    pub attempt_number: u32,
    pub status: DeliveryStatus,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub response_received_at: Option<DateTime<Utc>>,
    pub http_status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
}

impl WebhookDelivery {
    /// A queued attempt, due at `scheduled_at`.
    pub fn queued(
        sync_event_id: EventId,
        workspace_id: WorkspaceId,
        target_site_id: SiteId,
        target_url: impl Into<String>,
        attempt_number: u32,
        status: DeliveryStatus,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        debug_assert!(status.is_queued());
        Self {
            delivery_id: DeliveryId::new(),
            sync_event_id,
            workspace_id,
            target_site_id,
            target_url: target_url.into(),
            attempt_number,
            status,
            scheduled_at,
            sent_at: None,
            response_received_at: None,
            http_status_code: None,
            response_body: None,
            error_message: None,
            duration_ms: None,
        }
    }

    /// Move a queued attempt to `sending`.
    pub fn start_sending(&mut self, target_url: impl Into<String>, now: DateTime<Utc>) {
        self.target_url = target_url.into();
        self.status = DeliveryStatus::Sending;
        self.sent_at = Some(now);
    }

    /// Record an HTTP response. Any 2xx is a successful delivery.
    pub fn record_response(&mut self, status_code: u16, body: &str, now: DateTime<Utc>) {
        self.http_status_code = Some(status_code);
        self.response_body = Some(truncate_body(body));
        self.response_received_at = Some(now);
        self.duration_ms = self.elapsed_ms(now);
        if (200..300).contains(&status_code) {
            self.status = DeliveryStatus::Delivered;
            self.error_message = None;
        } else {
            self.status = DeliveryStatus::Failed;
            self.error_message = Some(format!("HTTP {status_code}"));
        }
    }

    /// Record an attempt that produced no HTTP response.
    pub fn record_failure(&mut self, failure: &AttemptFailure, now: DateTime<Utc>) {
        self.status = failure.status();
        self.error_message = Some(failure.message().to_string());
        self.duration_ms = self.elapsed_ms(now);
    }

    /// Close an attempt that will never run or never report back.
    ///
    /// Returns `false` if the attempt had already finished.
    pub fn abandon(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = DeliveryStatus::Failed;
        self.error_message = Some(reason.to_string());
        self.duration_ms = self.elapsed_ms(now);
        true
    }

    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }

    fn elapsed_ms(&self, now: DateTime<Utc>) -> Option<u64> {
        self.sent_at
            .map(|sent| (now - sent).num_milliseconds().max(0) as u64)
    }
}

/// Truncate a response body to [`MAX_RESPONSE_BODY_CHARS`] characters.
pub fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(MAX_RESPONSE_BODY_CHARS) {
        Some((idx, _)) => body[..idx].to_string(),
        None => body.to_string(),
    }
}
