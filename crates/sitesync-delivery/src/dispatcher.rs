//! Event dispatcher.
//!
//! One dispatch round takes the `processing` claim on an event, posts a
//! signed webhook to every site that has not confirmed it yet, records each
//! attempt, and resolves the event as completed, retrying or failed.
//!
//! Sites in a round are contacted concurrently. A semaphore shared by all
//! rounds of one dispatcher caps the number of requests in flight.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use sitesync_core::webhook::endpoint_url;
use sitesync_core::{
    AttemptFailure, Clock, DeliveryStatus, EventId, EventStatus, Resolution, RetryPolicy, SiteId,
    SyncEvent, WebhookDelivery, WebhookPayload, WebhookRequest,
};
use sitesync_store::EventLog;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::directory::SiteDirectory;
use crate::error::{DeliveryError, Result, TransportError};
use crate::transport::{self, WebhookResponse, WebhookTransport};

/// HMAC key shared with every receiving site.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(secret.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(..)")
    }
}

/// Configuration for dispatch behavior.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Requests in flight across all rounds.
    pub max_in_flight: usize,
    /// Due events fetched per sweep.
    pub batch_size: usize,
    /// A `processing` claim older than this is considered abandoned.
    pub claim_timeout: Duration,
    /// Backoff and retry budget.
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            batch_size: 50,
            claim_timeout: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

/// What happened to one site in a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteOutcome {
    pub site_id: SiteId,
    pub attempt_number: u32,
    pub delivered: bool,
    pub error: Option<String>,
}

/// Result of one dispatch round.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub event_id: EventId,
    /// Per-site outcomes, one per site attempted this round.
    pub outcomes: Vec<SiteOutcome>,
    /// Status the round resolved the event to.
    pub status: EventStatus,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// False if the event left `processing` before the round finished,
    /// e.g. an operator force-completed it.
    pub resolved: bool,
}

impl DispatchReport {
    pub fn delivered_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.delivered).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.delivered).count()
    }
}

/// Where a site's next attempt comes from.
enum AttemptSlot {
    /// A row already queued by the previous round.
    Queued(WebhookDelivery),
    /// No queued row; start attempt number `n`.
    Fresh(u32),
}

impl AttemptSlot {
    fn for_site(site: &SiteId, history: &[WebhookDelivery]) -> Self {
        let rows = history.iter().filter(|d| &d.target_site_id == site);
        if let Some(row) = rows
            .clone()
            .filter(|d| d.status.is_queued())
            .max_by_key(|d| d.attempt_number)
        {
            return AttemptSlot::Queued(row.clone());
        }
        let last = rows.map(|d| d.attempt_number).max().unwrap_or(0);
        AttemptSlot::Fresh(last + 1)
    }
}

/// Fans sync events out to their sites.
pub struct Dispatcher {
    log: Arc<dyn EventLog>,
    transport: Arc<dyn WebhookTransport>,
    directory: Arc<dyn SiteDirectory>,
    clock: Arc<dyn Clock>,
    secret: SigningSecret,
    config: DispatchConfig,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    /// Create a new dispatcher.
    pub fn new(
        log: Arc<dyn EventLog>,
        transport: Arc<dyn WebhookTransport>,
        directory: Arc<dyn SiteDirectory>,
        clock: Arc<dyn Clock>,
        secret: SigningSecret,
        config: DispatchConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            log,
            transport,
            directory,
            clock,
            secret,
            config,
            permits,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Stop handing out request permits. Rounds still waiting for one fail.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Dispatch every due event, up to the configured batch size.
    ///
    /// Events whose claim was lost to another worker are skipped. A round
    /// that errors is logged and does not stop the others.
    pub async fn process_due(&self) -> Result<Vec<DispatchReport>> {
        let now = self.clock.now();
        let due = self.log.list_due_events(now, self.config.batch_size).await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = due.len(), "dispatching due events");

        let rounds = due.iter().map(|event| self.dispatch_event(event.event_id));
        let mut reports = Vec::with_capacity(due.len());
        for (event, result) in due.iter().zip(join_all(rounds).await) {
            match result {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(err) => {
                    error!(event_id = %event.event_id, error = %err, "dispatch round failed")
                }
            }
        }
        Ok(reports)
    }

    /// Run one dispatch round for `id`.
    ///
    /// Returns `None` if the event was not claimable (not due, or claimed by
    /// someone else).
    pub async fn dispatch_event(&self, id: EventId) -> Result<Option<DispatchReport>> {
        let Some(event) = self.log.claim_event(id, self.clock.now()).await? else {
            debug!(event_id = %id, "event not claimable");
            return Ok(None);
        };

        match self.run_round(&event).await {
            Ok(report) => Ok(Some(report)),
            Err(err) => {
                // Resolve the claim now rather than waiting for stale-claim recovery.
                let now = self.clock.now();
                let resolution = self.failure_resolution(&event, err.to_string(), now);
                if let Err(finish_err) = self.log.finish_event(id, &resolution, now).await {
                    error!(event_id = %id, error = %finish_err, "could not release claim");
                }
                Err(err)
            }
        }
    }

    /// Resolve claims held longer than the claim timeout.
    pub async fn release_stale_claims(&self) -> Result<u64> {
        let now = self.clock.now();
        let timeout = chrono::Duration::milliseconds(self.config.claim_timeout.as_millis() as i64);
        let released = self.log.release_stale_claims(now - timeout, now).await?;
        if released > 0 {
            warn!(released, "released stale dispatch claims");
        }
        Ok(released)
    }

    async fn run_round(&self, event: &SyncEvent) -> Result<DispatchReport> {
        let pending = event.pending_sites();
        let active: HashMap<SiteId, String> = self
            .directory
            .active_sites(&event.workspace_id)
            .await?
            .into_iter()
            .map(|site| (site.site_id, site.base_url))
            .collect();
        let history = self.log.deliveries_for_event(event.event_id).await?;

        let attempts = pending.iter().map(|site| {
            let slot = AttemptSlot::for_site(site, &history);
            self.deliver(event, site, active.get(site).map(String::as_str), slot)
        });
        let outcomes = join_all(attempts)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        let now = self.clock.now();
        let failures: Vec<&SiteOutcome> = outcomes.iter().filter(|o| !o.delivered).collect();
        let resolution = if failures.is_empty() {
            Resolution::Completed
        } else {
            let summary = failures
                .iter()
                .map(|o| format!("{}: {}", o.site_id, o.error.as_deref().unwrap_or("failed")))
                .collect::<Vec<_>>()
                .join("; ");
            self.failure_resolution(event, summary, now)
        };

        let resolved = self.log.finish_event(event.event_id, &resolution, now).await?;
        if !resolved {
            warn!(event_id = %event.event_id, "event left processing during its round");
        }

        let next_retry_at = match &resolution {
            Resolution::Retry { next_retry_at, .. } => Some(*next_retry_at),
            _ => None,
        };
        if let (true, Some(at)) = (resolved, next_retry_at) {
            for failure in &failures {
                let target_url = active
                    .get(&failure.site_id)
                    .map(|base| endpoint_url(base))
                    .unwrap_or_default();
                let row = WebhookDelivery::queued(
                    event.event_id,
                    event.workspace_id.clone(),
                    failure.site_id.clone(),
                    target_url,
                    failure.attempt_number + 1,
                    DeliveryStatus::RetryScheduled,
                    at,
                );
                self.log.insert_delivery(&row).await?;
            }
        }

        match resolution.status() {
            EventStatus::Completed => {
                info!(event_id = %event.event_id, sites = outcomes.len(), "event completed")
            }
            EventStatus::Failed => {
                error!(event_id = %event.event_id, failed = failures.len(), "event failed, retries exhausted")
            }
            _ => {
                info!(event_id = %event.event_id, failed = failures.len(), "event scheduled for retry")
            }
        }

        Ok(DispatchReport {
            event_id: event.event_id,
            status: resolution.status(),
            outcomes,
            next_retry_at,
            resolved,
        })
    }

    /// Resolution for a round that left some sites unconfirmed.
    fn failure_resolution(&self, event: &SyncEvent, error: String, now: DateTime<Utc>) -> Resolution {
        let round = event.retry_count + 1;
        if round >= event.max_retries {
            Resolution::Failed { error }
        } else {
            let next_retry_at = self
                .config
                .retry
                .next_retry_at(round, now, &mut rand::thread_rng());
            Resolution::Retry {
                next_retry_at,
                error,
            }
        }
    }

    /// One attempt to one site.
    async fn deliver(
        &self,
        event: &SyncEvent,
        site: &SiteId,
        base_url: Option<&str>,
        slot: AttemptSlot,
    ) -> Result<SiteOutcome> {
        let now = self.clock.now();
        let mut row = match slot {
            AttemptSlot::Queued(row) => row,
            AttemptSlot::Fresh(attempt_number) => {
                let row = WebhookDelivery::queued(
                    event.event_id,
                    event.workspace_id.clone(),
                    site.clone(),
                    base_url.map(endpoint_url).unwrap_or_default(),
                    attempt_number,
                    DeliveryStatus::Pending,
                    now,
                );
                self.log.insert_delivery(&row).await?;
                row
            }
        };
        let attempt_number = row.attempt_number;

        let Some(base_url) = base_url else {
            let failure = AttemptFailure::Error("site is no longer active".to_string());
            row.start_sending(row.target_url.clone(), now);
            row.record_failure(&failure, now);
            self.log.update_delivery(&row).await?;
            warn!(event_id = %event.event_id, site_id = %site, "site missing from directory");
            return Ok(SiteOutcome {
                site_id: site.clone(),
                attempt_number,
                delivered: false,
                error: row.error_message,
            });
        };

        let payload = WebhookPayload::for_event(event, attempt_number, now);
        let request = WebhookRequest::build(self.secret.as_bytes(), base_url, &payload, row.delivery_id)?;
        row.start_sending(request.url.clone(), now);
        self.log.update_delivery(&row).await?;

        let result = self.post_with_connect_retries(&request).await?;
        let finished = self.clock.now();
        match result {
            Ok(WebhookResponse { status, body }) => row.record_response(status, &body, finished),
            Err(TransportError::Timeout(msg)) => {
                row.record_failure(&AttemptFailure::Timeout(msg), finished)
            }
            Err(err) => row.record_failure(&AttemptFailure::Error(err.to_string()), finished),
        }
        self.log.update_delivery(&row).await?;

        if row.is_delivered() {
            self.log.mark_site_synced(event.event_id, site).await?;
            debug!(event_id = %event.event_id, site_id = %site, attempt = attempt_number, "webhook delivered");
        } else {
            warn!(
                event_id = %event.event_id,
                site_id = %site,
                attempt = attempt_number,
                error = row.error_message.as_deref().unwrap_or_default(),
                "webhook attempt failed"
            );
        }

        Ok(SiteOutcome {
            site_id: site.clone(),
            attempt_number,
            delivered: row.is_delivered(),
            error: row.error_message,
        })
    }

    /// POST under a permit, retrying connection-level failures quickly.
    async fn post_with_connect_retries(
        &self,
        request: &WebhookRequest,
    ) -> Result<transport::Result<WebhookResponse>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DeliveryError::Shutdown)?;

        let mut retry = 0;
        loop {
            match self.transport.post(request).await {
                Err(err) if err.is_connection_level() && retry < self.config.retry.connect_retries => {
                    let pause = self
                        .config
                        .retry
                        .connect_backoff(retry, &mut rand::thread_rng());
                    debug!(url = %request.url, retry, error = %err, "connection-level failure");
                    retry += 1;
                    tokio::time::sleep(pause).await;
                }
                outcome => return Ok(outcome),
            }
        }
    }
}
