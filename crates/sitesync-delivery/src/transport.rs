//! Transport abstraction for webhook delivery.
//!
//! The transport layer performs one HTTP POST and reports the status code
//! and body, or why no response arrived. Retry decisions live in the
//! dispatcher, not here.

use std::time::Duration;

use async_trait::async_trait;
use sitesync_core::{truncate_body, WebhookRequest, MAX_RESPONSE_BODY_CHARS};

use crate::error::TransportError;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// HTTP response as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

/// Transport trait for posting signed webhook requests.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// POST `request` and return whatever the endpoint answered.
    ///
    /// Non-2xx responses are `Ok`; only a missing response is an error.
    async fn post(&self, request: &WebhookRequest) -> Result<WebhookResponse>;
}

/// Time boxes for outbound requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Upper bound on body bytes read per response. Enough for the stored
/// prefix at four bytes per character.
const MAX_BODY_BYTES: usize = MAX_RESPONSE_BODY_CHARS * 4;

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(concat!("sitesync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self { client })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_builder() {
        TransportError::InvalidUrl(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(&self, request: &WebhookRequest) -> Result<WebhookResponse> {
        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        let response = builder
            .body(request.body.clone())
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let body = read_body_prefix(response).await;
        Ok(WebhookResponse { status, body })
    }
}

/// Read at most [`MAX_BODY_BYTES`] of the body. The status decides the
/// outcome, so a body that fails mid-stream keeps what arrived.
async fn read_body_prefix(mut response: reqwest::Response) -> String {
    let mut bytes = Vec::new();
    while bytes.len() < MAX_BODY_BYTES {
        match response.chunk().await {
            Ok(Some(chunk)) => bytes.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    decode_body_prefix(bytes)
}

fn decode_body_prefix(mut bytes: Vec<u8>) -> String {
    bytes.truncate(MAX_BODY_BYTES);
    truncate_body(&String::from_utf8_lossy(&bytes))
}

/// A scripted in-memory transport for testing.
///
/// Replies are scripted per site base URL and consumed in order; once a
/// script runs dry the site's fallback reply (200 unless set) is used.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use sitesync_core::webhook::endpoint_url;

    /// One scripted outcome.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ScriptedReply {
        Status(u16, String),
        Refused,
        Timeout,
    }

    impl ScriptedReply {
        pub fn ok() -> Self {
            ScriptedReply::Status(200, "ok".to_string())
        }

        pub fn status(code: u16) -> Self {
            ScriptedReply::Status(code, String::new())
        }
    }

    #[derive(Default)]
    struct Scripts {
        queued: HashMap<String, VecDeque<ScriptedReply>>,
        fallback: HashMap<String, ScriptedReply>,
        sent: Vec<WebhookRequest>,
    }

    /// In-memory transport implementation.
    #[derive(Default)]
    pub struct ScriptedTransport {
        scripts: Mutex<Scripts>,
        latency: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Hold every request for `latency` before replying.
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        /// Queue replies for requests to `base_url`.
        pub fn script(&self, base_url: &str, replies: impl IntoIterator<Item = ScriptedReply>) {
            let mut scripts = self.scripts.lock().unwrap();
            scripts
                .queued
                .entry(endpoint_url(base_url))
                .or_default()
                .extend(replies);
        }

        /// Reply to `base_url` with `reply` whenever its script is empty.
        pub fn always(&self, base_url: &str, reply: ScriptedReply) {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.fallback.insert(endpoint_url(base_url), reply);
        }

        /// Every request posted so far, in order.
        pub fn requests(&self) -> Vec<WebhookRequest> {
            self.scripts.lock().unwrap().sent.clone()
        }

        /// Requests posted to one site.
        pub fn requests_to(&self, base_url: &str) -> Vec<WebhookRequest> {
            let url = endpoint_url(base_url);
            self.requests()
                .into_iter()
                .filter(|r| r.url == url)
                .collect()
        }

        /// Highest number of concurrent requests observed.
        pub fn peak_in_flight(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }

        fn next_reply(&self, request: &WebhookRequest) -> ScriptedReply {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.sent.push(request.clone());
            if let Some(reply) = scripts
                .queued
                .get_mut(&request.url)
                .and_then(VecDeque::pop_front)
            {
                return reply;
            }
            scripts
                .fallback
                .get(&request.url)
                .cloned()
                .unwrap_or_else(ScriptedReply::ok)
        }
    }

    #[async_trait]
    impl WebhookTransport for ScriptedTransport {
        async fn post(&self, request: &WebhookRequest) -> Result<WebhookResponse> {
            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_in_flight, Ordering::SeqCst);

            let reply = self.next_reply(request);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match reply {
                ScriptedReply::Status(status, body) => Ok(WebhookResponse { status, body }),
                ScriptedReply::Refused => {
                    Err(TransportError::Connect("connection refused".to_string()))
                }
                ScriptedReply::Timeout => {
                    Err(TransportError::Timeout("deadline elapsed".to_string()))
                }
            }
        }
    }
}
