//! Outbound webhook wire format and HMAC signing.
//!
//! ## Request
//!
//! `POST {base_url}/api/webhook/workspace-update` with a JSON body:
//!
//! ```json
//! {"attempt":1,"data":{...},"entity_id":"...","entity_type":"product",
//!  "event_id":"...","event_type":"product.updated","timestamp":"...",
//!  "workspace_id":"..."}
//! ```
//!
//! The body is canonical JSON: compact, with object keys sorted at every
//! level. The signature header carries `sha256=<hex>` of the HMAC-SHA256 of
//! exactly those bytes, keyed by the deployment secret.
//!
//! Any change to the body layout or signature scheme must bump
//! [`WEBHOOK_VERSION`].

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::entity::FieldMap;
use crate::error::{CoreError, Result};
use crate::event::SyncEvent;
use crate::types::{DeliveryId, EventId, WorkspaceId};

type HmacSha256 = Hmac<Sha256>;

/// Path appended to a site's base URL.
pub const WEBHOOK_PATH: &str = "/api/webhook/workspace-update";

/// Version of the body layout and signature scheme.
pub const WEBHOOK_VERSION: &str = "1";

pub const HEADER_SIGNATURE: &str = "X-Sitesync-Webhook-Signature";
pub const HEADER_EVENT_TYPE: &str = "X-Sitesync-Event-Type";
pub const HEADER_EVENT_ID: &str = "X-Sitesync-Event-ID";
pub const HEADER_DELIVERY_ID: &str = "X-Sitesync-Delivery-ID";
pub const HEADER_VERSION: &str = "X-Sitesync-Webhook-Version";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Body of one webhook request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event_id: EventId,
    pub event_type: String,
    pub workspace_id: WorkspaceId,
    pub entity_type: String,
    pub entity_id: String,
    pub data: FieldMap,
    /// RFC 3339 send time.
    pub timestamp: String,
    pub attempt: u32,
}

impl WebhookPayload {
    pub fn for_event(event: &SyncEvent, attempt: u32, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            workspace_id: event.workspace_id.clone(),
            entity_type: event.entity_type.as_str().to_string(),
            entity_id: event.entity_id.clone(),
            data: event.payload.clone(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            attempt,
        }
    }

    /// Canonical JSON bytes of this payload.
    pub fn canonical_body(&self) -> Result<Vec<u8>> {
        let value = canonicalize(serde_json::to_value(self)?);
        Ok(serde_json::to_vec(&value)?)
    }
}

/// Rebuild every object with its keys in sorted order.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Compute the signature header value for `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| CoreError::InvalidSigningKey)?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Check a received signature header against `body`.
///
/// The comparison is constant-time. Malformed headers are rejected.
pub fn verify_signature(secret: &[u8], body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Full webhook URL for a site base URL.
pub fn endpoint_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), WEBHOOK_PATH)
}

/// A fully built, signed webhook request ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRequest {
    pub url: String,
    pub body: Vec<u8>,
    pub headers: Vec<(&'static str, String)>,
}

impl WebhookRequest {
    /// Encode and sign `payload` for delivery `delivery_id` to `base_url`.
    pub fn build(
        secret: &[u8],
        base_url: &str,
        payload: &WebhookPayload,
        delivery_id: DeliveryId,
    ) -> Result<Self> {
        let body = payload.canonical_body()?;
        let signature = sign(secret, &body)?;
        Ok(Self {
            url: endpoint_url(base_url),
            headers: vec![
                ("Content-Type", "application/json".to_string()),
                (HEADER_SIGNATURE, signature),
                (HEADER_EVENT_TYPE, payload.event_type.clone()),
                (HEADER_EVENT_ID, payload.event_id.to_string()),
                (HEADER_DELIVERY_ID, delivery_id.to_string()),
                (HEADER_VERSION, WEBHOOK_VERSION.to_string()),
            ],
            body,
        })
    }

    /// Look up a header value by name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Decode the body back into a payload.
    pub fn payload(&self) -> Result<WebhookPayload> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ChangeKind, EntityKind};
    use crate::event::{EventDraft, EventSource, DEFAULT_MAX_RETRIES};
    use crate::types::SiteId;
    use chrono::TimeZone;
    use serde_json::json;

    const SECRET: &[u8] = b"deploy-secret";

    fn payload() -> WebhookPayload {
        let draft = EventDraft {
            workspace_id: WorkspaceId::from("ws-1"),
            entity_kind: EntityKind::Product,
            change: ChangeKind::Updated,
            entity_id: "p-1".into(),
            payload: json!({"price": "12.00", "name": "Mug"})
                .as_object()
                .cloned()
                .unwrap(),
            changed_fields: vec!["price".into()],
            triggered_by: None,
            source: EventSource::Detector,
        };
        let event = SyncEvent::new(
            draft,
            [SiteId::from("a")].into(),
            DEFAULT_MAX_RETRIES,
            Utc.timestamp_opt(0, 0).unwrap(),
        );
        WebhookPayload::for_event(&event, 1, Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    #[test]
    fn test_canonical_body_sorts_keys() {
        let body = payload().canonical_body().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("{\"attempt\":1,\"data\":{\"name\":\"Mug\",\"price\":\"12.00\"}"));
        assert!(!text.contains(' '));
        assert!(text.contains("\"timestamp\":\"2023-11-14T22:13:20.000Z\""));
    }

    #[test]
    fn test_sign_and_verify() {
        let body = payload().canonical_body().unwrap();
        let sig = sign(SECRET, &body).unwrap();
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert!(verify_signature(SECRET, &body, &sig));
        assert!(!verify_signature(b"other", &body, &sig));
        assert!(!verify_signature(SECRET, b"tampered", &sig));
        assert!(!verify_signature(SECRET, &body, "md5=abc"));
    }

    #[test]
    fn test_request_headers() {
        let p = payload();
        let delivery_id = DeliveryId::new();
        let req = WebhookRequest::build(SECRET, "https://shop.example/", &p, delivery_id).unwrap();

        assert_eq!(req.url, "https://shop.example/api/webhook/workspace-update");
        assert_eq!(req.header("x-sitesync-event-type"), Some("product.updated"));
        assert_eq!(req.header(HEADER_DELIVERY_ID), Some(delivery_id.to_string().as_str()));
        assert_eq!(req.header(HEADER_VERSION), Some("1"));
        let sig = req.header(HEADER_SIGNATURE).unwrap();
        assert!(verify_signature(SECRET, &req.body, sig));
        assert_eq!(req.payload().unwrap(), p);
    }
}
