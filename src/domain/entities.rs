//! Domain records exchanged between the queue, the processor and storage.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    error::DomainError,
    types::{JobState, RenderRoute},
};

/// Email snapshot handed over by the ingestion step. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderJobPayload {
    pub tenant_id: String,
    /// RFC 5322 `Message-Id`; together with the tenant it forms the idempotency key.
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_hints: Vec<String>,
    pub route: RenderRoute,
}

impl RenderJobPayload {
    /// True when at least one renderable body is present. Whitespace-only
    /// bodies count as absent.
    pub fn has_body(&self) -> bool {
        non_blank(self.html_body.as_deref()).is_some()
            || non_blank(self.text_body.as_deref()).is_some()
    }

    pub fn html(&self) -> Option<&str> {
        non_blank(self.html_body.as_deref())
    }

    pub fn text(&self) -> Option<&str> {
        non_blank(self.text_body.as_deref())
    }

    /// Reject payloads that cannot be keyed for idempotency.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.tenant_id.trim().is_empty() {
            return Err(DomainError::missing("tenant_id"));
        }
        if self.message_id.trim().is_empty() {
            return Err(DomainError::missing("message_id"));
        }
        Ok(())
    }

    pub fn idempotency_key(&self) -> IdempotencyKey<'_> {
        IdempotencyKey {
            tenant_id: &self.tenant_id,
            message_id: &self.message_id,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|body| !body.trim().is_empty())
}

/// `(tenant, message id)` pair used to detect duplicate deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdempotencyKey<'a> {
    pub tenant_id: &'a str,
    pub message_id: &'a str,
}

/// Parameters for a new queue entry.
#[derive(Debug, Clone)]
pub struct NewRenderJob {
    pub payload: RenderJobPayload,
    pub priority: i32,
    pub max_attempts: i32,
    pub run_at: OffsetDateTime,
}

/// Snapshot of a queued job as stored by the queue backend.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub payload: RenderJobPayload,
    pub state: JobState,
    pub attempts: i32,
    pub max_attempts: i32,
    pub priority: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub run_at: OffsetDateTime,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub done_at: Option<OffsetDateTime>,
}

/// A job claimed by one worker slot. `attempt` is 1-based and already counts
/// the current delivery.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    pub payload: RenderJobPayload,
    pub attempt: i32,
    pub max_attempts: i32,
}

impl ClaimedJob {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Queue depth by state, as reported to health checks and the metrics reporter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    /// Terminal failures plus dead-lettered jobs.
    pub failed: u64,
    pub dead_lettered: u64,
}

impl QueueCounts {
    /// Jobs that have not been picked up yet.
    pub fn depth(&self) -> u64 {
        self.waiting
    }
}

/// Rendered document ready to be persisted.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub tenant_id: String,
    pub message_id: String,
    pub title: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub received_at: OffsetDateTime,
    pub route: RenderRoute,
    pub category_hint: Option<String>,
    pub tag_hints: Vec<String>,
    pub attachment_ids: Vec<String>,
    pub pdf: Bytes,
}

impl NewDocument {
    pub fn from_payload(payload: &RenderJobPayload, pdf: Bytes) -> Self {
        Self {
            tenant_id: payload.tenant_id.clone(),
            message_id: payload.message_id.clone(),
            title: payload.subject.clone(),
            sender: payload.sender.clone(),
            recipients: payload.recipients.clone(),
            received_at: payload.received_at,
            route: payload.route,
            category_hint: payload.category_hint.clone(),
            tag_hints: payload.tag_hints.clone(),
            attachment_ids: payload.attachment_ids.clone(),
            pdf,
        }
    }
}

/// Metadata of a persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredDocument {
    pub id: Uuid,
    pub tenant_id: String,
    pub message_id: String,
    pub stored_path: String,
    pub checksum: String,
    pub size_bytes: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_json(extra: &str) -> String {
        format!(
            r#"{{
                "tenant_id": "t1",
                "message_id": "m1",
                "subject": "Hello",
                "sender": "a@example.com",
                "recipients": ["upload+t1@example.com"],
                "received_at": "2025-08-11T15:10:00Z",
                "route": "manual"{extra}
            }}"#
        )
    }

    #[test]
    fn deserializes_minimal_payload() {
        let payload: RenderJobPayload =
            serde_json::from_str(&payload_json(r#", "html_body": "<p>Hi</p>""#))
                .expect("payload parses");
        assert_eq!(payload.route, RenderRoute::Manual);
        assert_eq!(payload.html(), Some("<p>Hi</p>"));
        assert!(payload.text().is_none());
        assert!(payload.attachment_ids.is_empty());
        assert!(payload.has_body());
    }

    #[test]
    fn blank_bodies_do_not_count() {
        let payload: RenderJobPayload = serde_json::from_str(&payload_json(
            r#", "html_body": "   ", "text_body": "\n""#,
        ))
        .expect("payload parses");
        assert!(!payload.has_body());
    }

    #[test]
    fn blank_message_id_is_rejected() {
        let mut payload: RenderJobPayload =
            serde_json::from_str(&payload_json("")).expect("payload parses");
        assert!(payload.validate().is_ok());

        payload.message_id = "  ".into();
        assert_eq!(
            payload.validate(),
            Err(DomainError::missing("message_id"))
        );
    }

    #[test]
    fn idempotency_key_pairs_tenant_and_message() {
        let payload: RenderJobPayload =
            serde_json::from_str(&payload_json("")).expect("payload parses");
        let key = payload.idempotency_key();
        assert_eq!(key.tenant_id, "t1");
        assert_eq!(key.message_id, "m1");
    }
}
