//! Shared types between the gateway core and transport front-ends
//!
//! These types cross process boundaries as JSON:
//! - the Activity Stream envelope a client submits
//! - the job records handed through the durable queue
//! - the error objects routed back to clients
//!
//! Serializable with serde; free of runtime dependencies so transports can
//! depend on this crate cheaply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Core Identifiers
// ============================================================================

/// Stable identity of the "who" behind a message, derived from `actor.id`.
/// Primary key for credentials and platform sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle identifying an originating client connection.
///
/// A `ClientRef` is a plain string so it stays resolvable across process
/// boundaries: completions are published onto the bus topic derived from it,
/// regardless of which process executed the job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ClientRef(pub String);

impl ClientRef {
    /// Generate a fresh connection handle (ULID).
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ClientRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Activity Stream Envelope
// ============================================================================

/// The normalized message envelope: an actor performing a verb (`type`) in a
/// platform `context`, optionally on/with a `target` and `object`.
///
/// `actor`, `target`, and `object` stay as raw JSON here; their shape is
/// enforced by the schema registry, not by serde.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityStream {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Platform name this message is addressed to.
    pub context: String,

    /// Verb, e.g. "join", "send", "credentials".
    #[serde(rename = "type")]
    pub verb: String,

    pub actor: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ActivityStream {
    pub fn from_value(raw: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(raw.clone())
    }

    /// `actor.id`, when present.
    pub fn actor_id(&self) -> Option<&str> {
        self.actor.get("id").and_then(Value::as_str)
    }

    /// `target.id`, when present.
    pub fn target_id(&self) -> Option<&str> {
        self.target
            .as_ref()
            .and_then(|t| t.get("id"))
            .and_then(Value::as_str)
    }

    /// `object.type`, when present.
    pub fn object_type(&self) -> Option<&str> {
        self.object
            .as_ref()
            .and_then(|o| o.get("type"))
            .and_then(Value::as_str)
    }

    /// True when the object carries credentials to be stored, not executed.
    pub fn is_credentials(&self) -> bool {
        self.object_type() == Some("credentials")
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// One validated, routed unit of work awaiting execution by a platform
/// session. Produced by the dispatcher, owned by the queue until claimed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Job id; equals the originating message id.
    pub id: String,
    pub platform: String,
    pub actor: ActorId,
    pub verb: String,
    /// The full validated envelope, kept verbatim for the worker.
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    /// Delivery attempt, starting at 1. Incremented on redelivery so
    /// platform invocations can detect retries.
    pub attempt: u32,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        platform: impl Into<String>,
        actor: ActorId,
        verb: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            platform: platform.into(),
            actor,
            verb: verb.into(),
            payload,
            enqueued_at: Utc::now(),
            attempt: 1,
        }
    }

    /// Queue channel key. Partitioning by (platform, actor) bounds in-flight
    /// concurrency per session to one and gives per-session FIFO.
    pub fn channel(&self) -> String {
        channel_key(&self.platform, &self.actor)
    }
}

/// Channel key for a (platform, actor) pair.
pub fn channel_key(platform: &str, actor: &ActorId) -> String {
    format!("{platform}:{actor}")
}

// ============================================================================
// Errors on the Wire
// ============================================================================

/// Error payload routed back to a client, with a stable machine-readable
/// code alongside the human-readable content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[error("{code}: {content}")]
pub struct ErrorObject {
    pub code: String,
    pub content: String,
}

impl ErrorObject {
    pub fn new(code: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            content: content.into(),
        }
    }
}

// ============================================================================
// Outbound Envelopes
// ============================================================================

/// Build the error envelope sent back to a client. Echoes the message id
/// when one was supplied.
pub fn error_envelope(id: Option<&str>, context: Option<&str>, err: &ErrorObject) -> Value {
    serde_json::json!({
        "id": id,
        "context": context,
        "type": "error",
        "object": {
            "type": "error",
            "code": err.code,
            "content": err.content,
        },
    })
}

/// Build the success envelope for a completed job: the original envelope
/// with the platform's result merged in as the object.
pub fn result_envelope(original: &Value, result: Value) -> Value {
    let mut reply = original.clone();
    if let Value::Object(map) = &mut reply {
        if !result.is_null() {
            map.insert("object".to_string(), result);
        }
    }
    reply
}

// ============================================================================
// Session Observability
// ============================================================================

/// Point-in-time view of one platform session, for status surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub actor_id: String,
    pub platform: String,
    pub state: String,
    pub pending_jobs: usize,
    pub idle_secs: u64,
}

// ============================================================================
// Tests
// ============================================================================
