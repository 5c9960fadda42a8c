//! Platform plugin registry.
//!
//! Platforms are registered at build/deploy time through the
//! [`PlatformPlugin`] trait rather than discovered by runtime module
//! loading. The registry applies the allow/deny policy, meta-validates each
//! platform's schema (fatal at startup on failure), extracts the declared
//! verb set, and registers schema fragments into the [`SchemaRegistry`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use shared_types::{ActorId, Job};

use crate::schema::SchemaRegistry;

pub mod dummy;

pub use dummy::DummyPlatform;

/// Schema fragments a platform contributes at load time.
#[derive(Debug, Clone)]
pub struct PlatformSchema {
    pub name: String,
    pub version: String,
    /// JSON-schema fragment for this platform's messages.
    pub messages: Value,
    /// JSON-schema for credentials objects, when the platform uses them.
    pub credentials: Option<Value>,
}

impl PlatformSchema {
    /// The document meta-validated against the platform meta-schema.
    pub fn to_value(&self) -> Value {
        let mut doc = json!({
            "name": self.name,
            "version": self.version,
            "messages": self.messages,
        });
        if let Some(credentials) = &self.credentials {
            doc["credentials"] = credentials.clone();
        }
        doc
    }
}

/// Load-time platform configuration.
///
/// The typed trait makes a non-object `config` unrepresentable; the
/// fail-fast startup policy of the original applies to schema
/// meta-validation only.
#[derive(Debug, Clone, Copy)]
pub struct PlatformConfig {
    /// Whether sessions for this platform hold live external connections
    /// worth keeping across jobs.
    pub persist: bool,
    /// Jobs are rejected with CredentialsRequired until credentials have
    /// been set for the actor.
    pub require_credentials: bool,
}

/// Errors returned by platform verb invocations. Passed through to the
/// client largely verbatim.
#[derive(Debug, Error, Clone)]
pub enum PlatformError {
    #[error("{0}")]
    Execution(String),

    #[error("platform unavailable: {0}")]
    Unavailable(String),
}

/// Context injected into a platform session when it starts: the actor's
/// identity and credentials, plus the only channel by which the platform
/// may emit unsolicited events back toward clients.
pub struct SessionContext {
    pub actor: ActorId,
    pub platform: String,
    pub credentials: Option<Value>,
    pub emitter: mpsc::UnboundedSender<Value>,
}

impl SessionContext {
    /// Emit an unsolicited event (e.g. an incoming chat message) toward all
    /// clients of this session's actor.
    pub fn send_to_client(&self, payload: Value) {
        let _ = self.emitter.send(payload);
    }
}

/// A pluggable backend implementing a set of verbs against an external
/// system. One callable covers all declared verbs; the verb is on the job.
#[async_trait]
pub trait PlatformPlugin: Send + Sync {
    fn id(&self) -> &str;

    fn schema(&self) -> PlatformSchema;

    fn config(&self) -> PlatformConfig;

    /// Execute one job. May block on network I/O; runs on the session's
    /// dedicated worker, never on the dispatch path.
    async fn invoke(&self, job: &Job, session: &SessionContext) -> Result<Value, PlatformError>;

    /// Called once on session teardown.
    async fn cleanup(&self, _session: &SessionContext) {}
}

/// Immutable descriptor created at startup, looked up by `context` on every
/// incoming message.
#[derive(Clone)]
pub struct PlatformDescriptor {
    pub id: String,
    pub version: String,
    pub declared_verbs: HashSet<String>,
    pub requires_credentials: bool,
    pub plugin: Arc<dyn PlatformPlugin>,
}

impl std::fmt::Debug for PlatformDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformDescriptor")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("declared_verbs", &self.declared_verbs)
            .field("requires_credentials", &self.requires_credentials)
            .finish_non_exhaustive()
    }
}

/// Registry of loaded platforms, immutable after startup.
pub struct PlatformRegistry {
    platforms: HashMap<String, Arc<PlatformDescriptor>>,
}

impl PlatformRegistry {
    /// Load plugins, applying the allow/deny policy: a non-empty allowlist
    /// loads only listed ids; otherwise a non-empty denylist skips listed
    /// ids; otherwise everything loads.
    ///
    /// A platform whose schema fails meta-validation is a fatal startup
    /// error: the whole load fails and the process refuses to start.
    pub fn load(
        plugins: Vec<Arc<dyn PlatformPlugin>>,
        allow: &[String],
        deny: &[String],
        schemas: &SchemaRegistry,
    ) -> anyhow::Result<Self> {
        let meta = jsonschema::options()
            .build(&crate::schema::base::platform_meta_schema())
            .map_err(|e| anyhow::anyhow!("platform meta-schema failed to compile: {e}"))?;

        let mut platforms = HashMap::new();
        for plugin in plugins {
            let id = plugin.id().to_string();

            if !allow.is_empty() {
                if !allow.iter().any(|a| a == &id) {
                    info!(platform = %id, "platform not in allowlist, skipping");
                    continue;
                }
            } else if deny.iter().any(|d| d == &id) {
                info!(platform = %id, "platform in denylist, skipping");
                continue;
            }

            let schema = plugin.schema();
            let schema_doc = schema.to_value();
            if let Err(e) = meta.validate(&schema_doc) {
                anyhow::bail!(
                    "platform '{id}' schema failed meta-validation at {}: {e}",
                    e.instance_path
                );
            }

            let declared_verbs = extract_verbs(&schema.messages);
            schemas.register_platform(&id, &schema.messages, schema.credentials.as_ref())?;

            let config = plugin.config();
            info!(
                platform = %id,
                version = %schema.version,
                verbs = declared_verbs.len(),
                requires_credentials = config.require_credentials,
                "platform loaded"
            );

            platforms.insert(
                id.clone(),
                Arc::new(PlatformDescriptor {
                    id,
                    version: schema.version,
                    declared_verbs,
                    requires_credentials: config.require_credentials,
                    plugin,
                }),
            );
        }

        Ok(Self { platforms })
    }

    pub fn get(&self, platform_id: &str) -> Option<Arc<PlatformDescriptor>> {
        self.platforms.get(platform_id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.platforms.keys().map(String::as_str).collect()
    }
}

/// Declared verbs come from `messages.properties.type.enum`, when present.
fn extract_verbs(messages: &Value) -> HashSet<String> {
    messages
        .pointer("/properties/type/enum")
        .and_then(Value::as_array)
        .map(|verbs| {
            verbs
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}
