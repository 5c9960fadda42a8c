//! Built-in dummy platform: echoes or fails on request.
//!
//! Serves as the reference plugin implementation and the workhorse for
//! tests that need a real platform behind the dispatch path.

use async_trait::async_trait;
use serde_json::{json, Value};
use shared_types::Job;

use super::{PlatformConfig, PlatformError, PlatformPlugin, PlatformSchema, SessionContext};

pub struct DummyPlatform {
    require_credentials: bool,
}

impl DummyPlatform {
    pub fn new() -> Self {
        Self {
            require_credentials: false,
        }
    }

    /// Variant that gates jobs on stored credentials, for exercising the
    /// CredentialsRequired path.
    pub fn with_credentials_required() -> Self {
        Self {
            require_credentials: true,
        }
    }
}

impl Default for DummyPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformPlugin for DummyPlatform {
    fn id(&self) -> &str {
        "dummy"
    }

    fn schema(&self) -> PlatformSchema {
        PlatformSchema {
            name: "dummy".to_string(),
            version: "1.0.0".to_string(),
            messages: json!({
                "type": "object",
                "properties": {
                    "type": { "enum": ["echo", "fail", "credentials"] },
                },
            }),
            credentials: Some(json!({
                "type": "object",
                "properties": {
                    "type": { "const": "credentials" },
                    "token": { "type": "string" },
                },
                "required": ["type", "token"],
                "additionalProperties": true,
            })),
        }
    }

    fn config(&self) -> PlatformConfig {
        PlatformConfig {
            persist: false,
            require_credentials: self.require_credentials,
        }
    }

    async fn invoke(&self, job: &Job, _session: &SessionContext) -> Result<Value, PlatformError> {
        let content = job
            .payload
            .pointer("/object/content")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match job.verb.as_str() {
            "echo" => Ok(json!({ "type": "message", "content": content })),
            "fail" => Err(PlatformError::Execution(format!(
                "intentional failure: {content}"
            ))),
            other => Err(PlatformError::Execution(format!(
                "dummy cannot handle verb '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::ActorId;
    use tokio::sync::mpsc;

    fn session() -> SessionContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        SessionContext {
            actor: ActorId::from("bob@example.org"),
            platform: "dummy".to_string(),
            credentials: None,
            emitter: tx,
        }
    }

    #[tokio::test]
    async fn test_echo_returns_content() {
        let platform = DummyPlatform::new();
        let job = Job::new(
            "j1",
            "dummy",
            ActorId::from("bob@example.org"),
            "echo",
            json!({
                "id": "j1",
                "context": "dummy",
                "type": "echo",
                "actor": { "id": "bob@example.org", "type": "person" },
                "object": { "type": "message", "content": "hello" },
            }),
        );

        let result = platform.invoke(&job, &session()).await.unwrap();
        assert_eq!(result["content"], json!("hello"));
    }

    #[tokio::test]
    async fn test_fail_returns_platform_error() {
        let platform = DummyPlatform::new();
        let job = Job::new(
            "j2",
            "dummy",
            ActorId::from("bob@example.org"),
            "fail",
            json!({
                "id": "j2",
                "context": "dummy",
                "type": "fail",
                "actor": { "id": "bob@example.org", "type": "person" },
                "object": { "type": "message", "content": "boom" },
            }),
        );

        let err = platform.invoke(&job, &session()).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
