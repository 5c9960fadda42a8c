//! Error taxonomy for the dispatch path.
//!
//! Every failure a client can observe maps to one variant here, and every
//! variant carries a stable wire code so transports can handle errors
//! programmatically. Validation and routing failures are recovered locally
//! and answered on the client's channel; they are never fatal to the
//! process. Startup defects (platform meta-schema failures, malformed
//! platform config) use `anyhow` at the binary boundary instead and abort.

use shared_types::ErrorObject;
use thiserror::Error;

/// Failures surfaced to clients or recorded against pending jobs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    /// Required envelope fields missing; rejected before validation.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Message or sub-object failed schema validation.
    #[error("schema validation failed at {path}: {reason}")]
    SchemaValidationFailed { path: String, reason: String },

    /// `context` names no loaded platform.
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    /// `type` is not in the platform's declared verb set.
    #[error("unknown verb '{verb}' for platform '{platform}'")]
    UnknownVerb { platform: String, verb: String },

    /// Platform mandates credentials that have not been set for this actor.
    #[error("credentials required for '{actor}' on platform '{platform}'")]
    CredentialsRequired { actor: String, platform: String },

    /// Session torn down while the job was pending.
    #[error("session terminated: {0}")]
    SessionTerminated(String),

    /// Worker exited abnormally while the job was pending.
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    /// The platform's verb invocation returned an error; platform detail
    /// preserved verbatim.
    #[error("platform error: {0}")]
    PlatformExecutionError(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("store error: {0}")]
    Store(String),
}

impl DispatchError {
    pub fn wire_code(&self) -> &'static str {
        match self {
            DispatchError::MalformedRequest(_) => "MALFORMED_REQUEST",
            DispatchError::SchemaValidationFailed { .. } => "SCHEMA_VALIDATION_FAILED",
            DispatchError::UnknownPlatform(_) => "UNKNOWN_PLATFORM",
            DispatchError::UnknownVerb { .. } => "UNKNOWN_VERB",
            DispatchError::CredentialsRequired { .. } => "CREDENTIALS_REQUIRED",
            DispatchError::SessionTerminated(_) => "SESSION_TERMINATED",
            DispatchError::WorkerCrashed(_) => "WORKER_CRASHED",
            DispatchError::PlatformExecutionError(_) => "PLATFORM_ERROR",
            DispatchError::Queue(_) => "QUEUE_ERROR",
            DispatchError::Store(_) => "STORE_ERROR",
        }
    }
}

impl From<&DispatchError> for ErrorObject {
    fn from(err: &DispatchError) -> Self {
        ErrorObject::new(err.wire_code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes_are_stable() {
        let err = DispatchError::UnknownVerb {
            platform: "dummy".to_string(),
            verb: "teleport".to_string(),
        };
        assert_eq!(err.wire_code(), "UNKNOWN_VERB");

        let obj = ErrorObject::from(&err);
        assert_eq!(obj.code, "UNKNOWN_VERB");
        assert!(obj.content.contains("teleport"));
    }

    #[test]
    fn test_schema_failure_carries_path() {
        let err = DispatchError::SchemaValidationFailed {
            path: "/actor".to_string(),
            reason: "\"id\" is a required property".to_string(),
        };
        assert!(err.to_string().contains("/actor"));
    }
}
