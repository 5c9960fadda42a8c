//! Dispatcher - the ingress pipeline for raw client messages.
//!
//! Every inbound message runs the same gauntlet: JSON parse, envelope
//! deserialization, platform lookup, verb check, composed schema
//! validation, then either the credentials side-channel (store and ack,
//! never enqueue) or the credentials-gate plus job routing. Each failure
//! maps to one [`DispatchError`] variant and is answered on the client's
//! bus topic; nothing on this path is fatal to the process.
//!
//! Validation runs synchronously on the dispatch path; platform execution
//! never does.

use std::sync::Arc;

use ractor::ActorRef;
use serde_json::Value;
use tracing::{debug, warn};

use shared_types::{error_envelope, ActivityStream, ActorId, ClientRef, ErrorObject, Job};

use crate::bus::{self, client_topic, BusEvent, BusMsg};
use crate::credentials::CredentialStore;
use crate::error::DispatchError;
use crate::platform::{PlatformDescriptor, PlatformRegistry};
use crate::schema::{SchemaRegistry, ValidationResult};
use crate::session::{SessionKey, SessionManagerMsg};

/// What became of an accepted message.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A job was created and routed to its session.
    Accepted { job_id: String },

    /// Credentials were stored; no job was created.
    CredentialsStored,

    /// The actor's session on the platform was torn down.
    Disconnected,
}

pub struct Dispatcher {
    schemas: Arc<SchemaRegistry>,
    registry: Arc<PlatformRegistry>,
    credentials: Arc<dyn CredentialStore>,
    manager: ActorRef<SessionManagerMsg>,
    bus: ActorRef<BusMsg>,
}

impl Dispatcher {
    pub fn new(
        schemas: Arc<SchemaRegistry>,
        registry: Arc<PlatformRegistry>,
        credentials: Arc<dyn CredentialStore>,
        manager: ActorRef<SessionManagerMsg>,
        bus: ActorRef<BusMsg>,
    ) -> Self {
        Self {
            schemas,
            registry,
            credentials,
            manager,
            bus,
        }
    }

    /// Process one raw inbound frame from a client connection. Errors are
    /// answered on the client's topic and also returned to the caller, so
    /// co-located transports can short-circuit the bus round trip.
    pub fn ingest(&self, client: &ClientRef, raw: &str) -> Result<DispatchOutcome, DispatchError> {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.ingest_value(client, value),
            Err(e) => {
                let err = DispatchError::MalformedRequest(format!("invalid JSON: {e}"));
                self.reply_error(client, None, None, &err);
                Err(err)
            }
        }
    }

    /// Same as [`ingest`](Self::ingest), for transports that already hold
    /// parsed JSON.
    pub fn ingest_value(
        &self,
        client: &ClientRef,
        value: Value,
    ) -> Result<DispatchOutcome, DispatchError> {
        // Captured before routing so an error envelope can echo them even
        // when deserialization fails further in.
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let context = value
            .get("context")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        match self.route(client, value) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(
                    client = %client,
                    id = id.as_deref().unwrap_or("-"),
                    code = err.wire_code(),
                    error = %err,
                    "message rejected"
                );
                self.reply_error(client, id.as_deref(), context.as_deref(), &err);
                Err(err)
            }
        }
    }

    fn route(&self, client: &ClientRef, value: Value) -> Result<DispatchOutcome, DispatchError> {
        let (message, descriptor) = vet(&self.schemas, &self.registry, &value)?;

        let actor = ActorId::from(message.actor_id().ok_or_else(|| {
            DispatchError::MalformedRequest("actor.id is required".to_string())
        })?);

        // Built-in teardown verb: pending jobs fail with SessionTerminated
        // and the worker is released. Acked whether or not a session exists.
        if message.verb == "disconnect" {
            let key = SessionKey::new(actor, message.context.clone());
            self.manager
                .cast(SessionManagerMsg::Terminate {
                    key,
                    reason: "disconnect requested".to_string(),
                })
                .map_err(|e| {
                    DispatchError::Queue(format!("session manager unreachable: {e}"))
                })?;
            let event = BusEvent::new(client_topic(client), value, "dispatcher");
            let _ = bus::publish(&self.bus, event);
            return Ok(DispatchOutcome::Disconnected);
        }

        // Credentials never travel through the queue: store and ack.
        if message.verb == "credentials" {
            if !message.is_credentials() {
                return Err(DispatchError::MalformedRequest(
                    "credentials message requires a credentials-type object".to_string(),
                ));
            }
            let object = message.object.clone().ok_or_else(|| {
                DispatchError::MalformedRequest(
                    "credentials message requires an object".to_string(),
                )
            })?;
            self.credentials
                .set(&actor, &message.context, object)
                .map_err(|e| DispatchError::Store(e.to_string()))?;
            debug!(actor = %actor, platform = %message.context, "credentials stored");

            let event = BusEvent::new(client_topic(client), value, "dispatcher");
            let _ = bus::publish(&self.bus, event);
            return Ok(DispatchOutcome::CredentialsStored);
        }

        if descriptor.requires_credentials {
            let present = self
                .credentials
                .has(&actor, &message.context)
                .map_err(|e| DispatchError::Store(e.to_string()))?;
            if !present {
                return Err(DispatchError::CredentialsRequired {
                    actor: actor.to_string(),
                    platform: message.context.clone(),
                });
            }
        }

        // vet guarantees an id; it doubles as the job id so the terminal
        // response is always matchable.
        let job_id = message
            .id
            .clone()
            .ok_or_else(|| DispatchError::MalformedRequest("id is required".to_string()))?;

        let job = Job::new(
            job_id.clone(),
            message.context,
            actor.clone(),
            message.verb,
            value,
        );

        let register = self.manager.cast(SessionManagerMsg::RegisterClient {
            client: client.clone(),
            actor,
        });
        let routed = register.and_then(|_| {
            self.manager.cast(SessionManagerMsg::RouteJob {
                job,
                client: client.clone(),
            })
        });
        routed.map_err(|e| DispatchError::Queue(format!("session manager unreachable: {e}")))?;

        debug!(client = %client, job_id = %job_id, "job accepted");
        Ok(DispatchOutcome::Accepted { job_id })
    }

    fn reply_error(
        &self,
        client: &ClientRef,
        id: Option<&str>,
        context: Option<&str>,
        error: &DispatchError,
    ) {
        let envelope = error_envelope(id, context, &ErrorObject::from(error));
        let event = BusEvent::new(client_topic(client), envelope, "dispatcher");
        let _ = bus::publish(&self.bus, event);
    }
}

/// The stateless validation front half: envelope shape, platform existence,
/// verb membership, composed schema. Separated from routing so it can be
/// exercised without a running actor system.
fn vet(
    schemas: &SchemaRegistry,
    registry: &PlatformRegistry,
    value: &Value,
) -> Result<(ActivityStream, Arc<PlatformDescriptor>), DispatchError> {
    let message = ActivityStream::from_value(value)
        .map_err(|e| DispatchError::MalformedRequest(e.to_string()))?;

    // Replies are matched to requests by id, so an envelope without one is
    // rejected before any further processing.
    if message.id.is_none() {
        return Err(DispatchError::MalformedRequest("id is required".to_string()));
    }

    let descriptor = registry
        .get(&message.context)
        .ok_or_else(|| DispatchError::UnknownPlatform(message.context.clone()))?;

    // Built-in teardown verb: not part of any platform's declared set and
    // never schema-validated beyond the envelope.
    if message.verb == "disconnect" {
        return Ok((message, descriptor));
    }

    // Verb membership before schema validation, so a typo'd verb reports as
    // UNKNOWN_VERB rather than a generic schema failure.
    if !descriptor.declared_verbs.is_empty() && !descriptor.declared_verbs.contains(&message.verb) {
        return Err(DispatchError::UnknownVerb {
            platform: message.context.clone(),
            verb: message.verb.clone(),
        });
    }

    match schemas.validate(&message.context, value) {
        ValidationResult::Valid => Ok((message, descriptor)),
        ValidationResult::Invalid { path, reason } => {
            Err(DispatchError::SchemaValidationFailed { path, reason })
        }
    }
}
