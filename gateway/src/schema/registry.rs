//! SchemaRegistry - composed validation of Activity Stream messages.
//!
//! Validation runs in three stages:
//!
//! 1. the base envelope schema (`type`, `context`, `actor` required)
//! 2. the named platform's message schema
//! 3. exclusive one-of matching of `actor`, `target`, and `object` against
//!    the known object-type branches; a credentials-type `object` is
//!    validated against the platform's credentials schema instead
//!
//! Zero matches or more than one match in stage 3 is a failure, never a
//! pick-first. All failures come back as a [`ValidationResult`] with the
//! failing path; nothing panics or errors across this boundary.

use dashmap::DashMap;
use jsonschema::Validator;
use serde_json::Value;
use std::sync::Arc;

use crate::schema::base;

/// Outcome of validating one message. Pure data; calling validate twice on
/// the same message yields the same result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid { path: String, reason: String },
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    fn fail(path: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationResult::Invalid {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

struct ObjectTypeValidator {
    name: &'static str,
    validator: Validator,
}

struct PlatformValidators {
    messages: Validator,
    credentials: Option<Validator>,
}

/// Compiled validators for the base schema plus every registered platform.
pub struct SchemaRegistry {
    envelope: Validator,
    object_types: Vec<ObjectTypeValidator>,
    platforms: DashMap<String, Arc<PlatformValidators>>,
}

fn compile(schema: &Value) -> anyhow::Result<Validator> {
    jsonschema::options()
        .should_validate_formats(true)
        .build(schema)
        .map_err(|e| anyhow::anyhow!("invalid schema: {e}"))
}

impl SchemaRegistry {
    /// Compile the base envelope and object-type fragments.
    pub fn new() -> anyhow::Result<Self> {
        let envelope = compile(&base::envelope_schema())?;

        let mut object_types = Vec::new();
        for def in base::object_type_definitions() {
            object_types.push(ObjectTypeValidator {
                name: def.name,
                validator: compile(&def.schema)?,
            });
        }

        Ok(Self {
            envelope,
            object_types,
            platforms: DashMap::new(),
        })
    }

    /// Compile and store a platform's schema fragments. Called by the
    /// platform registry after meta-validation.
    pub fn register_platform(
        &self,
        platform_id: &str,
        messages: &Value,
        credentials: Option<&Value>,
    ) -> anyhow::Result<()> {
        let validators = PlatformValidators {
            messages: compile(messages)
                .map_err(|e| anyhow::anyhow!("platform '{platform_id}' messages schema: {e}"))?,
            credentials: match credentials {
                Some(schema) => Some(compile(schema).map_err(|e| {
                    anyhow::anyhow!("platform '{platform_id}' credentials schema: {e}")
                })?),
                None => None,
            },
        };
        self.platforms
            .insert(platform_id.to_string(), Arc::new(validators));
        Ok(())
    }

    pub fn has_platform(&self, platform_id: &str) -> bool {
        self.platforms.contains_key(platform_id)
    }

    /// Validate a full message against the composed schema for one platform.
    pub fn validate(&self, platform_id: &str, message: &Value) -> ValidationResult {
        if let Err(e) = self.envelope.validate(message) {
            return ValidationResult::fail(location_path(&e), e.to_string());
        }

        let platform = match self.platforms.get(platform_id) {
            Some(entry) => entry.clone(),
            None => {
                return ValidationResult::fail(
                    "/context",
                    format!("no schema registered for platform '{platform_id}'"),
                );
            }
        };

        if let Err(e) = platform.messages.validate(message) {
            return ValidationResult::fail(location_path(&e), e.to_string());
        }

        if let Some(actor) = message.get("actor") {
            let result = self.match_object_type("/actor", actor);
            if !result.is_valid() {
                return result;
            }
        }

        if let Some(target) = message.get("target") {
            let result = self.match_object_type("/target", target);
            if !result.is_valid() {
                return result;
            }
        }

        if let Some(object) = message.get("object") {
            let object_type = object.get("type").and_then(Value::as_str);
            if object_type == Some("credentials") {
                return self.validate_credentials_object(&platform, object);
            }
            let result = self.match_object_type("/object", object);
            if !result.is_valid() {
                return result;
            }
        }

        ValidationResult::Valid
    }

    /// Exclusive one-of across the known object-type branches. Exactly one
    /// branch must accept; ambiguity is an error, not a pick-first.
    fn match_object_type(&self, path: &str, value: &Value) -> ValidationResult {
        let matches: Vec<&'static str> = self
            .object_types
            .iter()
            .filter(|ot| ot.validator.is_valid(value))
            .map(|ot| ot.name)
            .collect();

        match matches.len() {
            1 => ValidationResult::Valid,
            0 => {
                // Best-effort detail: if the declared type names a known
                // branch, report that branch's first failure.
                if let Some(declared) = value.get("type").and_then(Value::as_str) {
                    if let Some(branch) = self.object_types.iter().find(|ot| ot.name == declared) {
                        if let Err(e) = branch.validator.validate(value) {
                            return ValidationResult::fail(
                                format!("{path}{}", location_path(&e)),
                                e.to_string(),
                            );
                        }
                    }
                }
                ValidationResult::fail(path, "does not match any known object type")
            }
            _ => ValidationResult::fail(
                path,
                format!("ambiguous object type: matches {}", matches.join(", ")),
            ),
        }
    }

    /// Credentials-schema substitution: a credentials-type object validates
    /// against the platform's declared credentials schema, not the generic
    /// object-type union.
    fn validate_credentials_object(
        &self,
        platform: &PlatformValidators,
        object: &Value,
    ) -> ValidationResult {
        match &platform.credentials {
            Some(validator) => match validator.validate(object) {
                Ok(()) => ValidationResult::Valid,
                Err(e) => ValidationResult::fail(
                    format!("/object{}", location_path(&e)),
                    e.to_string(),
                ),
            },
            None => {
                ValidationResult::fail("/object", "platform declares no credentials schema")
            }
        }
    }
}

fn location_path(error: &jsonschema::ValidationError<'_>) -> String {
    let path = error.instance_path.to_string();
    if path.is_empty() {
        "/".to_string()
    } else {
        path
    }
}
