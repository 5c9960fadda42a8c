//! Base Activity-Stream schema fragments.
//!
//! The envelope schema plus one fragment per known object type. Each
//! fragment discriminates on a `type` const, and each carries an explicit
//! `additionalProperties` policy: extension-friendly types (person, room,
//! feed, website, credentials) accept unknown properties for
//! platform-specific fields; the rest are fail-closed.

use serde_json::{json, Value};

/// Envelope schema: requires `type`, `context`, `actor`; `target` and
/// `object` optional. Unknown top-level keys are rejected.
pub fn envelope_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "id": { "type": "string" },
            "context": { "type": "string", "minLength": 1 },
            "type": { "type": "string", "minLength": 1 },
            "actor": { "type": "object" },
            "target": { "type": "object" },
            "object": { "type": "object" },
            "error": {},
        },
        "required": ["type", "context", "actor"],
        "additionalProperties": false,
    })
}

/// One known object type: its name (the `type` discriminator) and schema.
pub struct ObjectTypeDef {
    pub name: &'static str,
    pub schema: Value,
}

/// All object-type branches used for exclusive one-of matching of `actor`,
/// `target`, and `object` sub-objects.
pub fn object_type_definitions() -> Vec<ObjectTypeDef> {
    vec![
        ObjectTypeDef {
            name: "person",
            schema: json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string", "minLength": 1 },
                    "type": { "const": "person" },
                    "name": { "type": "string" },
                },
                "required": ["id", "type"],
                "additionalProperties": true,
            }),
        },
        ObjectTypeDef {
            name: "room",
            schema: json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string", "minLength": 1 },
                    "type": { "const": "room" },
                    "name": { "type": "string" },
                },
                "required": ["id", "type"],
                "additionalProperties": true,
            }),
        },
        ObjectTypeDef {
            name: "feed",
            schema: json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string", "minLength": 1 },
                    "type": { "const": "feed" },
                    "name": { "type": "string" },
                    "description": { "type": "string" },
                },
                "required": ["id", "type"],
                "additionalProperties": true,
            }),
        },
        ObjectTypeDef {
            name: "website",
            schema: json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string", "minLength": 1 },
                    "type": { "const": "website" },
                    "name": { "type": "string" },
                },
                "required": ["id", "type"],
                "additionalProperties": true,
            }),
        },
        ObjectTypeDef {
            name: "credentials",
            // Generic branch; replaced by the platform's credentials schema
            // when validating a credentials-type message.
            schema: json!({
                "type": "object",
                "properties": {
                    "type": { "const": "credentials" },
                },
                "required": ["type"],
                "additionalProperties": true,
            }),
        },
        ObjectTypeDef {
            name: "message",
            schema: json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string" },
                    "type": { "const": "message" },
                    "content": { "type": "string" },
                },
                "required": ["type", "content"],
                "additionalProperties": false,
            }),
        },
        ObjectTypeDef {
            name: "presence",
            schema: json!({
                "type": "object",
                "properties": {
                    "type": { "const": "presence" },
                    "presence": {
                        "enum": ["away", "chat", "dnd", "xa", "offline", "online"]
                    },
                    "status": { "type": "string" },
                    "role": { "type": "string" },
                },
                "required": ["type", "presence"],
                "additionalProperties": false,
            }),
        },
        ObjectTypeDef {
            name: "attendance",
            schema: json!({
                "type": "object",
                "properties": {
                    "type": { "const": "attendance" },
                },
                "required": ["type"],
                "additionalProperties": false,
            }),
        },
        ObjectTypeDef {
            name: "relationship",
            schema: json!({
                "type": "object",
                "properties": {
                    "type": { "const": "relationship" },
                    "relationship": { "type": "string" },
                    "subject": { "type": "object" },
                    "object": { "type": "object" },
                },
                "required": ["type", "relationship"],
                "additionalProperties": false,
            }),
        },
        ObjectTypeDef {
            name: "topic",
            schema: json!({
                "type": "object",
                "properties": {
                    "type": { "const": "topic" },
                    "content": { "type": "string" },
                },
                "required": ["type", "content"],
                "additionalProperties": false,
            }),
        },
        ObjectTypeDef {
            name: "address",
            schema: json!({
                "type": "object",
                "properties": {
                    "type": { "const": "address" },
                    "name": { "type": "string" },
                    "address": { "type": "string" },
                    "locality": { "type": "string" },
                    "region": { "type": "string" },
                    "country": { "type": "string" },
                },
                "required": ["type"],
                "additionalProperties": false,
            }),
        },
        ObjectTypeDef {
            name: "me",
            schema: json!({
                "type": "object",
                "properties": {
                    "type": { "const": "me" },
                    "content": { "type": "string" },
                },
                "required": ["type"],
                "additionalProperties": false,
            }),
        },
    ]
}

/// Meta-schema every platform schema must satisfy at load time. Failing
/// this is a deployment defect and fatal at startup. A credentials schema,
/// when present, must declare its `additionalProperties` policy explicitly
/// rather than inheriting a guessed default.
pub fn platform_meta_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": { "type": "string", "minLength": 1 },
            "version": { "type": "string", "minLength": 1 },
            "messages": {
                "type": "object",
                "properties": {
                    "properties": { "type": "object" },
                },
            },
            "credentials": {
                "type": "object",
                "required": ["additionalProperties"],
            },
        },
        "required": ["name", "version", "messages"],
        "additionalProperties": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_object_type_discriminates_on_type() {
        for def in object_type_definitions() {
            let discriminator = &def.schema["properties"]["type"]["const"];
            assert_eq!(
                discriminator,
                &json!(def.name),
                "object type '{}' must const-discriminate on its name",
                def.name
            );
            let required = def.schema["required"].as_array().unwrap();
            assert!(required.contains(&json!("type")));
        }
    }

    #[test]
    fn test_every_object_type_declares_additional_properties_policy() {
        for def in object_type_definitions() {
            assert!(
                def.schema.get("additionalProperties").is_some(),
                "object type '{}' must declare its additionalProperties policy",
                def.name
            );
        }
    }
}
