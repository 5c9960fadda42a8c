//! Schema-driven message validation.
//!
//! The registry composes the base Activity-Stream envelope, the per-platform
//! message schema, and exclusive one-of matching of polymorphic sub-objects.

pub mod base;
pub mod registry;

pub use registry::{SchemaRegistry, ValidationResult};
