//! # Event Identity
//!
//! Decides which id an appended event gets.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Identity Resolution                                 │
//! │                                                                         │
//! │   options.key present? ──yes──► Key(key)          (idempotent)          │
//! │          │ no                                                           │
//! │          ▼                                                              │
//! │   options.params present? ──yes──► Derived("h-" + blake3(canonical))   │
//! │          │ no                            (idempotent)                   │
//! │          ▼                                                              │
//! │   Random(uuid v4)                        (never collides)               │
//! │                                                                         │
//! │   canonical = JSON of { type, aggregate, params } with object keys      │
//! │               sorted recursively                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two appends that resolve to the same id are the same logical event:
//! the store keeps the first and reports `is_new = false` for the second.

use serde_json::{json, Value};

use crate::error::CoreResult;
use crate::types::AppendOptions;
use crate::validation::{validate_event_key, validate_event_type};
use crate::DERIVED_ID_PREFIX;

/// Where an event id came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventIdentity {
    /// Explicit idempotency key supplied by the caller.
    Key(String),
    /// Hash of the request semantics.
    Derived(String),
    /// Fresh random id.
    Random(String),
}

impl EventIdentity {
    pub fn id(&self) -> &str {
        match self {
            EventIdentity::Key(id) | EventIdentity::Derived(id) | EventIdentity::Random(id) => id,
        }
    }

    pub fn into_id(self) -> String {
        match self {
            EventIdentity::Key(id) | EventIdentity::Derived(id) | EventIdentity::Random(id) => id,
        }
    }

    /// Whether repeating the same call yields the same id.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, EventIdentity::Random(_))
    }
}

/// Resolves the id for an append.
///
/// Validates the event type and any explicit key.
pub fn resolve_identity(event_type: &str, options: &AppendOptions) -> CoreResult<EventIdentity> {
    validate_event_type(event_type)?;

    if let Some(key) = &options.key {
        validate_event_key(key)?;
        return Ok(EventIdentity::Key(key.clone()));
    }

    if let Some(params) = &options.params {
        let aggregate = match &options.aggregate {
            Some(aggregate) => serde_json::to_value(aggregate)?,
            None => Value::Null,
        };
        return Ok(EventIdentity::Derived(derive_key(event_type, &aggregate, params)));
    }

    Ok(EventIdentity::Random(uuid::Uuid::new_v4().to_string()))
}

/// Deterministic key from the semantic content of a request.
pub fn derive_key(event_type: &str, aggregate: &Value, params: &Value) -> String {
    let seed = json!({
        "type": event_type,
        "aggregate": aggregate,
        "params": params,
    });

    let digest = blake3::hash(canonical_json(&seed).as_bytes());
    format!("{}{}", DERIVED_ID_PREFIX, digest.to_hex())
}

/// Serializes a value with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
