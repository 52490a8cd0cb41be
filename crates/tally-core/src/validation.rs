//! # Input Validation
//!
//! Checks applied before anything reaches an adapter.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Validation Rules                            │
//! │                                                                 │
//! │  Event type      non-empty, ≤ 128 chars                         │
//! │  Event key       non-empty, ≤ 256 chars, no leading '_',        │
//! │                  not "rev_counter"                              │
//! │  Store name      non-empty, [a-z0-9_]+, starts with a letter    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::REV_COUNTER_KEY;

/// Maximum length of an event type.
pub const MAX_EVENT_TYPE_LEN: usize = 128;

/// Maximum length of an idempotency key / event id.
pub const MAX_KEY_LEN: usize = 256;

/// Validates an event type such as `sale.recorded`.
pub fn validate_event_type(event_type: &str) -> Result<(), ValidationError> {
    if event_type.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "type".to_string(),
        });
    }

    if event_type.len() > MAX_EVENT_TYPE_LEN {
        return Err(ValidationError::TooLong {
            field: "type".to_string(),
            max: MAX_EVENT_TYPE_LEN,
        });
    }

    Ok(())
}

/// Validates an explicit idempotency key.
///
/// Leading underscores are reserved for storage metadata (`_id`, `_rev`,
/// `_meta_*`), and `rev_counter` would collide with the key/value engine's
/// counter entry.
pub fn validate_event_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::Required {
            field: "key".to_string(),
        });
    }

    if key.len() > MAX_KEY_LEN {
        return Err(ValidationError::TooLong {
            field: "key".to_string(),
            max: MAX_KEY_LEN,
        });
    }

    if key.starts_with('_') {
        return Err(ValidationError::InvalidFormat {
            field: "key".to_string(),
            reason: "must not start with '_'".to_string(),
        });
    }

    if key == REV_COUNTER_KEY {
        return Err(ValidationError::Reserved {
            field: "key".to_string(),
            value: key.to_string(),
        });
    }

    Ok(())
}

/// Validates a store name (used as SQLite file stem and key/value prefix).
pub fn validate_store_name(name: &str) -> Result<(), ValidationError> {
    let mut chars = name.chars();

    match chars.next() {
        None => {
            return Err(ValidationError::Required {
                field: "store name".to_string(),
            })
        }
        Some(first) if !first.is_ascii_lowercase() => {
            return Err(ValidationError::InvalidFormat {
                field: "store name".to_string(),
                reason: "must start with a lowercase letter".to_string(),
            })
        }
        Some(_) => {}
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(ValidationError::InvalidFormat {
            field: "store name".to_string(),
            reason: "only a-z, 0-9 and '_' are allowed".to_string(),
        });
    }

    Ok(())
}
