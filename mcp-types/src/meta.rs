//! Validation for `_meta` keys.
//!
//! Keys follow `[prefix "/"] name` where both halves are dot-separated labels
//! of `[A-Za-z0-9_-]`. Prefixes containing a label equal (case-insensitively)
//! to `mcp` or `modelcontextprotocol` are reserved for the protocol itself
//! and rejected at the client boundary.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetaKeyError {
    #[error("invalid _meta key {key:?}: {reason}")]
    Invalid { key: String, reason: &'static str },
    #[error("_meta key {key:?} uses a reserved prefix")]
    Reserved { key: String },
}

/// Validate a single `_meta` key against the key grammar.
pub fn validate_meta_key(key: &str) -> Result<(), MetaKeyError> {
    let invalid = |reason: &'static str| MetaKeyError::Invalid {
        key: key.to_string(),
        reason,
    };

    if key.is_empty() {
        return Err(invalid("key is empty"));
    }

    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() {
            return Err(invalid("key starts with '/'"));
        }
        if name.contains('/') {
            return Err(invalid("key contains more than one '/'"));
        }
        validate_labels(prefix).map_err(invalid)?;
        let reserved = prefix.split('.').any(|label| {
            label.eq_ignore_ascii_case("mcp") || label.eq_ignore_ascii_case("modelcontextprotocol")
        });
        if reserved {
            return Err(MetaKeyError::Reserved {
                key: key.to_string(),
            });
        }
    }

    validate_labels(name).map_err(invalid)?;
    Ok(())
}

/// Validate every key of a `_meta` object.
pub fn validate_meta(meta: &serde_json::Map<String, serde_json::Value>) -> Result<(), MetaKeyError> {
    for key in meta.keys() {
        validate_meta_key(key)?;
    }
    Ok(())
}

fn validate_labels(part: &str) -> Result<(), &'static str> {
    if part.is_empty() {
        return Err("name is empty");
    }
    if part.starts_with('.') {
        return Err("leading '.'");
    }
    if part.ends_with('.') {
        return Err("trailing '.'");
    }
    for label in part.split('.') {
        if label.is_empty() {
            return Err("consecutive dots");
        }
        if label.starts_with('-') {
            return Err("label starts with '-'");
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err("label contains a character outside [A-Za-z0-9_-]");
        }
    }
    Ok(())
}
