//! Credential-rotation password configuration.
//!
//! Operators supply the broker's encryption passwords as a JSON array; each
//! entry carries a label, the secret itself, and whether it is the primary
//! password used for new writes. Exactly one primary must exist. Parsing
//! and validation happen at startup, well before any workspace operation.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordEntry {
    pub label: String,
    pub secret: String,
    pub primary: bool,
}

#[derive(Debug, Error)]
pub enum PasswordConfigError {
    #[error("password configuration JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("password configuration error: {}", .0.join("; "))]
    Validation(Vec<String>),
}

#[derive(Deserialize)]
struct RawEntry {
    label: String,
    #[serde(default)]
    primary: bool,
    password: RawPassword,
}

#[derive(Deserialize)]
struct RawPassword {
    secret: String,
}

const SECRET_MIN: usize = 20;
const SECRET_MAX: usize = 1024;
const LABEL_MIN: usize = 5;
const LABEL_MAX: usize = 20;

/// Parse and validate operator-supplied password configuration.
///
/// Empty input means no passwords are configured and is not an error. All
/// validation failures are collected and reported together, each with the
/// field path it applies to.
pub fn parse_password_entries(input: &str) -> Result<Vec<PasswordEntry>, PasswordConfigError> {
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<RawEntry> = serde_json::from_str(input)?;
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<PasswordEntry> = raw
        .into_iter()
        .map(|e| PasswordEntry {
            label: e.label,
            secret: e.password.secret,
            primary: e.primary,
        })
        .collect();

    let errors = validate(&entries);
    if !errors.is_empty() {
        return Err(PasswordConfigError::Validation(errors));
    }

    Ok(entries)
}

fn validate(entries: &[PasswordEntry]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen_labels = std::collections::HashSet::new();
    let mut primaries = 0usize;

    for (i, entry) in entries.iter().enumerate() {
        if entry.primary {
            primaries += 1;
        }
        if entry.secret.len() < SECRET_MIN || entry.secret.len() > SECRET_MAX {
            errors.push(format!(
                "[{i}].password.secret: length must be {SECRET_MIN} to {SECRET_MAX} characters"
            ));
        }
        if entry.label.len() < LABEL_MIN || entry.label.len() > LABEL_MAX {
            errors.push(format!(
                "[{i}].label: length must be {LABEL_MIN} to {LABEL_MAX} characters"
            ));
        }
        if !seen_labels.insert(entry.label.as_str()) {
            errors.push(format!("[{i}].label: duplicate label {:?}", entry.label));
        }
    }

    match primaries {
        0 => errors.push("[].primary: expected exactly one primary, got none".to_string()),
        1 => {}
        _ => errors.push("[].primary: expected exactly one primary, got multiple".to_string()),
    }

    errors
}
