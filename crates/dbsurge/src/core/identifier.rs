//! Identifier validation and quoting for generated DML.
//!
//! Identifiers cannot be bound as statement parameters, so every table
//! and column name that reaches generated SQL passes through
//! [`validate_identifier`] first and is quoted by [`quote_identifier`]
//! when its spelling requires it.

use crate::error::{EtlError, Result};

/// Conservative maximum identifier length across databases.
const MAX_IDENTIFIER_LENGTH: usize = 64;

/// Character sequences that could break out of an identifier position.
const DANGEROUS_PATTERNS: &[&str] = &["\0", "\n", "\r", "\"", ";", "\x1a", "--", "/*", "*/"];

/// Validate an identifier, recursing into dotted qualified names.
///
/// Rejects empty parts, parts not starting with a letter, parts over the
/// length limit, leading/trailing spaces, and injection-capable
/// sequences (quotes, semicolons, comment markers, control bytes).
///
/// # Errors
///
/// Returns `EtlError::Identifier` with a descriptive message.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.contains('.') {
        for part in identifier.split('.') {
            validate_identifier(part)?;
        }
        return Ok(());
    }

    if identifier.is_empty() {
        return Err(EtlError::Identifier("cannot be empty".to_string()));
    }
    if !identifier.chars().next().unwrap().is_ascii_alphabetic() {
        return Err(EtlError::Identifier(format!(
            "must start with a letter: {identifier:?}"
        )));
    }
    if identifier.len() > MAX_IDENTIFIER_LENGTH {
        return Err(EtlError::Identifier(format!(
            "exceeds max length of {MAX_IDENTIFIER_LENGTH}: {identifier:?}"
        )));
    }
    for pattern in DANGEROUS_PATTERNS {
        if identifier.contains(pattern) {
            return Err(EtlError::Identifier(format!(
                "contains dangerous pattern {pattern:?}: {identifier:?}"
            )));
        }
    }
    if identifier.starts_with(' ') || identifier.ends_with(' ') {
        return Err(EtlError::Identifier(format!(
            "has leading/trailing spaces: {identifier:?}"
        )));
    }
    Ok(())
}

/// True when the identifier needs double quotes in generated SQL.
///
/// Uniform-case alphanumeric-with-underscore names pass unquoted; mixed
/// case or anything else gets quoted to preserve spelling.
#[must_use]
pub fn needs_quoting(identifier: &str) -> bool {
    let mut chars = identifier.chars();
    let Some(first) = chars.next() else {
        return true;
    };
    if !first.is_ascii_alphabetic() {
        return true;
    }
    let all_lower = identifier
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    let all_upper = identifier
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    !(all_lower || all_upper)
}

/// Quote an identifier if needed, splitting qualified names on dots.
#[must_use]
pub fn quote_identifier(identifier: &str) -> String {
    if identifier.contains('.') {
        return identifier
            .split('.')
            .map(quote_identifier)
            .collect::<Vec<_>>()
            .join(".");
    }
    if needs_quoting(identifier) {
        format!("\"{identifier}\"")
    } else {
        identifier.to_string()
    }
}
