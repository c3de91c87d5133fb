//! Identifier validation and quoting for generated SQL.
//!
//! Names that end up inside generated DDL are checked with
//! [`validate_identifier`] and emitted with [`quote_identifier`]. The check
//! runs on the same string that gets quoted, so mixed-case names keep their
//! case and user tables may use any prefix, `pg_` included.

use crate::{PgExtError, Result};
use unicode_normalization::{is_nfkc, UnicodeNormalization};

/// Postgres truncates identifiers longer than this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Wraps each dot-separated part in double quotes, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Checks a table name, optionally qualified as `schema.table`.
pub fn validate_identifier(name: &str) -> Result<()> {
    match name.split('.').collect::<Vec<_>>().as_slice() {
        [table] => validate_identifier_part(table),
        [schema, table] => {
            validate_identifier_part(schema)?;
            validate_identifier_part(table)
        }
        _ => Err(PgExtError::Validation(format!(
            "Identifier '{}' must be 'name' or 'schema.name'",
            name
        ))),
    }
}

/// Checks one unqualified name exactly as it will be quoted.
///
/// Accepted names are ASCII letters, digits and `_`, not starting with a
/// digit, at most [`MAX_IDENTIFIER_LEN`] bytes. Names that only become valid
/// after NFKC normalisation (full-width letters, ligatures) are rejected with
/// the normalised spelling in the message, since the server would see the raw
/// characters.
pub fn validate_identifier_part(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PgExtError::Validation("Identifier cannot be empty".to_string()));
    }

    if !is_nfkc(name) {
        let normalized: String = name.nfkc().collect();
        return Err(PgExtError::Validation(format!(
            "Identifier '{}' is not in normalized form (did you mean '{}'?)",
            name, normalized
        )));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(PgExtError::Validation(format!(
            "Identifier '{}' is {} bytes, longer than {}",
            name,
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(PgExtError::Validation(format!(
            "Identifier '{}' must not start with a digit",
            name
        )));
    }

    if let Some(bad) = name.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(PgExtError::Validation(format!(
            "Identifier '{}' contains invalid character '{}'",
            name, bad
        )));
    }

    Ok(())
}

/// Escapes a value for use inside a single-quoted SQL string literal.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
