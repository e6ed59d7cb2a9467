//! SQL Identifier and Literal Sanitization Utilities
//!
//! Provides functions to safely quote SQL identifiers and literals so that
//! caller-supplied names never reach a statement unescaped.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{DataMapperError, Result};

static CAST_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?( [A-Za-z_][A-Za-z0-9_]*)*(\([0-9]+(, ?[0-9]+)?\))?(\[\])*$")
        .expect("cast type pattern is valid")
});

/// Quote a SQL identifier to make it safe for use in queries
///
/// # Example
/// ```
/// use runtara_data_mapper::sql::quote_identifier;
///
/// let quoted = quote_identifier("my_table");
/// assert_eq!(quoted, "\"my_table\"");
/// ```
pub fn quote_identifier(identifier: &str) -> String {
    // Escape any double quotes in the identifier by doubling them
    let escaped = identifier.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Quote a schema-qualified name: `"schema"."name"`
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(name))
}

/// Quote a string literal, doubling embedded single quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Validate a type name used in an explicit cast (`(expr)::type`)
///
/// Accepts plain, schema-qualified, multi-word, sized and array type names
/// such as `int`, `timestamp with time zone`, `numeric(10,2)` and `text[]`.
pub fn validate_cast_type(type_name: &str) -> Result<&str> {
    if CAST_TYPE.is_match(type_name) {
        Ok(type_name)
    } else {
        Err(DataMapperError::invalid_criteria(format!(
            "Invalid cast type '{}'",
            type_name
        )))
    }
}

/// Render a JSON array as a PostgreSQL array literal (`{"a","b"}`)
///
/// Every element is double-quoted so the literal parses for any element type;
/// `null` elements become unquoted `NULL`.
pub fn array_literal(values: &[serde_json::Value]) -> String {
    let items: Vec<String> = values
        .iter()
        .map(|v| match v {
            serde_json::Value::Null => "NULL".to_string(),
            serde_json::Value::String(s) => quote_array_element(s),
            serde_json::Value::Array(inner) => array_literal(inner),
            other => quote_array_element(&other.to_string()),
        })
        .collect();
    format!("{{{}}}", items.join(","))
}

fn quote_array_element(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}
