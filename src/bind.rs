//! Parameter binding
//!
//! The driver sends every parameter in binary form with a concrete type, so a
//! JSON value has to be turned into the Rust type matching what the server
//! expects. Builder statements cast their placeholders and bind values as they
//! come. Untyped statements (raw criteria, scripts, `Database::query`) are
//! prepared first and each value is converted to the parameter type the server
//! inferred.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Executor, Postgres, Statement as _, TypeInfo as _};
use uuid::Uuid;

use crate::error::{DataMapperError, Result};
use crate::sql::Statement;

pub(crate) type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Server-inferred parameter type names, or `None` for typed statements
pub(crate) async fn parameter_types<'c, E>(executor: E, statement: &Statement) -> Result<Option<Vec<String>>>
where
    E: Executor<'c, Database = Postgres>,
{
    if !statement.untyped || statement.params.is_empty() {
        return Ok(None);
    }
    let prepared = executor.prepare(&statement.sql).await?;
    Ok(prepared
        .parameters()
        .and_then(|params| params.left())
        .map(|types| types.iter().map(|t| t.name().to_string()).collect()))
}

/// Bind `params` in order, converting each to its inferred type when known
pub(crate) fn bind_params<'q>(
    mut query: PgQuery<'q>,
    params: &'q [Value],
    types: Option<&[String]>,
) -> Result<PgQuery<'q>> {
    for (index, param) in params.iter().enumerate() {
        let type_name = types.and_then(|types| types.get(index)).map(String::as_str);
        query = match type_name {
            Some(type_name) => coerce(index, param, type_name)?.bind(query),
            None => bind_value(query, param),
        };
    }
    Ok(query)
}

fn bind_value<'q>(query: PgQuery<'q>, param: &'q Value) -> PgQuery<'q> {
    match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => query.bind(i),
            // Past i64::MAX; numeric keeps every digit
            (None, Some(u)) => query.bind(Decimal::from(u)),
            _ => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.as_str()),
        Value::Array(_) | Value::Object(_) => query.bind(Json(param)),
    }
}

/// A JSON parameter converted for an inferred parameter type
#[derive(Debug, Clone, PartialEq)]
enum Coerced<'q> {
    /// No conversion needed
    AsIs(&'q Value),
    Text(Option<String>),
    Int(Option<i64>),
    Float(Option<f64>),
    Numeric(Option<Decimal>),
    Bool(Option<bool>),
    Uuid(Option<Uuid>),
    Date(Option<NaiveDate>),
    Time(Option<NaiveTime>),
    Timestamp(Option<NaiveDateTime>),
    Timestamptz(Option<DateTime<Utc>>),
    Json(Option<Value>),
    TextArray(Vec<Option<String>>),
    IntArray(Vec<Option<i64>>),
}

impl<'q> Coerced<'q> {
    fn bind(self, query: PgQuery<'q>) -> PgQuery<'q> {
        match self {
            Coerced::AsIs(value) => bind_value(query, value),
            Coerced::Text(v) => query.bind(v),
            Coerced::Int(v) => query.bind(v),
            Coerced::Float(v) => query.bind(v),
            Coerced::Numeric(v) => query.bind(v),
            Coerced::Bool(v) => query.bind(v),
            Coerced::Uuid(v) => query.bind(v),
            Coerced::Date(v) => query.bind(v),
            Coerced::Time(v) => query.bind(v),
            Coerced::Timestamp(v) => query.bind(v),
            Coerced::Timestamptz(v) => query.bind(v),
            Coerced::Json(v) => query.bind(v.map(Json)),
            Coerced::TextArray(v) => query.bind(v),
            Coerced::IntArray(v) => query.bind(v),
        }
    }
}

fn is_textual(type_name: &str) -> bool {
    matches!(type_name, "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" | "CITEXT")
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Convert `value` (parameter `$index + 1`) for a parameter of type `type_name`
fn coerce<'q>(index: usize, value: &'q Value, type_name: &str) -> Result<Coerced<'q>> {
    let invalid = || {
        DataMapperError::validation(format!(
            "Parameter ${}: {} is not a valid {}",
            index + 1,
            value,
            type_name.to_lowercase()
        ))
    };

    if let Value::Null = value {
        return Ok(match type_name {
            "INT2" | "INT4" | "INT8" => Coerced::Int(None),
            "FLOAT4" | "FLOAT8" => Coerced::Float(None),
            "NUMERIC" => Coerced::Numeric(None),
            "BOOL" => Coerced::Bool(None),
            "UUID" => Coerced::Uuid(None),
            "DATE" => Coerced::Date(None),
            "TIME" => Coerced::Time(None),
            "TIMESTAMP" => Coerced::Timestamp(None),
            "TIMESTAMPTZ" => Coerced::Timestamptz(None),
            "JSON" | "JSONB" => Coerced::Json(None),
            _ => Coerced::Text(None),
        });
    }

    if is_textual(type_name) {
        return Ok(Coerced::Text(text_of(value)));
    }

    let coerced = match (type_name, value) {
        ("JSON" | "JSONB", Value::String(s)) => {
            // JSON-typed placeholders take JSON text; anything else is a JSON string
            Coerced::Json(Some(serde_json::from_str(s).unwrap_or_else(|_| value.clone())))
        }
        ("JSON" | "JSONB", other) => Coerced::Json(Some(other.clone())),
        (_, Value::String(s)) => {
            let s = s.trim();
            match type_name {
                "INT2" | "INT4" | "INT8" => Coerced::Int(Some(s.parse::<i64>().map_err(|_| invalid())?)),
                "FLOAT4" | "FLOAT8" => Coerced::Float(Some(s.parse::<f64>().map_err(|_| invalid())?)),
                "NUMERIC" => Coerced::Numeric(Some(
                    s.parse::<Decimal>()
                        .or_else(|_| Decimal::from_scientific(s))
                        .map_err(|_| invalid())?,
                )),
                "BOOL" => Coerced::Bool(Some(parse_bool(s).ok_or_else(invalid)?)),
                "UUID" => Coerced::Uuid(Some(Uuid::parse_str(s).map_err(|_| invalid())?)),
                "DATE" => Coerced::Date(Some(NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| invalid())?)),
                "TIME" => Coerced::Time(Some(parse_time(s).ok_or_else(invalid)?)),
                "TIMESTAMP" => Coerced::Timestamp(Some(parse_timestamp(s).ok_or_else(invalid)?)),
                "TIMESTAMPTZ" => Coerced::Timestamptz(Some(parse_timestamptz(s).ok_or_else(invalid)?)),
                _ => Coerced::AsIs(value),
            }
        }
        ("TEXT[]" | "VARCHAR[]", Value::Array(items)) => Coerced::TextArray(items.iter().map(text_of).collect()),
        ("INT2[]" | "INT4[]" | "INT8[]", Value::Array(items)) => Coerced::IntArray(
            items
                .iter()
                .map(|item| match item {
                    Value::Null => Ok(None),
                    Value::Number(n) => n.as_i64().map(Some).ok_or_else(invalid),
                    Value::String(s) => s.trim().parse::<i64>().map(Some).map_err(|_| invalid()),
                    _ => Err(invalid()),
                })
                .collect::<Result<_>>()?,
        ),
        _ => Coerced::AsIs(value),
    };
    Ok(coerced)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "on" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    ["%H:%M:%S%.f", "%H:%M"]
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(s, format).ok())
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

fn parse_timestamptz(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z"))
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strings_follow_inferred_type() {
        assert_eq!(coerce(0, &json!("5"), "INT4").unwrap(), Coerced::Int(Some(5)));
        assert_eq!(
            coerce(0, &json!("2024-01-02"), "DATE").unwrap(),
            Coerced::Date(NaiveDate::from_ymd_opt(2024, 1, 2))
        );
        assert_eq!(
            coerce(0, &json!("6f1c2d3e-4b5a-4c6d-8e7f-9a0b1c2d3e4f"), "UUID").unwrap(),
            Coerced::Uuid(Uuid::parse_str("6f1c2d3e-4b5a-4c6d-8e7f-9a0b1c2d3e4f").ok())
        );
        assert_eq!(coerce(0, &json!("10.50"), "NUMERIC").unwrap(), Coerced::Numeric(Some(Decimal::new(1050, 2))));
        assert_eq!(coerce(0, &json!("off"), "BOOL").unwrap(), Coerced::Bool(Some(false)));
        assert_eq!(coerce(0, &json!("x"), "MOOD").unwrap(), Coerced::AsIs(&json!("x")));
    }

    #[test]
    fn test_timestamps() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 2).and_then(|d| d.and_hms_opt(3, 4, 5));
        assert_eq!(coerce(0, &json!("2024-01-02 03:04:05"), "TIMESTAMP").unwrap(), Coerced::Timestamp(expected));
        assert_eq!(coerce(0, &json!("2024-01-02T03:04:05"), "TIMESTAMP").unwrap(), Coerced::Timestamp(expected));
        assert_eq!(
            coerce(0, &json!("2024-01-02T05:04:05+02:00"), "TIMESTAMPTZ").unwrap(),
            Coerced::Timestamptz(expected.map(|ts| ts.and_utc()))
        );
    }

    #[test]
    fn test_nulls_carry_the_inferred_type() {
        assert_eq!(coerce(0, &Value::Null, "DATE").unwrap(), Coerced::Date(None));
        assert_eq!(coerce(0, &Value::Null, "JSONB").unwrap(), Coerced::Json(None));
        assert_eq!(coerce(0, &Value::Null, "MOOD").unwrap(), Coerced::Text(None));
    }

    #[test]
    fn test_scalars_for_text_parameters_become_text() {
        assert_eq!(coerce(0, &json!(5), "TEXT").unwrap(), Coerced::Text(Some("5".to_string())));
        assert_eq!(coerce(0, &json!(true), "VARCHAR").unwrap(), Coerced::Text(Some("true".to_string())));
        assert_eq!(coerce(0, &json!(7), "INT4").unwrap(), Coerced::AsIs(&json!(7)));
    }

    #[test]
    fn test_json_parameters() {
        assert_eq!(coerce(0, &json!("{\"k\":1}"), "JSONB").unwrap(), Coerced::Json(Some(json!({"k": 1}))));
        assert_eq!(coerce(0, &json!("plain"), "JSONB").unwrap(), Coerced::Json(Some(json!("plain"))));
        assert_eq!(coerce(0, &json!([1, 2]), "JSON").unwrap(), Coerced::Json(Some(json!([1, 2]))));
    }

    #[test]
    fn test_arrays() {
        assert_eq!(
            coerce(0, &json!(["a", 1, null]), "TEXT[]").unwrap(),
            Coerced::TextArray(vec![Some("a".to_string()), Some("1".to_string()), None])
        );
        assert_eq!(
            coerce(0, &json!([1, "2"]), "INT8[]").unwrap(),
            Coerced::IntArray(vec![Some(1), Some(2)])
        );
        assert!(coerce(0, &json!(["x"]), "INT4[]").is_err());
    }

    #[test]
    fn test_unparseable_values_name_the_parameter() {
        let err = coerce(1, &json!("tomorrow"), "DATE").unwrap_err();
        assert!(matches!(err, DataMapperError::Validation(_)));
        assert!(err.to_string().contains("$2"));
    }
}
