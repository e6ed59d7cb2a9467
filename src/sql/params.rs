//! Positional parameter collection
//!
//! The driver binds parameters with concrete types, so each placeholder is
//! rendered for the column it targets: strings and NULLs bound to non-text
//! columns get an explicit cast to the catalog type, scalars bound to text
//! columns are sent as text, and JSON values travel as one compact JSON text.

use serde_json::Value;

use crate::entity::Column;
use crate::sql::sanitize::array_literal;

/// Collects parameters and hands out `$n` placeholders
#[derive(Debug)]
pub struct Binder<'o> {
    params: Vec<Value>,
    next: &'o mut usize,
}

impl<'o> Binder<'o> {
    /// `next` is the number of the next placeholder and is advanced as
    /// parameters are pushed
    pub fn new(next: &'o mut usize) -> Self {
        Self {
            params: Vec::new(),
            next,
        }
    }

    /// Push a value as-is and return its placeholder
    pub fn push(&mut self, value: Value) -> String {
        self.params.push(value);
        let placeholder = format!("${}", *self.next);
        *self.next += 1;
        placeholder
    }

    /// Push a value as compact JSON text with a cast, e.g. `$1::jsonb`
    pub fn push_json(&mut self, value: &Value, cast: &str) -> String {
        let placeholder = self.push(Value::String(value.to_string()));
        format!("{}::{}", placeholder, cast)
    }

    /// Push a value as text
    pub fn push_text(&mut self, value: Value) -> String {
        self.push(to_text(value))
    }

    /// Push a value targeting `column` (unknown when `None`)
    pub fn bind(&mut self, column: Option<&Column>, value: Value) -> String {
        let Some(col) = column else {
            return match value {
                Value::Object(_) | Value::Array(_) => self.push_json(&value, "jsonb"),
                other => self.push(other),
            };
        };

        if col.is_json() {
            return match value {
                Value::Null => format!("{}::{}", self.push(Value::Null), col.data_type),
                other => self.push_json(&other, &col.data_type),
            };
        }

        if col.is_array() {
            let placeholder = match value {
                Value::Array(items) => self.push(Value::String(array_literal(&items))),
                other => self.push(to_text(other)),
            };
            return format!("{}::{}", placeholder, col.data_type);
        }

        if col.is_textual() {
            return self.push_text(value);
        }

        match value {
            Value::Number(_) | Value::Bool(_) => self.push(value),
            Value::String(_) | Value::Null => {
                format!("{}::{}", self.push(value), col.data_type)
            }
            other => format!("{}::{}", self.push(Value::String(other.to_string())), col.data_type),
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn finish(self) -> Vec<Value> {
        self.params
    }
}

/// Text form of a value; objects and arrays become compact JSON
pub fn to_text(value: Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(s) => Value::String(s),
        Value::Number(n) => Value::String(n.to_string()),
        Value::Bool(b) => Value::String(b.to_string()),
        other => Value::String(other.to_string()),
    }
}
