//! Per-call options, write payloads and results

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::decompose::DecomposeSchema;
use crate::sql::Statement;
use crate::sql::criteria::Criteria;

/// Sort direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// Placement of NULLs in an ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nulls {
    First,
    Last,
}

/// One ORDER BY entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Field reference; JSON paths are allowed
    pub field: String,
    /// Defaults to ascending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    /// Cast applied before sorting, e.g. `int` for numeric strings in a body
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub cast: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nulls: Option<Nulls>,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Some(Direction::Asc),
            cast: None,
            nulls: None,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Some(Direction::Desc),
            cast: None,
            nulls: None,
        }
    }

    pub fn cast(mut self, type_name: impl Into<String>) -> Self {
        self.cast = Some(type_name.into());
        self
    }

    pub fn nulls(mut self, nulls: Nulls) -> Self {
        self.nulls = Some(nulls);
        self
    }
}

/// Conflict handling for inserts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "action")]
pub enum OnConflict {
    /// `ON CONFLICT DO NOTHING`
    Ignore,
    /// Upsert on `target` (the primary key when empty)
    Update {
        #[serde(default)]
        target: Vec<String>,
    },
}

/// Options shared by reads and writes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    #[serde(default)]
    pub order: Vec<OrderBy>,
    /// Resolve order fields that are not columns inside the document body
    #[serde(default)]
    pub order_body: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    /// Projected fields for SELECT and RETURNING; all columns when empty
    #[serde(default)]
    pub columns: Vec<String>,
    /// Return the compiled statement instead of executing it
    #[serde(default)]
    pub build: bool,
    /// Exclude rows of descendant tables
    #[serde(default)]
    pub only: bool,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decompose: Option<DecomposeSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_conflict: Option<OnConflict>,
    /// Match plain document equalities with a single `@>` containment test
    #[serde(default)]
    pub document_containment: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    pub fn order_body(mut self, enabled: bool) -> Self {
        self.order_body = enabled;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(mut self) -> Self {
        self.build = true;
        self
    }

    pub fn only(mut self) -> Self {
        self.only = true;
        self
    }

    pub fn stream(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn decompose(mut self, schema: DecomposeSchema) -> Self {
        self.decompose = Some(schema);
        self
    }

    pub fn on_conflict(mut self, on_conflict: OnConflict) -> Self {
        self.on_conflict = Some(on_conflict);
        self
    }

    pub fn document_containment(mut self, enabled: bool) -> Self {
        self.document_containment = enabled;
        self
    }
}

/// A write payload.
///
/// Each field is either undefined (`None`, left out of the statement
/// entirely) or defined (`Some`, where `Some(Value::Null)` writes NULL).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record(IndexMap<String, Option<Value>>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field; pass `None` to mark it undefined
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Option<Value>>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Option<Value>>) {
        self.0.insert(name.into(), value.into());
    }

    /// The defined value of a field, if any
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).and_then(Option::as_ref)
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Defined fields in insertion order
    pub fn defined(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0
            .iter()
            .filter_map(|(name, value)| value.as_ref().map(|v| (name.as_str(), v)))
    }

    /// True when no field is defined
    pub fn is_empty(&self) -> bool {
        self.defined().next().is_none()
    }

    /// A copy without the named fields
    pub fn without(&self, names: &[String]) -> Record {
        Record(
            self.0
                .iter()
                .filter(|(name, _)| !names.contains(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        )
    }

    /// Defined fields as a JSON object
    pub fn to_object(&self) -> Map<String, Value> {
        self.defined()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Record(map.into_iter().map(|(k, v)| (k, Some(v))).collect())
    }
}

impl From<IndexMap<String, Option<Value>>> for Record {
    fn from(fields: IndexMap<String, Option<Value>>) -> Self {
        Record(fields)
    }
}

impl TryFrom<Value> for Record {
    type Error = crate::error::DataMapperError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Record::from(map)),
            other => Err(crate::error::DataMapperError::validation(format!(
                "Expected an object payload, got {}",
                other
            ))),
        }
    }
}

/// Full-text query parser
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TsParser {
    /// `plainto_tsquery`
    #[default]
    Plain,
    /// `to_tsquery`
    To,
    /// `phraseto_tsquery`
    Phrase,
    /// `websearch_to_tsquery`
    Websearch,
}

impl TsParser {
    pub fn function(self) -> &'static str {
        match self {
            TsParser::Plain => "plainto_tsquery",
            TsParser::To => "to_tsquery",
            TsParser::Phrase => "phraseto_tsquery",
            TsParser::Websearch => "websearch_to_tsquery",
        }
    }
}

/// A full-text search over one or more fields
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub fields: Vec<String>,
    pub term: String,
    /// Extra criteria conjoined with the text match
    pub where_: Criteria,
    /// Text search configuration, e.g. `english`
    pub language: Option<String>,
    pub parser: TsParser,
}

impl SearchRequest {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            fields: Vec::new(),
            term: term.into(),
            where_: Criteria::all(),
            language: None,
            parser: TsParser::default(),
        }
    }

    pub fn fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, criteria: impl Into<Criteria>) -> Self {
        self.where_ = criteria.into();
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn parser(mut self, parser: TsParser) -> Self {
        self.parser = parser;
        self
    }
}

/// Result of an operation
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Rows(Vec<Value>),
    /// Single-row reads; `None` when nothing matched
    Row(Option<Value>),
    Count(i64),
    /// Unwrapped single-column function result
    Scalar(Value),
    /// The compiled statement, when `build` was requested
    Statement(Statement),
}

impl Output {
    /// Rows of a multi-row result; a single row becomes a one-element list
    pub fn into_rows(self) -> Vec<Value> {
        match self {
            Output::Rows(rows) => rows,
            Output::Row(row) => row.into_iter().collect(),
            Output::Scalar(value) => vec![value],
            Output::Count(_) | Output::Statement(_) => Vec::new(),
        }
    }

    pub fn into_row(self) -> Option<Value> {
        match self {
            Output::Row(row) => row,
            Output::Rows(rows) => rows.into_iter().next(),
            Output::Scalar(value) => Some(value),
            Output::Count(_) | Output::Statement(_) => None,
        }
    }

    pub fn count(&self) -> Option<i64> {
        match self {
            Output::Count(n) => Some(*n),
            _ => None,
        }
    }

    pub fn statement(&self) -> Option<&Statement> {
        match self {
            Output::Statement(stmt) => Some(stmt),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_undefined_vs_null() {
        let record = Record::new()
            .field("name", json!("a"))
            .field("nickname", None)
            .field("deleted_at", Value::Null);

        let defined: Vec<&str> = record.defined().map(|(k, _)| k).collect();
        assert_eq!(defined, vec!["name", "deleted_at"]);
        assert!(!record.is_defined("nickname"));
        assert_eq!(record.get("deleted_at"), Some(&Value::Null));
        assert_eq!(record.to_object(), json!({"name": "a", "deleted_at": null}).as_object().cloned().unwrap());
    }

    #[test]
    fn test_record_from_json() {
        let record = Record::try_from(json!({"a": 1, "b": null})).unwrap();
        assert!(record.is_defined("a"));
        assert!(record.is_defined("b"));
        assert!(Record::try_from(json!([1])).is_err());
    }

    #[test]
    fn test_options_deserialize() {
        let options: QueryOptions = serde_json::from_value(json!({
            "order": [{"field": "name", "direction": "desc", "type": "int", "nulls": "last"}],
            "orderBody": true,
            "limit": 10,
            "onConflict": {"action": "update", "target": ["id"]}
        }))
        .unwrap();

        assert_eq!(options.order[0], OrderBy::desc("name").cast("int").nulls(Nulls::Last));
        assert!(options.order_body);
        assert_eq!(options.limit, Some(10));
        assert_eq!(
            options.on_conflict,
            Some(OnConflict::Update {
                target: vec!["id".to_string()]
            })
        );
    }

    #[test]
    fn test_output_accessors() {
        assert_eq!(Output::Row(None).into_rows(), Vec::<Value>::new());
        assert_eq!(Output::Rows(vec![json!(1), json!(2)]).into_row(), Some(json!(1)));
        assert_eq!(Output::Count(3).count(), Some(3));
    }
}
