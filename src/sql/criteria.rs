//! Criteria compilation for SQL WHERE clauses
//!
//! Converts loosely-typed criteria into a WHERE fragment plus an ordered list of
//! positional parameters.
//!
//! Mapping criteria are a flat conjunction: each `"<field>[ <operator>]"` key
//! produces one predicate and the predicates are joined with `AND`. Grouping
//! with `OR` is only available through raw string criteria.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::entity::{Column, Relation};
use crate::error::{DataMapperError, Result};
use crate::sql::field::FieldRef;
use crate::sql::params::{Binder, to_text};
use crate::sql::sanitize::array_literal;

static NUMERIC_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+$").expect("numeric key pattern is valid"));

// Version nibble restricted to 1 (time-based) or 4 (random).
static UUID_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[14][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("uuid key pattern is valid")
});

/// Criteria accepted by read, update and delete operations
#[derive(Debug, Clone, PartialEq)]
pub enum Criteria {
    /// Raw SQL predicate with positional (`$1`) or named (`${name}`) parameters
    Raw { sql: String, params: RawParams },
    /// `{"field op": value, ...}`, compiled as a conjunction
    Map(Map<String, Value>),
    /// Reserved: arrays of mappings are rejected
    List(Vec<Value>),
    /// A primary key value
    Key(Value),
}

/// Parameters accompanying raw criteria
#[derive(Debug, Clone, PartialEq)]
pub enum RawParams {
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Criteria {
    /// Match every row
    pub fn all() -> Self {
        Criteria::Map(Map::new())
    }

    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Criteria::Raw {
            sql: sql.into(),
            params: RawParams::Positional(params),
        }
    }

    pub fn raw_named(sql: impl Into<String>, params: Map<String, Value>) -> Self {
        Criteria::Raw {
            sql: sql.into(),
            params: RawParams::Named(params),
        }
    }

    pub fn key(value: impl Into<Value>) -> Self {
        Criteria::Key(value.into())
    }

    /// True for criteria that match every row
    pub fn is_empty(&self) -> bool {
        matches!(self, Criteria::Map(map) if map.is_empty())
    }

    /// Raw SQL, whose placeholders carry no type information
    pub fn is_raw(&self) -> bool {
        matches!(self, Criteria::Raw { .. })
    }
}

impl Default for Criteria {
    fn default() -> Self {
        Criteria::all()
    }
}

impl From<Value> for Criteria {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Criteria::Map(map),
            Value::Array(items) => Criteria::List(items),
            Value::Null => Criteria::all(),
            other => Criteria::Key(other),
        }
    }
}

impl From<Map<String, Value>> for Criteria {
    fn from(map: Map<String, Value>) -> Self {
        Criteria::Map(map)
    }
}

/// Predicate operators recognised at the end of a criteria key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    NotLike,
    ILike,
    NotILike,
    In,
    NotIn,
    Is,
    IsNot,
    Contains,
    ContainedBy,
    HasKey,
    HasAnyKey,
    HasAllKeys,
    Overlaps,
    Match,
    IMatch,
    NotMatch,
    NotIMatch,
    SimilarTo,
    NotSimilarTo,
}

// Longest tokens first so `not like` wins over `like`.
const OPERATOR_TOKENS: &[(&str, Operator)] = &[
    ("not similar to", Operator::NotSimilarTo),
    ("similar to", Operator::SimilarTo),
    ("not ilike", Operator::NotILike),
    ("not like", Operator::NotLike),
    ("is not", Operator::IsNot),
    ("not in", Operator::NotIn),
    ("ilike", Operator::ILike),
    ("like", Operator::Like),
    ("!~*", Operator::NotIMatch),
    ("in", Operator::In),
    ("is", Operator::Is),
    ("!=", Operator::NotEq),
    ("<>", Operator::NotEq),
    (">=", Operator::Gte),
    ("<=", Operator::Lte),
    ("@>", Operator::Contains),
    ("<@", Operator::ContainedBy),
    ("?|", Operator::HasAnyKey),
    ("?&", Operator::HasAllKeys),
    ("&&", Operator::Overlaps),
    ("~*", Operator::IMatch),
    ("!~", Operator::NotMatch),
    ("=", Operator::Eq),
    (">", Operator::Gt),
    ("<", Operator::Lt),
    ("?", Operator::HasKey),
    ("~", Operator::Match),
];

impl Operator {
    pub fn sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "<>",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::ILike => "ILIKE",
            Operator::NotILike => "NOT ILIKE",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Is => "IS",
            Operator::IsNot => "IS NOT",
            Operator::Contains => "@>",
            Operator::ContainedBy => "<@",
            Operator::HasKey => "?",
            Operator::HasAnyKey => "?|",
            Operator::HasAllKeys => "?&",
            Operator::Overlaps => "&&",
            Operator::Match => "~",
            Operator::IMatch => "~*",
            Operator::NotMatch => "!~",
            Operator::NotIMatch => "!~*",
            Operator::SimilarTo => "SIMILAR TO",
            Operator::NotSimilarTo => "NOT SIMILAR TO",
        }
    }

    fn is_comparison(self) -> bool {
        matches!(
            self,
            Operator::Eq | Operator::NotEq | Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte
        )
    }
}

/// Split a criteria key into its field and optional trailing operator.
///
/// The operator must be separated from the field by whitespace; matching is
/// case-insensitive.
pub fn split_key(key: &str) -> (&str, Option<Operator>) {
    let trimmed = key.trim();
    let lower = trimmed.to_ascii_lowercase();
    for (token, op) in OPERATOR_TOKENS {
        if lower.len() <= token.len() || !lower.ends_with(token) {
            continue;
        }
        let field = &trimmed[..trimmed.len() - token.len()];
        if field.ends_with(char::is_whitespace) {
            let field = field.trim_end();
            if !field.is_empty() {
                return (field, Some(*op));
            }
        }
    }
    (trimmed, None)
}

/// Whether `criteria` addresses a single row of `relation` by primary key.
///
/// Integers, numeric strings and canonical v1/v4 UUID strings are key values; a
/// mapping whose keys are exactly the primary key columns, each bound to a
/// scalar, is a (possibly compound) key lookup. Always false for keyless
/// relations.
pub fn is_pk_search(relation: &Relation, criteria: &Value) -> bool {
    if !relation.has_primary_key() {
        return false;
    }
    match criteria {
        Value::Object(map) => {
            map.len() == relation.primary_key.len()
                && relation.primary_key.iter().all(|pk| {
                    map.get(pk).is_some_and(|v| {
                        !matches!(v, Value::Null | Value::Object(_) | Value::Array(_))
                    })
                })
        }
        other => relation.primary_key.len() == 1 && is_key_value(other),
    }
}

/// Whether a scalar looks like a primary key value
pub fn is_key_value(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.is_i64() || n.is_u64(),
        Value::String(s) => NUMERIC_KEY.is_match(s) || UUID_KEY.is_match(s),
        _ => false,
    }
}

/// How field names are interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileMode {
    /// Fields that are not physical columns address keys of the document body
    pub document: bool,
    /// Fold plain equality predicates on body keys into one `@>` containment test
    pub containment: bool,
}

impl CompileMode {
    pub fn relational() -> Self {
        Self::default()
    }

    pub fn document() -> Self {
        Self {
            document: true,
            containment: false,
        }
    }

    pub fn containment() -> Self {
        Self {
            document: true,
            containment: true,
        }
    }
}

/// Compiles criteria against one relation
#[derive(Debug, Clone)]
pub struct CriteriaCompiler<'a> {
    relation: &'a Relation,
    body_column: &'a str,
    mode: CompileMode,
}

/// Build a WHERE clause for `criteria` against a relation's physical columns
///
/// Returns (clause, params) where `clause` uses placeholders starting at
/// `param_offset`; `param_offset` is advanced past the last one used.
pub fn build_criteria_clause(
    relation: &Relation,
    criteria: &Criteria,
    param_offset: &mut usize,
) -> Result<(String, Vec<Value>)> {
    CriteriaCompiler::new(relation).compile(criteria, param_offset)
}

impl<'a> CriteriaCompiler<'a> {
    pub fn new(relation: &'a Relation) -> Self {
        Self {
            relation,
            body_column: "body",
            mode: CompileMode::relational(),
        }
    }

    pub fn mode(mut self, mode: CompileMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn body_column(mut self, column: &'a str) -> Self {
        self.body_column = column;
        self
    }

    pub fn compile(
        &self,
        criteria: &Criteria,
        param_offset: &mut usize,
    ) -> Result<(String, Vec<Value>)> {
        if self.mode.document && !self.relation.is_document {
            return Err(DataMapperError::unsupported(
                self.relation.qualified_name(),
                "document criteria require an id-keyed table with a JSON body column",
            ));
        }

        match criteria {
            Criteria::Raw { sql, params } => compile_raw(sql, params, param_offset),
            Criteria::Key(value) => self.compile_key(value, param_offset),
            Criteria::List(_) => Err(DataMapperError::invalid_criteria(format!(
                "Arrays of criteria are not supported (querying {})",
                self.relation.qualified_name()
            ))),
            Criteria::Map(map) => self.compile_map(map, param_offset),
        }
    }

    fn compile_key(&self, value: &Value, param_offset: &mut usize) -> Result<(String, Vec<Value>)> {
        if !self.relation.has_primary_key() {
            return Err(DataMapperError::unsupported(
                self.relation.qualified_name(),
                "primary key criteria used against a relation without a primary key",
            ));
        }
        if self.relation.primary_key.len() > 1 {
            return Err(DataMapperError::invalid_criteria(format!(
                "{} has a compound primary key; pass a mapping of key columns",
                self.relation.qualified_name()
            )));
        }
        if !is_pk_search(self.relation, value) {
            return Err(DataMapperError::invalid_criteria(format!(
                "Unsupported criteria for {}: {} is neither a mapping nor a primary key value",
                self.relation.qualified_name(),
                value
            )));
        }

        let pk = &self.relation.primary_key[0];
        let mut binder = Binder::new(param_offset);
        let placeholder = binder.bind(self.relation.column(pk), value.clone());
        let clause = format!("{} = {}", FieldRef::column(pk.clone()).to_sql(), placeholder);
        Ok((clause, binder.finish()))
    }

    fn compile_map(
        &self,
        map: &Map<String, Value>,
        param_offset: &mut usize,
    ) -> Result<(String, Vec<Value>)> {
        let mut binder = Binder::new(param_offset);
        let mut predicates = Vec::new();

        let mut entries: Vec<(FieldRef, Option<Operator>, &Value)> = Vec::with_capacity(map.len());
        for (key, value) in map {
            let (field, op) = split_key(key);
            entries.push((FieldRef::parse(field)?, op, value));
        }

        if self.mode.containment {
            let mut contained = Map::new();
            entries.retain(|(field, op, value)| {
                let foldable = matches!(op, None | Some(Operator::Eq))
                    && !field.has_path()
                    && self.relation.column(&field.column).is_none()
                    && !matches!(value, Value::Null | Value::Array(_));
                if foldable {
                    contained.insert(field.column.clone(), (*value).clone());
                }
                !foldable
            });
            if !contained.is_empty() {
                let placeholder = binder.push_json(&Value::Object(contained), "jsonb");
                predicates.push(format!(
                    "{} @> {}",
                    FieldRef::column(self.body_column).to_sql(),
                    placeholder
                ));
            }
        }

        for (field, op, value) in entries {
            predicates.push(self.compile_predicate(field, op, value, &mut binder)?);
        }

        let params = binder.finish();
        if predicates.is_empty() {
            return Ok(("TRUE".to_string(), params));
        }
        Ok((predicates.join(" AND "), params))
    }

    fn resolve(&self, field: FieldRef) -> FieldRef {
        if self.mode.document && self.relation.column(&field.column).is_none() {
            field.into_document(self.body_column)
        } else {
            field
        }
    }

    fn compile_predicate(
        &self,
        field: FieldRef,
        op: Option<Operator>,
        value: &Value,
        binder: &mut Binder<'_>,
    ) -> Result<String> {
        // Arrays and objects stored under a body key match by containment
        if self.mode.document
            && !field.has_path()
            && self.relation.column(&field.column).is_none()
            && matches!(value, Value::Array(_) | Value::Object(_))
            && matches!(op, None | Some(Operator::Eq) | Some(Operator::NotEq))
        {
            let mut contained = Map::new();
            contained.insert(field.column.clone(), value.clone());
            let placeholder = binder.push_json(&Value::Object(contained), "jsonb");
            let test = format!("{} @> {}", FieldRef::column(self.body_column).to_sql(), placeholder);
            return Ok(match op {
                Some(Operator::NotEq) => format!("NOT ({})", test),
                _ => test,
            });
        }

        let field = self.resolve(field);
        let column = if field.has_path() {
            None
        } else {
            self.relation.column(&field.column)
        };
        let expr = field.to_sql();

        let op = match (op, value) {
            (None | Some(Operator::Eq), Value::Null) => return Ok(format!("{} IS NULL", expr)),
            (Some(Operator::NotEq), Value::Null) => return Ok(format!("{} IS NOT NULL", expr)),
            (None | Some(Operator::Eq), Value::Array(_)) if !targets_json(&field, column) => {
                Operator::In
            }
            (Some(Operator::NotEq), Value::Array(_)) if !targets_json(&field, column) => {
                Operator::NotIn
            }
            (None, _) => Operator::Eq,
            (Some(op), _) => op,
        };

        match op {
            Operator::Is | Operator::IsNot => {
                let literal = match value {
                    Value::Null => "NULL",
                    Value::Bool(true) => "TRUE",
                    Value::Bool(false) => "FALSE",
                    other => {
                        return Err(DataMapperError::invalid_criteria(format!(
                            "'{}' expects null, true or false, got {}",
                            op.sql(),
                            other
                        )));
                    }
                };
                Ok(format!("{} {} {}", expr, op.sql(), literal))
            }
            Operator::In | Operator::NotIn => {
                let items = match value {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                if items.is_empty() {
                    // IN () is invalid SQL; an empty list matches nothing
                    return Ok(if op == Operator::In { "FALSE" } else { "TRUE" }.to_string());
                }
                let placeholders: Vec<String> = items
                    .into_iter()
                    .map(|item| bind_operand(binder, &field, column, item))
                    .collect();
                Ok(format!("{} {} ({})", expr, op.sql(), placeholders.join(", ")))
            }
            Operator::Contains | Operator::ContainedBy | Operator::Overlaps => {
                let placeholder = match column {
                    Some(col) if col.is_array() => binder.bind(Some(col), value.clone()),
                    Some(col) if !col.is_json() => {
                        return Err(DataMapperError::invalid_criteria(format!(
                            "'{}' requires a JSON or array column, '{}' is {}",
                            op.sql(),
                            col.name,
                            col.data_type
                        )));
                    }
                    _ if field.yields_text() => {
                        return Err(DataMapperError::invalid_criteria(format!(
                            "'{}' cannot be applied to the text extraction {}",
                            op.sql(),
                            expr
                        )));
                    }
                    _ => binder.push_json(value, "jsonb"),
                };
                Ok(format!("{} {} {}", expr, op.sql(), placeholder))
            }
            Operator::HasKey => {
                let key = value.as_str().ok_or_else(|| {
                    DataMapperError::invalid_criteria(format!("'?' expects a string key, got {}", value))
                })?;
                let placeholder = binder.push(Value::String(key.to_string()));
                Ok(format!("{} ? {}", expr, placeholder))
            }
            Operator::HasAnyKey | Operator::HasAllKeys => {
                let keys = value.as_array().ok_or_else(|| {
                    DataMapperError::invalid_criteria(format!(
                        "'{}' expects an array of keys, got {}",
                        op.sql(),
                        value
                    ))
                })?;
                let placeholder = binder.push(Value::String(array_literal(keys)));
                Ok(format!("{} {} {}::text[]", expr, op.sql(), placeholder))
            }
            _ => {
                if matches!(value, Value::Null) {
                    return Err(DataMapperError::invalid_criteria(format!(
                        "'{}' cannot compare against null; use 'is' or 'is not'",
                        op.sql()
                    )));
                }
                if matches!(value, Value::Array(_) | Value::Object(_)) && !targets_json(&field, column) {
                    return Err(DataMapperError::invalid_criteria(format!(
                        "'{}' expects a scalar value for {}",
                        op.sql(),
                        expr
                    )));
                }

                // Text extractions compare as text unless the value says otherwise
                let cast = match value {
                    Value::Number(_) if field.yields_text() && op.is_comparison() => Some("numeric"),
                    Value::Bool(_) if field.yields_text() && op.is_comparison() => Some("boolean"),
                    _ => None,
                };
                match cast {
                    Some(cast) => {
                        let placeholder = binder.push(value.clone());
                        Ok(format!("({})::{} {} {}", expr, cast, op.sql(), placeholder))
                    }
                    None => {
                        let placeholder = bind_operand(binder, &field, column, value.clone());
                        Ok(format!("{} {} {}", expr, op.sql(), placeholder))
                    }
                }
            }
        }
    }
}

fn targets_json(field: &FieldRef, column: Option<&Column>) -> bool {
    field.yields_json() || column.is_some_and(|c| c.is_json())
}

fn bind_operand(binder: &mut Binder<'_>, field: &FieldRef, column: Option<&Column>, value: Value) -> String {
    if field.yields_text() {
        binder.push(to_text(value))
    } else if field.yields_json() {
        binder.push_json(&value, "jsonb")
    } else {
        binder.bind(column, value)
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// End of the string literal, quoted identifier, comment or dollar-quoted body
/// starting at `chars[i]`; `None` when ordinary SQL starts there.
///
/// Unterminated regions run to the end of the input.
pub(crate) fn skip_non_code(chars: &[char], i: usize) -> Option<usize> {
    let at = |k: usize| chars.get(k).copied();
    match chars[i] {
        '\'' => {
            // E'...' strings take backslash escapes
            let escapes = i > 0
                && matches!(chars[i - 1], 'E' | 'e')
                && (i < 2 || !is_identifier_char(chars[i - 2]));
            let mut k = i + 1;
            while k < chars.len() {
                match chars[k] {
                    '\\' if escapes => k += 2,
                    '\'' if at(k + 1) == Some('\'') => k += 2,
                    '\'' => return Some(k + 1),
                    _ => k += 1,
                }
            }
            Some(chars.len())
        }
        '"' => {
            let mut k = i + 1;
            while k < chars.len() {
                match chars[k] {
                    '"' if at(k + 1) == Some('"') => k += 2,
                    '"' => return Some(k + 1),
                    _ => k += 1,
                }
            }
            Some(chars.len())
        }
        '-' if at(i + 1) == Some('-') => Some(
            chars[i..]
                .iter()
                .position(|&c| c == '\n')
                .map_or(chars.len(), |p| i + p),
        ),
        '/' if at(i + 1) == Some('*') => {
            // Block comments nest
            let mut depth = 0usize;
            let mut k = i;
            while k < chars.len() {
                if chars[k] == '/' && at(k + 1) == Some('*') {
                    depth += 1;
                    k += 2;
                } else if chars[k] == '*' && at(k + 1) == Some('/') {
                    depth -= 1;
                    k += 2;
                    if depth == 0 {
                        return Some(k);
                    }
                } else {
                    k += 1;
                }
            }
            Some(chars.len())
        }
        '$' if i == 0 || !is_identifier_char(chars[i - 1]) => {
            let tag_len = chars[i + 1..].iter().position(|&c| c == '$')?;
            let tag = &chars[i + 1..i + 1 + tag_len];
            let valid = tag.first().is_none_or(|c| c.is_alphabetic() || *c == '_')
                && tag.iter().all(|&c| c.is_alphanumeric() || c == '_');
            if !valid {
                return None;
            }
            let delimiter = &chars[i..i + tag_len + 2];
            let body = i + tag_len + 2;
            Some(
                chars[body..]
                    .windows(delimiter.len())
                    .position(|window| window == delimiter)
                    .map_or(chars.len(), |p| body + p + delimiter.len()),
            )
        }
        _ => None,
    }
}

/// `sql` with every literal, quoted identifier, comment and dollar-quoted body
/// replaced by a single space
pub(crate) fn code_only(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < chars.len() {
        match skip_non_code(&chars, i) {
            Some(end) => {
                out.push(' ');
                i = end;
            }
            None => {
                out.push(chars[i]);
                i += 1;
            }
        }
    }
    out
}

/// Compile raw SQL criteria.
///
/// Named `${name}` parameters become positional placeholders (one per distinct
/// name); bare `$n` placeholders are renumbered by `param_offset`. Literals,
/// quoted identifiers, comments and dollar-quoted bodies are left alone.
pub fn compile_raw(
    sql: &str,
    params: &RawParams,
    param_offset: &mut usize,
) -> Result<(String, Vec<Value>)> {
    let base = *param_offset;
    let mut out = String::with_capacity(sql.len());
    let mut named: Vec<String> = Vec::new();
    let mut highest_positional = 0usize;
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if let Some(end) = skip_non_code(&chars, i) {
            out.extend(&chars[i..end]);
            i = end;
            continue;
        }
        let c = chars[i];
        if c != '$' {
            out.push(c);
            i += 1;
            continue;
        }

        if chars.get(i + 1) == Some(&'{') {
            let close = chars[i + 2..]
                .iter()
                .position(|&ch| ch == '}')
                .ok_or_else(|| {
                    DataMapperError::invalid_criteria(format!("Unterminated named parameter in '{}'", sql))
                })?;
            let name: String = chars[i + 2..i + 2 + close].iter().collect::<String>().trim().to_string();
            let RawParams::Named(values) = params else {
                return Err(DataMapperError::invalid_criteria(format!(
                    "Named parameter '{}' used without named parameter values",
                    name
                )));
            };
            if !values.contains_key(&name) {
                return Err(DataMapperError::invalid_criteria(format!(
                    "Missing value for named parameter '{}'",
                    name
                )));
            }
            let index = match named.iter().position(|n| *n == name) {
                Some(index) => index,
                None => {
                    named.push(name);
                    named.len() - 1
                }
            };
            out.push_str(&format!("${}", base + index));
            i += close + 3;
            continue;
        }

        let digits: String = chars[i + 1..]
            .iter()
            .take_while(|ch| ch.is_ascii_digit())
            .collect();
        if digits.is_empty() {
            out.push(c);
            i += 1;
            continue;
        }
        let n: usize = digits
            .parse()
            .map_err(|_| DataMapperError::invalid_criteria(format!("Invalid placeholder ${}", digits)))?;
        if n == 0 {
            return Err(DataMapperError::invalid_criteria("Placeholder $0 is not valid"));
        }
        highest_positional = highest_positional.max(n);
        out.push_str(&format!("${}", base + n - 1));
        i += 1 + digits.len();
    }

    let values = match params {
        RawParams::Positional(values) => {
            if highest_positional > values.len() {
                return Err(DataMapperError::invalid_criteria(format!(
                    "Raw criteria references ${} but only {} parameter(s) were supplied",
                    highest_positional,
                    values.len()
                )));
            }
            values.clone()
        }
        RawParams::Named(values) => {
            if highest_positional > 0 {
                return Err(DataMapperError::invalid_criteria(
                    "Raw criteria cannot mix positional placeholders with named parameters",
                ));
            }
            named
                .iter()
                .map(|name| values.get(name).cloned().unwrap_or(Value::Null))
                .collect()
        }
    };

    *param_offset = base + values.len();
    Ok((out, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Column, EntityKind};
    use serde_json::json;

    fn users() -> Relation {
        Relation::new(
            "public",
            "users",
            EntityKind::Table,
            vec![
                Column::new("id", "integer").not_null(),
                Column::new("name", "text"),
                Column::new("age", "integer"),
                Column::new("external_id", "uuid"),
                Column::new("tags", "text[]"),
                Column::new("meta", "jsonb"),
            ],
        )
        .with_primary_key(["id"])
    }

    fn docs() -> Relation {
        Relation::new(
            "public",
            "docs",
            EntityKind::Table,
            vec![Column::new("id", "integer").not_null(), Column::new("body", "jsonb")],
        )
        .with_primary_key(["id"])
        .detect_document("body")
    }

    fn compile(relation: &Relation, criteria: Value) -> (String, Vec<Value>) {
        let mut offset = 1;
        build_criteria_clause(relation, &Criteria::from(criteria), &mut offset).unwrap()
    }

    // ==================== Key Splitting ====================

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("name"), ("name", None));
        assert_eq!(split_key("age >="), ("age", Some(Operator::Gte)));
        assert_eq!(split_key("name not like"), ("name", Some(Operator::NotLike)));
        assert_eq!(split_key("name NOT ILIKE"), ("name", Some(Operator::NotILike)));
        assert_eq!(split_key("deleted is not"), ("deleted", Some(Operator::IsNot)));
        assert_eq!(split_key("id   not in"), ("id", Some(Operator::NotIn)));
        assert_eq!(split_key("\"body\" ->> 'title'"), ("\"body\" ->> 'title'", None));
        assert_eq!(split_key("is"), ("is", None));
        assert_eq!(split_key("this"), ("this", None));
        assert_eq!(split_key("meta ?|"), ("meta", Some(Operator::HasAnyKey)));
    }

    // ==================== Operators ====================

    #[test]
    fn test_every_operator_emits_expected_sql() {
        let rel = users();
        let cases: Vec<(&str, Value, &str, usize)> = vec![
            ("name =", json!("a"), "\"name\" = $1", 1),
            ("name !=", json!("a"), "\"name\" <> $1", 1),
            ("name <>", json!("a"), "\"name\" <> $1", 1),
            ("age >", json!(1), "\"age\" > $1", 1),
            ("age >=", json!(1), "\"age\" >= $1", 1),
            ("age <", json!(1), "\"age\" < $1", 1),
            ("age <=", json!(1), "\"age\" <= $1", 1),
            ("name like", json!("a%"), "\"name\" LIKE $1", 1),
            ("name not like", json!("a%"), "\"name\" NOT LIKE $1", 1),
            ("name ilike", json!("a%"), "\"name\" ILIKE $1", 1),
            ("name not ilike", json!("a%"), "\"name\" NOT ILIKE $1", 1),
            ("age in", json!([1, 2, 3]), "\"age\" IN ($1, $2, $3)", 3),
            ("age not in", json!([1, 2]), "\"age\" NOT IN ($1, $2)", 2),
            ("name is", json!(null), "\"name\" IS NULL", 0),
            ("name is not", json!(null), "\"name\" IS NOT NULL", 0),
            ("meta @>", json!({"a": 1}), "\"meta\" @> $1::jsonb", 1),
            ("meta <@", json!({"a": 1}), "\"meta\" <@ $1::jsonb", 1),
            ("meta ?", json!("a"), "\"meta\" ? $1", 1),
            ("meta ?|", json!(["a", "b"]), "\"meta\" ?| $1::text[]", 1),
            ("meta ?&", json!(["a", "b"]), "\"meta\" ?& $1::text[]", 1),
            ("tags &&", json!(["x"]), "\"tags\" && $1::text[]", 1),
            ("name ~", json!("^a"), "\"name\" ~ $1", 1),
            ("name ~*", json!("^a"), "\"name\" ~* $1", 1),
            ("name !~", json!("^a"), "\"name\" !~ $1", 1),
            ("name !~*", json!("^a"), "\"name\" !~* $1", 1),
            ("name similar to", json!("%a%"), "\"name\" SIMILAR TO $1", 1),
        ];

        for (key, value, expected, count) in cases {
            let (clause, params) = compile(&rel, json!({ key: value }));
            assert_eq!(clause, expected, "key {key}");
            assert_eq!(params.len(), count, "key {key}");
        }
    }

    #[test]
    fn test_default_operator_depends_on_value() {
        let rel = users();
        assert_eq!(compile(&rel, json!({"name": "a"})).0, "\"name\" = $1");
        assert_eq!(compile(&rel, json!({"name": null})).0, "\"name\" IS NULL");
        assert_eq!(compile(&rel, json!({"name !=": null})).0, "\"name\" IS NOT NULL");
        assert_eq!(compile(&rel, json!({"age": [1, 2]})).0, "\"age\" IN ($1, $2)");
        assert_eq!(compile(&rel, json!({"age !=": [1]})).0, "\"age\" NOT IN ($1)");
    }

    #[test]
    fn test_null_never_compiles_to_equals_null() {
        let rel = users();
        let (clause, params) = compile(&rel, json!({"name": null, "age =": null}));
        assert_eq!(clause, "\"name\" IS NULL AND \"age\" IS NULL");
        assert!(params.is_empty());
        assert!(!clause.contains("= NULL"));
    }

    #[test]
    fn test_is_with_booleans() {
        let rel = users();
        assert_eq!(compile(&rel, json!({"name is": true})).0, "\"name\" IS TRUE");
        assert_eq!(compile(&rel, json!({"name is not": false})).0, "\"name\" IS NOT FALSE");

        let mut offset = 1;
        let result = build_criteria_clause(&rel, &Criteria::from(json!({"name is": 3})), &mut offset);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_in_short_circuits() {
        let rel = users();
        assert_eq!(compile(&rel, json!({"age": []})), ("FALSE".to_string(), vec![]));
        assert_eq!(compile(&rel, json!({"age not in": []})), ("TRUE".to_string(), vec![]));
    }

    #[test]
    fn test_comparison_against_null_is_rejected() {
        let rel = users();
        let mut offset = 1;
        assert!(build_criteria_clause(&rel, &Criteria::from(json!({"age >": null})), &mut offset).is_err());
    }

    #[test]
    fn test_string_bound_to_typed_column_is_cast() {
        let rel = users();
        let (clause, params) = compile(&rel, json!({"external_id": "0d5b9c6e-6d1a-4f0e-8a3e-3f2b1c0d9e8f"}));
        assert_eq!(clause, "\"external_id\" = $1::uuid");
        assert_eq!(params, vec![json!("0d5b9c6e-6d1a-4f0e-8a3e-3f2b1c0d9e8f")]);
    }

    // ==================== Conjunction and Parameter Order ====================

    #[test]
    fn test_predicates_follow_insertion_order() {
        let rel = users();
        let (clause, params) = compile(&rel, json!({"name": "a", "age >": 3, "id": [7, 8]}));
        assert_eq!(clause, "\"name\" = $1 AND \"age\" > $2 AND \"id\" IN ($3, $4)");
        assert_eq!(params, vec![json!("a"), json!(3), json!(7), json!(8)]);
    }

    #[test]
    fn test_param_offset_tracking() {
        let rel = users();
        let mut offset = 5;
        let (clause, params) =
            build_criteria_clause(&rel, &Criteria::from(json!({"name": "a", "age": 2})), &mut offset).unwrap();
        assert_eq!(clause, "\"name\" = $5 AND \"age\" = $6");
        assert_eq!(params.len(), 2);
        assert_eq!(offset, 7);
    }

    #[test]
    fn test_empty_mapping_matches_everything() {
        assert_eq!(compile(&users(), json!({})), ("TRUE".to_string(), vec![]));
    }

    #[test]
    fn test_arrays_of_criteria_are_rejected() {
        let mut offset = 1;
        let result = build_criteria_clause(&users(), &Criteria::from(json!([{"a": 1}])), &mut offset);
        assert!(matches!(result, Err(DataMapperError::InvalidCriteria(_))));
    }

    // ==================== Primary Keys ====================

    #[test]
    fn test_is_pk_search() {
        let rel = users();
        assert!(is_pk_search(&rel, &json!(42)));
        assert!(is_pk_search(&rel, &json!("42")));
        assert!(is_pk_search(&rel, &json!("6ba7b810-9dad-11d1-80b4-00c04fd430c8")));
        assert!(is_pk_search(&rel, &json!("0D5B9C6E-6D1A-4F0E-8A3E-3F2B1C0D9E8F")));
        assert!(is_pk_search(&rel, &json!({"id": 3})));

        assert!(!is_pk_search(&rel, &json!("6ba7b810-9dad-31d1-80b4-00c04fd430c8")));
        assert!(!is_pk_search(&rel, &json!("6ba7b810-9dad-51d1-80b4-00c04fd430c8")));
        assert!(!is_pk_search(&rel, &json!("6ba7b8109dad11d180b400c04fd430c8")));
        assert!(!is_pk_search(&rel, &json!("abc")));
        assert!(!is_pk_search(&rel, &json!("\u{0661}\u{0662}")));
        assert!(!is_pk_search(&rel, &json!("１２")));
        assert!(!is_pk_search(&rel, &json!(1.5)));
        assert!(!is_pk_search(&rel, &json!({"name": "a"})));
        assert!(!is_pk_search(&rel, &json!({"id": [1]})));
    }

    #[test]
    fn test_is_pk_search_false_without_key() {
        let keyless = Relation::new("public", "logs", EntityKind::Table, vec![Column::new("msg", "text")]);
        assert!(!is_pk_search(&keyless, &json!(1)));
        assert!(!is_pk_search(&keyless, &json!({"msg": "a"})));
    }

    #[test]
    fn test_compound_key_mapping() {
        let rel = Relation::new(
            "public",
            "memberships",
            EntityKind::Table,
            vec![Column::new("user_id", "integer"), Column::new("group_id", "integer")],
        )
        .with_primary_key(["user_id", "group_id"]);

        assert!(is_pk_search(&rel, &json!({"user_id": 1, "group_id": 2})));
        assert!(!is_pk_search(&rel, &json!({"user_id": 1})));
        assert!(!is_pk_search(&rel, &json!(1)));

        let (clause, _) = compile(&rel, json!({"user_id": 1, "group_id": 2}));
        assert_eq!(clause, "\"user_id\" = $1 AND \"group_id\" = $2");
    }

    #[test]
    fn test_primitive_criteria_is_key_lookup() {
        let rel = users();
        let mut offset = 1;
        let (clause, params) = build_criteria_clause(&rel, &Criteria::key(7), &mut offset).unwrap();
        assert_eq!(clause, "\"id\" = $1");
        assert_eq!(params, vec![json!(7)]);

        let mut offset = 1;
        assert!(build_criteria_clause(&rel, &Criteria::key("nope"), &mut offset).is_err());
    }

    // ==================== Document Mode ====================

    #[test]
    fn test_document_fields_become_text_paths() {
        let rel = docs();
        let mut offset = 1;
        let (clause, params) = CriteriaCompiler::new(&rel)
            .mode(CompileMode::document())
            .compile(&Criteria::from(json!({"title": "X", "id >": 3})), &mut offset)
            .unwrap();

        assert_eq!(clause, "\"body\"->>'title' = $1 AND \"id\" > $2");
        assert_eq!(params, vec![json!("X"), json!(3)]);
    }

    #[test]
    fn test_document_numeric_comparison_casts_extraction() {
        let rel = docs();
        let mut offset = 1;
        let (clause, params) = CriteriaCompiler::new(&rel)
            .mode(CompileMode::document())
            .compile(&Criteria::from(json!({"price >": 10, "published": true})), &mut offset)
            .unwrap();

        assert_eq!(
            clause,
            "(\"body\"->>'price')::numeric > $1 AND (\"body\"->>'published')::boolean = $2"
        );
        assert_eq!(params, vec![json!(10), json!(true)]);
    }

    #[test]
    fn test_document_explicit_paths_are_honoured() {
        let rel = docs();
        let mut offset = 1;
        let (clause, params) = CriteriaCompiler::new(&rel)
            .mode(CompileMode::document())
            .compile(
                &Criteria::from(json!({"\"body\" ->> 'title' like": "A%", "author.name": "Kim", "tags in": ["a", 1]})),
                &mut offset,
            )
            .unwrap();

        assert_eq!(
            clause,
            "\"body\"->>'title' LIKE $1 AND \"body\"#>>'{author,name}' = $2 AND \"body\"->>'tags' IN ($3, $4)"
        );
        assert_eq!(params, vec![json!("A%"), json!("Kim"), json!("a"), json!("1")]);
    }

    #[test]
    fn test_document_containment_mode() {
        let rel = docs();
        let mut offset = 1;
        let (clause, params) = CriteriaCompiler::new(&rel)
            .mode(CompileMode::containment())
            .compile(&Criteria::from(json!({"title": "X", "rank >": 2, "draft": false})), &mut offset)
            .unwrap();

        assert_eq!(clause, "\"body\" @> $1::jsonb AND (\"body\"->>'rank')::numeric > $2");
        assert_eq!(params, vec![json!("{\"title\":\"X\",\"draft\":false}"), json!(2)]);
    }

    #[test]
    fn test_document_arrays_and_objects_match_by_containment() {
        let rel = docs();
        let mut offset = 1;
        let (clause, params) = CriteriaCompiler::new(&rel)
            .mode(CompileMode::document())
            .compile(
                &Criteria::from(json!({"tags": ["a", "b"], "meta": {"k": 1}, "labels !=": ["x"]})),
                &mut offset,
            )
            .unwrap();

        assert_eq!(
            clause,
            "\"body\" @> $1::jsonb AND \"body\" @> $2::jsonb AND NOT (\"body\" @> $3::jsonb)"
        );
        assert_eq!(
            params,
            vec![
                json!("{\"tags\":[\"a\",\"b\"]}"),
                json!("{\"meta\":{\"k\":1}}"),
                json!("{\"labels\":[\"x\"]}"),
            ]
        );
        assert_eq!(offset, 4);
    }

    #[test]
    fn test_document_containment_mode_keeps_arrays_as_containment() {
        let rel = docs();
        let mut offset = 1;
        let (clause, params) = CriteriaCompiler::new(&rel)
            .mode(CompileMode::containment())
            .compile(&Criteria::from(json!({"title": "A", "tags": ["a"]})), &mut offset)
            .unwrap();

        assert_eq!(clause, "\"body\" @> $1::jsonb AND \"body\" @> $2::jsonb");
        assert_eq!(params, vec![json!("{\"title\":\"A\"}"), json!("{\"tags\":[\"a\"]}")]);
    }

    #[test]
    fn test_document_mode_requires_document_table() {
        let mut offset = 1;
        let result = CriteriaCompiler::new(&users())
            .mode(CompileMode::document())
            .compile(&Criteria::from(json!({"title": "X"})), &mut offset);
        assert!(matches!(result, Err(DataMapperError::Unsupported { .. })));
    }

    // ==================== Raw Criteria ====================

    #[test]
    fn test_raw_positional_renumbered() {
        let mut offset = 3;
        let (clause, params) =
            compile_raw("a = $1 OR b = $2", &RawParams::Positional(vec![json!(1), json!(2)]), &mut offset)
                .unwrap();
        assert_eq!(clause, "a = $3 OR b = $4");
        assert_eq!(params, vec![json!(1), json!(2)]);
        assert_eq!(offset, 5);
    }

    #[test]
    fn test_raw_named_parameters() {
        let mut named = Map::new();
        named.insert("min".to_string(), json!(5));
        named.insert("name".to_string(), json!("x"));

        let mut offset = 1;
        let (clause, params) = compile_raw(
            "name = ${name} AND (age > ${min} OR score > ${min})",
            &RawParams::Named(named),
            &mut offset,
        )
        .unwrap();

        assert_eq!(clause, "name = $1 AND (age > $2 OR score > $2)");
        assert_eq!(params, vec![json!("x"), json!(5)]);
        assert_eq!(offset, 3);
    }

    #[test]
    fn test_raw_leaves_literals_alone() {
        let mut offset = 2;
        let (clause, _) =
            compile_raw("note = '$1 off' AND id = $1", &RawParams::Positional(vec![json!(1)]), &mut offset)
                .unwrap();
        assert_eq!(clause, "note = '$1 off' AND id = $2");
    }

    #[test]
    fn test_raw_skips_comments_and_quoted_bodies() {
        let mut offset = 4;
        let (clause, _) = compile_raw(
            "a = $1 -- don't renumber $1 here\n\
             AND b = E'it\\'s $1' /* $1 /* nested $1 */ ' */ AND c = $$ $1 $$ \
             AND d = $tag$ it's $1 $tag$ AND \"col$1\" = $2",
            &RawParams::Positional(vec![json!(1), json!(2)]),
            &mut offset,
        )
        .unwrap();
        assert_eq!(
            clause,
            "a = $4 -- don't renumber $1 here\n\
             AND b = E'it\\'s $1' /* $1 /* nested $1 */ ' */ AND c = $$ $1 $$ \
             AND d = $tag$ it's $1 $tag$ AND \"col$1\" = $5"
        );
        assert_eq!(offset, 6);
    }

    #[test]
    fn test_code_only_blanks_non_code() {
        assert_eq!(code_only("a = 'x' -- c\nb = $$y$$"), "a =    \nb =  ");
        assert_eq!(code_only("$1 + $x$"), "$1 +  ");
    }

    #[test]
    fn test_raw_errors() {
        let mut offset = 1;
        assert!(compile_raw("a = ${missing}", &RawParams::Named(Map::new()), &mut offset).is_err());
        assert!(compile_raw("a = $2", &RawParams::Positional(vec![json!(1)]), &mut offset).is_err());
        assert!(compile_raw("a = ${x}", &RawParams::Positional(vec![]), &mut offset).is_err());
    }

    // ==================== Determinism ====================

    #[test]
    fn test_compilation_is_deterministic() {
        let rel = users();
        let criteria = json!({"name ilike": "a%", "age": [1, 2], "meta @>": {"k": [1]}});
        let first = compile(&rel, criteria.clone());
        for _ in 0..5 {
            assert_eq!(compile(&rel, criteria.clone()), first);
        }
    }
}
