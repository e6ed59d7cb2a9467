//! Catalog entities exposed through the registry
//!
//! Includes relations (tables, views, materialized views, foreign tables),
//! sequences, functions and enum types.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::sql::sanitize::quote_qualified;

/// Every kind of catalog object the registry can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Table,
    View,
    MaterializedView,
    ForeignTable,
    Sequence,
    Function,
    Enum,
}

impl EntityKind {
    /// Map a `pg_class.relkind` code to a relation kind
    pub fn from_relkind(relkind: &str) -> Option<Self> {
        match relkind {
            "r" | "p" => Some(EntityKind::Table),
            "v" => Some(EntityKind::View),
            "m" => Some(EntityKind::MaterializedView),
            "f" => Some(EntityKind::ForeignTable),
            _ => None,
        }
    }

    pub fn is_relation(self) -> bool {
        matches!(
            self,
            EntityKind::Table
                | EntityKind::View
                | EntityKind::MaterializedView
                | EntityKind::ForeignTable
        )
    }
}

/// What a caller intends to do with an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Readable,
    Writable,
    Searchable,
    Sequence,
    Executable,
    Enum,
}

impl Capability {
    pub fn allows(self, kind: EntityKind) -> bool {
        match self {
            Capability::Readable | Capability::Searchable => kind.is_relation(),
            Capability::Writable => kind == EntityKind::Table,
            Capability::Sequence => kind == EntityKind::Sequence,
            Capability::Executable => kind == EntityKind::Function,
            Capability::Enum => kind == EntityKind::Enum,
        }
    }
}

/// A relation column as reported by the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// `format_type` rendering, e.g. `integer`, `text[]`, `timestamp with time zone`
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Text-like columns accept text parameters without a cast
    pub fn is_textual(&self) -> bool {
        let t = self.data_type.as_str();
        t == "text"
            || t == "name"
            || t == "citext"
            || (t.starts_with("character") && !t.ends_with("[]"))
    }

    pub fn is_array(&self) -> bool {
        self.data_type.ends_with("[]")
    }

    pub fn is_json(&self) -> bool {
        self.data_type == "jsonb" || self.data_type == "json"
    }
}

/// A table, view, materialized view or foreign table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub schema: String,
    pub name: String,
    pub kind: EntityKind,
    pub columns: Vec<Column>,
    /// Ordered primary key columns; empty for keyless tables and views
    pub primary_key: Vec<String>,
    /// Has a JSON `body` column keyed by `id`
    pub is_document: bool,
}

impl Relation {
    pub fn new(
        schema: impl Into<String>,
        name: impl Into<String>,
        kind: EntityKind,
        columns: Vec<Column>,
    ) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            kind,
            columns,
            primary_key: Vec::new(),
            is_document: false,
        }
    }

    pub fn with_primary_key<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Mark as document-backed when the shape fits (`id` key plus a JSON body)
    pub fn detect_document(mut self, body_column: &str) -> Self {
        self.is_document = self.primary_key == ["id"]
            && self.column(body_column).is_some_and(Column::is_json);
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// `"schema"."name"`
    pub fn quoted_name(&self) -> String {
        quote_qualified(&self.schema, &self.name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }
}

/// A sequence and its reflected bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub schema: String,
    pub name: String,
    pub last_value: Option<i64>,
    pub start_value: i64,
    pub min_value: i64,
    pub max_value: i64,
    pub increment: i64,
}

impl Sequence {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn quoted_name(&self) -> String {
        quote_qualified(&self.schema, &self.name)
    }
}

/// One overload of a function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub arg_types: Vec<String>,
    pub default_count: usize,
    pub variadic: bool,
    pub return_type: String,
    pub returns_set: bool,
    /// Invoked with `CALL` rather than selected from
    #[serde(default)]
    pub procedure: bool,
}

impl FunctionSignature {
    pub fn arg_count(&self) -> usize {
        self.arg_types.len()
    }

    /// Whether a call with `n` arguments can bind to this overload
    pub fn accepts(&self, n: usize) -> bool {
        let max = self.arg_count();
        let min = max.saturating_sub(self.default_count);
        if self.variadic {
            n >= max.saturating_sub(1).min(min)
        } else {
            (min..=max).contains(&n)
        }
    }
}

/// All overloads of one function name in a schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub schema: String,
    pub name: String,
    pub overloads: Vec<FunctionSignature>,
}

impl Function {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn quoted_name(&self) -> String {
        quote_qualified(&self.schema, &self.name)
    }

    /// Pick the overload for a call with `n` arguments.
    ///
    /// An exact arity match wins over one reached through defaults or variadics.
    pub fn resolve(&self, n: usize) -> Option<&FunctionSignature> {
        self.overloads
            .iter()
            .find(|sig| sig.arg_count() == n && !sig.variadic)
            .or_else(|| self.overloads.iter().find(|sig| sig.accepts(n)))
    }
}

/// An enum type and its labels in sort order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumType {
    pub schema: String,
    pub name: String,
    pub labels: Vec<String>,
}

/// Any catalog object held by the registry
#[derive(Debug, Clone)]
pub enum Entity {
    Relation(Arc<Relation>),
    Sequence(Arc<Sequence>),
    Function(Arc<Function>),
    Enum(Arc<EnumType>),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Relation(rel) => rel.kind,
            Entity::Sequence(_) => EntityKind::Sequence,
            Entity::Function(_) => EntityKind::Function,
            Entity::Enum(_) => EntityKind::Enum,
        }
    }

    pub fn schema(&self) -> &str {
        match self {
            Entity::Relation(rel) => &rel.schema,
            Entity::Sequence(seq) => &seq.schema,
            Entity::Function(func) => &func.schema,
            Entity::Enum(en) => &en.schema,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Entity::Relation(rel) => &rel.name,
            Entity::Sequence(seq) => &seq.name,
            Entity::Function(func) => &func.name,
            Entity::Enum(en) => &en.name,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema(), self.name())
    }

    pub fn is_document(&self) -> bool {
        matches!(self, Entity::Relation(rel) if rel.is_document)
    }

    pub fn as_relation(&self) -> Option<&Arc<Relation>> {
        match self {
            Entity::Relation(rel) => Some(rel),
            _ => None,
        }
    }
}
