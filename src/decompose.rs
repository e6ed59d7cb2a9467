//! Reshaping flat joined rows into nested objects
//!
//! A `DecomposeSchema` names the key column(s) identifying one logical object,
//! the columns to copy onto it, and nested child schemas. Rows sharing a key
//! are merged into one object; each row may still add new elements to that
//! object's array children.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DataMapperError, Result};

/// Key column(s) of a decomposition node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySpec {
    Single(String),
    Compound(Vec<String>),
}

impl KeySpec {
    fn columns(&self) -> &[String] {
        match self {
            KeySpec::Single(column) => std::slice::from_ref(column),
            KeySpec::Compound(columns) => columns,
        }
    }
}

/// Columns copied onto each object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnMap {
    /// Same name in the row and in the output
    List(Vec<String>),
    /// Output field to input column
    Map(IndexMap<String, String>),
}

impl Default for ColumnMap {
    fn default() -> Self {
        ColumnMap::List(Vec::new())
    }
}

impl ColumnMap {
    /// `(output, input)` pairs
    fn pairs(&self) -> Vec<(&str, &str)> {
        match self {
            ColumnMap::List(names) => names.iter().map(|n| (n.as_str(), n.as_str())).collect(),
            ColumnMap::Map(map) => map.iter().map(|(out, input)| (out.as_str(), input.as_str())).collect(),
        }
    }
}

/// One level of the output graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecomposeSchema {
    pub pk: KeySpec,
    #[serde(default)]
    pub columns: ColumnMap,
    /// Collect every distinct child instead of keeping the first
    #[serde(default)]
    pub array: bool,
    #[serde(default)]
    pub children: IndexMap<String, DecomposeSchema>,
}

impl DecomposeSchema {
    pub fn new(pk: impl Into<String>) -> Self {
        Self {
            pk: KeySpec::Single(pk.into()),
            columns: ColumnMap::default(),
            array: false,
            children: IndexMap::new(),
        }
    }

    pub fn compound<S: Into<String>>(pk: impl IntoIterator<Item = S>) -> Self {
        Self {
            pk: KeySpec::Compound(pk.into_iter().map(Into::into).collect()),
            ..Self::new("")
        }
    }

    pub fn columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = ColumnMap::List(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Map output fields to differently named input columns
    pub fn map_columns<K: Into<String>, V: Into<String>>(mut self, columns: impl IntoIterator<Item = (K, V)>) -> Self {
        self.columns = ColumnMap::Map(columns.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    pub fn array(mut self) -> Self {
        self.array = true;
        self
    }

    pub fn child(mut self, key: impl Into<String>, schema: DecomposeSchema) -> Self {
        self.children.insert(key.into(), schema);
        self
    }
}

/// Decompose `rows` (JSON objects) into nested objects
pub fn decompose(schema: &DecomposeSchema, rows: &[Value]) -> Result<Vec<Value>> {
    let mut root = Node::new(schema, true);
    for row in rows {
        let row = row.as_object().ok_or_else(|| {
            DataMapperError::validation(format!("Cannot decompose a non-object row: {}", row))
        })?;
        root.absorb(row)?;
    }
    Ok(root.finish())
}

struct Node<'s> {
    schema: &'s DecomposeSchema,
    many: bool,
    objects: IndexMap<String, Built<'s>>,
}

struct Built<'s> {
    fields: Map<String, Value>,
    children: Vec<(&'s str, Node<'s>)>,
}

impl<'s> Node<'s> {
    fn new(schema: &'s DecomposeSchema, many: bool) -> Self {
        Self {
            schema,
            many,
            objects: IndexMap::new(),
        }
    }

    fn column<'r>(row: &'r Map<String, Value>, name: &str) -> Result<&'r Value> {
        row.get(name).ok_or_else(|| {
            DataMapperError::validation(format!("Decompose column '{}' is not present in the results", name))
        })
    }

    /// Identity of the object this row describes; `None` when the row carries
    /// no object at this level
    fn key(&self, row: &Map<String, Value>) -> Result<Option<String>> {
        let mut parts = Vec::with_capacity(self.schema.pk.columns().len());
        for column in self.schema.pk.columns() {
            let value = Self::column(row, column)?;
            if value.is_null() {
                return Ok(None);
            }
            parts.push(value.clone());
        }
        Ok(Some(Value::Array(parts).to_string()))
    }

    fn absorb(&mut self, row: &Map<String, Value>) -> Result<()> {
        let Some(key) = self.key(row)? else {
            return Ok(());
        };

        if !self.objects.contains_key(&key) {
            if !self.many && !self.objects.is_empty() {
                return Ok(());
            }
            let mut fields = Map::new();
            for (output, input) in self.schema.columns.pairs() {
                fields.insert(output.to_string(), Self::column(row, input)?.clone());
            }
            let children = self
                .schema
                .children
                .iter()
                .map(|(name, schema)| (name.as_str(), Node::new(schema, schema.array)))
                .collect();
            self.objects.insert(key.clone(), Built { fields, children });
        }

        if let Some(built) = self.objects.get_mut(&key) {
            for (_, child) in built.children.iter_mut() {
                child.absorb(row)?;
            }
        }
        Ok(())
    }

    fn finish(self) -> Vec<Value> {
        self.objects
            .into_values()
            .map(|built| {
                let mut fields = built.fields;
                for (name, child) in built.children {
                    let many = child.many;
                    let mut values = child.finish();
                    if many {
                        fields.insert(name.to_string(), Value::Array(values));
                    } else if !values.is_empty() {
                        fields.insert(name.to_string(), values.swap_remove(0));
                    }
                }
                Value::Object(fields)
            })
            .collect()
    }
}
