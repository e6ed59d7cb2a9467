//! Entity registry
//!
//! The `SchemaTree` maps schema names to the entities reflected in them. The
//! `Registry` holds the current tree behind an `Arc` so readers take a cheap
//! snapshot and `install` swaps in a rebuilt tree without disturbing them.

use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use indexmap::map::Entry;

use crate::entity::{Capability, Entity};
use crate::error::{DataMapperError, Result};
use crate::sql::catalog::Catalog;

/// A parsed `schema.name` or bare `name` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub name: String,
}

/// Parse an entity reference.
///
/// Unquoted parts are folded to lower case; double-quoted parts are kept
/// exactly, with `""` standing for a literal quote.
pub fn parse_name(input: &str) -> Result<QualifiedName> {
    let invalid = |reason: &str| DataMapperError::validation(format!("Invalid entity name '{}': {}", input, reason));

    let mut parts = Vec::new();
    let mut chars = input.trim().chars().peekable();
    loop {
        let mut part = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    None => return Err(invalid("unterminated quoted identifier")),
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        part.push('"');
                    }
                    Some('"') => break,
                    Some(c) => part.push(c),
                }
            }
            if !matches!(chars.peek(), None | Some('.')) {
                return Err(invalid("unexpected text after quoted identifier"));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == '.' {
                    break;
                }
                if c == '"' {
                    return Err(invalid("quote inside unquoted identifier"));
                }
                part.push(c.to_ascii_lowercase());
                chars.next();
            }
            part = part.trim().to_string();
        }
        if part.is_empty() {
            return Err(invalid("empty name part"));
        }
        parts.push(part);

        match chars.next() {
            None => break,
            Some('.') => continue,
            Some(_) => return Err(invalid("unexpected character")),
        }
    }

    match parts.len() {
        1 => Ok(QualifiedName {
            schema: None,
            name: parts.remove(0),
        }),
        2 => {
            let name = parts.remove(1);
            Ok(QualifiedName {
                schema: Some(parts.remove(0)),
                name,
            })
        }
        _ => Err(invalid("expected 'schema.name' or 'name'")),
    }
}

/// Schemas and their entities, in reflection order
#[derive(Debug, Clone, Default)]
pub struct SchemaTree {
    schemas: IndexMap<String, IndexMap<String, Entity>>,
}

impl SchemaTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from reflected catalog metadata
    pub fn build(catalog: Catalog) -> Result<Self> {
        let mut tree = Self::new();
        for relation in catalog.relations {
            tree.register(Entity::Relation(Arc::new(relation)))?;
        }
        for sequence in catalog.sequences {
            tree.register(Entity::Sequence(Arc::new(sequence)))?;
        }
        for function in catalog.functions {
            tree.register(Entity::Function(Arc::new(function)))?;
        }
        for enum_type in catalog.enums {
            tree.register(Entity::Enum(Arc::new(enum_type)))?;
        }
        Ok(tree)
    }

    /// Add an entity; a second entity with the same qualified name is an error
    pub fn register(&mut self, entity: Entity) -> Result<()> {
        let names = self.schemas.entry(entity.schema().to_string()).or_default();
        match names.entry(entity.name().to_string()) {
            Entry::Occupied(existing) => Err(DataMapperError::configuration(format!(
                "Duplicate entity name {} ({:?} and {:?})",
                entity.qualified_name(),
                existing.get().kind(),
                entity.kind()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(entity);
                Ok(())
            }
        }
    }

    pub fn get(&self, schema: &str, name: &str) -> Option<&Entity> {
        self.schemas.get(schema).and_then(|names| names.get(name))
    }

    /// Resolve `schema.name` or a bare `name`.
    ///
    /// Bare names are looked up in `default_schema` first, then in every other
    /// schema; a name found in several other schemas is ambiguous. A miss is
    /// `Ok(None)`.
    pub fn lookup(
        &self,
        reference: &str,
        default_schema: &str,
        capability: Option<Capability>,
    ) -> Result<Option<Entity>> {
        let parsed = parse_name(reference)?;
        let admits = |entity: &&Entity| capability.is_none_or(|cap| cap.allows(entity.kind()));

        if let Some(schema) = &parsed.schema {
            return Ok(self.get(schema, &parsed.name).filter(admits).cloned());
        }

        if let Some(entity) = self.get(default_schema, &parsed.name).filter(admits) {
            return Ok(Some(entity.clone()));
        }

        let mut matches = self
            .schemas
            .iter()
            .filter(|(schema, _)| schema.as_str() != default_schema)
            .filter_map(|(_, names)| names.get(&parsed.name))
            .filter(admits);
        let Some(first) = matches.next() else {
            return Ok(None);
        };
        if let Some(second) = matches.next() {
            return Err(DataMapperError::configuration(format!(
                "Ambiguous entity name '{}': matches {} and {}",
                reference,
                first.qualified_name(),
                second.qualified_name()
            )));
        }
        Ok(Some(first.clone()))
    }

    pub fn schemas(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.schemas.values().flat_map(|names| names.values())
    }

    pub fn len(&self) -> usize {
        self.schemas.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-wide holder of the current `SchemaTree`
#[derive(Debug)]
pub struct Registry {
    tree: RwLock<Arc<SchemaTree>>,
    default_schema: String,
}

impl Registry {
    pub fn new(tree: SchemaTree, default_schema: impl Into<String>) -> Self {
        Self {
            tree: RwLock::new(Arc::new(tree)),
            default_schema: default_schema.into(),
        }
    }

    /// The current tree; unaffected by later installs
    pub fn snapshot(&self) -> Arc<SchemaTree> {
        self.tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the current tree
    pub fn install(&self, tree: SchemaTree) {
        *self.tree.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(tree);
    }

    pub fn default_schema(&self) -> &str {
        &self.default_schema
    }

    pub fn lookup(&self, reference: &str, capability: Option<Capability>) -> Result<Option<Entity>> {
        self.snapshot()
            .lookup(reference, &self.default_schema, capability)
    }
}
