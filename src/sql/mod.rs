//! SQL generation for the data mapper
//!
//! Everything in this module is pure: it turns catalog metadata, criteria and
//! options into statement text plus positional parameters without touching a
//! connection. Only `catalog::reflect` performs I/O.

pub mod catalog;
pub mod criteria;
pub mod field;
pub mod params;
pub mod query;
pub mod sanitize;
pub mod search;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use criteria::{Criteria, CriteriaCompiler, build_criteria_clause, is_pk_search};
pub use query::QueryBuilder;
pub use sanitize::{quote_identifier, quote_qualified};
pub use search::build_search;

/// A compiled statement: SQL text plus its positional parameters.
///
/// `params[i]` is bound to placeholder `$(i + 1)`. Objects and arrays destined
/// for JSON columns are carried as one compact JSON text each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Placeholders carry no casts (raw SQL, scripts); parameter types are
    /// taken from the server before binding
    #[serde(skip)]
    pub untyped: bool,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
            untyped: false,
        }
    }

    pub fn untyped(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            untyped: true,
            ..Self::new(sql, params)
        }
    }

    /// Mark as untyped when it embeds raw criteria
    pub(crate) fn embedding(mut self, criteria: &Criteria) -> Self {
        self.untyped |= criteria.is_raw();
        self
    }
}
