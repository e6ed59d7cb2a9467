//! Capability handles
//!
//! Handles are obtained from `Database` by entity name and carry a clone of the
//! database handle, so a handle taken inside a transaction runs on the
//! transaction's connection.
//!
//! Every operation honours `QueryOptions::build` by returning the compiled
//! statement instead of executing it.

use std::ops::Deref;
use std::sync::Arc;

use futures_util::TryStreamExt;
use serde_json::Value;

use crate::database::{Database, RowStream, reject_streamed_decompose, shape_rows};
use crate::entity::{Column, Function, Relation, Sequence};
use crate::error::{DataMapperError, Result};
use crate::options::{Output, QueryOptions, Record, SearchRequest};
use crate::sql::criteria::Criteria;
use crate::sql::params::Binder;
use crate::sql::query::{DOCUMENT_COLUMN, QueryBuilder};
use crate::sql::{Statement, build_search};

/// Pseudo-types that cannot be the target of a parameter cast
const PSEUDO_TYPES: &[&str] = &[
    "any",
    "anyelement",
    "anyarray",
    "anynonarray",
    "anyenum",
    "record",
    "internal",
    "cstring",
];

fn unwrap_document(mut row: Value) -> Value {
    row.get_mut(DOCUMENT_COLUMN).map(Value::take).unwrap_or(row)
}

// =============================================================================
// Readable
// =============================================================================

/// Reads and searches against a table, view, materialized view or foreign table
#[derive(Clone)]
pub struct Readable {
    db: Database,
    relation: Arc<Relation>,
}

impl Readable {
    pub(crate) fn new(db: Database, relation: Arc<Relation>) -> Self {
        Self { db, relation }
    }

    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    pub fn qualified_name(&self) -> String {
        self.relation.qualified_name()
    }

    fn builder(&self, document: bool) -> QueryBuilder<'_> {
        QueryBuilder::new(&self.relation)
            .body_column(&self.db.config().document_body_column)
            .document(document)
    }

    async fn fetch(&self, statement: Statement, options: &QueryOptions, document: bool) -> Result<Output> {
        if options.build {
            return Ok(Output::Statement(statement));
        }
        reject_streamed_decompose(&self.relation.qualified_name(), options)?;

        let mut rows = self.db.rows(&statement).await?;
        if document && options.columns.is_empty() {
            rows = rows.into_iter().map(unwrap_document).collect();
        }
        Ok(Output::Rows(shape_rows(rows, options)?))
    }

    async fn fetch_one(&self, statement: Statement, options: &QueryOptions, document: bool) -> Result<Output> {
        Ok(match self.fetch(statement, options, document).await? {
            Output::Rows(rows) => Output::Row(rows.into_iter().next()),
            other => other,
        })
    }

    /// Rows matching `criteria`
    pub async fn find(&self, criteria: impl Into<Criteria>, options: &QueryOptions) -> Result<Output> {
        let statement = self.builder(false).select(&criteria.into(), options)?;
        self.fetch(statement, options, false).await
    }

    /// First matching row, or `Output::Row(None)`
    pub async fn find_one(&self, criteria: impl Into<Criteria>, options: &QueryOptions) -> Result<Output> {
        let statement = self.builder(false).select_one(&criteria.into(), options)?;
        self.fetch_one(statement, options, false).await
    }

    pub async fn count(&self, criteria: impl Into<Criteria>, options: &QueryOptions) -> Result<Output> {
        let statement = self.builder(false).count(&criteria.into(), options)?;
        if options.build {
            return Ok(Output::Statement(statement));
        }
        let rows = self.db.rows(&statement).await?;
        let count = rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(Output::Count(count))
    }

    /// Documents matching `criteria`; unknown fields resolve inside the body
    pub async fn find_doc(&self, criteria: impl Into<Criteria>, options: &QueryOptions) -> Result<Output> {
        let statement = self.builder(true).select(&criteria.into(), options)?;
        self.fetch(statement, options, true).await
    }

    pub async fn find_one_doc(&self, criteria: impl Into<Criteria>, options: &QueryOptions) -> Result<Output> {
        let statement = self.builder(true).select_one(&criteria.into(), options)?;
        self.fetch_one(statement, options, true).await
    }

    /// Ranked full-text search over physical columns
    pub async fn search(&self, request: &SearchRequest, options: &QueryOptions) -> Result<Output> {
        let statement = build_search(&self.builder(false), request, options)?;
        self.fetch(statement, options, false).await
    }

    /// Ranked full-text search over document fields
    pub async fn search_doc(&self, request: &SearchRequest, options: &QueryOptions) -> Result<Output> {
        let statement = build_search(&self.builder(true), request, options)?;
        self.fetch(statement, options, true).await
    }

    /// Rows matching `criteria`, fetched lazily
    pub fn stream(&self, criteria: impl Into<Criteria>, options: &QueryOptions) -> Result<RowStream> {
        self.check_streamable(options)?;
        let statement = self.builder(false).select(&criteria.into(), options)?;
        Ok(self.db.stream_statement(statement))
    }

    /// Documents matching `criteria`, fetched lazily
    pub fn stream_doc(&self, criteria: impl Into<Criteria>, options: &QueryOptions) -> Result<RowStream> {
        self.check_streamable(options)?;
        let statement = self.builder(true).select(&criteria.into(), options)?;
        let rows = self.db.stream_statement(statement);
        if options.columns.is_empty() {
            Ok(Box::pin(rows.map_ok(unwrap_document)))
        } else {
            Ok(rows)
        }
    }

    fn check_streamable(&self, options: &QueryOptions) -> Result<()> {
        if options.decompose.is_some() {
            return Err(DataMapperError::unsupported(
                self.relation.qualified_name(),
                "decompose needs the complete result set and cannot be combined with streaming",
            ));
        }
        if options.build {
            return Err(DataMapperError::unsupported(
                self.relation.qualified_name(),
                "build mode returns a statement, not a stream",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Writable
// =============================================================================

/// Reads and writes against a table
#[derive(Clone)]
pub struct Writable {
    readable: Readable,
}

impl Deref for Writable {
    type Target = Readable;

    fn deref(&self) -> &Readable {
        &self.readable
    }
}

impl Writable {
    pub(crate) fn new(db: Database, relation: Arc<Relation>) -> Self {
        Self {
            readable: Readable::new(db, relation),
        }
    }

    /// Insert records, returning the inserted rows
    pub async fn insert(&self, records: &[Record], options: &QueryOptions) -> Result<Output> {
        let statement = self.builder(false).insert(records, options)?;
        self.fetch(statement, options, false).await
    }

    pub async fn insert_one(&self, record: &Record, options: &QueryOptions) -> Result<Output> {
        let statement = self.builder(false).insert(std::slice::from_ref(record), options)?;
        self.fetch_one(statement, options, false).await
    }

    /// Insert documents; everything but `id` goes into the body
    pub async fn insert_doc(&self, documents: &[Record], options: &QueryOptions) -> Result<Output> {
        let statement = self.builder(true).insert(documents, options)?;
        self.fetch(statement, options, true).await
    }

    /// Set the defined fields of `changes` on every matching row
    pub async fn update(
        &self,
        criteria: impl Into<Criteria>,
        changes: &Record,
        options: &QueryOptions,
    ) -> Result<Output> {
        let statement = self.builder(false).update(&criteria.into(), changes, options)?;
        self.fetch(statement, options, false).await
    }

    /// Update the row identified by the record's key fields
    pub async fn update_by_key(&self, record: &Record, options: &QueryOptions) -> Result<Output> {
        let statement = self.builder(false).update_by_key(record, options)?;
        self.fetch_one(statement, options, false).await
    }

    /// Update by key when the record carries one, insert otherwise
    pub async fn save(&self, record: &Record, options: &QueryOptions) -> Result<Output> {
        let statement = self.builder(false).save(record, options)?;
        self.fetch_one(statement, options, false).await
    }

    /// `save` for documents; fields other than `id` are merged into the body
    pub async fn save_doc(&self, record: &Record, options: &QueryOptions) -> Result<Output> {
        let statement = self.builder(true).save(record, options)?;
        self.fetch_one(statement, options, true).await
    }

    /// Delete matching rows, returning them
    pub async fn delete(&self, criteria: impl Into<Criteria>, options: &QueryOptions) -> Result<Output> {
        let statement = self.builder(false).delete(&criteria.into(), options)?;
        self.fetch(statement, options, false).await
    }

    /// Merge `changes` into a JSON column of every matching row
    pub async fn modify(
        &self,
        criteria: impl Into<Criteria>,
        changes: &Record,
        column: Option<&str>,
        options: &QueryOptions,
    ) -> Result<Output> {
        let statement = self.builder(false).modify(&criteria.into(), changes, column, options)?;
        self.fetch(statement, options, false).await
    }

    /// Merge `changes` into the body of every matching document
    pub async fn update_doc(
        &self,
        criteria: impl Into<Criteria>,
        changes: &Record,
        options: &QueryOptions,
    ) -> Result<Output> {
        let statement = self.builder(true).update(&criteria.into(), changes, options)?;
        self.fetch(statement, options, true).await
    }
}

// =============================================================================
// Sequences
// =============================================================================

/// Access to a sequence
#[derive(Clone)]
pub struct SequenceHandle {
    db: Database,
    sequence: Arc<Sequence>,
}

impl SequenceHandle {
    pub(crate) fn new(db: Database, sequence: Arc<Sequence>) -> Self {
        Self { db, sequence }
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    /// Last value handed out, or `None` before the first `nextval`
    pub async fn last_value(&self) -> Result<Option<i64>> {
        let statement = Statement::new(
            format!(
                "SELECT last_value, is_called FROM {}",
                self.sequence.quoted_name()
            ),
            Vec::new(),
        );
        let rows = self.db.rows(&statement).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        if row.get("is_called").and_then(Value::as_bool) != Some(true) {
            return Ok(None);
        }
        Ok(row.get("last_value").and_then(Value::as_i64))
    }

    pub async fn next_value(&self) -> Result<i64> {
        let statement = Statement::new(
            "SELECT nextval($1::regclass) AS \"value\"",
            vec![Value::String(self.sequence.quoted_name())],
        );
        let rows = self.db.rows(&statement).await?;
        rows.first()
            .and_then(|row| row.get("value"))
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                DataMapperError::validation(format!(
                    "nextval returned no value for {}",
                    self.sequence.qualified_name()
                ))
            })
    }

    /// Restart so that the next value is `start` (the sequence's own start by default)
    pub async fn reset(&self, start: Option<i64>) -> Result<()> {
        let start = start.unwrap_or(self.sequence.start_value);
        let statement = Statement::new(
            "SELECT setval($1::regclass, $2, false)",
            vec![Value::String(self.sequence.quoted_name()), Value::from(start)],
        );
        self.db.rows(&statement).await?;
        Ok(())
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Access to a function or procedure
#[derive(Clone)]
pub struct Executable {
    db: Database,
    function: Arc<Function>,
}

impl Executable {
    pub(crate) fn new(db: Database, function: Arc<Function>) -> Self {
        Self { db, function }
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    /// Statement calling the overload that accepts `args.len()` arguments
    pub fn statement(&self, args: &[Value]) -> Result<Statement> {
        call_statement(&self.function, args)
    }

    /// Call the function.
    ///
    /// A function that does not return a set and yields one single-column row
    /// comes back as `Output::Scalar`.
    pub async fn call(&self, args: &[Value], options: &QueryOptions) -> Result<Output> {
        let statement = self.statement(args)?;
        if options.build {
            return Ok(Output::Statement(statement));
        }
        reject_streamed_decompose(&self.function.qualified_name(), options)?;

        let returns_set = self
            .function
            .resolve(args.len())
            .is_some_and(|signature| signature.returns_set);
        let rows = self.db.rows(&statement).await?;

        let scalar = match rows.as_slice() {
            [Value::Object(row)] if row.len() == 1 && !returns_set && options.decompose.is_none() => {
                row.values().next().cloned()
            }
            _ => None,
        };
        match scalar {
            Some(value) => Ok(Output::Scalar(value)),
            None => Ok(Output::Rows(shape_rows(rows, options)?)),
        }
    }
}

fn call_statement(function: &Function, args: &[Value]) -> Result<Statement> {
    let signature = function.resolve(args.len()).ok_or_else(|| {
        DataMapperError::unsupported(
            function.qualified_name(),
            format!("no overload accepts {} argument(s)", args.len()),
        )
    })?;

    let mut param_offset = 1;
    let mut binder = Binder::new(&mut param_offset);
    let variadic_from = if signature.variadic {
        signature.arg_count().saturating_sub(1)
    } else {
        usize::MAX
    };
    let placeholders: Vec<String> = args
        .iter()
        .enumerate()
        .map(|(i, arg)| {
            let column = signature
                .arg_types
                .get(i)
                .filter(|t| i < variadic_from && !PSEUDO_TYPES.contains(&t.as_str()))
                .map(|t| Column::new(format!("${}", i + 1), t.clone()));
            let placeholder = binder.bind(column.as_ref(), arg.clone());
            // Overload resolution needs every typed argument cast
            match &column {
                Some(col) if !placeholder.contains("::") => format!("{}::{}", placeholder, col.data_type),
                _ => placeholder,
            }
        })
        .collect();

    let verb = if signature.procedure { "CALL" } else { "SELECT * FROM" };
    Ok(Statement::new(
        format!("{} {}({})", verb, function.quoted_name(), placeholders.join(", ")),
        binder.finish(),
    ))
}
