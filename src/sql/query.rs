//! Statement builders for reads and writes
//!
//! `QueryBuilder` composes complete SELECT / INSERT / UPDATE / DELETE statements
//! for one relation. Placeholders are always numbered from `$1` and every
//! identifier is quoted.

use serde_json::Value;

use crate::entity::Relation;
use crate::error::{DataMapperError, Result};
use crate::options::{Direction, Nulls, OnConflict, QueryOptions, Record};
use crate::sql::Statement;
use crate::sql::criteria::{CompileMode, Criteria, CriteriaCompiler};
use crate::sql::field::FieldRef;
use crate::sql::params::Binder;
use crate::sql::sanitize::{quote_identifier, validate_cast_type};

/// Output column carrying `{...body, id}` for document reads and writes
pub const DOCUMENT_COLUMN: &str = "document";

/// Builds statements against one relation
#[derive(Debug, Clone)]
pub struct QueryBuilder<'a> {
    relation: &'a Relation,
    body_column: &'a str,
    document: bool,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(relation: &'a Relation) -> Self {
        Self {
            relation,
            body_column: "body",
            document: false,
        }
    }

    pub fn body_column(mut self, column: &'a str) -> Self {
        self.body_column = column;
        self
    }

    /// Treat the relation as a document table: criteria and ordering resolve
    /// unknown fields inside the body, and rows come back as `{...body, id}`
    pub fn document(mut self, enabled: bool) -> Self {
        self.document = enabled;
        self
    }

    pub fn relation(&self) -> &'a Relation {
        self.relation
    }

    pub fn body(&self) -> &'a str {
        self.body_column
    }

    pub fn is_document(&self) -> bool {
        self.document
    }

    fn require_document(&self) -> Result<()> {
        if self.document && !self.relation.is_document {
            return Err(DataMapperError::unsupported(
                self.relation.qualified_name(),
                format!(
                    "not a document table (needs an id primary key and a JSON {} column)",
                    self.body_column
                ),
            ));
        }
        Ok(())
    }

    pub(crate) fn compile_where(
        &self,
        criteria: &Criteria,
        options: &QueryOptions,
        param_offset: &mut usize,
    ) -> Result<(String, Vec<Value>)> {
        let mode = match (self.document, options.document_containment) {
            (false, _) => CompileMode::relational(),
            (true, false) => CompileMode::document(),
            (true, true) => CompileMode::containment(),
        };
        CriteriaCompiler::new(self.relation)
            .body_column(self.body_column)
            .mode(mode)
            .compile(criteria, param_offset)
    }

    pub(crate) fn table(&self, options: &QueryOptions) -> String {
        if options.only {
            format!("ONLY {}", self.relation.quoted_name())
        } else {
            self.relation.quoted_name()
        }
    }

    fn resolve_field(&self, field: FieldRef, in_body: bool) -> FieldRef {
        if in_body && self.relation.column(&field.column).is_none() {
            field.into_document(self.body_column)
        } else {
            field
        }
    }

    fn document_projection(&self) -> String {
        format!(
            "COALESCE({}::jsonb, '{{}}'::jsonb) || jsonb_build_object('id', {}) AS {}",
            quote_identifier(self.body_column),
            quote_identifier("id"),
            quote_identifier(DOCUMENT_COLUMN)
        )
    }

    pub(crate) fn projection(&self, options: &QueryOptions) -> Result<String> {
        if options.columns.is_empty() {
            return Ok(if self.document {
                self.document_projection()
            } else {
                "*".to_string()
            });
        }

        let mut items = Vec::with_capacity(options.columns.len());
        for column in &options.columns {
            let field = self.resolve_field(FieldRef::parse(column)?, self.document);
            if field.has_path() {
                items.push(format!("{} AS {}", field.to_sql(), quote_identifier(&field.output_name())));
            } else {
                items.push(field.to_sql());
            }
        }
        Ok(items.join(", "))
    }

    /// ORDER BY terms from `options.order`, without the keyword
    pub(crate) fn order_terms(&self, options: &QueryOptions) -> Result<Vec<String>> {
        let in_body = options.order_body || self.document;
        if options.order_body && !options.order.is_empty() && self.relation.column(self.body_column).is_none() {
            return Err(DataMapperError::unsupported(
                self.relation.qualified_name(),
                format!("orderBody requires a {} column", self.body_column),
            ));
        }

        let mut terms = Vec::with_capacity(options.order.len());
        for order in &options.order {
            let field = FieldRef::parse(&order.field)?;
            // orderBody addresses the body even where a column shares the name
            let field = if options.order_body && field.column != self.body_column {
                field.into_document(self.body_column)
            } else {
                self.resolve_field(field, in_body)
            };
            let mut term = match &order.cast {
                Some(cast) => format!("({})::{}", field.to_sql(), validate_cast_type(cast)?),
                None => field.to_sql(),
            };
            term.push(' ');
            term.push_str(order.direction.unwrap_or(Direction::Asc).sql());
            match order.nulls {
                Some(Nulls::First) => term.push_str(" NULLS FIRST"),
                Some(Nulls::Last) => term.push_str(" NULLS LAST"),
                None => {}
            }
            terms.push(term);
        }
        Ok(terms)
    }

    /// Primary key ascending; empty for keyless relations
    pub(crate) fn key_order(&self) -> Vec<String> {
        self.relation
            .primary_key
            .iter()
            .map(|pk| format!("{} ASC", quote_identifier(pk)))
            .collect()
    }

    pub(crate) fn pagination(options: &QueryOptions) -> String {
        let mut sql = String::new();
        if let Some(limit) = options.limit.filter(|n| *n > 0) {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = options.offset.filter(|n| *n > 0) {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        sql
    }

    fn returning(&self, options: &QueryOptions) -> Result<String> {
        Ok(format!(" RETURNING {}", self.projection(options)?))
    }

    /// `SELECT ... FROM ... WHERE ... ORDER BY ... LIMIT ... OFFSET ...`
    pub fn select(&self, criteria: &Criteria, options: &QueryOptions) -> Result<Statement> {
        self.require_document()?;
        let mut param_offset = 1;
        let (clause, params) = self.compile_where(criteria, options, &mut param_offset)?;

        let mut sql = format!("SELECT {} FROM {}", self.projection(options)?, self.table(options));
        if clause != "TRUE" {
            sql.push_str(&format!(" WHERE {}", clause));
        }

        let mut order = self.order_terms(options)?;
        if order.is_empty() {
            order = self.key_order();
        }
        if !order.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }
        sql.push_str(&Self::pagination(options));

        Ok(Statement::new(sql, params).embedding(criteria))
    }

    /// Like `select`, limited to one row unless the caller set a limit
    pub fn select_one(&self, criteria: &Criteria, options: &QueryOptions) -> Result<Statement> {
        if options.limit.is_some() {
            return self.select(criteria, options);
        }
        let mut options = options.clone();
        options.limit = Some(1);
        self.select(criteria, &options)
    }

    /// `SELECT COUNT(*)`; ordering and pagination are ignored
    pub fn count(&self, criteria: &Criteria, options: &QueryOptions) -> Result<Statement> {
        self.require_document()?;
        let mut param_offset = 1;
        let (clause, params) = self.compile_where(criteria, options, &mut param_offset)?;

        let mut sql = format!(
            "SELECT COUNT(*) AS {} FROM {}",
            quote_identifier("count"),
            self.table(options)
        );
        if clause != "TRUE" {
            sql.push_str(&format!(" WHERE {}", clause));
        }
        Ok(Statement::new(sql, params).embedding(criteria))
    }

    fn check_columns<'r>(&self, names: impl IntoIterator<Item = &'r str>) -> Result<()> {
        for name in names {
            if self.relation.column(name).is_none() {
                return Err(DataMapperError::validation(format!(
                    "Unknown column '{}' for {}",
                    name,
                    self.relation.qualified_name()
                )));
            }
        }
        Ok(())
    }

    /// Insert one or more records.
    ///
    /// The column list is the union of the defined fields in first-seen order;
    /// a record that leaves one of them undefined gets `DEFAULT` in that slot.
    pub fn insert(&self, records: &[Record], options: &QueryOptions) -> Result<Statement> {
        self.require_document()?;
        if records.is_empty() {
            return Err(DataMapperError::validation(format!(
                "Nothing to insert into {}",
                self.relation.qualified_name()
            )));
        }
        if self.document {
            return self.insert_documents(records, options);
        }

        let mut columns: Vec<&str> = Vec::new();
        for record in records {
            for (name, _) in record.defined() {
                if !columns.contains(&name) {
                    columns.push(name);
                }
            }
        }
        self.check_columns(columns.iter().copied())?;

        let mut param_offset = 1;
        let mut binder = Binder::new(&mut param_offset);
        let mut sql = format!("INSERT INTO {}", self.relation.quoted_name());

        if columns.is_empty() {
            if records.len() > 1 {
                return Err(DataMapperError::validation(format!(
                    "Cannot insert several empty records into {} in one statement",
                    self.relation.qualified_name()
                )));
            }
            sql.push_str(" DEFAULT VALUES");
        } else {
            let rows: Vec<String> = records
                .iter()
                .map(|record| {
                    let slots: Vec<String> = columns
                        .iter()
                        .map(|name| match record.get(name) {
                            Some(value) => binder.bind(self.relation.column(name), value.clone()),
                            None => "DEFAULT".to_string(),
                        })
                        .collect();
                    format!("({})", slots.join(", "))
                })
                .collect();
            let names: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
            sql.push_str(&format!(" ({}) VALUES {}", names.join(", "), rows.join(", ")));
        }

        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        sql.push_str(&self.on_conflict(options, &columns)?);
        sql.push_str(&self.returning(options)?);

        Ok(Statement::new(sql, binder.finish()))
    }

    fn insert_documents(&self, records: &[Record], options: &QueryOptions) -> Result<Statement> {
        let with_id = records.iter().any(|r| r.is_defined("id"));
        let body_type = self
            .relation
            .column(self.body_column)
            .map(|c| c.data_type.clone())
            .unwrap_or_else(|| "jsonb".to_string());

        let mut param_offset = 1;
        let mut binder = Binder::new(&mut param_offset);
        let id_column = self.relation.column("id");

        let rows: Vec<String> = records
            .iter()
            .map(|record| {
                let body = Value::Object(record.without(&["id".to_string()]).to_object());
                let mut slots = Vec::with_capacity(2);
                if with_id {
                    slots.push(match record.get("id") {
                        Some(id) => binder.bind(id_column, id.clone()),
                        None => "DEFAULT".to_string(),
                    });
                }
                slots.push(binder.push_json(&body, &body_type));
                format!("({})", slots.join(", "))
            })
            .collect();

        let mut columns = Vec::with_capacity(2);
        if with_id {
            columns.push("id".to_string());
        }
        columns.push(self.body_column.to_string());
        let names: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.relation.quoted_name(),
            names.join(", "),
            rows.join(", ")
        );
        sql.push_str(&self.on_conflict(options, &columns)?);
        sql.push_str(&self.returning(options)?);

        Ok(Statement::new(sql, binder.finish()))
    }

    fn on_conflict(&self, options: &QueryOptions, columns: &[String]) -> Result<String> {
        let target = match &options.on_conflict {
            None => return Ok(String::new()),
            Some(OnConflict::Ignore) => return Ok(" ON CONFLICT DO NOTHING".to_string()),
            Some(OnConflict::Update { target }) if target.is_empty() => &self.relation.primary_key,
            Some(OnConflict::Update { target }) => target,
        };
        if target.is_empty() {
            return Err(DataMapperError::unsupported(
                self.relation.qualified_name(),
                "upsert needs a conflict target or a primary key",
            ));
        }
        self.check_columns(target.iter().map(String::as_str))?;

        let targets: Vec<String> = target.iter().map(|c| quote_identifier(c)).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !target.contains(c))
            .map(|c| format!("{0} = EXCLUDED.{0}", quote_identifier(c)))
            .collect();

        if updates.is_empty() {
            return Ok(format!(" ON CONFLICT ({}) DO NOTHING", targets.join(", ")));
        }
        Ok(format!(
            " ON CONFLICT ({}) DO UPDATE SET {}",
            targets.join(", "),
            updates.join(", ")
        ))
    }

    /// Update rows matching `criteria` with the defined fields of `changes`.
    ///
    /// Document builders merge the changes into the body instead.
    pub fn update(&self, criteria: &Criteria, changes: &Record, options: &QueryOptions) -> Result<Statement> {
        self.require_document()?;
        if self.document {
            return self.modify(criteria, changes, None, options);
        }
        if changes.is_empty() {
            return Err(DataMapperError::validation(format!(
                "No fields to update in {}",
                self.relation.qualified_name()
            )));
        }
        self.check_columns(changes.defined().map(|(name, _)| name))?;

        let mut param_offset = 1;
        let mut binder = Binder::new(&mut param_offset);
        let assignments: Vec<String> = changes
            .defined()
            .map(|(name, value)| {
                format!(
                    "{} = {}",
                    quote_identifier(name),
                    binder.bind(self.relation.column(name), value.clone())
                )
            })
            .collect();
        let mut params = binder.finish();

        let (clause, where_params) = self.compile_where(criteria, options, &mut param_offset)?;
        params.extend(where_params);

        let mut sql = format!("UPDATE {} SET {}", self.table(options), assignments.join(", "));
        if clause != "TRUE" {
            sql.push_str(&format!(" WHERE {}", clause));
        }
        sql.push_str(&self.returning(options)?);

        Ok(Statement::new(sql, params).embedding(criteria))
    }

    /// Key criteria for a record, or `None` when some key field is missing.
    ///
    /// Fails for relations without a primary key.
    pub fn key_criteria(&self, record: &Record) -> Result<Option<Criteria>> {
        if !self.relation.has_primary_key() {
            return Err(DataMapperError::unsupported(
                self.relation.qualified_name(),
                "identity-based writes require a primary key",
            ));
        }
        let mut key = serde_json::Map::new();
        for pk in &self.relation.primary_key {
            match record.get(pk) {
                Some(Value::Null) | None => return Ok(None),
                Some(value) => {
                    key.insert(pk.clone(), value.clone());
                }
            }
        }
        Ok(Some(Criteria::Map(key)))
    }

    /// Update the row identified by the record's primary key fields
    pub fn update_by_key(&self, record: &Record, options: &QueryOptions) -> Result<Statement> {
        let criteria = self.key_criteria(record)?.ok_or_else(|| {
            DataMapperError::validation(format!(
                "Missing primary key value for {} ({})",
                self.relation.qualified_name(),
                self.relation.primary_key.join(", ")
            ))
        })?;
        let changes = record.without(&self.relation.primary_key);
        self.update(&criteria, &changes, options)
    }

    /// Update when every key field is present, insert otherwise
    pub fn save(&self, record: &Record, options: &QueryOptions) -> Result<Statement> {
        match self.key_criteria(record)? {
            Some(_) => self.update_by_key(record, options),
            None => self.insert(std::slice::from_ref(record), options),
        }
    }

    pub fn delete(&self, criteria: &Criteria, options: &QueryOptions) -> Result<Statement> {
        self.require_document()?;
        let mut param_offset = 1;
        let (clause, params) = self.compile_where(criteria, options, &mut param_offset)?;

        let mut sql = format!("DELETE FROM {}", self.table(options));
        if clause != "TRUE" {
            sql.push_str(&format!(" WHERE {}", clause));
        }
        sql.push_str(&self.returning(options)?);

        Ok(Statement::new(sql, params).embedding(criteria))
    }

    /// Merge the defined fields of `changes` into a JSON column (the body
    /// column by default) of every matching row
    pub fn modify(
        &self,
        criteria: &Criteria,
        changes: &Record,
        column: Option<&str>,
        options: &QueryOptions,
    ) -> Result<Statement> {
        self.require_document()?;
        let name = column.unwrap_or(self.body_column);
        let target = self
            .relation
            .column(name)
            .filter(|c| c.is_json())
            .ok_or_else(|| {
                DataMapperError::validation(format!(
                    "{} has no JSON column '{}' to modify",
                    self.relation.qualified_name(),
                    name
                ))
            })?;
        if changes.is_empty() {
            return Err(DataMapperError::validation(format!(
                "No fields to merge into {}.{}",
                self.relation.qualified_name(),
                name
            )));
        }

        let mut param_offset = 1;
        let mut binder = Binder::new(&mut param_offset);
        let patch = binder.push_json(&Value::Object(changes.to_object()), "jsonb");
        let mut params = binder.finish();

        let column_sql = quote_identifier(name);
        let mut merged = format!("COALESCE({}::jsonb, '{{}}'::jsonb) || {}", column_sql, patch);
        if target.data_type != "jsonb" {
            merged = format!("({})::{}", merged, target.data_type);
        }

        let (clause, where_params) = self.compile_where(criteria, options, &mut param_offset)?;
        params.extend(where_params);

        let mut sql = format!("UPDATE {} SET {} = {}", self.table(options), column_sql, merged);
        if clause != "TRUE" {
            sql.push_str(&format!(" WHERE {}", clause));
        }
        sql.push_str(&self.returning(options)?);

        Ok(Statement::new(sql, params).embedding(criteria))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Column, EntityKind};
    use crate::options::OrderBy;
    use serde_json::json;

    fn products() -> Relation {
        Relation::new(
            "public",
            "products",
            EntityKind::Table,
            vec![
                Column::new("id", "integer").not_null(),
                Column::new("name", "text"),
                Column::new("price", "numeric"),
                Column::new("sku", "uuid"),
                Column::new("attrs", "jsonb"),
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

    fn logs() -> Relation {
        Relation::new(
            "audit",
            "logs",
            EntityKind::Table,
            vec![Column::new("at", "timestamp with time zone"), Column::new("msg", "text")],
        )
    }

    // =========================================================================
    // SELECT Tests
    // =========================================================================

    #[test]
    fn test_select_defaults_to_key_order() {
        let rel = products();
        let stmt = QueryBuilder::new(&rel)
            .select(&Criteria::all(), &QueryOptions::new())
            .unwrap();
        assert_eq!(stmt.sql, "SELECT * FROM \"public\".\"products\" ORDER BY \"id\" ASC");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_select_keyless_has_no_default_order() {
        let rel = logs();
        let stmt = QueryBuilder::new(&rel)
            .select(&Criteria::all(), &QueryOptions::new())
            .unwrap();
        assert_eq!(stmt.sql, "SELECT * FROM \"audit\".\"logs\"");
    }

    #[test]
    fn test_select_with_everything() {
        let rel = products();
        let options = QueryOptions::new()
            .only()
            .columns(["id", "attrs->>'color'"])
            .order(OrderBy::desc("price").nulls(Nulls::Last))
            .order(OrderBy::asc("attrs->>'rank'").cast("int"))
            .limit(10)
            .offset(20);
        let stmt = QueryBuilder::new(&rel)
            .select(&Criteria::from(json!({"name ilike": "w%"})), &options)
            .unwrap();

        assert_eq!(
            stmt.sql,
            "SELECT \"id\", \"attrs\"->>'color' AS \"color\" FROM ONLY \"public\".\"products\" \
             WHERE \"name\" ILIKE $1 ORDER BY \"price\" DESC NULLS LAST, (\"attrs\"->>'rank')::int ASC \
             LIMIT 10 OFFSET 20"
        );
        assert_eq!(stmt.params, vec![json!("w%")]);
    }

    #[test]
    fn test_non_positive_limit_and_offset_are_omitted() {
        let rel = products();
        let stmt = QueryBuilder::new(&rel)
            .select(&Criteria::all(), &QueryOptions::new().limit(0).offset(-5))
            .unwrap();
        assert!(!stmt.sql.contains("LIMIT"));
        assert!(!stmt.sql.contains("OFFSET"));
    }

    #[test]
    fn test_invalid_order_cast_rejected() {
        let rel = products();
        let result = QueryBuilder::new(&rel).select(
            &Criteria::all(),
            &QueryOptions::new().order(OrderBy::asc("price").cast("int; drop table x")),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_select_one_adds_limit() {
        let rel = products();
        let stmt = QueryBuilder::new(&rel)
            .select_one(&Criteria::key(5), &QueryOptions::new())
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"public\".\"products\" WHERE \"id\" = $1 ORDER BY \"id\" ASC LIMIT 1"
        );
    }

    #[test]
    fn test_count() {
        let rel = products();
        let stmt = QueryBuilder::new(&rel)
            .count(&Criteria::from(json!({"price >": 5})), &QueryOptions::new().limit(3))
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(*) AS \"count\" FROM \"public\".\"products\" WHERE \"price\" > $1"
        );
    }

    #[test]
    fn test_raw_criteria_leaves_parameters_untyped() {
        let rel = products();
        let builder = QueryBuilder::new(&rel);
        let options = QueryOptions::new();

        let raw = Criteria::raw("created_at > $1", vec![json!("2024-01-01")]);
        let stmt = builder.select(&raw, &options).unwrap();
        assert!(stmt.untyped);
        assert_eq!(stmt.params, vec![json!("2024-01-01")]);
        assert!(builder.count(&raw, &options).unwrap().untyped);
        assert!(builder.delete(&raw, &options).unwrap().untyped);

        let mapped = builder.select(&Criteria::from(json!({"price >": 5})), &options).unwrap();
        assert!(!mapped.untyped);
    }

    #[test]
    fn test_build_is_deterministic() {
        let rel = products();
        let criteria = Criteria::from(json!({"name": "a", "price <=": 9.5, "id": [1, 2]}));
        let options = QueryOptions::new().order(OrderBy::desc("name")).limit(5);
        let builder = QueryBuilder::new(&rel);

        let first = builder.select(&criteria, &options).unwrap();
        for _ in 0..3 {
            assert_eq!(builder.select(&criteria, &options).unwrap(), first);
        }
    }

    // =========================================================================
    // Document Tests
    // =========================================================================

    #[test]
    fn test_document_select() {
        let rel = docs();
        let stmt = QueryBuilder::new(&rel)
            .document(true)
            .select(
                &Criteria::from(json!({"title": "X"})),
                &QueryOptions::new().order(OrderBy::desc("published")),
            )
            .unwrap();

        assert_eq!(
            stmt.sql,
            "SELECT COALESCE(\"body\"::jsonb, '{}'::jsonb) || jsonb_build_object('id', \"id\") AS \"document\" \
             FROM \"public\".\"docs\" WHERE \"body\"->>'title' = $1 ORDER BY \"body\"->>'published' DESC"
        );
        assert_eq!(stmt.params, vec![json!("X")]);
    }

    #[test]
    fn test_document_select_with_containment() {
        let rel = docs();
        let stmt = QueryBuilder::new(&rel)
            .document(true)
            .select(
                &Criteria::from(json!({"title": "X"})),
                &QueryOptions::new().document_containment(true),
            )
            .unwrap();
        assert!(stmt.sql.contains("WHERE \"body\" @> $1::jsonb"));
        assert_eq!(stmt.params, vec![json!("{\"title\":\"X\"}")]);
    }

    #[test]
    fn test_document_mode_on_plain_table_is_rejected() {
        let rel = products();
        let result = QueryBuilder::new(&rel)
            .document(true)
            .select(&Criteria::all(), &QueryOptions::new());
        assert!(matches!(result, Err(DataMapperError::Unsupported { .. })));
    }

    #[test]
    fn test_order_body_on_relational_select() {
        let rel = docs();
        let stmt = QueryBuilder::new(&rel)
            .select(
                &Criteria::all(),
                &QueryOptions::new().order_body(true).order(OrderBy::asc("rank").cast("int")),
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"public\".\"docs\" ORDER BY (\"body\"->>'rank')::int ASC"
        );
    }

    #[test]
    fn test_order_body_rewrites_column_names_too() {
        let rel = docs();
        let options = QueryOptions::new()
            .order_body(true)
            .order(OrderBy::desc("id"))
            .order(OrderBy::asc("body->>'title'"));
        let stmt = QueryBuilder::new(&rel).select(&Criteria::all(), &options).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"public\".\"docs\" ORDER BY \"body\"->>'id' DESC, \"body\"->>'title' ASC"
        );

        let stmt = QueryBuilder::new(&rel)
            .document(true)
            .select(&Criteria::all(), &QueryOptions::new().order(OrderBy::desc("id")))
            .unwrap();
        assert!(stmt.sql.ends_with("ORDER BY \"id\" DESC"));
    }

    #[test]
    fn test_insert_document() {
        let rel = docs();
        let record = Record::new()
            .field("title", json!("Hello"))
            .field("draft", None)
            .field("tags", json!(["a"]));
        let stmt = QueryBuilder::new(&rel)
            .document(true)
            .insert(&[record], &QueryOptions::new())
            .unwrap();

        assert_eq!(
            stmt.sql,
            "INSERT INTO \"public\".\"docs\" (\"body\") VALUES ($1::jsonb) \
             RETURNING COALESCE(\"body\"::jsonb, '{}'::jsonb) || jsonb_build_object('id', \"id\") AS \"document\""
        );
        assert_eq!(stmt.params, vec![json!("{\"title\":\"Hello\",\"tags\":[\"a\"]}")]);
    }

    #[test]
    fn test_update_document_merges_body() {
        let rel = docs();
        let record = Record::new()
            .field("id", json!(4))
            .field("title", json!("New"))
            .field("subtitle", Value::Null)
            .field("draft", None);
        let stmt = QueryBuilder::new(&rel)
            .document(true)
            .update_by_key(&record, &QueryOptions::new())
            .unwrap();

        assert_eq!(
            stmt.sql,
            "UPDATE \"public\".\"docs\" SET \"body\" = COALESCE(\"body\"::jsonb, '{}'::jsonb) || $1::jsonb \
             WHERE \"id\" = $2 \
             RETURNING COALESCE(\"body\"::jsonb, '{}'::jsonb) || jsonb_build_object('id', \"id\") AS \"document\""
        );
        assert_eq!(
            stmt.params,
            vec![json!("{\"title\":\"New\",\"subtitle\":null}"), json!(4)]
        );
    }

    #[test]
    fn test_modify_named_column() {
        let rel = products();
        let stmt = QueryBuilder::new(&rel)
            .modify(
                &Criteria::from(json!({"name": "w"})),
                &Record::new().field("color", json!("red")),
                Some("attrs"),
                &QueryOptions::new().columns(["id"]),
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"public\".\"products\" SET \"attrs\" = COALESCE(\"attrs\"::jsonb, '{}'::jsonb) || $1::jsonb \
             WHERE \"name\" = $2 RETURNING \"id\""
        );

        let result = QueryBuilder::new(&rel).modify(
            &Criteria::all(),
            &Record::new().field("x", json!(1)),
            Some("name"),
            &QueryOptions::new(),
        );
        assert!(result.is_err());
    }

    // =========================================================================
    // INSERT Tests
    // =========================================================================

    #[test]
    fn test_insert_omits_undefined_and_keeps_null() {
        let rel = products();
        let record = Record::new()
            .field("name", json!("Widget"))
            .field("price", None)
            .field("sku", Value::Null);
        let stmt = QueryBuilder::new(&rel)
            .insert(&[record], &QueryOptions::new())
            .unwrap();

        assert_eq!(
            stmt.sql,
            "INSERT INTO \"public\".\"products\" (\"name\", \"sku\") VALUES ($1, $2::uuid) RETURNING *"
        );
        assert_eq!(stmt.params, vec![json!("Widget"), Value::Null]);
    }

    #[test]
    fn test_insert_many_uses_column_union() {
        let rel = products();
        let records = vec![
            Record::new().field("name", json!("a")),
            Record::new().field("price", json!(2)).field("name", json!("b")),
        ];
        let stmt = QueryBuilder::new(&rel)
            .insert(&records, &QueryOptions::new())
            .unwrap();

        assert_eq!(
            stmt.sql,
            "INSERT INTO \"public\".\"products\" (\"name\", \"price\") VALUES ($1, DEFAULT), ($2, $3) RETURNING *"
        );
        assert_eq!(stmt.params, vec![json!("a"), json!("b"), json!(2)]);
    }

    #[test]
    fn test_insert_empty_record() {
        let rel = products();
        let stmt = QueryBuilder::new(&rel)
            .insert(&[Record::new()], &QueryOptions::new())
            .unwrap();
        assert_eq!(stmt.sql, "INSERT INTO \"public\".\"products\" DEFAULT VALUES RETURNING *");

        assert!(
            QueryBuilder::new(&rel)
                .insert(&[Record::new(), Record::new()], &QueryOptions::new())
                .is_err()
        );
        assert!(QueryBuilder::new(&rel).insert(&[], &QueryOptions::new()).is_err());
    }

    #[test]
    fn test_insert_unknown_column_rejected() {
        let rel = products();
        let result = QueryBuilder::new(&rel)
            .insert(&[Record::new().field("nope", json!(1))], &QueryOptions::new());
        assert!(matches!(result, Err(DataMapperError::Validation(_))));
    }

    #[test]
    fn test_insert_on_conflict() {
        let rel = products();
        let record = Record::new().field("id", json!(1)).field("name", json!("a"));

        let stmt = QueryBuilder::new(&rel)
            .insert(
                std::slice::from_ref(&record),
                &QueryOptions::new().on_conflict(OnConflict::Ignore),
            )
            .unwrap();
        assert!(stmt.sql.ends_with("VALUES ($1, $2) ON CONFLICT DO NOTHING RETURNING *"));

        let stmt = QueryBuilder::new(&rel)
            .insert(
                &[record],
                &QueryOptions::new().on_conflict(OnConflict::Update { target: vec![] }),
            )
            .unwrap();
        assert!(
            stmt.sql
                .ends_with("ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\" RETURNING *")
        );
    }

    // =========================================================================
    // UPDATE / DELETE / SAVE Tests
    // =========================================================================

    #[test]
    fn test_update_params_precede_criteria() {
        let rel = products();
        let stmt = QueryBuilder::new(&rel)
            .update(
                &Criteria::from(json!({"price <": 3})),
                &Record::new().field("name", json!("cheap")).field("sku", None),
                &QueryOptions::new(),
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"public\".\"products\" SET \"name\" = $1 WHERE \"price\" < $2 RETURNING *"
        );
        assert_eq!(stmt.params, vec![json!("cheap"), json!(3)]);
    }

    #[test]
    fn test_update_without_fields_rejected() {
        let rel = products();
        let result = QueryBuilder::new(&rel).update(
            &Criteria::all(),
            &Record::new().field("name", None),
            &QueryOptions::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_save_picks_insert_or_update() {
        let rel = products();
        let builder = QueryBuilder::new(&rel);

        let stmt = builder
            .save(&Record::new().field("name", json!("a")), &QueryOptions::new())
            .unwrap();
        assert!(stmt.sql.starts_with("INSERT INTO"));

        let stmt = builder
            .save(
                &Record::new().field("id", json!(9)).field("name", json!("a")),
                &QueryOptions::new(),
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"public\".\"products\" SET \"name\" = $1 WHERE \"id\" = $2 RETURNING *"
        );
        assert_eq!(stmt.params, vec![json!("a"), json!(9)]);
    }

    #[test]
    fn test_save_on_keyless_table_names_entity() {
        let rel = logs();
        let err = QueryBuilder::new(&rel)
            .save(&Record::new().field("msg", json!("x")), &QueryOptions::new())
            .unwrap_err();
        assert!(err.to_string().contains("audit.logs"));
        assert!(matches!(err, DataMapperError::Unsupported { .. }));
    }

    #[test]
    fn test_delete() {
        let rel = products();
        let stmt = QueryBuilder::new(&rel)
            .delete(&Criteria::key("12"), &QueryOptions::new().only())
            .unwrap();
        assert_eq!(
            stmt.sql,
            "DELETE FROM ONLY \"public\".\"products\" WHERE \"id\" = $1::integer RETURNING *"
        );
        assert_eq!(stmt.params, vec![json!("12")]);
    }
}
