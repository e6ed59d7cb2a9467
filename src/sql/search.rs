//! Full-text search statements
//!
//! Searches match `to_tsvector(concat_ws(' ', fields...))` against a query
//! built from the search term, conjoined with any extra criteria. Results are
//! ranked unless an explicit order is given, and always end with a stable
//! tiebreaker so that offset paging is reproducible.

use crate::error::{DataMapperError, Result};
use crate::options::{QueryOptions, SearchRequest};
use crate::sql::Statement;
use crate::sql::field::FieldRef;
use crate::sql::params::Binder;
use crate::sql::query::QueryBuilder;
use crate::sql::sanitize::quote_identifier;

/// Column holding a precomputed tsvector for document tables
const SEARCH_COLUMN: &str = "search";

/// Build a search statement for the builder's relation
pub fn build_search(
    query: &QueryBuilder<'_>,
    request: &SearchRequest,
    options: &QueryOptions,
) -> Result<Statement> {
    let relation = query.relation();
    if query.is_document() && !relation.is_document {
        return Err(DataMapperError::unsupported(
            relation.qualified_name(),
            "document search requires a document table",
        ));
    }
    if request.term.trim().is_empty() {
        return Err(DataMapperError::validation(format!(
            "Search of {} needs a non-empty term",
            relation.qualified_name()
        )));
    }

    let mut param_offset = 1;
    let mut binder = Binder::new(&mut param_offset);
    let language = request
        .language
        .as_ref()
        .map(|lang| format!("{}::regconfig", binder.push(serde_json::Value::String(lang.clone()))));
    let term = binder.push(serde_json::Value::String(request.term.clone()));

    let vector = if request.fields.is_empty() {
        match relation.column(SEARCH_COLUMN) {
            Some(_) if query.is_document() => quote_identifier(SEARCH_COLUMN),
            _ => {
                return Err(DataMapperError::validation(format!(
                    "Search of {} needs at least one field",
                    relation.qualified_name()
                )));
            }
        }
    } else {
        let mut exprs = Vec::with_capacity(request.fields.len());
        for name in &request.fields {
            let mut field = FieldRef::parse(name)?;
            if query.is_document() && relation.column(&field.column).is_none() {
                field = field.into_document(query.body());
            } else if !field.has_path() && relation.column(&field.column).is_none() {
                return Err(DataMapperError::validation(format!(
                    "Unknown search field '{}' for {}",
                    name,
                    relation.qualified_name()
                )));
            }
            exprs.push(field.to_sql());
        }
        let document = format!("concat_ws(' ', {})", exprs.join(", "));
        match &language {
            Some(lang) => format!("to_tsvector({}, {})", lang, document),
            None => format!("to_tsvector({})", document),
        }
    };

    let tsquery = match &language {
        Some(lang) => format!("{}({}, {})", request.parser.function(), lang, term),
        None => format!("{}({})", request.parser.function(), term),
    };
    let mut params = binder.finish();

    let (clause, where_params) = query.compile_where(&request.where_, options, &mut param_offset)?;
    params.extend(where_params);

    let mut sql = format!(
        "SELECT {} FROM {} WHERE {} @@ {}",
        query.projection(options)?,
        query.table(options),
        vector,
        tsquery
    );
    if clause != "TRUE" {
        sql.push_str(&format!(" AND {}", clause));
    }

    let mut order = query.order_terms(options)?;
    if order.is_empty() {
        order.push(format!("ts_rank({}, {}) DESC", vector, tsquery));
    }
    order.extend(tiebreaker(query));
    sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    sql.push_str(&QueryBuilder::pagination(options));

    Ok(Statement::new(sql, params).embedding(&request.where_))
}

/// Primary key ascending, or every orderable column for keyless relations
fn tiebreaker(query: &QueryBuilder<'_>) -> Vec<String> {
    let key = query.key_order();
    if !key.is_empty() {
        return key;
    }
    query
        .relation()
        .columns
        .iter()
        .filter(|c| c.data_type != "json" && c.data_type != "xml")
        .map(|c| format!("{} ASC", quote_identifier(&c.name)))
        .collect()
}
