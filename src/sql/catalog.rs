//! Catalog reflection
//!
//! Reads relations, sequences, functions and enum types from the PostgreSQL
//! system catalogs. Name filters are bound as comma-delimited text parameters
//! and applied inside the catalog queries.

use std::sync::LazyLock;

use indexmap::IndexMap;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};

use crate::config::DatabaseConfig;
use crate::entity::{Column, EntityKind, EnumType, Function, FunctionSignature, Relation, Sequence};
use crate::error::{DataMapperError, Result};

/// Everything reflected in one pass
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub relations: Vec<Relation>,
    pub sequences: Vec<Sequence>,
    pub functions: Vec<Function>,
    pub enums: Vec<EnumType>,
}

impl Catalog {
    pub fn len(&self) -> usize {
        self.relations.len() + self.sequences.len() + self.functions.len() + self.enums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const SYSTEM_SCHEMAS: &str = "n.nspname NOT IN ('pg_catalog', 'information_schema') \
     AND n.nspname NOT LIKE 'pg\\_toast%' AND n.nspname NOT LIKE 'pg\\_temp%'";

/// Split a bound filter parameter into a text array
fn filter_list(param: usize) -> String {
    format!("string_to_array(replace(${}::text, ' ', ''), ',')", param)
}

/// `schemas` restriction on `schema_expr`, bound at `$param`
fn schema_filter(schema_expr: &str, param: usize) -> String {
    format!(
        "(${p}::text = '' OR {expr} = ANY({list}))",
        p = param,
        expr = schema_expr,
        list = filter_list(param)
    )
}

/// Whitelist / blacklist / exceptions on an object name.
///
/// Parameters are bound in order: blacklist, whitelist, exceptions. A
/// non-empty whitelist admits exactly the listed names and ignores the
/// blacklist; otherwise blacklisted names are dropped unless excepted.
fn name_filter(name_expr: &str, qualified_expr: &str, first_param: usize) -> String {
    let (black, white, except) = (first_param, first_param + 1, first_param + 2);
    let matches = |param: usize, op: &str| {
        format!(
            "({name} {op} ANY({list}) OR {qualified} {op} ANY({list}))",
            name = name_expr,
            qualified = qualified_expr,
            op = op,
            list = filter_list(param)
        )
    };
    format!(
        "(CASE WHEN ${white}::text <> '' THEN {whitelisted} \
         ELSE (${black}::text = '' OR NOT {blacklisted} OR (${except}::text <> '' AND {excepted})) END)",
        white = white,
        black = black,
        except = except,
        whitelisted = matches(white, "="),
        blacklisted = matches(black, "LIKE"),
        excepted = matches(except, "LIKE"),
    )
}

static RELATIONS_SQL: LazyLock<String> = LazyLock::new(|| {
    format!(
        r#"SELECT n.nspname::text AS schema,
       c.relname::text AS name,
       c.relkind::text AS kind,
       COALESCE((
           SELECT json_agg(json_build_object(
                      'name', a.attname::text,
                      'type', format_type(a.atttypid, a.atttypmod),
                      'nullable', NOT a.attnotnull
                  ) ORDER BY a.attnum)
           FROM pg_attribute a
           WHERE a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped
       ), '[]'::json) AS columns,
       COALESCE((
           SELECT array_agg(a.attname::text ORDER BY k.ord)
           FROM pg_index i
           CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
           JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
           WHERE i.indrelid = c.oid AND i.indisprimary
       ), ARRAY[]::text[]) AS primary_key
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE c.relkind IN ('r', 'p', 'v', 'm', 'f')
  AND {system}
  AND {schemas}
  AND {names}
  AND (NOT $5::boolean OR c.relkind <> 'm')
ORDER BY n.nspname, c.relname"#,
        system = SYSTEM_SCHEMAS,
        schemas = schema_filter("n.nspname", 1),
        names = name_filter("c.relname", "n.nspname || '.' || c.relname", 2),
    )
});

static SEQUENCES_SQL: LazyLock<String> = LazyLock::new(|| {
    format!(
        r#"SELECT s.schemaname::text AS schema,
       s.sequencename::text AS name,
       s.last_value,
       s.start_value,
       s.min_value,
       s.max_value,
       s.increment_by AS increment
FROM pg_sequences s
WHERE {schemas}
  AND {names}
ORDER BY s.schemaname, s.sequencename"#,
        schemas = schema_filter("s.schemaname", 1),
        names = name_filter("s.sequencename", "s.schemaname || '.' || s.sequencename", 2),
    )
});

static FUNCTIONS_SQL: LazyLock<String> = LazyLock::new(|| {
    format!(
        r#"SELECT n.nspname::text AS schema,
       p.proname::text AS name,
       ARRAY(
           SELECT format_type(t.oid, NULL)
           FROM unnest(p.proargtypes::oid[]) WITH ORDINALITY AS t(oid, ord)
           ORDER BY t.ord
       ) AS arg_types,
       p.pronargdefaults::int4 AS default_count,
       p.provariadic <> 0 AS variadic,
       format_type(p.prorettype, NULL) AS return_type,
       p.proretset AS returns_set,
       p.prokind = 'p' AS procedure
FROM pg_proc p
JOIN pg_namespace n ON n.oid = p.pronamespace
WHERE p.prokind IN ('f', 'p')
  AND {system}
  AND {schemas}
  AND {names}
ORDER BY n.nspname, p.proname, p.pronargs"#,
        system = SYSTEM_SCHEMAS,
        schemas = schema_filter("n.nspname", 1),
        names = name_filter("p.proname", "n.nspname || '.' || p.proname", 2),
    )
});

static ENUMS_SQL: LazyLock<String> = LazyLock::new(|| {
    format!(
        r#"SELECT n.nspname::text AS schema,
       t.typname::text AS name,
       array_agg(e.enumlabel::text ORDER BY e.enumsortorder) AS labels
FROM pg_type t
JOIN pg_enum e ON e.enumtypid = t.oid
JOIN pg_namespace n ON n.oid = t.typnamespace
WHERE {system}
  AND {schemas}
GROUP BY n.nspname, t.typname
ORDER BY n.nspname, t.typname"#,
        system = SYSTEM_SCHEMAS,
        schemas = schema_filter("n.nspname", 1),
    )
});

/// Reflect every entity admitted by the configured filters.
///
/// Any catalog query failure aborts the whole reflection.
#[instrument(skip_all, fields(schemas = %config.schemas.as_str()))]
pub async fn reflect(pool: &PgPool, config: &DatabaseConfig) -> Result<Catalog> {
    let rows = sqlx::query(RELATIONS_SQL.as_str())
        .bind(config.schemas.as_str())
        .bind(config.blacklist.as_str())
        .bind(config.whitelist.as_str())
        .bind(config.exceptions.as_str())
        .bind(config.exclude_matviews)
        .fetch_all(pool)
        .await?;
    let relations = rows
        .iter()
        .map(|row| relation_from_row(row, &config.document_body_column))
        .collect::<Result<Vec<_>>>()?;
    debug!(count = relations.len(), "Reflected relations");

    let rows = sqlx::query(SEQUENCES_SQL.as_str())
        .bind(config.schemas.as_str())
        .bind(config.blacklist.as_str())
        .bind(config.whitelist.as_str())
        .bind(config.exceptions.as_str())
        .fetch_all(pool)
        .await?;
    let sequences = rows.iter().map(sequence_from_row).collect::<Result<Vec<_>>>()?;

    let functions = if config.exclude_functions {
        Vec::new()
    } else {
        let rows = sqlx::query(FUNCTIONS_SQL.as_str())
            .bind(config.schemas.as_str())
            .bind(config.function_blacklist.as_str())
            .bind(config.function_whitelist.as_str())
            .bind("")
            .fetch_all(pool)
            .await?;
        let overloads = rows.iter().map(overload_from_row).collect::<Result<Vec<_>>>()?;
        group_overloads(overloads)
    };

    let rows = sqlx::query(ENUMS_SQL.as_str())
        .bind(config.schemas.as_str())
        .fetch_all(pool)
        .await?;
    let enums = rows
        .iter()
        .map(|row| -> Result<EnumType> {
            Ok(EnumType {
                schema: row.try_get("schema")?,
                name: row.try_get("name")?,
                labels: row.try_get("labels")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let catalog = Catalog {
        relations,
        sequences,
        functions,
        enums,
    };
    info!(
        relations = catalog.relations.len(),
        sequences = catalog.sequences.len(),
        functions = catalog.functions.len(),
        enums = catalog.enums.len(),
        "Catalog reflected"
    );
    Ok(catalog)
}

fn relation_from_row(row: &PgRow, body_column: &str) -> Result<Relation> {
    let schema: String = row.try_get("schema")?;
    let name: String = row.try_get("name")?;
    let relkind: String = row.try_get("kind")?;
    let columns: serde_json::Value = row.try_get("columns")?;
    let primary_key: Vec<String> = row.try_get("primary_key")?;

    let kind = EntityKind::from_relkind(&relkind).ok_or_else(|| {
        DataMapperError::configuration(format!(
            "Unexpected relation kind '{}' for {}.{}",
            relkind, schema, name
        ))
    })?;
    let columns: Vec<Column> = serde_json::from_value(columns)?;

    Ok(Relation::new(schema, name, kind, columns)
        .with_primary_key(primary_key)
        .detect_document(body_column))
}

fn sequence_from_row(row: &PgRow) -> Result<Sequence> {
    Ok(Sequence {
        schema: row.try_get("schema")?,
        name: row.try_get("name")?,
        last_value: row.try_get("last_value")?,
        start_value: row.try_get("start_value")?,
        min_value: row.try_get("min_value")?,
        max_value: row.try_get("max_value")?,
        increment: row.try_get("increment")?,
    })
}

fn overload_from_row(row: &PgRow) -> Result<(String, String, FunctionSignature)> {
    let default_count: i32 = row.try_get("default_count")?;
    Ok((
        row.try_get("schema")?,
        row.try_get("name")?,
        FunctionSignature {
            arg_types: row.try_get("arg_types")?,
            default_count: default_count.max(0) as usize,
            variadic: row.try_get("variadic")?,
            return_type: row.try_get("return_type")?,
            returns_set: row.try_get("returns_set")?,
            procedure: row.try_get("procedure")?,
        },
    ))
}

/// Collect overloads under one function per schema and name
fn group_overloads(overloads: Vec<(String, String, FunctionSignature)>) -> Vec<Function> {
    let mut grouped: IndexMap<(String, String), Vec<FunctionSignature>> = IndexMap::new();
    for (schema, name, signature) in overloads {
        grouped.entry((schema, name)).or_default().push(signature);
    }
    grouped
        .into_iter()
        .map(|((schema, name), overloads)| Function {
            schema,
            name,
            overloads,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(args: &[&str]) -> FunctionSignature {
        FunctionSignature {
            arg_types: args.iter().map(|s| s.to_string()).collect(),
            default_count: 0,
            variadic: false,
            return_type: "integer".to_string(),
            returns_set: false,
            procedure: false,
        }
    }

    #[test]
    fn test_group_overloads_by_schema_and_name() {
        let functions = group_overloads(vec![
            ("public".into(), "area".into(), sig(&["integer"])),
            ("public".into(), "area".into(), sig(&["integer", "integer"])),
            ("audit".into(), "area".into(), sig(&[])),
            ("public".into(), "now_utc".into(), sig(&[])),
        ]);

        assert_eq!(functions.len(), 3);
        assert_eq!(functions[0].qualified_name(), "public.area");
        assert_eq!(functions[0].overloads.len(), 2);
        assert_eq!(functions[1].qualified_name(), "audit.area");
        assert_eq!(functions[2].name, "now_utc");
    }

    #[test]
    fn test_schema_filter_sql() {
        assert_eq!(
            schema_filter("n.nspname", 1),
            "($1::text = '' OR n.nspname = ANY(string_to_array(replace($1::text, ' ', ''), ',')))"
        );
    }

    #[test]
    fn test_name_filter_binds_three_params() {
        let sql = name_filter("c.relname", "n.nspname || '.' || c.relname", 2);
        assert!(sql.starts_with("(CASE WHEN $3::text <> ''"));
        assert!(sql.contains("c.relname LIKE ANY(string_to_array(replace($2::text"));
        assert!(sql.contains("$4::text <> ''"));
        assert!(!sql.contains("$5"));
    }

    #[test]
    fn test_catalog_queries_number_params_consistently() {
        assert!(RELATIONS_SQL.contains("$5::boolean"));
        assert!(!SEQUENCES_SQL.contains("$5"));
        assert!(FUNCTIONS_SQL.contains("p.prokind IN ('f', 'p')"));
        assert!(!ENUMS_SQL.contains("$2"));
    }
}
