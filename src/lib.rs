//! # runtara-data-mapper
//!
//! A catalog-reflecting data mapper for PostgreSQL.
//!
//! On connect the crate reads the system catalogs and builds a registry of every
//! table, view, materialized view, foreign table, sequence, function and enum it
//! is allowed to see. Callers then look entities up by name and read, write,
//! search or call them with plain JSON criteria instead of hand-written SQL.
//!
//! ## Features
//!
//! - **Schema Reflection**: Relations with columns and primary keys, sequences, function overloads and enum labels
//! - **Criteria Compiler**: `{"age >=": 21, "name like": "A%"}` style criteria turned into parameterized WHERE clauses
//! - **Document Tables**: Tables with an `id` key and a JSON `body` column read and written as plain documents
//! - **Full-Text Search**: Ranked multi-field search with stable paging
//! - **Decomposition**: Flat joined rows reshaped into nested object graphs
//! - **Transactions**: A unit of work on one reserved connection, rolled back on any error
//! - **Build Mode**: Any operation can return its `{sql, params}` instead of executing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use runtara_data_mapper::{Database, DatabaseConfig, QueryOptions, Record};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DatabaseConfig::builder("postgres://localhost/mydb")
//!         .schemas("public")
//!         .build();
//!     let db = Database::connect(config).await?;
//!
//!     let products = db.writable("products")?;
//!     products
//!         .insert(
//!             &[Record::new().field("sku", json!("WIDGET-001")).field("price", json!(29.99))],
//!             &QueryOptions::new(),
//!         )
//!         .await?;
//!
//!     let cheap = products
//!         .find(json!({"price <": 50}), &QueryOptions::new().limit(10))
//!         .await?
//!         .into_rows();
//!     println!("{} cheap products", cheap.len());
//!
//!     db.transaction(async |tx| {
//!         let products = tx.writable("products")?;
//!         products.delete(json!({"sku": "WIDGET-001"}), &QueryOptions::new()).await?;
//!         Ok(())
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Compiling Without a Connection
//!
//! Statement building is pure and works on catalog metadata alone:
//!
//! ```rust
//! use runtara_data_mapper::entity::{Column, EntityKind, Relation};
//! use runtara_data_mapper::{Criteria, QueryBuilder, QueryOptions};
//! use serde_json::json;
//!
//! let users = Relation::new(
//!     "public",
//!     "users",
//!     EntityKind::Table,
//!     vec![Column::new("id", "integer"), Column::new("name", "text")],
//! )
//! .with_primary_key(["id"]);
//!
//! let stmt = QueryBuilder::new(&users)
//!     .select(&Criteria::from(json!({"name": "ann"})), &QueryOptions::new())
//!     .unwrap();
//! assert_eq!(stmt.sql, r#"SELECT * FROM "public"."users" WHERE "name" = $1 ORDER BY "id" ASC"#);
//! assert_eq!(stmt.params, vec![json!("ann")]);
//! ```

pub mod access;
mod bind;
pub mod command;
pub mod config;
pub mod database;
pub mod decompose;
pub mod entity;
pub mod error;
pub mod options;
pub mod registry;
pub mod sql;

// Re-export main types for convenience
pub use access::{Executable, Readable, SequenceHandle, Writable};
pub use command::{Command, CommandTree, ParameterShape};
pub use config::{DatabaseConfig, DatabaseConfigBuilder, FilterSpec};
pub use database::{Database, RowStream};
pub use decompose::{DecomposeSchema, decompose};
pub use entity::{Capability, Entity, EntityKind};
pub use error::{DataMapperError, Result};
pub use options::{
    Direction, Nulls, OnConflict, OrderBy, Output, QueryOptions, Record, SearchRequest, TsParser,
};
pub use registry::{Registry, SchemaTree};

// Re-export SQL utilities for advanced users
pub use sql::{
    Criteria, CriteriaCompiler, QueryBuilder, Statement, build_criteria_clause, build_search,
    is_pk_search, quote_identifier,
};
