//! Database handle
//!
//! `Database` owns the connection pool, the entity registry and the command
//! tree. It is cheap to clone; every clone shares the same pool and registry.
//! Inside `transaction` the handle is rebound to one reserved connection, and
//! every statement issued through it (or through access handles obtained from
//! it) runs on that connection.

use std::sync::{Arc, PoisonError, RwLock};

use futures_util::TryStreamExt;
use futures_util::stream::{BoxStream, Stream};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map, Number, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column as _, Decode, PgPool, Postgres, Row, Type, TypeInfo as _};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::access::{Executable, Readable, SequenceHandle, Writable};
use crate::bind::{bind_params, parameter_types};
use crate::command::{Command, CommandTree};
use crate::config::DatabaseConfig;
use crate::decompose::decompose;
use crate::entity::{Capability, Entity};
use crate::error::{DataMapperError, Result};
use crate::options::{Output, QueryOptions};
use crate::registry::{Registry, SchemaTree};
use crate::sql::Statement;
use crate::sql::catalog::reflect;

/// Lazily fetched rows, decoded to JSON objects
pub type RowStream = BoxStream<'static, Result<Value>>;

type SharedTransaction = Arc<Mutex<Option<sqlx::Transaction<'static, Postgres>>>>;

/// Where statements are sent
#[derive(Clone)]
enum Connection {
    Pool,
    /// Taken when the transaction finishes
    Transaction(SharedTransaction),
}

/// Handle to a reflected database
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    config: Arc<DatabaseConfig>,
    registry: Arc<Registry>,
    commands: Arc<RwLock<CommandTree>>,
    connection: Connection,
}

impl Database {
    /// Connect, reflect the catalog and build the registry
    pub async fn connect(config: DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|e| DataMapperError::Connection(format!("Database connection failed: {}", e)))?;

        Self::from_pool(pool, config).await
    }

    /// Create a handle over an existing pool
    pub async fn from_pool(pool: PgPool, config: DatabaseConfig) -> Result<Self> {
        let tree = SchemaTree::build(reflect(&pool, &config).await?)?;
        let registry = Registry::new(tree, config.default_schema.clone());

        Ok(Self {
            pool,
            config: Arc::new(config),
            registry: Arc::new(registry),
            commands: Arc::new(RwLock::new(CommandTree::new())),
            connection: Connection::Pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn in_transaction(&self) -> bool {
        matches!(self.connection, Connection::Transaction(_))
    }

    /// Re-reflect the catalog and swap in the new tree.
    ///
    /// Requests already holding a snapshot finish against the old tree.
    #[instrument(skip_all)]
    pub async fn reload(&self) -> Result<()> {
        let tree = SchemaTree::build(reflect(&self.pool, &self.config).await?)?;
        info!(entities = tree.len(), "Installing reloaded schema tree");
        self.registry.install(tree);
        Ok(())
    }

    /// Close the pool; clones of this handle become unusable
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // =========================================================================
    // Entity Lookup
    // =========================================================================

    /// Look up any entity by `schema.name` or bare name
    pub fn entity(&self, name: &str) -> Result<Option<Entity>> {
        self.registry.lookup(name, None)
    }

    fn require(&self, name: &str, capability: Capability) -> Result<Entity> {
        if let Some(entity) = self.registry.lookup(name, Some(capability))? {
            return Ok(entity);
        }
        match self.registry.lookup(name, None)? {
            Some(entity) => Err(DataMapperError::unsupported(
                entity.qualified_name(),
                format!("a {:?} is not {:?}", entity.kind(), capability),
            )),
            None => Err(DataMapperError::entity_not_found(name)),
        }
    }

    /// Read and search access to a table, view, materialized view or foreign table
    pub fn readable(&self, name: &str) -> Result<Readable> {
        match self.require(name, Capability::Readable)? {
            Entity::Relation(relation) => Ok(Readable::new(self.clone(), relation)),
            other => Err(DataMapperError::unsupported(other.qualified_name(), "not a relation")),
        }
    }

    /// Read and write access to a table
    pub fn writable(&self, name: &str) -> Result<Writable> {
        match self.require(name, Capability::Writable)? {
            Entity::Relation(relation) => Ok(Writable::new(self.clone(), relation)),
            other => Err(DataMapperError::unsupported(other.qualified_name(), "not a table")),
        }
    }

    pub fn sequence(&self, name: &str) -> Result<SequenceHandle> {
        match self.require(name, Capability::Sequence)? {
            Entity::Sequence(sequence) => Ok(SequenceHandle::new(self.clone(), sequence)),
            other => Err(DataMapperError::unsupported(other.qualified_name(), "not a sequence")),
        }
    }

    pub fn executable(&self, name: &str) -> Result<Executable> {
        match self.require(name, Capability::Executable)? {
            Entity::Function(function) => Ok(Executable::new(self.clone(), function)),
            other => Err(DataMapperError::unsupported(other.qualified_name(), "not a function")),
        }
    }

    /// Labels of an enum type in sort order
    pub fn enum_labels(&self, name: &str) -> Result<Vec<String>> {
        match self.require(name, Capability::Enum)? {
            Entity::Enum(enum_type) => Ok(enum_type.labels.clone()),
            other => Err(DataMapperError::unsupported(other.qualified_name(), "not an enum")),
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub fn register_command(&self, path: &str, command: Command) -> Result<()> {
        self.commands
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path, command)
    }

    /// Replace the command tree with the scripts found under `dir`
    pub fn load_commands(&self, dir: impl AsRef<std::path::Path>) -> Result<usize> {
        let tree = CommandTree::load_dir(dir)?;
        let count = tree.len();
        *self.commands.write().unwrap_or_else(PoisonError::into_inner) = tree;
        Ok(count)
    }

    pub fn command(&self, path: &str) -> Option<Command> {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    /// Run a registered command with positional (array) or named (object) arguments
    pub async fn execute(&self, path: &str, args: &Value, options: &QueryOptions) -> Result<Output> {
        let command = self
            .command(path)
            .ok_or_else(|| DataMapperError::CommandNotFound(path.to_string()))?;
        self.run(command.statement(args)?, options).await
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run raw SQL with positional parameters
    pub async fn query(&self, sql: &str, params: Vec<Value>, options: &QueryOptions) -> Result<Output> {
        self.run(Statement::untyped(sql, params), options).await
    }

    /// Execute a statement unless `build` was requested, then decompose if asked
    pub(crate) async fn run(&self, statement: Statement, options: &QueryOptions) -> Result<Output> {
        if options.build {
            return Ok(Output::Statement(statement));
        }
        reject_streamed_decompose("query", options)?;
        let rows = self.rows(&statement).await?;
        Ok(Output::Rows(shape_rows(rows, options)?))
    }

    /// Execute a statement and decode every row
    pub async fn rows(&self, statement: &Statement) -> Result<Vec<Value>> {
        debug!(sql = %statement.sql, params = statement.params.len(), "Executing statement");
        let rows = match &self.connection {
            Connection::Pool => {
                let types = parameter_types(&self.pool, statement).await?;
                bind_params(sqlx::query(&statement.sql), &statement.params, types.as_deref())?
                    .fetch_all(&self.pool)
                    .await?
            }
            Connection::Transaction(slot) => {
                let mut guard = slot.lock().await;
                let tx = guard.as_mut().ok_or_else(transaction_finished)?;
                let types = parameter_types(&mut **tx, statement).await?;
                bind_params(sqlx::query(&statement.sql), &statement.params, types.as_deref())?
                    .fetch_all(&mut **tx)
                    .await?
            }
        };
        Ok(rows.iter().map(row_to_json).collect())
    }

    /// Execute a statement, yielding rows as the server sends them
    pub fn stream_statement(&self, statement: Statement) -> RowStream {
        let db = self.clone();
        boxed(async_stream::try_stream! {
            debug!(sql = %statement.sql, params = statement.params.len(), "Streaming statement");
            match &db.connection {
                Connection::Pool => {
                    let types = parameter_types(&db.pool, &statement).await?;
                    let mut rows = bind_params(sqlx::query(&statement.sql), &statement.params, types.as_deref())?
                        .fetch(&db.pool);
                    while let Some(row) = rows.try_next().await? {
                        yield row_to_json(&row);
                    }
                }
                Connection::Transaction(slot) => {
                    let mut guard = slot.lock().await;
                    let tx = guard.as_mut().ok_or_else(transaction_finished)?;
                    let types = parameter_types(&mut **tx, &statement).await?;
                    let mut rows = bind_params(sqlx::query(&statement.sql), &statement.params, types.as_deref())?
                        .fetch(&mut **tx);
                    while let Some(row) = rows.try_next().await? {
                        yield row_to_json(&row);
                    }
                }
            }
        })
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Run `f` on one reserved connection.
    ///
    /// Commits when `f` returns `Ok`; any error, whether from SQL or raised by
    /// the caller, rolls everything back before it is returned.
    #[instrument(skip_all)]
    pub async fn transaction<O>(&self, f: impl AsyncFnOnce(&Database) -> Result<O>) -> Result<O> {
        if self.in_transaction() {
            return Err(DataMapperError::validation("Nested transactions are not supported"));
        }

        let slot: SharedTransaction = Arc::new(Mutex::new(Some(self.pool.begin().await?)));
        let scoped = Database {
            connection: Connection::Transaction(slot.clone()),
            ..self.clone()
        };

        let result = f(&scoped).await;
        let tx = slot.lock().await.take().ok_or_else(transaction_finished)?;

        match result {
            Ok(value) => {
                tx.commit().await?;
                debug!("Transaction committed");
                Ok(value)
            }
            Err(err) => {
                warn!(error = %err, "Rolling back transaction");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(err)
            }
        }
    }
}

fn transaction_finished() -> DataMapperError {
    DataMapperError::validation("Transaction has already finished")
}

fn boxed<S>(stream: S) -> RowStream
where
    S: Stream<Item = Result<Value>> + Send + 'static,
{
    Box::pin(stream)
}

pub(crate) fn reject_streamed_decompose(entity: &str, options: &QueryOptions) -> Result<()> {
    if options.stream && options.decompose.is_some() {
        return Err(DataMapperError::unsupported(
            entity,
            "decompose needs the complete result set and cannot be combined with streaming",
        ));
    }
    Ok(())
}

pub(crate) fn shape_rows(rows: Vec<Value>, options: &QueryOptions) -> Result<Vec<Value>> {
    match &options.decompose {
        Some(schema) => decompose(schema, &rows),
        None => Ok(rows),
    }
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Decode a row into a JSON object, keeping column order
pub(crate) fn row_to_json(row: &PgRow) -> Value {
    let mut object = Map::with_capacity(row.len());
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.type_info().name());
        object.insert(column.name().to_string(), value);
    }
    Value::Object(object)
}

fn get<'r, T>(row: &'r PgRow, index: usize) -> Option<T>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get::<Option<T>, _>(index).ok().flatten()
}

fn array<'r, T>(row: &'r PgRow, index: usize) -> Option<Value>
where
    T: Into<Value>,
    Vec<Option<T>>: Decode<'r, Postgres> + Type<Postgres>,
{
    get::<Vec<Option<T>>>(row, index)
        .map(|items| Value::Array(items.into_iter().map(|v| v.map_or(Value::Null, Into::into)).collect()))
}

fn float(value: f64) -> Option<Value> {
    Number::from_f64(value).map(Value::Number)
}

fn decimal(value: Decimal) -> Option<Value> {
    if value.is_integer() {
        if let Some(i) = value.to_i64() {
            return Some(Value::from(i));
        }
        if let Some(u) = value.to_u64() {
            return Some(Value::from(u));
        }
    }
    value
        .to_f64()
        .and_then(float)
        .or_else(|| Some(Value::String(value.to_string())))
}

fn decode_column(row: &PgRow, index: usize, type_name: &str) -> Value {
    let value = match type_name {
        "BOOL" => get::<bool>(row, index).map(Value::Bool),
        "INT2" => get::<i16>(row, index).map(Value::from),
        "INT4" => get::<i32>(row, index).map(Value::from),
        "INT8" => get::<i64>(row, index).map(Value::from),
        "FLOAT4" => get::<f32>(row, index).and_then(|v| float(f64::from(v))),
        "FLOAT8" => get::<f64>(row, index).and_then(float),
        "NUMERIC" => get::<Decimal>(row, index).and_then(decimal),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" | "CITEXT" => get::<String>(row, index).map(Value::String),
        "UUID" => get::<uuid::Uuid>(row, index).map(|v| Value::String(v.to_string())),
        "JSON" | "JSONB" => get::<Value>(row, index),
        "TIMESTAMPTZ" => get::<chrono::DateTime<chrono::Utc>>(row, index).map(|v| Value::String(v.to_rfc3339())),
        "TIMESTAMP" => get::<chrono::NaiveDateTime>(row, index)
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "DATE" => get::<chrono::NaiveDate>(row, index).map(|v| Value::String(v.to_string())),
        "TEXT[]" | "VARCHAR[]" | "_TEXT" | "_VARCHAR" => array::<String>(row, index),
        "INT2[]" | "_INT2" => array::<i16>(row, index),
        "INT4[]" | "_INT4" => array::<i32>(row, index),
        "INT8[]" | "_INT8" => array::<i64>(row, index),
        "BOOL[]" | "_BOOL" => array::<bool>(row, index),
        "VOID" => None,
        // Enums, domains and anything else with a textual wire form
        _ => row
            .try_get_unchecked::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String),
    };
    value.unwrap_or(Value::Null)
}
