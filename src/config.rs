//! Configuration for Database
//!
//! Provides a builder pattern for configuring connection and reflection filters.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{DataMapperError, Result};

/// A normalized name filter for catalog reflection.
///
/// Internally this is always a comma-delimited pattern string; an empty string
/// means "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FilterSpec(String);

impl FilterSpec {
    /// A filter that does not restrict anything
    pub fn all() -> Self {
        Self(String::new())
    }

    /// Normalize a loosely-typed filter value.
    ///
    /// - `null`, `"all"` and `"*"` mean no restriction
    /// - a string is passed through as a comma-delimited list
    /// - an array of strings is joined with `", "`
    ///
    /// Anything else is rejected.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(Self::all()),
            serde_json::Value::String(s) if s == "all" || s == "*" => Ok(Self::all()),
            serde_json::Value::String(s) => Ok(Self(s.clone())),
            serde_json::Value::Array(items) => {
                let names = items
                    .iter()
                    .map(|item| {
                        item.as_str().map(str::to_string).ok_or_else(|| {
                            DataMapperError::configuration(format!(
                                "Filter arrays may only contain strings, got {}",
                                item
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self(names.join(", ")))
            }
            other => Err(DataMapperError::configuration(format!(
                "Invalid filter specification: {}",
                other
            ))),
        }
    }

    /// The comma-delimited form passed to catalog queries
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Individual trimmed entries
    pub fn entries(&self) -> Vec<&str> {
        self.0
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

impl From<&str> for FilterSpec {
    fn from(value: &str) -> Self {
        match value {
            "all" | "*" => Self::all(),
            other => Self(other.to_string()),
        }
    }
}

impl From<String> for FilterSpec {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl<S: AsRef<str>> From<Vec<S>> for FilterSpec {
    fn from(values: Vec<S>) -> Self {
        Self(
            values
                .iter()
                .map(|v| v.as_ref())
                .collect::<Vec<_>>()
                .join(", "),
        )
    }
}

impl<'de> Deserialize<'de> for FilterSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        FilterSpec::from_value(&value).map_err(serde::de::Error::custom)
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_body_column() -> String {
    "body".to_string()
}

/// Configuration for the database handle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// PostgreSQL database URL
    pub database_url: String,
    /// Maximum pooled connections (default: 10)
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Schema searched first for unqualified names (default: "public")
    #[serde(default = "default_schema")]
    pub default_schema: String,
    /// Schemas to reflect
    #[serde(default)]
    pub schemas: FilterSpec,
    /// LIKE patterns of relations to skip
    #[serde(default)]
    pub blacklist: FilterSpec,
    /// Relations to load exclusively
    #[serde(default)]
    pub whitelist: FilterSpec,
    /// Exceptions to the blacklist
    #[serde(default)]
    pub exceptions: FilterSpec,
    /// LIKE patterns of functions to skip
    #[serde(default)]
    pub function_blacklist: FilterSpec,
    /// Functions to load exclusively
    #[serde(default)]
    pub function_whitelist: FilterSpec,
    /// Skip function reflection entirely
    #[serde(default)]
    pub exclude_functions: bool,
    /// Skip materialized views
    #[serde(default)]
    pub exclude_matviews: bool,
    /// JSON column holding documents (default: "body")
    #[serde(default = "default_body_column")]
    pub document_body_column: String,
}

impl DatabaseConfig {
    /// Create a new configuration builder
    pub fn builder(database_url: impl Into<String>) -> DatabaseConfigBuilder {
        DatabaseConfigBuilder::new(database_url)
    }

    /// Parse configuration from a JSON value, normalizing filters
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| DataMapperError::configuration(e.to_string()))
    }
}

/// Builder for DatabaseConfig
#[derive(Debug)]
pub struct DatabaseConfigBuilder {
    config: DatabaseConfig,
}

impl DatabaseConfigBuilder {
    /// Create a new builder with the database URL
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            config: DatabaseConfig {
                database_url: database_url.into(),
                max_connections: default_max_connections(),
                default_schema: default_schema(),
                schemas: FilterSpec::all(),
                blacklist: FilterSpec::all(),
                whitelist: FilterSpec::all(),
                exceptions: FilterSpec::all(),
                function_blacklist: FilterSpec::all(),
                function_whitelist: FilterSpec::all(),
                exclude_functions: false,
                exclude_matviews: false,
                document_body_column: default_body_column(),
            },
        }
    }

    /// Set the maximum number of pooled connections (default: 10)
    pub fn max_connections(mut self, max: u32) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the schema searched first for unqualified names (default: "public")
    pub fn default_schema(mut self, schema: impl Into<String>) -> Self {
        self.config.default_schema = schema.into();
        self
    }

    /// Restrict reflection to these schemas
    pub fn schemas(mut self, filter: impl Into<FilterSpec>) -> Self {
        self.config.schemas = filter.into();
        self
    }

    /// Skip relations matching these LIKE patterns
    pub fn blacklist(mut self, filter: impl Into<FilterSpec>) -> Self {
        self.config.blacklist = filter.into();
        self
    }

    /// Only load these relations
    pub fn whitelist(mut self, filter: impl Into<FilterSpec>) -> Self {
        self.config.whitelist = filter.into();
        self
    }

    /// Load these relations even when blacklisted
    pub fn exceptions(mut self, filter: impl Into<FilterSpec>) -> Self {
        self.config.exceptions = filter.into();
        self
    }

    /// Skip functions matching these LIKE patterns
    pub fn function_blacklist(mut self, filter: impl Into<FilterSpec>) -> Self {
        self.config.function_blacklist = filter.into();
        self
    }

    /// Only load these functions
    pub fn function_whitelist(mut self, filter: impl Into<FilterSpec>) -> Self {
        self.config.function_whitelist = filter.into();
        self
    }

    /// Enable or disable function reflection (default: enabled)
    pub fn exclude_functions(mut self, exclude: bool) -> Self {
        self.config.exclude_functions = exclude;
        self
    }

    /// Enable or disable materialized view reflection (default: enabled)
    pub fn exclude_matviews(mut self, exclude: bool) -> Self {
        self.config.exclude_matviews = exclude;
        self
    }

    /// Set the document column name (default: "body")
    pub fn document_body_column(mut self, column: impl Into<String>) -> Self {
        self.config.document_body_column = column.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> DatabaseConfig {
        self.config
    }
}
