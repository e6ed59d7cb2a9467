//! Error types for data mapper operations

use thiserror::Error;

/// Errors that can occur while reflecting, compiling or executing statements
#[derive(Debug, Error)]
pub enum DataMapperError {
    #[error("Validation error: {0}")]
    Validation(String),

    /// Malformed filters, duplicate entity names, ambiguous lookups.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Criteria or options that cannot be turned into a statement.
    #[error("Invalid criteria: {0}")]
    InvalidCriteria(String),

    #[error("Unsupported operation on {entity}: {message}")]
    Unsupported { entity: String, message: String },

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading command scripts from disk.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DataMapperError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_criteria(msg: impl Into<String>) -> Self {
        Self::InvalidCriteria(msg.into())
    }

    pub fn unsupported(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unsupported {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub fn entity_not_found(msg: impl Into<String>) -> Self {
        Self::EntityNotFound(msg.into())
    }

    /// The engine's SQLSTATE code when the error came back from the server.
    pub fn database_code(&self) -> Option<String> {
        match self {
            Self::Sql(err) => err
                .as_database_error()
                .and_then(|db| db.code())
                .map(|code| code.into_owned()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DataMapperError>;
