//! Error types for the Prodplan core

use thiserror::Error;

/// Result type alias for Prodplan operations
pub type Result<T> = std::result::Result<T, ProdplanError>;

/// Main error type for the Prodplan core
#[derive(Error, Debug)]
pub enum ProdplanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source file unreadable: {0}")]
    InspectorRead(String),

    #[error("Another ingestion run holds the lock: {0}")]
    ConcurrentRun(String),

    #[error("Table does not exist: {0}")]
    TableNotFound(String),

    #[error("No ON CONFLICT target for {table}. Available: {available}")]
    NoConflictTarget { table: String, available: String },

    #[error("Count contract violated: {0}")]
    CountContract(String),

    #[error("Release gate failed: {0}")]
    GateFailed(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ProdplanError {
    /// Configuration error with a message
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
