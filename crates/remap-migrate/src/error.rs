//! Error types for the migration library.

use thiserror::Error;

/// Exit code for configuration, mapping and incomplete-load errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;

/// Exit code for database, transform and other runtime errors.
pub const EXIT_RUNTIME_ERROR: u8 = 2;

/// Exit code for file system errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, bad flag combination, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed mapping directive
    #[error("Mapping error in {source_column} -> {target_column}: {message}")]
    Mapping {
        source_column: String,
        target_column: String,
        message: String,
    },

    /// Source or target database error
    #[error("Database error: {0}")]
    Store(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A row could not be transformed; aborts the run
    #[error("Transform failed for table {table}: {message}")]
    Transform { table: String, message: String },

    /// Loading a file failed at the connection level
    #[error("Load failed for table {table}: {message}")]
    Load { table: String, message: String },

    /// Tables still unloaded after the retry loop
    #[error("Could not import remaining tables: {}", tables.join(", "))]
    Incomplete { tables: Vec<String> },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV interchange file error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Mapping error for a source/target column pair
    pub fn mapping(
        source_column: impl Into<String>,
        target_column: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        MigrateError::Mapping {
            source_column: source_column.into(),
            target_column: target_column.into(),
            message: message.into(),
        }
    }

    /// Create a Transform error
    pub fn transform(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transform {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Load error
    pub fn load(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Load {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_)
            | MigrateError::Mapping { .. }
            | MigrateError::Incomplete { .. }
            | MigrateError::Yaml(_) => EXIT_CONFIG_ERROR,
            MigrateError::Io(_) => EXIT_IO_ERROR,
            _ => EXIT_RUNTIME_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        // Add error chain for wrapped errors
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
