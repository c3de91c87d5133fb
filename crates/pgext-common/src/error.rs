//! Error types for pgext

use thiserror::Error;

/// Result type alias for pgext operations
pub type Result<T> = std::result::Result<T, PgExtError>;

/// Unified error type for all pgext operations.
///
/// Variants keep the original cause distinguishable: input that was rejected
/// before any I/O (`Validation`, `SchemaResolution`), failures to reach the
/// server (`Connection`, `Timeout`) and violations of the copy framing
/// (`Protocol`) are never folded into one another.
#[derive(Error, Debug, Clone)]
pub enum PgExtError {
    /// Input rejected before any I/O was attempted
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entity type has no registered table/column schema
    #[error("Schema resolution error: {0}")]
    SchemaResolution(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// Binary copy stream violated the expected framing or type mapping
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Unique constraint violation (SQLSTATE 23505)
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PgExtError {
    /// Returns true if the error was raised before touching the server.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PgExtError::Validation(_) | PgExtError::SchemaResolution(_)
        )
    }

    /// Returns true if the server could not be reached or the link dropped.
    pub fn is_connection(&self) -> bool {
        matches!(self, PgExtError::Connection(_) | PgExtError::Timeout(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, PgExtError::Protocol(_))
    }
}

impl From<serde_json::Error> for PgExtError {
    fn from(err: serde_json::Error) -> Self {
        PgExtError::Serialization(err.to_string())
    }
}

// PostgreSQL-specific error conversions (when postgres-errors feature is enabled)
#[cfg(feature = "postgres-errors")]
impl From<sqlx::Error> for PgExtError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error;
        match &err {
            Error::Configuration(_) => PgExtError::Connection(err.to_string()),
            Error::Database(db_err) => {
                // See: https://www.postgresql.org/docs/current/errcodes-appendix.html
                if let Some(code) = db_err.code() {
                    let code_str: &str = &code;
                    match code_str {
                        "23505" | "23P01" => return PgExtError::Conflict(err.to_string()),
                        // invalid_binary_representation / bad_copy_file_format
                        "22P03" | "22P04" => return PgExtError::Protocol(err.to_string()),
                        // Connection errors (class 08)
                        code if code.starts_with("08") => {
                            return PgExtError::Connection(err.to_string())
                        }
                        // Admin shutdown / crash recovery
                        "57P01" | "57P02" | "57P03" => {
                            return PgExtError::Connection(err.to_string())
                        }
                        "57014" => return PgExtError::Timeout(err.to_string()),
                        _ => {}
                    }
                }
                PgExtError::Database(err.to_string())
            }
            Error::Io(_) => PgExtError::Connection(err.to_string()),
            Error::Tls(_) => PgExtError::Connection(err.to_string()),
            Error::Protocol(_) => PgExtError::Protocol(err.to_string()),
            Error::Encode(_) => PgExtError::Serialization(err.to_string()),
            Error::Decode(_) => PgExtError::Serialization(err.to_string()),
            Error::PoolTimedOut => PgExtError::Timeout("Connection pool timed out".to_string()),
            Error::PoolClosed => PgExtError::Connection("Connection pool closed".to_string()),
            _ => PgExtError::Database(err.to_string()),
        }
    }
}
