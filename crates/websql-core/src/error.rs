//! Error types for websql operations.
//!
//! Errors are `Clone`: a failing statement reports the same engine error to
//! the caller awaiting that statement and to the transaction error path.

use std::fmt;

/// The primary error type for all websql operations.
#[derive(Debug, Clone)]
pub enum Error {
    /// Opening or identifying the underlying database failed
    Connection(ConnectionError),
    /// The engine rejected or failed a statement
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction protocol errors
    Transaction(TransactionError),
    /// Configuration errors
    Config(ConfigError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message, typically raised by a transaction body
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to open the database
    Open,
    /// The stored database version differs from the requested one
    VersionMismatch,
}

#[derive(Debug, Clone)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    /// Engine-native result code, when the engine reports one
    pub code: Option<i32>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Storage quota exceeded
    Quota,
    /// Database busy or locked
    Busy,
    /// Cancelled
    Cancelled,
    /// Other database error
    Database,
}

#[derive(Debug, Clone)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The engine rolled the transaction back on request
    Aborted,
    /// The physical transaction has already committed or rolled back
    Closed,
    /// A transaction handle was used after its body finished
    HandleExpired,
    /// The engine committed while the body was still suspended
    BodyIncomplete,
    /// The transaction body panicked
    BodyPanicked,
    /// A statement was discarded before it ran
    Discarded,
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
}

impl Error {
    /// Build a custom error, usually from inside a transaction body.
    pub fn custom(message: impl Into<String>) -> Self {
        Error::Custom(message.into())
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Get the engine result code, if available
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Query(q) => q.code,
            _ => None,
        }
    }

    /// Is this a transaction protocol error of the given kind?
    pub fn is_transaction(&self, kind: TransactionErrorKind) -> bool {
        matches!(self, Error::Transaction(t) if t.kind == kind)
    }
}

impl TransactionError {
    pub fn new(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(code) = e.code {
                    write!(f, "Query error (code {}): {}", code, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{} (code {})", self.message, code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(ConfigError {
            message: err.to_string(),
        })
    }
}

/// Result type alias for websql operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_error_helpers() {
        let err = Error::Query(QueryError {
            kind: QueryErrorKind::Syntax,
            sql: Some("SELEC 1".to_string()),
            code: Some(1),
            message: "near \"SELEC\": syntax error".to_string(),
        });

        assert_eq!(err.sql(), Some("SELEC 1"));
        assert_eq!(err.code(), Some(1));
        assert_eq!(
            err.to_string(),
            "Query error (code 1): near \"SELEC\": syntax error"
        );
    }

    #[test]
    fn transaction_kind_matching() {
        let err: Error =
            TransactionError::new(TransactionErrorKind::Closed, "transaction is closed").into();
        assert!(err.is_transaction(TransactionErrorKind::Closed));
        assert!(!err.is_transaction(TransactionErrorKind::Aborted));
        assert_eq!(err.to_string(), "Transaction error: transaction is closed");
    }

    #[test]
    fn custom_errors_display_verbatim() {
        let err = Error::custom("body gave up");
        assert_eq!(err.to_string(), "body gave up");
        assert!(err.sql().is_none());
    }

    #[test]
    fn json_errors_become_config_errors() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Config(_)));
    }
}
