//! Core types for websql.
//!
//! - [`Value`] and [`Row`] for parameters and results
//! - [`codec`] for carrying binary values through text-only engines
//! - [`engine`] for the WebSQL-style callback engine boundary
//! - [`result`] for the uniform result shape
//! - `Outcome` and `Cx` re-exported from asupersync

pub use asupersync::{Cx, Outcome};

pub mod codec;
pub mod engine;
pub mod error;
pub mod result;
pub mod row;
pub mod value;

pub use codec::BINARY_TAG;
pub use engine::{
    Engine, EngineTransaction, ErrorCallback, NativeResult, SqlResultSet, StatementCallback,
    StatementErrorAction, StatementErrorCallback, SuccessCallback, TransactionCallback,
};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, QueryError, QueryErrorKind, Result,
    TransactionError, TransactionErrorKind, TypeError,
};
pub use result::{UniformResult, normalize_result};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
