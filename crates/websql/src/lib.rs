//! websql - serialized, abort-safe access to a WebSQL-style database.
//!
//! A WebSQL-style engine only exposes callback-driven transactions that
//! commit once their statement queue runs dry. This crate puts one such
//! engine behind an async API that:
//!
//! - runs one logical operation at a time, in arrival order
//! - rolls a multi-statement transaction back when its body fails, even
//!   though the engine only rolls back on a failing statement
//! - carries binary values through the engine's text parameters
//! - returns one uniform result shape for every statement
//!
//! # Quick Start
//!
//! ```ignore
//! use websql::prelude::*;
//!
//! async fn example(cx: &Cx) -> Result<()> {
//!     let conn = Connection::create(ConnectionOptions::new("app"))?;
//!
//!     conn.query(cx, "CREATE TABLE heroes (id INTEGER PRIMARY KEY, name TEXT)", &[])
//!         .await;
//!
//!     // Both inserts or neither.
//!     conn.transaction(cx, |tx| async move {
//!         tx.query("INSERT INTO heroes (name) VALUES (?)", &["Spider-Man".into()]).await?;
//!         tx.query("INSERT INTO heroes (name) VALUES (?)", &["Iron Man".into()]).await?;
//!         Ok(())
//!     })
//!     .await;
//!
//!     let sum = conn.query(cx, "SELECT ? + ? AS solution", &[2.into(), 3.into()]).await;
//!     Ok(())
//! }
//! ```

mod completion;
mod connection;
mod coordinator;
mod handle;
pub mod lock;
mod options;

pub use connection::Connection;
pub use coordinator::{FORCED_ABORT_SQL, TransactionPhase};
pub use handle::TransactionHandle;
pub use lock::{SerialGuard, SerialLock};
pub use options::{ConnectionOptions, DEFAULT_VERSION};

pub use websql_core::{
    BINARY_TAG, ColumnInfo, ConfigError, ConnectionError, ConnectionErrorKind, Cx, Engine,
    EngineTransaction, Error, FromValue, NativeResult, Outcome, QueryError, QueryErrorKind,
    Result, Row, SqlResultSet, StatementErrorAction, TransactionError, TransactionErrorKind,
    TypeError, UniformResult, Value, codec, normalize_result,
};
pub use websql_sqlite::{DEFAULT_MAX_SIZE, SqliteConfig, SqliteDatabase, SqliteTransaction, Storage};

pub mod prelude {
    pub use crate::{
        Connection, ConnectionOptions, Cx, Error, Outcome, Result, Row, Storage,
        TransactionHandle, UniformResult, Value,
    };
}
