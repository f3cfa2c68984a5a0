//! WebSQL-style callback engine over SQLite.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! [`SqliteDatabase`] implements the `Engine` trait from websql-core the way
//! a browser's `openDatabase` result behaves: transactions are callback
//! driven, queued, and committed or rolled back as a whole.
//!
//! # Features
//!
//! - In-memory and directory-backed databases
//! - Version recorded in `__WebKitDatabaseInfoTable__` and checked on open
//! - Storage quota enforced through `PRAGMA max_page_count`
//! - Optional native transaction abort
//!
//! # Example
//!
//! ```rust,ignore
//! use websql_core::{Engine, EngineTransaction, StatementErrorAction};
//! use websql_sqlite::{SqliteConfig, SqliteDatabase};
//!
//! let db = SqliteDatabase::open(&SqliteConfig::new("app"))?;
//! db.transaction(
//!     Box::new(|tx| {
//!         tx.execute_sql(
//!             "CREATE TABLE t (v)",
//!             Vec::new(),
//!             Box::new(|_, _| {}),
//!             Box::new(|_, _| StatementErrorAction::Abort),
//!         )
//!         .ok();
//!     }),
//!     Box::new(|err| eprintln!("rolled back: {err}")),
//!     Box::new(|| println!("committed")),
//! );
//! ```

pub mod connection;
pub mod database;
pub mod ffi;
pub mod types;

pub use connection::{DEFAULT_MAX_SIZE, SqliteConfig, Storage};
pub use database::{SqliteDatabase, SqliteTransaction};

/// Re-export the SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_version() {
        let version = sqlite_version();
        assert!(
            version.starts_with('3'),
            "Expected SQLite 3.x, got {}",
            version
        );
    }
}
