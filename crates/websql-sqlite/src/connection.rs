//! SQLite handle and database configuration.
//!
//! [`RawConnection`] is a thin safe wrapper over one `sqlite3*`. It knows how
//! to run a single statement and report a WebSQL-shaped result set, and
//! nothing about transactions queues or callbacks; that lives in
//! [`crate::database`].

// Allow casts in FFI code where we need to match C types exactly
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::result_large_err)]
#![allow(clippy::borrow_as_ptr)]

use crate::ffi;
use crate::types;
use serde::{Deserialize, Serialize};
use std::ffi::{CStr, CString, c_int};
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;
use websql_core::{
    ColumnInfo, ConnectionError, ConnectionErrorKind, Error, QueryError, QueryErrorKind, Result,
    Row, SqlResultSet, Value,
};

/// Default storage quota: 50 MiB.
pub const DEFAULT_MAX_SIZE: u64 = 50 * 1024 * 1024;

/// Where database files live.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Storage {
    /// A private in-memory database, discarded when the handle is dropped.
    #[default]
    Memory,
    /// One file per database name inside this directory.
    Directory(PathBuf),
}

impl Storage {
    /// Resolve the SQLite filename for a database name.
    pub fn filename(&self, name: &str) -> Result<String> {
        match self {
            Storage::Memory => Ok(":memory:".to_string()),
            Storage::Directory(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    Error::Connection(ConnectionError {
                        kind: ConnectionErrorKind::Open,
                        message: format!("Cannot create {}: {}", dir.display(), e),
                    })
                })?;
                let path = dir.join(format!("{}.db", file_stem(name)));
                Ok(path.to_string_lossy().into_owned())
            }
        }
    }
}

/// Map a database name onto a safe file stem.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Configuration for opening a [`crate::SqliteDatabase`].
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database name.
    pub name: String,
    /// Expected schema version. Empty accepts whatever is stored.
    pub version: String,
    /// Human-readable name.
    pub display_name: String,
    /// Storage quota in bytes. Zero disables the quota.
    pub max_size: u64,
    pub storage: Storage,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Offer a native transaction abort instead of relying on a failing
    /// statement.
    pub native_abort: bool,
}

impl SqliteConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            version: "1.0".to_string(),
            max_size: DEFAULT_MAX_SIZE,
            storage: Storage::Memory,
            busy_timeout_ms: 5000,
            native_abort: false,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn max_size(mut self, bytes: u64) -> Self {
        self.max_size = bytes;
        self
    }

    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn native_abort(mut self, enabled: bool) -> Self {
        self.native_abort = enabled;
        self
    }
}

/// An open `sqlite3*` handle.
pub(crate) struct RawConnection {
    db: *mut ffi::sqlite3,
}

// SAFETY: the handle is opened in serialized mode and every use goes
// through the owning Mutex in `SqliteDatabase`.
unsafe impl Send for RawConnection {}

impl RawConnection {
    pub(crate) fn open(filename: &str, busy_timeout_ms: u32) -> Result<Self> {
        let c_path = CString::new(filename).map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Open,
                message: "Invalid path: contains null byte".to_string(),
            })
        })?;

        let mut flags =
            ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE | ffi::SQLITE_OPEN_FULLMUTEX;
        if filename == ":memory:" {
            flags |= ffi::SQLITE_OPEN_MEMORY;
        }

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let msg = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: db is valid even on failure and must still be closed
                unsafe {
                    let msg = errmsg(db);
                    ffi::sqlite3_close_v2(db);
                    msg
                }
            };
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Open,
                message: format!("Failed to open database: {}", msg),
            }));
        }

        if busy_timeout_ms > 0 {
            // SAFETY: db is valid
            unsafe {
                ffi::sqlite3_busy_timeout(db, busy_timeout_ms as c_int);
            }
        }

        Ok(Self { db })
    }

    /// Execute SQL without parameters or results (BEGIN, COMMIT, DDL).
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        let c_sql = CString::new(sql).map_err(|_| nul_error(sql))?;
        let mut errmsg_ptr: *mut std::ffi::c_char = ptr::null_mut();

        // SAFETY: All pointers are valid
        let rc = unsafe {
            ffi::sqlite3_exec(
                self.db,
                c_sql.as_ptr(),
                None,
                ptr::null_mut(),
                &mut errmsg_ptr,
            )
        };

        if rc != ffi::SQLITE_OK {
            let message = if errmsg_ptr.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: errmsg_ptr was allocated by SQLite
                unsafe {
                    let msg = CStr::from_ptr(errmsg_ptr).to_string_lossy().into_owned();
                    ffi::sqlite3_free(errmsg_ptr.cast());
                    msg
                }
            };
            return Err(query_error(rc, sql, message));
        }

        Ok(())
    }

    /// Prepare, bind and step one statement to completion.
    pub(crate) fn run(&self, sql: &str, params: &[Value]) -> Result<SqlResultSet> {
        let stmt = Statement::prepare(self.db, sql)?;

        for (i, param) in params.iter().enumerate() {
            // SAFETY: stmt is valid, index is 1-based
            let rc = unsafe { types::bind_value(stmt.raw, (i + 1) as c_int, param) };
            if rc != ffi::SQLITE_OK {
                // SAFETY: db is valid
                let msg = unsafe { errmsg(self.db) };
                return Err(query_error(
                    rc,
                    sql,
                    format!("Failed to bind parameter {}: {}", i + 1, msg),
                ));
            }
        }

        // SAFETY: stmt is valid
        let col_count = unsafe { ffi::sqlite3_column_count(stmt.raw) };
        let columns = Arc::new(ColumnInfo::new(
            (0..col_count)
                .map(|i| {
                    // SAFETY: i is a valid column index
                    unsafe { types::column_name(stmt.raw, i) }
                        .unwrap_or_else(|| format!("col{}", i))
                })
                .collect(),
        ));

        // SAFETY: db is valid
        let (rowid_before, total_before) = unsafe {
            (
                ffi::sqlite3_last_insert_rowid(self.db),
                ffi::sqlite3_total_changes(self.db),
            )
        };

        let mut rows = Vec::new();
        loop {
            // SAFETY: stmt is valid
            match unsafe { ffi::sqlite3_step(stmt.raw) } {
                ffi::SQLITE_ROW => {
                    let values = (0..col_count)
                        // SAFETY: we just got SQLITE_ROW
                        .map(|i| unsafe { types::read_column(stmt.raw, i) })
                        .collect();
                    rows.push(Row::with_columns(Arc::clone(&columns), values));
                }
                ffi::SQLITE_DONE => break,
                _ => {
                    // SAFETY: db is valid
                    let (code, msg) =
                        unsafe { (ffi::sqlite3_extended_errcode(self.db), errmsg(self.db)) };
                    return Err(query_error(code, sql, msg));
                }
            }
        }

        // SAFETY: db is valid
        let (changes, total_after, rowid_after) = unsafe {
            (
                ffi::sqlite3_changes(self.db),
                ffi::sqlite3_total_changes(self.db),
                ffi::sqlite3_last_insert_rowid(self.db),
            )
        };

        // sqlite3_changes keeps the last DML count across DDL and queries.
        let rows_affected = if total_after == total_before {
            0
        } else {
            u64::try_from(changes).unwrap_or(0)
        };

        let mut result = SqlResultSet::new().with_rows_affected(rows_affected);
        if rows_affected > 0 && (rowid_after != rowid_before || is_insert(sql)) {
            result = result.with_insert_id(rowid_after);
        }
        if col_count > 0 {
            result = result.with_rows(rows);
        }
        Ok(result)
    }

    /// Run a query and return its first column of the first row.
    pub(crate) fn query_scalar(&self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        let result = self.run(sql, params)?;
        Ok(websql_core::NativeResult::rows(&result)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get(0).cloned()))
    }

    /// Is a transaction currently open on this handle?
    pub(crate) fn in_transaction(&self) -> bool {
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_get_autocommit(self.db) == 0 }
    }
}

impl Drop for RawConnection {
    fn drop(&mut self) {
        // SAFETY: db is valid and no statements outlive their `run` call
        unsafe {
            ffi::sqlite3_close_v2(self.db);
        }
    }
}

/// A prepared statement, finalized on drop.
struct Statement {
    raw: *mut ffi::sqlite3_stmt,
}

impl Statement {
    fn prepare(db: *mut ffi::sqlite3, sql: &str) -> Result<Self> {
        let c_sql = CString::new(sql).map_err(|_| nul_error(sql))?;
        let mut raw: *mut ffi::sqlite3_stmt = ptr::null_mut();

        // SAFETY: All pointers are valid
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                db,
                c_sql.as_ptr(),
                c_sql.as_bytes().len() as c_int,
                &mut raw,
                ptr::null_mut(),
            )
        };

        if rc != ffi::SQLITE_OK {
            // SAFETY: db is valid
            let (code, msg) = unsafe { (ffi::sqlite3_extended_errcode(db), errmsg(db)) };
            return Err(query_error(code, sql, msg));
        }
        if raw.is_null() {
            // Whitespace or comment only.
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Syntax,
                sql: Some(sql.to_string()),
                code: None,
                message: "empty statement".to_string(),
            }));
        }

        Ok(Self { raw })
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        // SAFETY: raw is a valid statement that is finalized exactly once
        unsafe {
            ffi::sqlite3_finalize(self.raw);
        }
    }
}

/// Read the current error message of a handle.
///
/// # Safety
/// `db` must be a valid handle.
unsafe fn errmsg(db: *mut ffi::sqlite3) -> String {
    // SAFETY: guaranteed by the caller; errmsg never returns null
    unsafe { CStr::from_ptr(ffi::sqlite3_errmsg(db)) }
        .to_string_lossy()
        .into_owned()
}

fn is_insert(sql: &str) -> bool {
    let head = sql.trim_start();
    ["INSERT", "REPLACE"].iter().any(|kw| {
        head.get(..kw.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(kw))
    })
}

fn nul_error(sql: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        sql: Some(sql.to_string()),
        code: None,
        message: "SQL contains null byte".to_string(),
    })
}

fn query_error(code: c_int, sql: &str, message: String) -> Error {
    Error::Query(QueryError {
        kind: error_code_to_kind(code, &message),
        sql: Some(sql.to_string()),
        code: Some(code),
        message,
    })
}

fn error_code_to_kind(code: c_int, message: &str) -> QueryErrorKind {
    match code & 0xff {
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Busy,
        ffi::SQLITE_PERM | ffi::SQLITE_AUTH | ffi::SQLITE_READONLY => QueryErrorKind::Permission,
        ffi::SQLITE_FULL | ffi::SQLITE_TOOBIG => QueryErrorKind::Quota,
        ffi::SQLITE_INTERRUPT | ffi::SQLITE_ABORT => QueryErrorKind::Cancelled,
        ffi::SQLITE_CANTOPEN => QueryErrorKind::NotFound,
        ffi::SQLITE_ERROR if message.contains("syntax error") => QueryErrorKind::Syntax,
        ffi::SQLITE_ERROR if message.starts_with("unrecognized token") => QueryErrorKind::Syntax,
        ffi::SQLITE_ERROR if message.starts_with("no such") => QueryErrorKind::NotFound,
        _ => QueryErrorKind::Database,
    }
}
