//! Native SQLite driver core.
//!
//! [`Connection`] owns a native handle together with everything registered on it:
//! prepared statements, hooks, user-defined functions, and virtual-table modules. Prepare
//! and step transparently recover from schema invalidation and lock contention, always
//! honouring a pending cancellation. Closing tears every registration down before the
//! handle is freed or returned to the process-wide pool.
//!
//! ```no_run
//! use rawsqlite::{Connection, DriverConfig, OpenOptions, Value};
//!
//! # fn main() -> rawsqlite::Result<()> {
//! let mut conn = Connection::new(DriverConfig::default());
//! conn.open("app.db", &OpenOptions::new().pooling(true))?;
//! conn.execute("CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v)")?;
//! let rows = conn.query_rows("SELECT v FROM kv WHERE k = ?", &[Value::from("answer")])?;
//! conn.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! A connection may move between threads but must only be driven by one thread at a time.
//! [`CancelHandle`] is the exception: it can be cloned and used from any thread.

mod backup;
mod config;
mod connection;
mod errors;
mod events;
mod functions;
mod handle;
mod hooks;
mod module;
mod pool;
mod retry;
mod statement;
mod types;
mod utils;

#[cfg(feature = "python")]
mod exceptions;
#[cfg(feature = "python")]
mod python;

pub use backup::{backup_database, Backup, BackupProgress};
pub use config::{DriverConfig, OpenOptions, RetryPolicy};
pub use connection::{Connection, Prepared, TempSchemaBuilder};
pub use errors::{Error, ErrorCategory, Result};
pub use events::{add_observer, remove_observer, LifecycleEvent, Observer, ObserverId};
pub use functions::{
    register_collation, register_function, registered, unregister, CollationFn,
    FunctionDefinition, FunctionKind, ScalarFn,
};
pub use handle::{CancelHandle, ConnectionHandle};
pub use hooks::{
    log_callback_installed, Authorizer, AuthorizerContext, CommitHook, LogCallback, ProgressHook,
    RollbackHook, TraceCallback, UpdateHook,
};
pub use pool::{shared as shared_pool, ConnectionPool, PoolCounts, SharedPool};
pub use retry::{
    effective_code, run as run_with_retry, settle_cancellation, Attempt, Backoff, Next, RetryState,
    ThreadSleep,
};
pub use statement::StatementId;
pub use types::{
    Authorization, ColumnType, ConnectionFlags, DbConfigOption, LimitOption, OpenFlags,
    ResultCode, UpdateAction, Value,
};

pub use libsqlite3_sys as ffi;
