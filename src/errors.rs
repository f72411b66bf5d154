//! Error taxonomy and native-error capture.

use std::ffi::c_int;
use std::time::Duration;

use libsqlite3_sys as ffi;
use thiserror::Error;

use crate::types::ResultCode;
use crate::utils::cstr_to_string;

/// Errors raised by the driver.
///
/// Contention and schema invalidation are recovered inside prepare and step and only reach
/// the caller as [`Error::Timeout`] or [`Error::SchemaChanged`] once the configured budget is
/// spent. Cancellation always surfaces as [`Error::Cancelled`].
#[derive(Debug, Error)]
pub enum Error {
    /// A native call failed; carries the engine's last error text.
    #[error("{code}: {message}")]
    Sqlite {
        code: ResultCode,
        extended_code: c_int,
        message: String,
    },

    /// Busy/Locked persisted past the caller's time budget.
    #[error("{code}: timed out after {elapsed:?}")]
    Timeout { code: ResultCode, elapsed: Duration },

    /// The schema kept changing between attempts.
    #[error("database schema changed {retries} times while preparing or stepping")]
    SchemaChanged { retries: u32 },

    /// A cancellation request was observed during the call.
    #[error("operation was cancelled")]
    Cancelled,

    /// A handle was used outside its lifecycle; no native call was attempted.
    #[error("misuse: {0}")]
    Misuse(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("string contains an interior NUL byte: {0}")]
    Nul(#[from] std::ffi::NulError),

    /// A user callback reported a failure.
    #[error("callback failed: {0}")]
    Callback(String),

    /// Best-effort teardown could not complete every step.
    #[error("teardown failed: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Teardown(Vec<Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

/// DB-API style classification used by the language bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Integrity,
    Operational,
    Programming,
    Interrupted,
    Database,
}

impl Error {
    pub(crate) fn from_code(code: c_int, message: impl Into<String>) -> Self {
        Error::Sqlite {
            code: ResultCode::from_raw(code),
            extended_code: code,
            message: message.into(),
        }
    }

    /// Result-code class of this error.
    pub fn code(&self) -> ResultCode {
        match self {
            Error::Sqlite { code, .. } | Error::Timeout { code, .. } => *code,
            Error::SchemaChanged { .. } => ResultCode::Schema,
            Error::Cancelled => ResultCode::Interrupt,
            Error::Misuse(_) => ResultCode::Misuse,
            Error::InvalidArgument(_) | Error::Nul(_) => ResultCode::Range,
            Error::Callback(_) | Error::Teardown(_) => ResultCode::Error,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Contention-class errors a caller may retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout { .. }) || self.code().is_contention()
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Cancelled => ErrorCategory::Interrupted,
            Error::Misuse(_) | Error::InvalidArgument(_) | Error::Nul(_) => {
                ErrorCategory::Programming
            }
            Error::Timeout { .. } | Error::SchemaChanged { .. } => ErrorCategory::Operational,
            Error::Callback(_) | Error::Teardown(_) => ErrorCategory::Database,
            Error::Sqlite { code, .. } => match code {
                ResultCode::Constraint => ErrorCategory::Integrity,
                ResultCode::Interrupt => ErrorCategory::Interrupted,
                ResultCode::Misuse | ResultCode::Range => ErrorCategory::Programming,
                ResultCode::Busy
                | ResultCode::Locked
                | ResultCode::ReadOnly
                | ResultCode::IoErr
                | ResultCode::CantOpen
                | ResultCode::Full
                | ResultCode::Schema
                | ResultCode::Perm
                | ResultCode::Abort => ErrorCategory::Operational,
                _ => ErrorCategory::Database,
            },
        }
    }
}

/// Last error message of `db`, or the generic text for `code` when there is no handle.
pub(crate) fn last_error_message(db: *mut ffi::sqlite3, code: c_int) -> String {
    if !db.is_null() {
        // Safety: db is a live connection handle; the returned text is copied before any
        // further native call can invalidate it.
        if let Some(msg) = unsafe { cstr_to_string(ffi::sqlite3_errmsg(db)) } {
            return msg;
        }
    }
    // Safety: sqlite3_errstr returns a pointer to a static string.
    unsafe { cstr_to_string(ffi::sqlite3_errstr(code)) }
        .unwrap_or_else(|| ResultCode::from_raw(code).to_string())
}

/// Build an [`Error::Sqlite`] from a failed native call on `db`.
pub(crate) fn error_from_handle(db: *mut ffi::sqlite3, code: c_int) -> Error {
    let extended = if db.is_null() {
        code
    } else {
        // Safety: db is a live connection handle.
        unsafe { ffi::sqlite3_extended_errcode(db) }
    };
    let extended = if ResultCode::from_raw(extended) == ResultCode::from_raw(code) {
        extended
    } else {
        code
    };
    Error::Sqlite {
        code: ResultCode::from_raw(code),
        extended_code: extended,
        message: last_error_message(db, code),
    }
}

/// Map a native return code to `Ok(())` or an error carrying the handle's message.
pub(crate) fn check(db: *mut ffi::sqlite3, rc: c_int) -> Result<()> {
    if rc == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(error_from_handle(db, rc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_classes() {
        assert_eq!(Error::Cancelled.code(), ResultCode::Interrupt);
        assert_eq!(Error::SchemaChanged { retries: 3 }.code(), ResultCode::Schema);
        assert_eq!(Error::Misuse("x".into()).code(), ResultCode::Misuse);
        let timeout = Error::Timeout {
            code: ResultCode::Locked,
            elapsed: Duration::from_millis(5),
        };
        assert!(timeout.is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            Error::from_code(ffi::SQLITE_CONSTRAINT, "UNIQUE constraint failed").category(),
            ErrorCategory::Integrity
        );
        assert_eq!(
            Error::from_code(ffi::SQLITE_BUSY, "database is locked").category(),
            ErrorCategory::Operational
        );
        assert_eq!(Error::Cancelled.category(), ErrorCategory::Interrupted);
        assert_eq!(Error::Misuse("closed".into()).category(), ErrorCategory::Programming);
        assert_eq!(
            Error::from_code(ffi::SQLITE_ERROR, "no such table: t").category(),
            ErrorCategory::Database
        );
    }

    #[test]
    fn test_teardown_message_joins_failures() {
        let err = Error::Teardown(vec![
            Error::Misuse("a".into()),
            Error::Callback("b".into()),
        ]);
        assert_eq!(err.to_string(), "teardown failed: misuse: a; callback failed: b");
    }

    #[test]
    fn test_last_error_message_without_handle() {
        let msg = last_error_message(std::ptr::null_mut(), ffi::SQLITE_BUSY);
        assert_eq!(msg, "database is locked");
    }
}
