//! Python exception types exposed by the extension module.

use pyo3::create_exception;
use pyo3::exceptions::PyException;
use pyo3::PyErr;

use crate::errors::{Error as DriverError, ErrorCategory};

// DB-API style hierarchy: every driver error derives from Error.
create_exception!(_rawsqlite, Error, PyException);
create_exception!(_rawsqlite, DatabaseError, Error);
create_exception!(_rawsqlite, OperationalError, DatabaseError);
create_exception!(_rawsqlite, ProgrammingError, DatabaseError);
create_exception!(_rawsqlite, IntegrityError, DatabaseError);
create_exception!(_rawsqlite, InterruptedError, OperationalError);

/// Map a driver error onto the exception class of its category.
pub(crate) fn to_py_err(e: DriverError) -> PyErr {
    let message = e.to_string();
    match e.category() {
        ErrorCategory::Integrity => IntegrityError::new_err(message),
        ErrorCategory::Operational => OperationalError::new_err(message),
        ErrorCategory::Programming => ProgrammingError::new_err(message),
        ErrorCategory::Interrupted => InterruptedError::new_err(message),
        ErrorCategory::Database => DatabaseError::new_err(message),
    }
}
