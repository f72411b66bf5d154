//! Thin synchronous Python surface over [`crate::Connection`].

use std::time::Duration;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyList, PyString, PyTuple};

use crate::backup::backup_database;
use crate::config::{DriverConfig, OpenOptions};
use crate::connection::Connection;
use crate::exceptions::{
    to_py_err, DatabaseError, Error, IntegrityError, InterruptedError, OperationalError,
    ProgrammingError,
};
use crate::handle::CancelHandle;
use crate::types::Value;

fn to_value(value: &Bound<'_, PyAny>) -> PyResult<Value> {
    if value.is_none() {
        Ok(Value::Null)
    } else if let Ok(v) = value.extract::<i64>() {
        Ok(Value::Integer(v))
    } else if let Ok(v) = value.extract::<f64>() {
        Ok(Value::Real(v))
    } else if let Ok(v) = value.extract::<String>() {
        Ok(Value::Text(v))
    } else if let Ok(v) = value.extract::<Vec<u8>>() {
        Ok(Value::Blob(v))
    } else {
        Err(PyValueError::new_err(format!(
            "unsupported parameter type: {}",
            value.get_type().name()?
        )))
    }
}

fn to_py(py: Python<'_>, value: Value) -> PyResult<Py<PyAny>> {
    Ok(match value {
        Value::Null => py.None(),
        Value::Integer(v) => v.into_pyobject(py)?.into_any().unbind(),
        Value::Real(v) => v.into_pyobject(py)?.into_any().unbind(),
        Value::Text(v) => PyString::new(py, &v).into_any().unbind(),
        Value::Blob(v) => PyBytes::new(py, &v).into_any().unbind(),
    })
}

/// Synchronous SQLite connection.
#[pyclass(unsendable, name = "Connection")]
pub(crate) struct PyConnection {
    inner: Connection,
    timeout: Duration,
}

#[pymethods]
impl PyConnection {
    /// Open `path`. Pooled handles are only used for on-disk databases opened with
    /// `pooling=True`.
    #[new]
    #[pyo3(signature = (path, *, pooling = false, timeout = 30.0))]
    fn new(path: String, pooling: bool, timeout: f64) -> PyResult<Self> {
        if !timeout.is_finite() || timeout < 0.0 {
            return Err(PyValueError::new_err("timeout must be >= 0.0"));
        }
        let timeout = Duration::from_secs_f64(timeout);
        let config = DriverConfig {
            default_timeout_ms: timeout.as_millis().try_into().unwrap_or(u64::MAX),
            ..DriverConfig::default()
        };
        let mut inner = Connection::new(config);
        inner
            .open(&path, &OpenOptions::new().pooling(pooling))
            .map_err(to_py_err)?;
        Ok(Self { inner, timeout })
    }

    /// Run every statement of `sql`; returns the number of rows changed.
    fn execute(&mut self, py: Python<'_>, sql: &str) -> PyResult<usize> {
        let inner = &mut self.inner;
        py.detach(|| inner.execute(sql)).map_err(to_py_err)
    }

    /// Run the first statement of `sql` and return its rows as tuples.
    #[pyo3(signature = (sql, parameters = None))]
    fn query<'py>(
        &mut self,
        py: Python<'py>,
        sql: &str,
        parameters: Option<Vec<Bound<'py, PyAny>>>,
    ) -> PyResult<Bound<'py, PyList>> {
        let params = parameters
            .unwrap_or_default()
            .iter()
            .map(to_value)
            .collect::<PyResult<Vec<_>>>()?;
        let inner = &mut self.inner;
        let rows = py
            .detach(|| inner.query_rows(sql, &params))
            .map_err(to_py_err)?;
        let rows = rows
            .into_iter()
            .map(|row| {
                let items = row
                    .into_iter()
                    .map(|value| to_py(py, value))
                    .collect::<PyResult<Vec<_>>>()?;
                PyTuple::new(py, items)
            })
            .collect::<PyResult<Vec<_>>>()?;
        PyList::new(py, rows)
    }

    /// Copy this database into `target`.
    #[pyo3(signature = (target, *, pages = 0, name = "main", sleep = 0.25))]
    fn backup(&self, target: &mut PyConnection, pages: i32, name: &str, sleep: f64) -> PyResult<()> {
        if !sleep.is_finite() || sleep < 0.0 {
            return Err(PyValueError::new_err("sleep must be >= 0.0"));
        }
        backup_database(
            &self.inner,
            name,
            &mut target.inner,
            "main",
            pages,
            Duration::from_secs_f64(sleep),
            None,
        )
        .map_err(to_py_err)
    }

    /// A handle whose `cancel()` may be called from any thread.
    fn cancel_handle(&self) -> PyCancelHandle {
        PyCancelHandle {
            inner: self.inner.cancel_handle(),
        }
    }

    fn cancel(&self) {
        self.inner.cancel();
    }

    fn close(&mut self) -> PyResult<()> {
        self.inner.close().map_err(to_py_err)
    }

    #[getter]
    fn total_timeout(&self) -> f64 {
        self.timeout.as_secs_f64()
    }

    #[getter]
    fn in_transaction(&self) -> PyResult<bool> {
        Ok(!self.inner.is_autocommit().map_err(to_py_err)?)
    }

    #[getter]
    fn lastrowid(&self) -> PyResult<i64> {
        self.inner.last_insert_rowid().map_err(to_py_err)
    }

    #[getter]
    fn changes(&self) -> PyResult<i64> {
        self.inner.changes().map_err(to_py_err)
    }

    fn __enter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    #[pyo3(signature = (*_args))]
    fn __exit__(&mut self, _args: &Bound<'_, PyTuple>) -> PyResult<bool> {
        self.close()?;
        Ok(false)
    }
}

/// Cancels the running or next call of the connection it came from.
#[pyclass(name = "CancelHandle")]
pub(crate) struct PyCancelHandle {
    inner: CancelHandle,
}

#[pymethods]
impl PyCancelHandle {
    fn cancel(&self) {
        self.inner.cancel();
    }
}

/// Python bindings for rawsqlite.
#[pymodule]
fn _rawsqlite(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = m.py();
    m.add_class::<PyConnection>()?;
    m.add_class::<PyCancelHandle>()?;
    m.add("Error", py.get_type::<Error>())?;
    m.add("DatabaseError", py.get_type::<DatabaseError>())?;
    m.add("OperationalError", py.get_type::<OperationalError>())?;
    m.add("ProgrammingError", py.get_type::<ProgrammingError>())?;
    m.add("IntegrityError", py.get_type::<IntegrityError>())?;
    m.add("InterruptedError", py.get_type::<InterruptedError>())?;
    m.add("sqlite_version", Connection::version())?;
    Ok(())
}
