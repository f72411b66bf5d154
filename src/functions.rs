//! User-defined scalar functions and collations.
//!
//! Definitions live in a process-wide registry; every connection binds the registered set when
//! it opens (unless [`ConnectionFlags::NO_BIND_FUNCTIONS`] is set) and may bind extra
//! definitions of its own. The engine owns a boxed copy of each callback and frees it through
//! the destroy trampoline when the binding is replaced, removed, or the handle is closed.
//!
//! [`ConnectionFlags::NO_BIND_FUNCTIONS`]: crate::types::ConnectionFlags::NO_BIND_FUNCTIONS

use std::cmp::Ordering;
use std::ffi::{c_char, c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};

use libsqlite3_sys as ffi;
use tracing::{debug, error};

use crate::errors::{check, Error, Result};
use crate::types::Value;
use crate::utils::to_cstring;

pub type ScalarFn = Arc<dyn Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync>;
pub type CollationFn = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

#[derive(Clone)]
pub enum FunctionKind {
    Scalar {
        /// Number of arguments, or -1 for any.
        arity: i32,
        deterministic: bool,
        func: ScalarFn,
    },
    Collation(CollationFn),
}

#[derive(Clone)]
pub struct FunctionDefinition {
    pub name: String,
    pub kind: FunctionKind,
}

impl FunctionDefinition {
    pub fn scalar<F>(name: impl Into<String>, arity: i32, func: F) -> Self
    where
        F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: FunctionKind::Scalar {
                arity,
                deterministic: false,
                func: Arc::new(func),
            },
        }
    }

    pub fn collation<F>(name: impl Into<String>, compare: F) -> Self
    where
        F: Fn(&str, &str) -> Ordering + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: FunctionKind::Collation(Arc::new(compare)),
        }
    }

    /// Mark a scalar function as deterministic so the planner may factor it out.
    pub fn deterministic(mut self) -> Self {
        if let FunctionKind::Scalar { deterministic, .. } = &mut self.kind {
            *deterministic = true;
        }
        self
    }

    fn key(&self) -> FunctionKey {
        FunctionKey {
            name: self.name.to_ascii_lowercase(),
            arity: match &self.kind {
                FunctionKind::Scalar { arity, .. } => Some(*arity),
                FunctionKind::Collation(_) => None,
            },
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("function name cannot be empty".into()));
        }
        if let FunctionKind::Scalar { arity, .. } = self.kind {
            if !(-1..=127).contains(&arity) {
                return Err(Error::InvalidArgument(format!(
                    "invalid arity {arity} for '{}': expected -1..=127",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FunctionDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = f.debug_struct("FunctionDefinition");
        out.field("name", &self.name);
        match &self.kind {
            FunctionKind::Scalar {
                arity,
                deterministic,
                ..
            } => out
                .field("arity", arity)
                .field("deterministic", deterministic),
            FunctionKind::Collation(_) => out.field("collation", &true),
        };
        out.finish()
    }
}

/// Names are case-insensitive; scalar functions are further keyed by arity.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FunctionKey {
    name: String,
    arity: Option<i32>,
}

static REGISTRY: Mutex<Vec<FunctionDefinition>> = Mutex::new(Vec::new());

fn upsert(list: &mut Vec<FunctionDefinition>, def: FunctionDefinition) {
    let key = def.key();
    match list.iter_mut().find(|existing| existing.key() == key) {
        Some(existing) => *existing = def,
        None => list.push(def),
    }
}

/// Add a definition bound by every connection opened from now on, replacing one with the
/// same name (and arity).
pub fn register_function(def: FunctionDefinition) -> Result<()> {
    def.validate()?;
    let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
    upsert(&mut registry, def);
    Ok(())
}

pub fn register_collation<F>(name: impl Into<String>, compare: F) -> Result<()>
where
    F: Fn(&str, &str) -> Ordering + Send + Sync + 'static,
{
    register_function(FunctionDefinition::collation(name, compare))
}

/// Drop every registered definition called `name`. Connections that already bound it keep
/// their binding until they unbind or close.
pub fn unregister(name: &str) -> bool {
    let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
    let before = registry.len();
    registry.retain(|def| !def.name.eq_ignore_ascii_case(name));
    registry.len() != before
}

pub fn registered() -> Vec<FunctionDefinition> {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

unsafe fn value_from_raw(value: *mut ffi::sqlite3_value) -> Value {
    match ffi::sqlite3_value_type(value) {
        ffi::SQLITE_INTEGER => Value::Integer(ffi::sqlite3_value_int64(value)),
        ffi::SQLITE_FLOAT => Value::Real(ffi::sqlite3_value_double(value)),
        ffi::SQLITE_TEXT => {
            let text = ffi::sqlite3_value_text(value);
            let len = ffi::sqlite3_value_bytes(value).max(0) as usize;
            if text.is_null() {
                Value::Text(String::new())
            } else {
                let bytes = std::slice::from_raw_parts(text, len);
                Value::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        }
        ffi::SQLITE_BLOB => {
            let blob = ffi::sqlite3_value_blob(value) as *const u8;
            let len = ffi::sqlite3_value_bytes(value).max(0) as usize;
            if blob.is_null() {
                Value::Blob(Vec::new())
            } else {
                Value::Blob(std::slice::from_raw_parts(blob, len).to_vec())
            }
        }
        _ => Value::Null,
    }
}

unsafe fn result_error(ctx: *mut ffi::sqlite3_context, message: &str) {
    let len = c_int::try_from(message.len()).unwrap_or(c_int::MAX);
    ffi::sqlite3_result_error(ctx, message.as_ptr() as *const c_char, len);
}

unsafe fn set_result(ctx: *mut ffi::sqlite3_context, value: &Value) {
    match value {
        Value::Null => ffi::sqlite3_result_null(ctx),
        Value::Integer(v) => ffi::sqlite3_result_int64(ctx, *v),
        Value::Real(v) => ffi::sqlite3_result_double(ctx, *v),
        Value::Text(text) => match c_int::try_from(text.len()) {
            Ok(len) => ffi::sqlite3_result_text(
                ctx,
                text.as_ptr() as *const c_char,
                len,
                ffi::SQLITE_TRANSIENT(),
            ),
            Err(_) => ffi::sqlite3_result_error_toobig(ctx),
        },
        Value::Blob(bytes) => match c_int::try_from(bytes.len()) {
            Ok(len) => ffi::sqlite3_result_blob(
                ctx,
                bytes.as_ptr() as *const c_void,
                len,
                ffi::SQLITE_TRANSIENT(),
            ),
            Err(_) => ffi::sqlite3_result_error_toobig(ctx),
        },
    }
}

unsafe extern "C" fn scalar_trampoline(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let user_data = ffi::sqlite3_user_data(ctx);
    if user_data.is_null() {
        ffi::sqlite3_result_null(ctx);
        return;
    }
    // Safety: user_data is the boxed ScalarFn registered with this function; the engine
    // keeps it alive until scalar_destroy runs.
    let func = &*(user_data as *const ScalarFn);
    let args: Vec<Value> = (0..argc.max(0) as usize)
        .map(|i| value_from_raw(*argv.add(i)))
        .collect();
    match catch_unwind(AssertUnwindSafe(|| func(&args))) {
        Ok(Ok(value)) => set_result(ctx, &value),
        Ok(Err(message)) => result_error(ctx, &message),
        Err(_) => {
            error!("user-defined function panicked");
            result_error(ctx, "user-defined function panicked");
        }
    }
}

unsafe extern "C" fn scalar_destroy(user_data: *mut c_void) {
    if !user_data.is_null() {
        drop(Box::from_raw(user_data as *mut ScalarFn));
    }
}

unsafe extern "C" fn collation_trampoline(
    user_data: *mut c_void,
    left_len: c_int,
    left: *const c_void,
    right_len: c_int,
    right: *const c_void,
) -> c_int {
    // Safety: user_data is the boxed CollationFn registered with this collation.
    let compare = &*(user_data as *const CollationFn);
    let text = |ptr: *const c_void, len: c_int| {
        if ptr.is_null() || len <= 0 {
            std::borrow::Cow::Borrowed("")
        } else {
            String::from_utf8_lossy(std::slice::from_raw_parts(ptr as *const u8, len as usize))
        }
    };
    let (left, right) = (text(left, left_len), text(right, right_len));
    match catch_unwind(AssertUnwindSafe(|| compare(&left, &right))) {
        Ok(ordering) => ordering as c_int,
        Err(_) => {
            error!("collation panicked; treating operands as equal");
            0
        }
    }
}

unsafe extern "C" fn collation_destroy(user_data: *mut c_void) {
    if !user_data.is_null() {
        drop(Box::from_raw(user_data as *mut CollationFn));
    }
}

fn bind_native(db: *mut ffi::sqlite3, def: &FunctionDefinition) -> Result<()> {
    let name = to_cstring(&def.name)?;
    match &def.kind {
        FunctionKind::Scalar {
            arity,
            deterministic,
            func,
        } => {
            let mut text_rep = ffi::SQLITE_UTF8;
            if *deterministic {
                text_rep |= ffi::SQLITE_DETERMINISTIC;
            }
            let user_data = Box::into_raw(Box::new(Arc::clone(func))) as *mut c_void;
            // Safety: db is live; on failure the engine invokes scalar_destroy itself, so
            // user_data is never freed twice.
            let rc = unsafe {
                ffi::sqlite3_create_function_v2(
                    db,
                    name.as_ptr(),
                    *arity,
                    text_rep,
                    user_data,
                    Some(scalar_trampoline),
                    None,
                    None,
                    Some(scalar_destroy),
                )
            };
            check(db, rc)
        }
        FunctionKind::Collation(compare) => {
            let user_data = Box::into_raw(Box::new(Arc::clone(compare))) as *mut c_void;
            // Safety: db is live. The engine does not call the destructor when registration
            // fails, so the box is reclaimed here in that case.
            let rc = unsafe {
                ffi::sqlite3_create_collation_v2(
                    db,
                    name.as_ptr(),
                    ffi::SQLITE_UTF8,
                    user_data,
                    Some(collation_trampoline),
                    Some(collation_destroy),
                )
            };
            if rc != ffi::SQLITE_OK {
                unsafe { collation_destroy(user_data) };
            }
            check(db, rc)
        }
    }
}

fn unbind_native(db: *mut ffi::sqlite3, key: &FunctionKey) -> Result<()> {
    let name = to_cstring(&key.name)?;
    // Safety: registering null callbacks removes the binding; the engine runs the old
    // destructor.
    let rc = unsafe {
        match key.arity {
            Some(arity) => ffi::sqlite3_create_function_v2(
                db,
                name.as_ptr(),
                arity,
                ffi::SQLITE_UTF8,
                ptr::null_mut(),
                None,
                None,
                None,
                None,
            ),
            None => ffi::sqlite3_create_collation_v2(
                db,
                name.as_ptr(),
                ffi::SQLITE_UTF8,
                ptr::null_mut(),
                None,
                None,
            ),
        }
    };
    check(db, rc)
}

/// Definitions bound to one native connection.
#[derive(Debug, Default)]
pub(crate) struct BoundFunctions {
    keys: Vec<FunctionKey>,
}

impl BoundFunctions {
    pub(crate) fn bind(&mut self, db: *mut ffi::sqlite3, def: &FunctionDefinition) -> Result<()> {
        def.validate()?;
        bind_native(db, def)?;
        let key = def.key();
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
        debug!(name = %def.name, "bound function");
        Ok(())
    }

    /// Bind every registered definition, replacing earlier bindings of the same name.
    pub(crate) fn bind_registered(&mut self, db: *mut ffi::sqlite3) -> Result<()> {
        for def in registered() {
            self.bind(db, &def)?;
        }
        Ok(())
    }

    /// Remove every binding made through this set, attempting each one even if another fails.
    pub(crate) fn unbind_all(&mut self, db: *mut ffi::sqlite3) -> Vec<Error> {
        self.keys
            .drain(..)
            .filter_map(|key| unbind_native(db, &key).err())
            .collect()
    }

    /// Forget bindings without touching the engine, e.g. after the handle was closed.
    pub(crate) fn forget(&mut self) {
        self.keys.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::native;

    fn open_memory() -> *mut ffi::sqlite3 {
        let path = std::ffi::CString::new(":memory:").unwrap();
        let mut db = ptr::null_mut();
        let flags = ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        let rc = unsafe { ffi::sqlite3_open_v2(path.as_ptr(), &mut db, flags, ptr::null()) };
        assert_eq!(rc, ffi::SQLITE_OK);
        db
    }

    fn query_text(db: *mut ffi::sqlite3, sql: &str) -> std::result::Result<String, String> {
        let text = std::ffi::CString::new(sql).unwrap();
        let mut stmt = ptr::null_mut();
        unsafe {
            let rc = ffi::sqlite3_prepare_v2(db, text.as_ptr(), -1, &mut stmt, ptr::null_mut());
            if rc != ffi::SQLITE_OK {
                return Err(crate::errors::last_error_message(db, rc));
            }
            let rc = ffi::sqlite3_step(stmt);
            let out = if rc == ffi::SQLITE_ROW {
                let ptr = ffi::sqlite3_column_text(stmt, 0);
                Ok(crate::utils::cstr_to_string(ptr as *const c_char).unwrap_or_default())
            } else {
                Err(crate::errors::last_error_message(db, rc))
            };
            ffi::sqlite3_finalize(stmt);
            out
        }
    }

    #[test]
    fn test_registry_replaces_by_name_and_arity() {
        register_function(FunctionDefinition::scalar("fn_registry_a", 1, |_| Ok(Value::Null)))
            .unwrap();
        register_function(FunctionDefinition::scalar("FN_REGISTRY_A", 1, |_| {
            Ok(Value::Integer(1))
        }))
        .unwrap();
        register_function(FunctionDefinition::scalar("fn_registry_a", 2, |_| Ok(Value::Null)))
            .unwrap();
        let count = registered()
            .iter()
            .filter(|def| def.name.eq_ignore_ascii_case("fn_registry_a"))
            .count();
        assert_eq!(count, 2);
        assert!(unregister("fn_registry_a"));
        assert!(!unregister("fn_registry_a"));
    }

    #[test]
    fn test_invalid_arity_is_rejected() {
        let def = FunctionDefinition::scalar("fn_bad_arity", 200, |_| Ok(Value::Null));
        assert!(matches!(register_function(def), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_scalar_function_binds_and_unbinds() {
        let db = open_memory();
        let mut bound = BoundFunctions::default();
        let def = FunctionDefinition::scalar("shout", 1, |args| match &args[0] {
            Value::Text(s) => Ok(Value::Text(s.to_uppercase())),
            other => Err(format!("expected text, got {other:?}")),
        })
        .deterministic();
        bound.bind(db, &def).unwrap();
        bound.bind(db, &def).unwrap();
        assert_eq!(bound.len(), 1);

        assert_eq!(query_text(db, "SELECT shout('abc')").unwrap(), "ABC");
        let err = query_text(db, "SELECT shout(1)").unwrap_err();
        assert!(err.contains("expected text"), "{err}");

        assert!(bound.unbind_all(db).is_empty());
        assert!(query_text(db, "SELECT shout('abc')").is_err());
        unsafe { native::sqlite3_close_v2(db) };
    }

    #[test]
    fn test_panicking_function_reports_an_error() {
        let db = open_memory();
        let mut bound = BoundFunctions::default();
        let def = FunctionDefinition::scalar("explode", 0, |_| panic!("boom"));
        bound.bind(db, &def).unwrap();
        let err = query_text(db, "SELECT explode()").unwrap_err();
        assert!(err.contains("panicked"), "{err}");
        unsafe { native::sqlite3_close_v2(db) };
    }

    #[test]
    fn test_collation_orders_rows() {
        let db = open_memory();
        let mut bound = BoundFunctions::default();
        let def = FunctionDefinition::collation("by_length", |a: &str, b: &str| {
            a.len().cmp(&b.len())
        });
        bound.bind(db, &def).unwrap();
        let sql = "SELECT group_concat(v, ',') FROM \
                   (SELECT v FROM (SELECT 'ccc' AS v UNION ALL SELECT 'a' UNION ALL SELECT 'bb') \
                   ORDER BY v COLLATE by_length)";
        assert_eq!(query_text(db, sql).unwrap(), "a,bb,ccc");
        assert!(bound.unbind_all(db).is_empty());
        unsafe { native::sqlite3_close_v2(db) };
    }
}
