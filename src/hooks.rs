//! Native callback registration and teardown.
//!
//! The engine keeps raw pointers to the closures registered here. A [`HookSet`] owns every
//! closure for one connection and must be unhooked (null callbacks registered) before the
//! native handle is pooled or freed; a callback firing into a dropped closure would be a
//! use-after-free.

use std::ffi::{c_char, c_int, c_uint, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use libsqlite3_sys as ffi;
use tracing::{error, warn};

use crate::errors::{Error, Result};
use crate::types::{Authorization, UpdateAction};
use crate::utils::cstr_to_string;

pub type UpdateHook = Box<dyn FnMut(UpdateAction, &str, &str, i64) + Send>;
/// Returns `true` to turn the commit into a rollback.
pub type CommitHook = Box<dyn FnMut() -> bool + Send>;
pub type RollbackHook = Box<dyn FnMut() + Send>;
pub type Authorizer = Box<dyn FnMut(&AuthorizerContext<'_>) -> Authorization + Send>;
/// Returns `true` to interrupt the running statement.
pub type ProgressHook = Box<dyn FnMut() -> bool + Send>;
pub type TraceCallback = Box<dyn FnMut(&str) + Send>;
pub type LogCallback = Arc<dyn Fn(i32, &str) + Send + Sync>;

/// Arguments passed to an authorizer callback.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizerContext<'a> {
    /// One of the `SQLITE_CREATE_INDEX` .. `SQLITE_RECURSIVE` action codes.
    pub action: i32,
    pub arg1: Option<&'a str>,
    pub arg2: Option<&'a str>,
    pub database: Option<&'a str>,
    pub trigger_or_view: Option<&'a str>,
}

fn guarded<R>(hook: &str, fallback: R, f: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            error!(hook, "callback panicked; returning the safe default to the engine");
            fallback
        }
    }
}

unsafe fn text<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        None
    } else {
        std::ffi::CStr::from_ptr(ptr).to_str().ok()
    }
}

unsafe extern "C" fn update_trampoline(
    ctx: *mut c_void,
    op: c_int,
    db_name: *const c_char,
    table: *const c_char,
    rowid: ffi::sqlite3_int64,
) {
    // Safety: ctx points at the UpdateHook boxed in the owning HookSet, which unregisters
    // this trampoline before dropping it.
    let hook = &mut *(ctx as *mut UpdateHook);
    let db_name = text(db_name).unwrap_or_default();
    let table = text(table).unwrap_or_default();
    guarded("update", (), || hook(UpdateAction::from_raw(op), db_name, table, rowid));
}

unsafe extern "C" fn commit_trampoline(ctx: *mut c_void) -> c_int {
    // Safety: see update_trampoline.
    let hook = &mut *(ctx as *mut CommitHook);
    guarded("commit", true, || hook()) as c_int
}

unsafe extern "C" fn rollback_trampoline(ctx: *mut c_void) {
    // Safety: see update_trampoline.
    let hook = &mut *(ctx as *mut RollbackHook);
    guarded("rollback", (), || hook());
}

unsafe extern "C" fn authorizer_trampoline(
    ctx: *mut c_void,
    action: c_int,
    arg1: *const c_char,
    arg2: *const c_char,
    database: *const c_char,
    trigger_or_view: *const c_char,
) -> c_int {
    // Safety: see update_trampoline.
    let hook = &mut *(ctx as *mut Authorizer);
    let context = AuthorizerContext {
        action,
        arg1: text(arg1),
        arg2: text(arg2),
        database: text(database),
        trigger_or_view: text(trigger_or_view),
    };
    guarded("authorizer", Authorization::Deny, || hook(&context)).as_raw()
}

unsafe extern "C" fn progress_trampoline(ctx: *mut c_void) -> c_int {
    // Safety: see update_trampoline.
    let hook = &mut *(ctx as *mut ProgressHook);
    guarded("progress", false, || hook()) as c_int
}

unsafe extern "C" fn trace_trampoline(
    _mask: c_uint,
    ctx: *mut c_void,
    _stmt: *mut c_void,
    sql: *mut c_void,
) -> c_int {
    if ctx.is_null() || sql.is_null() {
        return 0;
    }
    // Safety: see update_trampoline; for SQLITE_TRACE_STMT the last argument is the
    // statement text.
    let hook = &mut *(ctx as *mut TraceCallback);
    if let Some(sql) = text(sql as *const c_char) {
        guarded("trace", (), || hook(sql));
    }
    0
}

fn user_data<T>(slot: &mut Option<Box<T>>) -> *mut c_void {
    slot.as_mut()
        .map_or(ptr::null_mut(), |boxed| &mut **boxed as *mut T as *mut c_void)
}

/// Closures currently registered with one native connection.
#[derive(Default)]
pub(crate) struct HookSet {
    update: Option<Box<UpdateHook>>,
    commit: Option<Box<CommitHook>>,
    rollback: Option<Box<RollbackHook>>,
    authorizer: Option<Box<Authorizer>>,
    progress: Option<Box<ProgressHook>>,
    trace: Option<Box<TraceCallback>>,
}

impl HookSet {
    pub(crate) fn set_update(&mut self, db: *mut ffi::sqlite3, hook: Option<UpdateHook>) {
        let mut next = hook.map(Box::new);
        let ctx = user_data(&mut next);
        // Safety: db is live; the new closure outlives its registration and the old one is
        // dropped only after the engine stopped referring to it.
        unsafe {
            ffi::sqlite3_update_hook(
                db,
                if ctx.is_null() { None } else { Some(update_trampoline) },
                ctx,
            )
        };
        self.update = next;
    }

    pub(crate) fn set_commit(&mut self, db: *mut ffi::sqlite3, hook: Option<CommitHook>) {
        let mut next = hook.map(Box::new);
        let ctx = user_data(&mut next);
        // Safety: see set_update.
        unsafe {
            ffi::sqlite3_commit_hook(
                db,
                if ctx.is_null() { None } else { Some(commit_trampoline) },
                ctx,
            )
        };
        self.commit = next;
    }

    pub(crate) fn set_rollback(&mut self, db: *mut ffi::sqlite3, hook: Option<RollbackHook>) {
        let mut next = hook.map(Box::new);
        let ctx = user_data(&mut next);
        // Safety: see set_update.
        unsafe {
            ffi::sqlite3_rollback_hook(
                db,
                if ctx.is_null() { None } else { Some(rollback_trampoline) },
                ctx,
            )
        };
        self.rollback = next;
    }

    pub(crate) fn set_authorizer(
        &mut self,
        db: *mut ffi::sqlite3,
        hook: Option<Authorizer>,
    ) -> Result<()> {
        let mut next = hook.map(Box::new);
        let ctx = user_data(&mut next);
        // Safety: see set_update.
        let rc = unsafe {
            ffi::sqlite3_set_authorizer(
                db,
                if ctx.is_null() { None } else { Some(authorizer_trampoline) },
                ctx,
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(Error::from_code(rc, "failed to register authorizer"));
        }
        self.authorizer = next;
        Ok(())
    }

    pub(crate) fn set_progress(
        &mut self,
        db: *mut ffi::sqlite3,
        instructions: i32,
        hook: Option<ProgressHook>,
    ) {
        let mut next = hook.map(Box::new);
        let ctx = user_data(&mut next);
        let instructions = if ctx.is_null() { 0 } else { instructions };
        // Safety: see set_update.
        unsafe {
            ffi::sqlite3_progress_handler(
                db,
                instructions,
                if ctx.is_null() { None } else { Some(progress_trampoline) },
                ctx,
            )
        };
        self.progress = next;
    }

    pub(crate) fn set_trace(
        &mut self,
        db: *mut ffi::sqlite3,
        hook: Option<TraceCallback>,
    ) -> Result<()> {
        let mut next = hook.map(Box::new);
        let ctx = user_data(&mut next);
        let mask = if !ctx.is_null() {
            ffi::SQLITE_TRACE_STMT as c_uint
        } else {
            0
        };
        // Safety: see set_update.
        let rc = unsafe {
            ffi::sqlite3_trace_v2(
                db,
                mask,
                if ctx.is_null() { None } else { Some(trace_trampoline) },
                ctx,
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(Error::from_code(rc, "failed to register trace callback"));
        }
        self.trace = next;
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.update.is_none()
            && self.commit.is_none()
            && self.rollback.is_none()
            && self.authorizer.is_none()
            && self.progress.is_none()
            && self.trace.is_none()
    }

    /// Register a null callback for every hook, attempting each one even if another fails.
    ///
    /// Closures whose native registration could not be cleared are leaked rather than
    /// dropped, since the engine may still call into them.
    pub(crate) fn unhook_all(&mut self, db: *mut ffi::sqlite3) -> Vec<Error> {
        let mut failures = Vec::new();
        self.set_rollback(db, None);
        if let Err(e) = self.set_trace(db, None) {
            failures.push(e);
            std::mem::forget(self.trace.take());
        }
        self.set_commit(db, None);
        self.set_update(db, None);
        if let Err(e) = self.set_authorizer(db, None) {
            failures.push(e);
            std::mem::forget(self.authorizer.take());
        }
        self.set_progress(db, 0, None);
        failures
    }
}

struct LogRegistration {
    token: u64,
    callback: LogCallback,
}

static LOG_CALLBACK: Mutex<Option<LogRegistration>> = Mutex::new(None);
static NEXT_LOG_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Proof of having installed the process-wide log callback.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct LogToken(u64);

type NativeLogFn = unsafe extern "C" fn(*mut c_void, c_int, *const c_char);

unsafe extern "C" fn log_trampoline(_ctx: *mut c_void, code: c_int, message: *const c_char) {
    let callback = LOG_CALLBACK
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(|registration| Arc::clone(&registration.callback));
    if let Some(callback) = callback {
        let message = cstr_to_string(message).unwrap_or_default();
        guarded("log", (), || callback(code, &message));
    }
}

/// Install (or replace) the process-wide log callback.
///
/// Only the holder of the current token may replace it; installing over another
/// connection's callback is rejected.
pub(crate) fn install_log_callback(
    current: Option<&LogToken>,
    callback: LogCallback,
) -> Result<LogToken> {
    let mut slot = LOG_CALLBACK.lock().unwrap_or_else(PoisonError::into_inner);
    match (slot.as_ref(), current) {
        (Some(existing), Some(token)) if existing.token == token.0 => {}
        (Some(_), _) => {
            return Err(Error::Misuse(
                "the log callback is owned by another connection".into(),
            ))
        }
        (None, _) => {
            // Safety: SQLITE_CONFIG_LOG may be changed at any time; the trampoline reads the
            // callback from the registry, so no pointer into Rust memory is handed out.
            let rc = unsafe {
                ffi::sqlite3_config(
                    ffi::SQLITE_CONFIG_LOG,
                    log_trampoline as NativeLogFn,
                    ptr::null_mut::<c_void>(),
                )
            };
            if rc != ffi::SQLITE_OK {
                return Err(Error::from_code(rc, "failed to install log callback"));
            }
        }
    }
    let token = NEXT_LOG_TOKEN.fetch_add(1, Ordering::Relaxed);
    *slot = Some(LogRegistration { token, callback });
    Ok(LogToken(token))
}

/// Remove the process-wide log callback if `token` still owns it.
pub(crate) fn uninstall_log_callback(token: LogToken) -> Result<()> {
    let mut slot = LOG_CALLBACK.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.as_ref().map(|r| r.token) != Some(token.0) {
        warn!("log callback was replaced by another owner; leaving it installed");
        return Ok(());
    }
    // Safety: clearing the log callback is permitted at any time.
    let rc = unsafe {
        ffi::sqlite3_config(
            ffi::SQLITE_CONFIG_LOG,
            ptr::null_mut::<c_void>(),
            ptr::null_mut::<c_void>(),
        )
    };
    if rc != ffi::SQLITE_OK {
        return Err(Error::from_code(rc, "failed to remove log callback"));
    }
    *slot = None;
    Ok(())
}

/// Whether any connection currently owns the native log callback.
pub fn log_callback_installed() -> bool {
    LOG_CALLBACK
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}
