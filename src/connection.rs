//! The driver: one logical database connection over a native handle.
//!
//! A [`Connection`] owns (or borrows) a native handle, the statements prepared on it, and
//! every callback registered with it. Prepare and step recover from schema invalidation and
//! contention internally; cancellation requested through a [`CancelHandle`] always wins.
//!
//! A connection is `Send` but not `Sync`. Driving one connection from several threads at
//! once is not supported; only [`CancelHandle::cancel`] may be called concurrently.

use std::collections::BTreeMap;
use std::ffi::{c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use libsqlite3_sys as ffi;
use tracing::{debug, instrument, warn};

use crate::config::{DriverConfig, OpenOptions};
use crate::errors::{check, error_from_handle, Error, Result};
use crate::events::{self, LifecycleEvent};
use crate::functions::{BoundFunctions, FunctionDefinition};
use crate::handle::{native, CancelHandle, ConnectionHandle};
use crate::hooks::{
    self, Authorizer, CommitHook, HookSet, LogCallback, LogToken, ProgressHook, RollbackHook,
    TraceCallback, UpdateHook,
};
use crate::module::ModuleSet;
use crate::pool::{self, ConnectionPool, PoolCounts};
use crate::retry::{self, Attempt, Next, RetryState, ThreadSleep};
use crate::statement::{RawStatement, StatementArena, StatementId, StatementSlot};
use crate::types::{
    ColumnType, ConnectionFlags, DbConfigOption, LimitOption, OpenFlags, ResultCode, Value,
};
use crate::utils::{
    cstr_to_string, hex_key_literal, is_private_database, is_temp_schema_error,
    is_types_clause_error, normalize_pool_key, parse_type_definitions, split_types_clause,
    strip_base_schema, to_cstring, validate_path,
};

/// Result of [`Connection::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    /// `None` when the text held no statement or the engine interrupted the prepare. An
    /// interrupted prepare leaves the whole text in `remaining`.
    pub statement: Option<StatementId>,
    /// Unparsed tail of the script.
    pub remaining: String,
}

/// Rebuilds the temporary schema tables on demand.
pub type TempSchemaBuilder = Box<dyn FnMut(&mut Connection) -> Result<()> + Send>;

pub struct Connection {
    handle: Option<ConnectionHandle>,
    config: DriverConfig,
    pool: Arc<dyn ConnectionPool>,
    statements: StatementArena,
    hooks: HookSet,
    log_token: Option<LogToken>,
    cancel: CancelHandle,
    /// Cancellation counter value last reported to the caller.
    cancel_seen: u64,
    functions: BoundFunctions,
    modules: ModuleSet,
    use_pool: bool,
    pool_version: u64,
    max_pool_size: usize,
    file_name: String,
    pool_key: String,
    flags: ConnectionFlags,
    building_temp_schema: bool,
    temp_schema_builder: Option<TempSchemaBuilder>,
}

struct NativePrepare {
    rc: c_int,
    raw: Option<RawStatement>,
    consumed: usize,
}

fn native_prepare(db: *mut ffi::sqlite3, sql: &str, legacy: bool) -> Result<NativePrepare> {
    let len = byte_len(sql.len())?;
    let start = sql.as_ptr() as *const c_char;
    let mut stmt = ptr::null_mut();
    let mut tail: *const c_char = ptr::null();
    // Safety: db is live; the engine reads at most len bytes and points tail inside them.
    let rc = unsafe {
        if legacy {
            native::sqlite3_prepare(db, start, len, &mut stmt, &mut tail)
        } else {
            ffi::sqlite3_prepare_v2(db, start, len, &mut stmt, &mut tail)
        }
    };
    let consumed = if tail.is_null() {
        sql.len()
    } else {
        (tail as usize).saturating_sub(start as usize).min(sql.len())
    };
    Ok(NativePrepare {
        rc,
        // Safety: a statement returned by prepare is owned by nobody else yet.
        raw: unsafe { RawStatement::from_raw(stmt) },
        consumed,
    })
}

fn byte_len(len: usize) -> Result<c_int> {
    c_int::try_from(len).map_err(|_| Error::InvalidArgument(format!("{len} bytes is too long")))
}

fn bind_raw(stmt: *mut ffi::sqlite3_stmt, index: i32, value: &Value) -> c_int {
    // Safety: stmt is live; text and blobs are copied by the engine (SQLITE_TRANSIENT).
    unsafe {
        match value {
            Value::Null => ffi::sqlite3_bind_null(stmt, index),
            Value::Integer(v) => ffi::sqlite3_bind_int64(stmt, index, *v),
            Value::Real(v) => ffi::sqlite3_bind_double(stmt, index, *v),
            Value::Text(text) => match c_int::try_from(text.len()) {
                Ok(len) => ffi::sqlite3_bind_text(
                    stmt,
                    index,
                    text.as_ptr() as *const c_char,
                    len,
                    ffi::SQLITE_TRANSIENT(),
                ),
                Err(_) => ffi::SQLITE_TOOBIG,
            },
            Value::Blob(bytes) => match c_int::try_from(bytes.len()) {
                Ok(len) => ffi::sqlite3_bind_blob(
                    stmt,
                    index,
                    bytes.as_ptr() as *const c_void,
                    len,
                    ffi::SQLITE_TRANSIENT(),
                ),
                Err(_) => ffi::SQLITE_TOOBIG,
            },
        }
    }
}

fn unnamed_count(stmt: *mut ffi::sqlite3_stmt) -> usize {
    // Safety: stmt is live.
    unsafe {
        let count = ffi::sqlite3_bind_parameter_count(stmt);
        (1..=count)
            .filter(|&i| ffi::sqlite3_bind_parameter_name(stmt, i).is_null())
            .count()
    }
}

/// Make a handle safe to hand to an unrelated caller.
fn reset_for_pool(db: *mut ffi::sqlite3) -> Result<()> {
    // Safety: db is live and every statement prepared through the driver is finalized.
    unsafe {
        if !ffi::sqlite3_next_stmt(db, ptr::null_mut()).is_null() {
            return Err(Error::Misuse(
                "native statements are still outstanding on the handle".into(),
            ));
        }
        if ffi::sqlite3_get_autocommit(db) == 0 {
            let rc = ffi::sqlite3_exec(
                db,
                c"ROLLBACK".as_ptr(),
                None,
                ptr::null_mut(),
                ptr::null_mut(),
            );
            check(db, rc)?;
        }
    }
    Ok(())
}

impl Connection {
    /// A closed connection using the process-wide pool.
    pub fn new(config: DriverConfig) -> Self {
        Self::with_pool(config, pool::shared())
    }

    pub fn with_pool(config: DriverConfig, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            handle: None,
            config,
            pool,
            statements: StatementArena::default(),
            hooks: HookSet::default(),
            log_token: None,
            cancel: CancelHandle::new(),
            cancel_seen: 0,
            functions: BoundFunctions::default(),
            modules: ModuleSet::default(),
            use_pool: false,
            pool_version: 0,
            max_pool_size: 0,
            file_name: String::new(),
            pool_key: String::new(),
            flags: ConnectionFlags::empty(),
            building_temp_schema: false,
            temp_schema_builder: None,
        }
    }

    /// Wrap a native handle opened elsewhere. The result is never pooled.
    ///
    /// # Safety
    ///
    /// `db` must be a live connection; when `owned` is true nothing else may close it, and
    /// when it is false the caller keeps it open for the lifetime of the result.
    pub unsafe fn from_raw(config: DriverConfig, db: *mut ffi::sqlite3, owned: bool) -> Result<Self> {
        let handle = ConnectionHandle::from_raw(db, owned)
            .ok_or_else(|| Error::InvalidArgument("native connection handle is null".into()))?;
        let mut conn = Self::new(config);
        conn.file_name = cstr_to_string(ffi::sqlite3_db_filename(db, c"main".as_ptr()))
            .unwrap_or_default();
        conn.pool_key = normalize_pool_key(&conn.file_name);
        conn.cancel.attach(db);
        conn.cancel_seen = conn.cancel.requested();
        conn.handle = Some(handle);
        Ok(conn)
    }

    /// Open `path`, closing any handle this connection already holds.
    #[instrument(skip(self, options))]
    pub fn open(&mut self, path: &str, options: &OpenOptions) -> Result<()> {
        if self.handle.is_some() {
            if let Err(e) = self.close() {
                debug!(error = %e, "reopening after a failed teardown");
            }
            if self.handle.is_some() {
                return Err(Error::Misuse("previous handle could not be closed".into()));
            }
        }
        validate_path(path)?;

        let use_pool = options.pooling
            && options.open_flags == OpenFlags::DEFAULT
            && !is_private_database(path);
        let pool_key = normalize_pool_key(path);
        let (pooled, version) = if use_pool {
            self.pool.remove(&pool_key, options.max_pool_size)
        } else {
            (None, 0)
        };

        let handle = match pooled {
            Some(handle) => {
                events::emit(LifecycleEvent::OpenedFromPool {
                    path: pool_key.clone(),
                    version,
                });
                handle
            }
            None => {
                let handle = Self::open_native(path, options)?;
                events::emit(LifecycleEvent::NewHandle {
                    path: pool_key.clone(),
                });
                handle
            }
        };
        let db = handle.as_ptr();

        self.handle = Some(handle);
        self.file_name = path.to_string();
        self.pool_key = pool_key;
        self.pool_version = version;
        self.use_pool = use_pool;
        self.max_pool_size = options.max_pool_size;
        self.flags = options.flags;
        self.cancel.attach(db);
        self.cancel_seen = self.cancel.requested();

        if !self.flags.contains(ConnectionFlags::NO_BIND_FUNCTIONS) {
            if let Err(e) = self.functions.bind_registered(db) {
                self.use_pool = false;
                if let Err(close_err) = self.close() {
                    warn!(error = %close_err, "closing after failed function binding");
                }
                return Err(e);
            }
        }
        // Safety: db is live.
        let rc = unsafe { ffi::sqlite3_busy_timeout(db, 0) };
        check(db, rc)
    }

    fn open_native(path: &str, options: &OpenOptions) -> Result<ConnectionHandle> {
        let c_path = to_cstring(path)?;
        let vfs = options.vfs.as_deref().map(to_cstring).transpose()?;
        let mut db = ptr::null_mut();
        // Safety: all strings outlive the call; db receives a new handle even on failure.
        let rc = unsafe {
            ffi::sqlite3_open_v2(
                c_path.as_ptr(),
                &mut db,
                options.open_flags.bits(),
                vfs.as_ref().map_or(ptr::null(), |v| v.as_ptr()),
            )
        };
        if rc != ffi::SQLITE_OK {
            let err = error_from_handle(db, rc);
            if !db.is_null() {
                // Safety: the failed handle is still ours to release.
                unsafe { native::sqlite3_close_v2(db) };
            }
            return Err(err);
        }
        // Safety: db was just opened.
        unsafe { ffi::sqlite3_extended_result_codes(db, 1) };
        // Safety: the handle is owned by nobody else yet.
        unsafe { ConnectionHandle::from_raw(db, true) }
            .ok_or_else(|| Error::Misuse("native open returned a null handle".into()))
    }

    /// Tear down every statement and callback, then pool or free the handle.
    ///
    /// Every teardown step is attempted; failures are logged and returned together. A
    /// handle whose teardown failed is never pooled.
    #[instrument(skip(self), fields(path = %self.file_name))]
    pub fn close(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let db = handle.as_ptr();
        self.cancel.detach();
        let mut failures = Vec::new();

        drop(self.statements.drain());
        failures.extend(self.hooks.unhook_all(db));
        if let Some(token) = self.log_token.take() {
            if let Err(e) = hooks::uninstall_log_callback(token) {
                failures.push(e);
            }
        }
        if self.flags.contains(ConnectionFlags::UNBIND_FUNCTIONS_ON_CLOSE) {
            failures.extend(self.functions.unbind_all(db));
        } else {
            self.functions.forget();
        }
        self.modules.clear();

        let pooled = if self.use_pool && failures.is_empty() && handle.owns_handle() {
            match reset_for_pool(db) {
                Ok(()) => true,
                Err(e) => {
                    failures.push(e);
                    false
                }
            }
        } else {
            false
        };

        if pooled {
            self.pool.add(&self.pool_key, handle, self.pool_version);
            events::emit(LifecycleEvent::ClosedToPool {
                path: self.pool_key.clone(),
                version: self.pool_version,
            });
        } else {
            if let Err(e) = handle.close() {
                failures.push(e);
            }
            events::emit(LifecycleEvent::Disposed {
                path: self.pool_key.clone(),
            });
        }

        if failures.is_empty() {
            Ok(())
        } else {
            for failure in &failures {
                warn!(error = %failure, "connection teardown step failed");
            }
            Err(Error::Teardown(failures))
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn pool_version(&self) -> u64 {
        self.pool_version
    }

    /// Whether closing would hand the handle back to the pool.
    pub fn is_pool_eligible(&self) -> bool {
        self.use_pool
    }

    pub fn flags(&self) -> ConnectionFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: ConnectionFlags) {
        self.flags = flags;
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub(crate) fn raw_handle(&self) -> Result<*mut ffi::sqlite3> {
        self.handle
            .as_ref()
            .map(ConnectionHandle::as_ptr)
            .ok_or_else(|| Error::Misuse("connection is closed".into()))
    }

    /// Request cancellation of the running or next prepare/step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A cloneable handle that cancels this connection from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Report and consume a cancellation requested since the last one reported.
    fn observe_cancellation(&mut self) -> bool {
        let requested = self.cancel.requested();
        let pending = requested != self.cancel_seen;
        self.cancel_seen = requested;
        pending
    }

    pub fn set_temp_schema_builder(&mut self, builder: Option<TempSchemaBuilder>) {
        self.temp_schema_builder = builder;
    }

    // -- statements ----------------------------------------------------------------------

    /// Prepare the first statement of `sql`.
    ///
    /// Schema changes are retried up to the configured limit and contention is retried until
    /// `timeout` is spent. `previous` is the statement prepared from the earlier part of the
    /// same script; unnamed parameter numbering continues from it.
    pub fn prepare(
        &mut self,
        sql: &str,
        previous: Option<StatementId>,
        timeout: Duration,
    ) -> Result<Prepared> {
        let db = self.raw_handle()?;
        let outcome = self.prepare_inner(db, sql, previous, timeout);
        let cancelled = self.observe_cancellation();
        if cancelled {
            if let Ok(Prepared {
                statement: Some(id),
                ..
            }) = &outcome
            {
                drop(self.statements.remove(*id));
            }
        }
        retry::settle_cancellation(cancelled, outcome)
    }

    fn prepare_inner(
        &mut self,
        db: *mut ffi::sqlite3,
        sql: &str,
        previous: Option<StatementId>,
        timeout: Duration,
    ) -> Result<Prepared> {
        let mut text = sql.trim().to_string();
        if let Some(base) = self.config.base_schema_name.as_deref() {
            text = strip_base_schema(&text, base);
        }
        if text.contains('\0') {
            return Err(Error::InvalidArgument(
                "SQL text cannot contain null bytes".into(),
            ));
        }
        if text.is_empty() {
            return Ok(Prepared {
                statement: None,
                remaining: String::new(),
            });
        }

        let legacy = self.flags.contains(ConnectionFlags::LEGACY_PREPARE);
        let log = self.flags.contains(ConnectionFlags::LOG_PREPARE);
        let policy = self.config.retry.clone();
        let mut state = RetryState::new(self.cancel_seen, timeout).watch(self.cancel.clone());
        let outcome = retry::run(&policy, &mut state, &mut ThreadSleep, || {
            if log {
                debug!(sql = %text, "prepare");
            }
            match native_prepare(db, &text, legacy) {
                Err(e) => Attempt::Fail(e),
                Ok(p) if p.rc == ffi::SQLITE_OK => Attempt::Success((p.raw, p.consumed)),
                Ok(p) => Attempt::from_failure(
                    ResultCode::from_raw(p.rc),
                    error_from_handle(db, p.rc),
                ),
            }
        });
        let (raw, consumed) = match outcome {
            Ok(prepared) => prepared,
            Err(error) => return self.recover_prepare(db, &text, previous, timeout, error),
        };

        let remaining = text.get(consumed..).unwrap_or_default().trim_start().to_string();
        let Some(raw) = raw else {
            return Ok(Prepared {
                statement: None,
                remaining,
            });
        };
        let unnamed_base = match previous {
            Some(prev) => {
                let slot = self.statements.get(prev)?;
                slot.unnamed_base + unnamed_count(slot.raw.as_ptr())
            }
            None => 0,
        };
        let id = self.statements.insert(StatementSlot {
            raw,
            sql: text.get(..consumed).unwrap_or_default().trim().to_string(),
            remaining: remaining.clone(),
            explicit_types: None,
            bindings: BTreeMap::new(),
            timeout,
            unnamed_base,
        });
        Ok(Prepared {
            statement: Some(id),
            remaining,
        })
    }

    /// Handle prepare failures that have a recovery: native interrupts, the legacy `TYPES`
    /// prefix, and missing temporary schema tables.
    fn recover_prepare(
        &mut self,
        db: *mut ffi::sqlite3,
        text: &str,
        previous: Option<StatementId>,
        timeout: Duration,
        error: Error,
    ) -> Result<Prepared> {
        let message = match &error {
            Error::Sqlite {
                code: ResultCode::Interrupt,
                ..
            } => {
                return Ok(Prepared {
                    statement: None,
                    remaining: text.to_string(),
                })
            }
            Error::Sqlite { message, .. } => message.clone(),
            _ => return Err(error),
        };

        if self.config.legacy_types_clause && is_types_clause_error(&message) {
            let (clause, rest) = split_types_clause(text);
            let types = parse_type_definitions(clause);
            debug!(?types, "applying legacy TYPES clause");
            let prepared = self.prepare_inner(db, rest, previous, timeout)?;
            if let Some(id) = prepared.statement {
                self.statements.get_mut(id)?.explicit_types = Some(types);
            }
            return Ok(prepared);
        }

        if is_temp_schema_error(&message) && !self.building_temp_schema {
            if let Some(mut builder) = self.temp_schema_builder.take() {
                debug!("building temporary schema");
                self.building_temp_schema = true;
                let outcome =
                    builder(self).and_then(|()| self.prepare_inner(db, text, previous, timeout));
                self.building_temp_schema = false;
                if self.temp_schema_builder.is_none() {
                    self.temp_schema_builder = Some(builder);
                }
                return outcome;
            }
        }
        Err(error)
    }

    /// Advance `id` by one row. Returns `false` once the statement has finished.
    pub fn step(&mut self, id: StatementId) -> Result<bool> {
        let db = self.raw_handle()?;
        let outcome = self.step_inner(db, id);
        let cancelled = self.observe_cancellation();
        if cancelled {
            if let Ok(slot) = self.statements.get(id) {
                // Safety: the statement is live; reset only rewinds it.
                unsafe { ffi::sqlite3_reset(slot.raw.as_ptr()) };
            }
        }
        retry::settle_cancellation(cancelled, outcome)
    }

    fn step_inner(&mut self, db: *mut ffi::sqlite3, id: StatementId) -> Result<bool> {
        let policy = self.config.retry.clone();
        let legacy = self.flags.contains(ConnectionFlags::LEGACY_PREPARE);
        let timeout = self.statements.get(id)?.timeout;
        let mut state = RetryState::new(self.cancel_seen, timeout).watch(self.cancel.clone());
        let mut backoff = ThreadSleep;
        loop {
            let attempt = self.step_once(db, id, legacy)?;
            if let Next::Done(has_row) = state.advance(&policy, &mut backoff, attempt)? {
                return Ok(has_row);
            }
        }
    }

    fn step_once(
        &mut self,
        db: *mut ffi::sqlite3,
        id: StatementId,
        legacy: bool,
    ) -> Result<Attempt<bool>> {
        let stmt = self.statements.get(id)?.raw.as_ptr();
        // Safety: stmt is live while its slot holds it.
        let rc = unsafe { ffi::sqlite3_step(stmt) };
        match ResultCode::from_raw(rc) {
            ResultCode::Row => return Ok(Attempt::Success(true)),
            ResultCode::Done | ResultCode::Interrupt => return Ok(Attempt::Success(false)),
            _ => {}
        }
        // The step message is lost once reset runs.
        let step_error = error_from_handle(db, rc);
        // Safety: as above.
        let reset_rc = unsafe { ffi::sqlite3_reset(stmt) };
        Ok(match ResultCode::from_raw(reset_rc) {
            ResultCode::Ok => Attempt::Fail(step_error),
            ResultCode::Schema => self.recompile(db, id, legacy)?,
            code if code.is_contention() => Attempt::RetryLock(code),
            _ => Attempt::Fail(error_from_handle(db, reset_rc)),
        })
    }

    /// Re-prepare the text behind `id` into a new native statement, move it into the same
    /// slot, and replay the recorded bindings.
    fn recompile(
        &mut self,
        db: *mut ffi::sqlite3,
        id: StatementId,
        legacy: bool,
    ) -> Result<Attempt<bool>> {
        let sql = self.statements.get(id)?.sql.clone();
        let prepared = native_prepare(db, &sql, legacy)?;
        if prepared.rc != ffi::SQLITE_OK {
            return Ok(Attempt::from_failure(
                ResultCode::from_raw(prepared.rc),
                error_from_handle(db, prepared.rc),
            ));
        }
        let raw = prepared
            .raw
            .ok_or_else(|| Error::Misuse("schema recovery produced no statement".into()))?;
        drop(self.statements.transplant(id, raw)?);

        let slot = self.statements.get(id)?;
        for (&index, value) in &slot.bindings {
            check(db, bind_raw(slot.raw.as_ptr(), index, value))?;
        }
        debug!(sql = %slot.sql, "recompiled statement after schema change");
        Ok(Attempt::RetrySchema)
    }

    /// Rewind `id`, recompiling it if the schema changed since it was prepared.
    pub fn reset(&mut self, id: StatementId) -> Result<()> {
        let db = self.raw_handle()?;
        let stmt = self.statements.get(id)?.raw.as_ptr();
        // Safety: stmt is live.
        let rc = unsafe { ffi::sqlite3_reset(stmt) };
        if ResultCode::from_raw(rc) == ResultCode::Schema {
            let legacy = self.flags.contains(ConnectionFlags::LEGACY_PREPARE);
            return match self.recompile(db, id, legacy)? {
                Attempt::Fail(e) => Err(e),
                Attempt::RetryLock(code) => Err(error_from_handle(db, code.as_raw())),
                Attempt::Success(_) | Attempt::RetrySchema => Ok(()),
            };
        }
        check(db, rc)
    }

    pub fn clear_bindings(&mut self, id: StatementId) -> Result<()> {
        let db = self.raw_handle()?;
        let slot = self.statements.get_mut(id)?;
        // Safety: the statement is live.
        check(db, unsafe { ffi::sqlite3_clear_bindings(slot.raw.as_ptr()) })?;
        slot.bindings.clear();
        Ok(())
    }

    pub fn finalize(&mut self, id: StatementId) -> Result<()> {
        drop(self.statements.remove(id)?);
        Ok(())
    }

    /// Number of live statements prepared on this connection.
    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    pub fn statement_sql(&self, id: StatementId) -> Result<&str> {
        Ok(&self.statements.get(id)?.sql)
    }

    pub fn statement_remaining(&self, id: StatementId) -> Result<&str> {
        Ok(&self.statements.get(id)?.remaining)
    }

    pub fn explicit_types(&self, id: StatementId) -> Result<Option<&[String]>> {
        Ok(self.statements.get(id)?.explicit_types.as_deref())
    }

    /// Declare column types for `id`, overriding the declared types the engine reports.
    pub fn set_explicit_types(&mut self, id: StatementId, types: Option<Vec<String>>) -> Result<()> {
        self.statements.get_mut(id)?.explicit_types = types;
        Ok(())
    }

    // -- parameters ----------------------------------------------------------------------

    pub fn parameter_count(&self, id: StatementId) -> Result<i32> {
        let slot = self.statements.get(id)?;
        // Safety: the statement is live.
        Ok(unsafe { ffi::sqlite3_bind_parameter_count(slot.raw.as_ptr()) })
    }

    /// Parameter names in index order; unnamed parameters are reported as `;N`.
    pub fn parameter_names(&self, id: StatementId) -> Result<Vec<String>> {
        let slot = self.statements.get(id)?;
        let stmt = slot.raw.as_ptr();
        // Safety: the statement is live; names are copied out immediately.
        let count = unsafe { ffi::sqlite3_bind_parameter_count(stmt) };
        let mut next_unnamed = slot.unnamed_base;
        Ok((1..=count)
            .map(|i| {
                match unsafe { cstr_to_string(ffi::sqlite3_bind_parameter_name(stmt, i)) } {
                    Some(name) if !name.is_empty() => name,
                    _ => {
                        let name = format!(";{next_unnamed}");
                        next_unnamed += 1;
                        name
                    }
                }
            })
            .collect())
    }

    /// Name of the 1-based parameter `index`.
    pub fn parameter_name(&self, id: StatementId, index: i32) -> Result<Option<String>> {
        let names = self.parameter_names(id)?;
        Ok(usize::try_from(index)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| names.into_iter().nth(i)))
    }

    /// 1-based index of the parameter called `name`.
    pub fn parameter_index(&self, id: StatementId, name: &str) -> Result<Option<i32>> {
        Ok(self
            .parameter_names(id)?
            .iter()
            .position(|candidate| candidate == name)
            .map(|i| i as i32 + 1))
    }

    // -- binding -------------------------------------------------------------------------

    /// Bind `value` to the 1-based parameter `index` and record it for replay after a
    /// recompile.
    pub fn bind_value(&mut self, id: StatementId, index: i32, value: Value) -> Result<()> {
        let db = self.raw_handle()?;
        let slot = self.statements.get_mut(id)?;
        check(db, bind_raw(slot.raw.as_ptr(), index, &value))?;
        slot.bindings.insert(index, value);
        Ok(())
    }

    pub fn bind_double(&mut self, id: StatementId, index: i32, value: f64) -> Result<()> {
        self.bind_value(id, index, Value::Real(value))
    }

    pub fn bind_int32(&mut self, id: StatementId, index: i32, value: i32) -> Result<()> {
        self.bind_value(id, index, Value::Integer(value.into()))
    }

    pub fn bind_int64(&mut self, id: StatementId, index: i32, value: i64) -> Result<()> {
        self.bind_value(id, index, Value::Integer(value))
    }

    /// Binds the bit pattern as `i32` unless [`ConnectionFlags::BIND_UINT32_AS_INT64`] is set.
    pub fn bind_uint32(&mut self, id: StatementId, index: i32, value: u32) -> Result<()> {
        let widened = if self.flags.contains(ConnectionFlags::BIND_UINT32_AS_INT64) {
            i64::from(value)
        } else {
            i64::from(value as i32)
        };
        self.bind_value(id, index, Value::Integer(widened))
    }

    /// Binds the bit pattern as `i64`.
    pub fn bind_uint64(&mut self, id: StatementId, index: i32, value: u64) -> Result<()> {
        self.bind_value(id, index, Value::Integer(value as i64))
    }

    pub fn bind_bool(&mut self, id: StatementId, index: i32, value: bool) -> Result<()> {
        self.bind_value(id, index, Value::from(value))
    }

    pub fn bind_text(&mut self, id: StatementId, index: i32, value: &str) -> Result<()> {
        self.bind_value(id, index, Value::Text(value.to_string()))
    }

    pub fn bind_blob(&mut self, id: StatementId, index: i32, value: &[u8]) -> Result<()> {
        self.bind_value(id, index, Value::Blob(value.to_vec()))
    }

    pub fn bind_null(&mut self, id: StatementId, index: i32) -> Result<()> {
        self.bind_value(id, index, Value::Null)
    }

    // -- columns -------------------------------------------------------------------------

    pub fn column_count(&self, id: StatementId) -> Result<i32> {
        let slot = self.statements.get(id)?;
        // Safety: the statement is live.
        Ok(unsafe { ffi::sqlite3_column_count(slot.raw.as_ptr()) })
    }

    /// Columns available in the current row; zero when no row is pending.
    pub fn data_count(&self, id: StatementId) -> Result<i32> {
        let slot = self.statements.get(id)?;
        // Safety: the statement is live.
        Ok(unsafe { ffi::sqlite3_data_count(slot.raw.as_ptr()) })
    }

    fn column_stmt(&self, id: StatementId, index: i32) -> Result<*mut ffi::sqlite3_stmt> {
        self.raw_handle()?;
        let stmt = self.statements.get(id)?.raw.as_ptr();
        // Safety: the statement is live.
        let count = unsafe { ffi::sqlite3_column_count(stmt) };
        if index < 0 || index >= count {
            return Err(Error::InvalidArgument(format!(
                "column index {index} is out of range for {count} columns"
            )));
        }
        Ok(stmt)
    }

    pub fn column_name(&self, id: StatementId, index: i32) -> Result<String> {
        let stmt = self.column_stmt(id, index)?;
        // Safety: stmt is live and index is in range.
        Ok(unsafe { cstr_to_string(ffi::sqlite3_column_name(stmt, index)) }.unwrap_or_default())
    }

    pub fn column_type(&self, id: StatementId, index: i32) -> Result<ColumnType> {
        let stmt = self.column_stmt(id, index)?;
        // Safety: as above.
        Ok(ColumnType::from_raw(unsafe { ffi::sqlite3_column_type(stmt, index) }))
    }

    /// Declared type of a result column; explicit types take precedence.
    pub fn column_decltype(&self, id: StatementId, index: i32) -> Result<Option<String>> {
        let stmt = self.column_stmt(id, index)?;
        if let Some(types) = &self.statements.get(id)?.explicit_types {
            if let Some(declared) = types.get(index as usize) {
                return Ok(Some(declared.clone()));
            }
        }
        // Safety: as above.
        Ok(unsafe { cstr_to_string(ffi::sqlite3_column_decltype(stmt, index)) })
    }

    pub fn column_double(&self, id: StatementId, index: i32) -> Result<f64> {
        let stmt = self.column_stmt(id, index)?;
        // Safety: as above.
        Ok(unsafe { ffi::sqlite3_column_double(stmt, index) })
    }

    pub fn column_int32(&self, id: StatementId, index: i32) -> Result<i32> {
        let stmt = self.column_stmt(id, index)?;
        // Safety: as above.
        Ok(unsafe { ffi::sqlite3_column_int(stmt, index) })
    }

    pub fn column_int64(&self, id: StatementId, index: i32) -> Result<i64> {
        let stmt = self.column_stmt(id, index)?;
        // Safety: as above.
        Ok(unsafe { ffi::sqlite3_column_int64(stmt, index) })
    }

    pub fn column_bool(&self, id: StatementId, index: i32) -> Result<bool> {
        Ok(self.column_int64(id, index)? != 0)
    }

    /// Column text, `None` for NULL.
    pub fn column_text(&self, id: StatementId, index: i32) -> Result<Option<String>> {
        let stmt = self.column_stmt(id, index)?;
        // Safety: as above; the bytes are copied before the next native call.
        unsafe {
            let text = ffi::sqlite3_column_text(stmt, index);
            if text.is_null() {
                return Ok(None);
            }
            let len = ffi::sqlite3_column_bytes(stmt, index).max(0) as usize;
            let bytes = std::slice::from_raw_parts(text, len);
            Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
        }
    }

    pub fn column_blob(&self, id: StatementId, index: i32) -> Result<Vec<u8>> {
        let stmt = self.column_stmt(id, index)?;
        // Safety: as above.
        unsafe {
            let blob = ffi::sqlite3_column_blob(stmt, index) as *const u8;
            let len = ffi::sqlite3_column_bytes(stmt, index).max(0) as usize;
            if blob.is_null() {
                return Ok(Vec::new());
            }
            Ok(std::slice::from_raw_parts(blob, len).to_vec())
        }
    }

    pub fn column_value(&self, id: StatementId, index: i32) -> Result<Value> {
        Ok(match self.column_type(id, index)? {
            ColumnType::Integer => Value::Integer(self.column_int64(id, index)?),
            ColumnType::Float => Value::Real(self.column_double(id, index)?),
            ColumnType::Text => Value::Text(self.column_text(id, index)?.unwrap_or_default()),
            ColumnType::Blob => Value::Blob(self.column_blob(id, index)?),
            ColumnType::Null => Value::Null,
        })
    }

    // -- convenience ---------------------------------------------------------------------

    /// Run every statement of `sql`, returning the number of rows changed.
    pub fn execute(&mut self, sql: &str) -> Result<usize> {
        let db = self.raw_handle()?;
        // Safety: db is live.
        let before = unsafe { ffi::sqlite3_total_changes(db) };
        let timeout = self.config.default_timeout();
        let mut rest = sql.to_string();
        let mut previous: Option<StatementId> = None;
        loop {
            let prepared = self.prepare(&rest, previous, timeout);
            if let Some(prev) = previous.take() {
                self.finalize(prev)?;
            }
            let prepared = prepared?;
            if let Some(id) = prepared.statement {
                if let Err(e) = self.run_to_completion(id) {
                    drop(self.finalize(id));
                    return Err(e);
                }
                previous = Some(id);
            }
            if prepared.remaining.is_empty() || prepared.remaining == rest {
                break;
            }
            rest = prepared.remaining;
        }
        if let Some(prev) = previous {
            self.finalize(prev)?;
        }
        // Safety: db is live.
        let after = unsafe { ffi::sqlite3_total_changes(db) };
        Ok(usize::try_from(after - before).unwrap_or(0))
    }

    fn run_to_completion(&mut self, id: StatementId) -> Result<()> {
        while self.step(id)? {}
        Ok(())
    }

    /// Prepare the first statement of `sql`, bind `params` in order, and collect its rows.
    pub fn query_rows(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>> {
        let timeout = self.config.default_timeout();
        let Some(id) = self.prepare(sql, None, timeout)?.statement else {
            return Ok(Vec::new());
        };
        let rows = self.collect_rows(id, params);
        let finalized = self.finalize(id);
        let rows = rows?;
        finalized?;
        Ok(rows)
    }

    fn collect_rows(&mut self, id: StatementId, params: &[Value]) -> Result<Vec<Vec<Value>>> {
        for (i, value) in params.iter().enumerate() {
            self.bind_value(id, i as i32 + 1, value.clone())?;
        }
        let mut rows = Vec::new();
        while self.step(id)? {
            let count = self.column_count(id)?;
            rows.push(
                (0..count)
                    .map(|i| self.column_value(id, i))
                    .collect::<Result<Vec<_>>>()?,
            );
        }
        Ok(rows)
    }

    // -- connection state ----------------------------------------------------------------

    pub fn changes(&self) -> Result<i64> {
        let db = self.raw_handle()?;
        // Safety: db is live.
        Ok(unsafe { ffi::sqlite3_changes(db) }.into())
    }

    pub fn last_insert_rowid(&self) -> Result<i64> {
        let db = self.raw_handle()?;
        // Safety: db is live.
        Ok(unsafe { ffi::sqlite3_last_insert_rowid(db) })
    }

    pub fn is_autocommit(&self) -> Result<bool> {
        let db = self.raw_handle()?;
        // Safety: db is live.
        Ok(unsafe { ffi::sqlite3_get_autocommit(db) } != 0)
    }

    /// Native busy handler timeout; the driver's own retry loop is separate.
    pub fn set_busy_timeout(&mut self, ms: i32) -> Result<()> {
        let db = self.raw_handle()?;
        // Safety: db is live.
        check(db, unsafe { ffi::sqlite3_busy_timeout(db, ms) })
    }

    pub fn release_memory(&mut self) -> Result<()> {
        let db = self.raw_handle()?;
        // Safety: db is live.
        check(db, unsafe { ffi::sqlite3_db_release_memory(db) })
    }

    /// Version of the linked native engine.
    pub fn version() -> String {
        // Safety: sqlite3_libversion returns a static string.
        unsafe { cstr_to_string(ffi::sqlite3_libversion()) }.unwrap_or_default()
    }

    pub fn limit(&self, option: LimitOption) -> Result<i32> {
        let db = self.raw_handle()?;
        // Safety: db is live; a negative value only queries.
        Ok(unsafe { ffi::sqlite3_limit(db, option.as_raw(), -1) })
    }

    /// Set a limit, returning its previous value.
    pub fn set_limit_option(&mut self, option: LimitOption, value: i32) -> Result<i32> {
        if value < 0 {
            return Err(Error::InvalidArgument(format!(
                "limit {option:?} cannot be negative"
            )));
        }
        let db = self.raw_handle()?;
        // Safety: db is live.
        Ok(unsafe { ffi::sqlite3_limit(db, option.as_raw(), value) })
    }

    pub fn configuration_option(&self, option: DbConfigOption) -> Result<bool> {
        let db = self.raw_handle()?;
        self.db_config(db, option, -1)
    }

    /// Switch a configuration option, returning the state the engine reports afterwards.
    pub fn set_configuration_option(&mut self, option: DbConfigOption, enabled: bool) -> Result<bool> {
        let db = self.raw_handle()?;
        self.db_config(db, option, c_int::from(enabled))
    }

    fn db_config(&self, db: *mut ffi::sqlite3, option: DbConfigOption, value: c_int) -> Result<bool> {
        let mut current: c_int = 0;
        // Safety: db is live; every boolean option takes an int and an int out-pointer.
        let rc = unsafe { ffi::sqlite3_db_config(db, option.as_raw(), value, &mut current as *mut c_int) };
        if rc != ffi::SQLITE_OK {
            return Err(Error::from_code(rc, format!("failed to configure {option:?}")));
        }
        Ok(current != 0)
    }

    pub fn enable_load_extension(&mut self, enabled: bool) -> Result<()> {
        let db = self.raw_handle()?;
        // Safety: db is live.
        check(db, unsafe { ffi::sqlite3_enable_load_extension(db, c_int::from(enabled)) })
    }

    pub fn load_extension(&mut self, path: &str, entry_point: Option<&str>) -> Result<()> {
        let db = self.raw_handle()?;
        let c_path = to_cstring(path)?;
        let c_entry = entry_point.map(to_cstring).transpose()?;
        let mut message: *mut c_char = ptr::null_mut();
        // Safety: db is live; the error message is allocated by the engine and freed here.
        let rc = unsafe {
            ffi::sqlite3_load_extension(
                db,
                c_path.as_ptr(),
                c_entry.as_ref().map_or(ptr::null(), |e| e.as_ptr()),
                &mut message,
            )
        };
        if rc == ffi::SQLITE_OK {
            return Ok(());
        }
        let text = unsafe {
            let text = cstr_to_string(message);
            ffi::sqlite3_free(message as *mut c_void);
            text
        };
        Err(Error::from_code(
            rc,
            text.unwrap_or_else(|| format!("failed to load extension {path}")),
        ))
    }

    /// Issue the codec "set key" pragma. The connection is never pooled afterwards.
    pub fn set_password(&mut self, key: &[u8]) -> Result<()> {
        self.key_pragma("key", key)
    }

    /// Issue the codec "change key" pragma. The connection is never pooled afterwards.
    pub fn change_password(&mut self, key: &[u8]) -> Result<()> {
        self.key_pragma("rekey", key)
    }

    fn key_pragma(&mut self, pragma: &str, key: &[u8]) -> Result<()> {
        let db = self.raw_handle()?;
        self.use_pool = false;
        let sql = to_cstring(&format!("PRAGMA {pragma} = \"{}\"", hex_key_literal(key)))?;
        // Safety: db is live.
        let rc = unsafe {
            ffi::sqlite3_exec(db, sql.as_ptr(), None, ptr::null_mut(), ptr::null_mut())
        };
        check(db, rc)
    }

    // -- hooks ---------------------------------------------------------------------------

    pub fn set_update_hook(&mut self, hook: Option<UpdateHook>) -> Result<()> {
        let db = self.raw_handle()?;
        self.hooks.set_update(db, hook);
        Ok(())
    }

    pub fn set_commit_hook(&mut self, hook: Option<CommitHook>) -> Result<()> {
        let db = self.raw_handle()?;
        self.hooks.set_commit(db, hook);
        Ok(())
    }

    pub fn set_rollback_hook(&mut self, hook: Option<RollbackHook>) -> Result<()> {
        let db = self.raw_handle()?;
        self.hooks.set_rollback(db, hook);
        Ok(())
    }

    pub fn set_authorizer(&mut self, hook: Option<Authorizer>) -> Result<()> {
        let db = self.raw_handle()?;
        self.hooks.set_authorizer(db, hook)
    }

    /// Run `hook` every `instructions` virtual machine instructions.
    pub fn set_progress_hook(&mut self, instructions: i32, hook: Option<ProgressHook>) -> Result<()> {
        let db = self.raw_handle()?;
        self.hooks.set_progress(db, instructions, hook);
        Ok(())
    }

    pub fn set_trace_callback(&mut self, hook: Option<TraceCallback>) -> Result<()> {
        let db = self.raw_handle()?;
        self.hooks.set_trace(db, hook)
    }

    /// Install or clear the process-wide native log callback.
    ///
    /// Only the connection that installed the callback may replace or clear it; it is
    /// released automatically when that connection closes.
    pub fn set_log_callback(&mut self, callback: Option<LogCallback>) -> Result<()> {
        match callback {
            Some(callback) => {
                let token = hooks::install_log_callback(self.log_token.as_ref(), callback)?;
                self.log_token = Some(token);
            }
            None => {
                if let Some(token) = self.log_token.take() {
                    hooks::uninstall_log_callback(token)?;
                }
            }
        }
        Ok(())
    }

    pub fn owns_log_callback(&self) -> bool {
        self.log_token.is_some()
    }

    // -- functions and modules -----------------------------------------------------------

    /// Bind `def` on this connection only, replacing any binding of the same name.
    pub fn bind_function(&mut self, def: &FunctionDefinition) -> Result<()> {
        let db = self.raw_handle()?;
        self.functions.bind(db, def)
    }

    pub fn unbind_functions(&mut self) -> Result<()> {
        let db = self.raw_handle()?;
        let failures = self.functions.unbind_all(db);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(failures))
        }
    }

    /// Register a virtual-table module. The connection is never pooled afterwards.
    pub fn create_module(&mut self, name: &str, module: &'static ffi::sqlite3_module) -> Result<()> {
        let db = self.raw_handle()?;
        self.use_pool = false;
        self.modules.create(db, name, module)
    }

    pub fn dispose_module(&mut self, name: &str) -> Result<()> {
        let db = self.raw_handle()?;
        self.modules.dispose(db, name)
    }

    // -- pool ----------------------------------------------------------------------------

    /// Free idle handles for `path` and invalidate every outstanding one.
    pub fn clear_pool(&self, path: &str) {
        self.pool.clear_pool(&normalize_pool_key(path));
    }

    pub fn clear_all_pools(&self) {
        self.pool.clear_all();
    }

    pub fn pool_counts(&self, path: Option<&str>) -> PoolCounts {
        match path {
            Some(path) => self.pool.counts(Some(&normalize_pool_key(path))),
            None => self.pool.counts(None),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.handle.is_some() {
            // Failures were already logged by close.
            drop(self.close());
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("file_name", &self.file_name)
            .field("open", &self.is_open())
            .field("flags", &self.flags)
            .field("use_pool", &self.use_pool)
            .field("pool_version", &self.pool_version)
            .field("statements", &self.statements.len())
            .field("functions", &self.functions.len())
            .field("has_modules", &!self.modules.is_empty())
            .field("has_hooks", &!self.hooks.is_empty())
            .finish()
    }
}
