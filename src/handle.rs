//! Owning wrappers around native connection pointers.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use libsqlite3_sys as ffi;
use tracing::warn;

use crate::errors::{check, Result};

/// Engine entry points that `libsqlite3-sys` leaves out of its generated bindings. The
/// bundled library still exports both.
pub(crate) mod native {
    use std::os::raw::{c_char, c_int};

    use libsqlite3_sys::{sqlite3, sqlite3_stmt};

    extern "C" {
        pub fn sqlite3_close_v2(db: *mut sqlite3) -> c_int;
        pub fn sqlite3_prepare(
            db: *mut sqlite3,
            sql: *const c_char,
            len: c_int,
            stmt: *mut *mut sqlite3_stmt,
            tail: *mut *const c_char,
        ) -> c_int;
    }
}

/// A native `sqlite3*` plus its ownership flag.
///
/// An owning handle closes the native connection when dropped; a borrowed one never does.
/// The handle cannot be cloned, so at most one wrapper refers to a given native pointer.
pub struct ConnectionHandle {
    db: NonNull<ffi::sqlite3>,
    owned: bool,
}

// Safety: the bundled engine is built thread-safe and a handle is only driven by whoever
// holds it, so moving it across threads (into and out of the pool) is sound.
unsafe impl Send for ConnectionHandle {}

impl ConnectionHandle {
    /// Wrap a native connection pointer.
    ///
    /// # Safety
    ///
    /// `db` must be a valid connection; when `owned` is true nothing else may close it.
    pub unsafe fn from_raw(db: *mut ffi::sqlite3, owned: bool) -> Option<Self> {
        NonNull::new(db).map(|db| Self { db, owned })
    }

    pub fn as_ptr(&self) -> *mut ffi::sqlite3 {
        self.db.as_ptr()
    }

    pub fn owns_handle(&self) -> bool {
        self.owned
    }

    /// Close the native connection, reporting the engine's result.
    pub fn close(self) -> Result<()> {
        let handle = std::mem::ManuallyDrop::new(self);
        if !handle.owned {
            return Ok(());
        }
        let db = handle.db.as_ptr();
        // Safety: the handle owns db and is not used again after this call.
        let rc = unsafe { native::sqlite3_close_v2(db) };
        check(std::ptr::null_mut(), rc)
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.owned {
            // Safety: the handle owns db; close_v2 defers the free while statements or
            // backups are still outstanding.
            let rc = unsafe { native::sqlite3_close_v2(self.db.as_ptr()) };
            if rc != ffi::SQLITE_OK {
                warn!(rc, "native close failed while dropping connection handle");
            }
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("db", &self.db)
            .field("owned", &self.owned)
            .finish()
    }
}

struct InterruptTarget(*mut ffi::sqlite3);

// Safety: the pointer is only passed to sqlite3_interrupt, which is safe to call from any
// thread, and only while the owning connection keeps it attached.
unsafe impl Send for InterruptTarget {}

#[derive(Default)]
pub(crate) struct CancelState {
    requested: AtomicU64,
    target: Mutex<Option<InterruptTarget>>,
}

/// Thread-safe side channel that requests cancellation of the current or next call.
///
/// Every request bumps a counter and interrupts the native connection. The connection
/// compares the counter against the value it last observed, so a request that lands between
/// native calls is still reported by the next prepare or step.
#[derive(Clone, Default)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let target = self
            .state
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.state.requested.fetch_add(1, Ordering::SeqCst);
        if let Some(InterruptTarget(db)) = target.as_ref() {
            // Safety: the target is detached under this lock before the connection is freed
            // or pooled, so db is live here.
            unsafe { ffi::sqlite3_interrupt(*db) };
        }
    }

    pub(crate) fn requested(&self) -> u64 {
        self.state.requested.load(Ordering::SeqCst)
    }

    pub(crate) fn attach(&self, db: *mut ffi::sqlite3) {
        *self
            .state
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(InterruptTarget(db));
    }

    pub(crate) fn detach(&self) {
        self.state
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("requested", &self.requested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_pointer_is_rejected() {
        assert!(unsafe { ConnectionHandle::from_raw(std::ptr::null_mut(), true) }.is_none());
    }

    #[test]
    fn test_cancel_without_target_only_counts() {
        let handle = CancelHandle::new();
        handle.cancel();
        handle.clone().cancel();
        assert_eq!(handle.requested(), 2);
    }

    #[test]
    fn test_owned_handle_closes() {
        let path = std::ffi::CString::new(":memory:").unwrap();
        let mut db = std::ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_open_v2(
                path.as_ptr(),
                &mut db,
                ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE,
                std::ptr::null(),
            )
        };
        assert_eq!(rc, ffi::SQLITE_OK);
        let handle = unsafe { ConnectionHandle::from_raw(db, true) }.unwrap();
        assert!(handle.owns_handle());
        assert!(handle.close().is_ok());
    }
}
