//! Virtual-table module registration.
//!
//! Only the create/dispose lifecycle is handled here; the module's callbacks are supplied by
//! the caller as a `'static` native module table.

use std::ffi::c_void;
use std::ptr;

use libsqlite3_sys as ffi;
use tracing::debug;

use crate::errors::{check, Error, Result};
use crate::utils::to_cstring;

unsafe extern "C" fn module_destroy(client_data: *mut c_void) {
    if !client_data.is_null() {
        let name = Box::from_raw(client_data as *mut String);
        debug!(module = %name, "module disposed");
    }
}

/// Modules created on one native connection.
#[derive(Debug, Default)]
pub(crate) struct ModuleSet {
    names: Vec<String>,
}

impl ModuleSet {
    pub(crate) fn create(
        &mut self,
        db: *mut ffi::sqlite3,
        name: &str,
        module: &'static ffi::sqlite3_module,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("module name cannot be empty".into()));
        }
        let c_name = to_cstring(name)?;
        let client_data = Box::into_raw(Box::new(name.to_string())) as *mut c_void;
        // Safety: db is live and module is 'static. The engine runs module_destroy when the
        // module is replaced, dropped, or registration fails.
        let rc = unsafe {
            ffi::sqlite3_create_module_v2(
                db,
                c_name.as_ptr(),
                module,
                client_data,
                Some(module_destroy),
            )
        };
        check(db, rc)?;
        if !self.contains(name) {
            self.names.push(name.to_string());
        }
        debug!(module = name, "module created");
        Ok(())
    }

    pub(crate) fn dispose(&mut self, db: *mut ffi::sqlite3, name: &str) -> Result<()> {
        let position = self
            .names
            .iter()
            .position(|existing| existing.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::Misuse(format!("module '{name}' was not created here")))?;
        let c_name = to_cstring(name)?;
        // Safety: a null module table removes the registration.
        let rc = unsafe {
            ffi::sqlite3_create_module_v2(db, c_name.as_ptr(), ptr::null(), ptr::null_mut(), None)
        };
        check(db, rc)?;
        self.names.remove(position);
        Ok(())
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Forget every module; the native close releases them.
    pub(crate) fn clear(&mut self) {
        self.names.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::native;

    fn empty_module() -> &'static ffi::sqlite3_module {
        Box::leak(Box::new(unsafe { std::mem::zeroed::<ffi::sqlite3_module>() }))
    }

    fn open_memory() -> *mut ffi::sqlite3 {
        let path = std::ffi::CString::new(":memory:").unwrap();
        let mut db = ptr::null_mut();
        let flags = ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        let rc = unsafe { ffi::sqlite3_open_v2(path.as_ptr(), &mut db, flags, ptr::null()) };
        assert_eq!(rc, ffi::SQLITE_OK);
        db
    }

    #[test]
    fn test_create_and_dispose_module() {
        let db = open_memory();
        let mut modules = ModuleSet::default();
        modules.create(db, "shadow", empty_module()).unwrap();
        modules.create(db, "SHADOW", empty_module()).unwrap();
        assert!(modules.contains("shadow"));

        modules.dispose(db, "shadow").unwrap();
        assert!(modules.is_empty());
        assert!(matches!(modules.dispose(db, "shadow"), Err(Error::Misuse(_))));
        unsafe { native::sqlite3_close_v2(db) };
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let db = open_memory();
        let mut modules = ModuleSet::default();
        assert!(matches!(
            modules.create(db, "", empty_module()),
            Err(Error::InvalidArgument(_))
        ));
        unsafe { native::sqlite3_close_v2(db) };
    }
}
