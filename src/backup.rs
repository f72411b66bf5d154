//! Incremental online backup between two open connections.

use std::ptr::NonNull;
use std::time::Duration;

use libsqlite3_sys as ffi;
use tracing::{debug, instrument, warn};

use crate::connection::Connection;
use crate::errors::{error_from_handle, Error, Result};
use crate::types::{ConnectionFlags, ResultCode};
use crate::utils::to_cstring;

/// Progress reported after each successful [`Backup::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupProgress {
    pub remaining: i32,
    pub page_count: i32,
}

impl BackupProgress {
    pub fn copied(&self) -> i32 {
        self.page_count - self.remaining
    }
}

/// A native backup object copying pages from `source` into `dest`.
///
/// The destination is borrowed mutably for the whole copy, so nothing else can drive it in
/// the meantime. [`Backup::finish`] may be called once; after that every query is rejected
/// without touching the engine. Dropping an unfinished backup finishes it.
pub struct Backup<'a> {
    raw: NonNull<ffi::sqlite3_backup>,
    dest_db: *mut ffi::sqlite3,
    last_step: ResultCode,
    retry: bool,
    finished: bool,
    log: bool,
    _source: &'a Connection,
    _dest: &'a mut Connection,
}

impl<'a> Backup<'a> {
    /// Start copying database `source_db` of `source` over database `dest_db` of `dest`.
    pub fn new(
        source: &'a Connection,
        source_db: &str,
        dest: &'a mut Connection,
        dest_db: &str,
    ) -> Result<Self> {
        let source_ptr = source.raw_handle()?;
        let dest_ptr = dest.raw_handle()?;
        if source_ptr == dest_ptr {
            return Err(Error::Misuse(
                "source and destination connections must be distinct".into(),
            ));
        }
        let source_name = to_cstring(source_db)?;
        let dest_name = to_cstring(dest_db)?;
        // Safety: both handles are open and distinct; the backup borrows both connections for
        // its whole lifetime.
        let raw = unsafe {
            ffi::sqlite3_backup_init(
                dest_ptr,
                dest_name.as_ptr(),
                source_ptr,
                source_name.as_ptr(),
            )
        };
        let raw = match NonNull::new(raw) {
            Some(raw) => raw,
            None => {
                // Safety: dest_ptr is live; the init failure is recorded on it.
                let rc = unsafe { ffi::sqlite3_errcode(dest_ptr) };
                return Err(match error_from_handle(dest_ptr, rc) {
                    Error::Sqlite {
                        code,
                        extended_code,
                        message,
                    } => Error::Sqlite {
                        code,
                        extended_code,
                        message: format!("failed to initialize backup: {message}"),
                    },
                    other => other,
                });
            }
        };
        let log = source.flags().contains(ConnectionFlags::LOG_BACKUP)
            || dest.flags().contains(ConnectionFlags::LOG_BACKUP);
        Ok(Self {
            raw,
            dest_db: dest_ptr,
            last_step: ResultCode::Ok,
            retry: false,
            finished: false,
            log,
            _source: source,
            _dest: dest,
        })
    }

    fn live(&self) -> Result<*mut ffi::sqlite3_backup> {
        if self.finished {
            Err(Error::Misuse("backup has already been finished".into()))
        } else {
            Ok(self.raw.as_ptr())
        }
    }

    /// Copy up to `pages` pages (negative copies everything left).
    ///
    /// Returns `true` while pages remain. Busy/Locked also return `true` with
    /// [`Backup::should_retry`] set, so the caller can back off and step again.
    pub fn step(&mut self, pages: i32) -> Result<bool> {
        let raw = self.live()?;
        // Safety: raw is live until finish.
        let rc = unsafe { ffi::sqlite3_backup_step(raw, pages) };
        let code = ResultCode::from_raw(rc);
        self.last_step = code;
        self.retry = false;
        if self.log {
            // Safety: raw is live.
            let (remaining, page_count) =
                unsafe { (ffi::sqlite3_backup_remaining(raw), ffi::sqlite3_backup_pagecount(raw)) };
            debug!(pages, result = %code, remaining, page_count, "backup step");
        }
        match code {
            ResultCode::Ok => Ok(true),
            ResultCode::Busy | ResultCode::Locked => {
                self.retry = true;
                Ok(true)
            }
            ResultCode::Done => Ok(false),
            _ => Err(error_from_handle(self.dest_db, rc)),
        }
    }

    /// Whether the last step hit contention and should be repeated.
    pub fn should_retry(&self) -> bool {
        self.retry
    }

    pub fn remaining(&self) -> Result<i32> {
        let raw = self.live()?;
        // Safety: raw is live until finish.
        Ok(unsafe { ffi::sqlite3_backup_remaining(raw) })
    }

    pub fn page_count(&self) -> Result<i32> {
        let raw = self.live()?;
        // Safety: raw is live until finish.
        Ok(unsafe { ffi::sqlite3_backup_pagecount(raw) })
    }

    pub fn progress(&self) -> Result<BackupProgress> {
        Ok(BackupProgress {
            remaining: self.remaining()?,
            page_count: self.page_count()?,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Release the native backup object.
    ///
    /// Succeeds when the engine reports `Ok` or repeats the last step's result. A second
    /// call is rejected before reaching the engine.
    pub fn finish(&mut self) -> Result<()> {
        let raw = self.live()?;
        self.finished = true;
        // Safety: raw is live and finished exactly once.
        let rc = unsafe { ffi::sqlite3_backup_finish(raw) };
        let code = ResultCode::from_raw(rc);
        if code == ResultCode::Ok || code == self.last_step {
            Ok(())
        } else {
            Err(error_from_handle(self.dest_db, rc))
        }
    }
}

impl Drop for Backup<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                warn!(error = %e, "finishing backup on drop failed");
            }
        }
    }
}

/// Copy `source_db` of `source` into `dest_db` of `dest`, `pages_per_step` pages at a time.
///
/// Sleeps `retry_delay` whenever a step hits contention. `progress` runs after every step
/// that left pages to copy; returning `false` stops the copy early, leaving the destination
/// partially written.
#[instrument(skip(source, dest, progress), fields(source = source.file_name(), dest = dest.file_name()))]
pub fn backup_database(
    source: &Connection,
    source_db: &str,
    dest: &mut Connection,
    dest_db: &str,
    pages_per_step: i32,
    retry_delay: Duration,
    mut progress: Option<&mut dyn FnMut(BackupProgress) -> bool>,
) -> Result<()> {
    let pages = if pages_per_step == 0 { -1 } else { pages_per_step };
    let mut backup = Backup::new(source, source_db, dest, dest_db)?;
    while backup.step(pages)? {
        if backup.should_retry() {
            std::thread::sleep(retry_delay);
            continue;
        }
        if let Some(callback) = progress.as_mut() {
            if !callback(backup.progress()?) {
                debug!("backup stopped by progress callback");
                break;
            }
        }
    }
    backup.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, OpenOptions};
    use crate::types::Value;

    fn open(path: &str) -> Connection {
        let mut conn = Connection::new(DriverConfig::default());
        conn.open(path, &OpenOptions::new()).unwrap();
        conn
    }

    fn seeded(path: &str, rows: i64) -> Connection {
        let mut conn = open(path);
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        for i in 1..=rows {
            conn.execute(&format!("INSERT INTO t (id, name) VALUES ({i}, 'row{i}')"))
                .unwrap();
        }
        conn
    }

    #[test]
    fn test_backup_copies_everything_in_one_step() {
        let mut a = open(":memory:");
        let b = seeded(":memory:", 3);

        let mut backup = Backup::new(&b, "main", &mut a, "main").unwrap();
        assert!(!backup.step(-1).unwrap());
        assert!(!backup.should_retry());
        backup.finish().unwrap();
        drop(backup);

        let rows = a.query_rows("SELECT id, name FROM t ORDER BY id", &[]).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2], vec![Value::Integer(3), Value::Text("row3".into())]);
    }

    #[test]
    fn test_finish_is_single_shot() {
        let mut a = open(":memory:");
        let b = seeded(":memory:", 1);
        let mut backup = Backup::new(&b, "main", &mut a, "main").unwrap();
        backup.step(-1).unwrap();
        backup.finish().unwrap();
        assert!(backup.is_finished());
        assert!(matches!(backup.finish(), Err(Error::Misuse(_))));
        assert!(matches!(backup.remaining(), Err(Error::Misuse(_))));
        assert!(matches!(backup.page_count(), Err(Error::Misuse(_))));
        assert!(matches!(backup.step(1), Err(Error::Misuse(_))));
    }

    #[test]
    fn test_incremental_steps_report_progress() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("source.db");
        let source_path = source_path.to_str().unwrap();
        let source = seeded(source_path, 0);
        {
            let mut conn = open(source_path);
            conn.execute("CREATE TABLE blobs (data BLOB)").unwrap();
            for _ in 0..8 {
                conn.execute("INSERT INTO blobs VALUES (zeroblob(4096))").unwrap();
            }
            conn.close().unwrap();
        }
        let mut dest = open(":memory:");

        let mut backup = Backup::new(&source, "main", &mut dest, "main").unwrap();
        assert!(backup.step(1).unwrap());
        let progress = backup.progress().unwrap();
        assert!(progress.page_count > 1);
        assert_eq!(progress.copied(), 1);
        while backup.step(2).unwrap() {}
        assert_eq!(backup.remaining().unwrap(), 0);
        backup.finish().unwrap();
        drop(backup);

        let rows = dest.query_rows("SELECT count(*) FROM blobs", &[]).unwrap();
        assert_eq!(rows, vec![vec![Value::Integer(8)]]);
    }

    #[test]
    fn test_backup_database_with_progress_and_early_stop() {
        let source = seeded(":memory:", 50);
        let mut dest = open(":memory:");
        let mut calls = 0;
        let mut progress = |_: BackupProgress| {
            calls += 1;
            true
        };
        backup_database(
            &source,
            "main",
            &mut dest,
            "main",
            1,
            Duration::from_millis(1),
            Some(&mut progress),
        )
        .unwrap();
        let rows = dest.query_rows("SELECT count(*) FROM t", &[]).unwrap();
        assert_eq!(rows, vec![vec![Value::Integer(50)]]);
        assert!(calls >= 1);

        let mut empty = open(":memory:");
        let mut stop = |_: BackupProgress| false;
        backup_database(
            &source,
            "main",
            &mut empty,
            "main",
            1,
            Duration::ZERO,
            Some(&mut stop),
        )
        .unwrap();
    }

    #[test]
    fn test_same_native_handle_is_rejected() {
        let mut a = open(":memory:");
        let raw = a.raw_handle().unwrap();
        let alias = unsafe { Connection::from_raw(DriverConfig::default(), raw, false) }.unwrap();
        assert!(matches!(
            Backup::new(&alias, "main", &mut a, "main"),
            Err(Error::Misuse(_))
        ));
        drop(alias);
    }

    #[test]
    fn test_closed_connection_is_rejected() {
        let mut a = open(":memory:");
        let mut b = open(":memory:");
        b.close().unwrap();
        assert!(matches!(
            Backup::new(&b, "main", &mut a, "main"),
            Err(Error::Misuse(_))
        ));
    }
}
