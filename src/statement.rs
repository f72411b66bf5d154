//! Prepared-statement slots.
//!
//! Callers hold a [`StatementId`], never the native pointer. Schema recovery swaps the
//! native statement inside a slot while the id stays the same, so every holder keeps seeing
//! the same logical statement.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::time::Duration;

use libsqlite3_sys as ffi;

use crate::errors::{Error, Result};
use crate::types::Value;

/// Stable identity of a prepared statement on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementId {
    index: u32,
    generation: u32,
}

/// A native `sqlite3_stmt*`, finalized on drop.
pub(crate) struct RawStatement(NonNull<ffi::sqlite3_stmt>);

// Safety: a statement travels with its owning connection, which is driven by one thread at
// a time.
unsafe impl Send for RawStatement {}

impl RawStatement {
    /// # Safety
    ///
    /// `stmt` must be null or a statement nobody else finalizes.
    pub(crate) unsafe fn from_raw(stmt: *mut ffi::sqlite3_stmt) -> Option<Self> {
        NonNull::new(stmt).map(RawStatement)
    }

    pub(crate) fn as_ptr(&self) -> *mut ffi::sqlite3_stmt {
        self.0.as_ptr()
    }
}

impl Drop for RawStatement {
    fn drop(&mut self) {
        // Safety: the statement is owned by this wrapper and finalized exactly once.
        unsafe {
            ffi::sqlite3_finalize(self.0.as_ptr());
        }
    }
}

pub(crate) struct StatementSlot {
    pub(crate) raw: RawStatement,
    /// The text this statement was prepared from, used again on schema recovery.
    pub(crate) sql: String,
    /// Unparsed tail of the script this statement came from.
    pub(crate) remaining: String,
    pub(crate) explicit_types: Option<Vec<String>>,
    /// Every value bound so far, replayed after a transplant.
    pub(crate) bindings: BTreeMap<i32, Value>,
    pub(crate) timeout: Duration,
    /// Unnamed parameters seen in earlier statements of the same script.
    pub(crate) unnamed_base: usize,
}

struct Entry {
    generation: u32,
    slot: Option<StatementSlot>,
}

#[derive(Default)]
pub(crate) struct StatementArena {
    entries: Vec<Entry>,
    free: Vec<u32>,
}

impl StatementArena {
    pub(crate) fn insert(&mut self, slot: StatementSlot) -> StatementId {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.slot = Some(slot);
            StatementId {
                index,
                generation: entry.generation,
            }
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(Entry {
                generation: 0,
                slot: Some(slot),
            });
            StatementId {
                index,
                generation: 0,
            }
        }
    }

    pub(crate) fn get(&self, id: StatementId) -> Result<&StatementSlot> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.slot.as_ref())
            .ok_or_else(|| stale(id))
    }

    pub(crate) fn get_mut(&mut self, id: StatementId) -> Result<&mut StatementSlot> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.slot.as_mut())
            .ok_or_else(|| stale(id))
    }

    /// Replace the native statement behind `id`, returning the old one.
    pub(crate) fn transplant(&mut self, id: StatementId, raw: RawStatement) -> Result<RawStatement> {
        let slot = self.get_mut(id)?;
        Ok(std::mem::replace(&mut slot.raw, raw))
    }

    pub(crate) fn remove(&mut self, id: StatementId) -> Result<StatementSlot> {
        let entry = self
            .entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation && e.slot.is_some())
            .ok_or_else(|| stale(id))?;
        let slot = entry.slot.take().ok_or_else(|| stale(id))?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        Ok(slot)
    }

    /// Take every live statement, invalidating all outstanding ids.
    pub(crate) fn drain(&mut self) -> Vec<StatementSlot> {
        let mut slots = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Some(slot) = entry.slot.take() {
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(index as u32);
                slots.push(slot);
            }
        }
        slots
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.slot.is_some()).count()
    }
}

fn stale(id: StatementId) -> Error {
    Error::Misuse(format!(
        "statement {}:{} is finalized or belongs to a closed connection",
        id.index, id.generation
    ))
}
