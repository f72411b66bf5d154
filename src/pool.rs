//! Connection pool contract and the process-wide implementation.
//!
//! Pooled handles are keyed by normalized file path. Each path carries a version stamp:
//! clearing a path bumps it, and a handle handed back with an older stamp is freed rather
//! than queued, so a stale handle can never reach a later caller.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::debug;

use crate::handle::ConnectionHandle;

/// Pool hit/return counters and idle-handle total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    /// Handles handed out from the pool.
    pub opened: u64,
    /// Handles accepted back into the pool.
    pub closed: u64,
    /// Idle handles currently queued.
    pub total: usize,
}

/// Keyed store of idle native handles.
pub trait ConnectionPool: Send + Sync {
    /// Take an idle handle for `path`, trimming the queue to `max_size` first. Always returns
    /// the current version stamp of `path`.
    fn remove(&self, path: &str, max_size: usize) -> (Option<ConnectionHandle>, u64);

    /// Return a handle that was opened under `version`.
    fn add(&self, path: &str, handle: ConnectionHandle, version: u64);

    /// Counters for one path, or summed over all paths.
    fn counts(&self, path: Option<&str>) -> PoolCounts;

    /// Free the idle handles of `path` and invalidate every outstanding one.
    fn clear_pool(&self, path: &str);

    fn clear_all(&self);
}

const DEFAULT_MAX_POOL_SIZE: usize = 100;

struct PoolQueue {
    version: u64,
    max_size: usize,
    idle: VecDeque<ConnectionHandle>,
    opened: u64,
    closed: u64,
}

impl Default for PoolQueue {
    fn default() -> Self {
        Self {
            version: 0,
            max_size: DEFAULT_MAX_POOL_SIZE,
            idle: VecDeque::new(),
            opened: 0,
            closed: 0,
        }
    }
}

impl PoolQueue {
    fn trim(&mut self, limit: usize) -> Vec<ConnectionHandle> {
        let mut evicted = Vec::new();
        while self.idle.len() > limit {
            if let Some(handle) = self.idle.pop_front() {
                evicted.push(handle);
            }
        }
        evicted
    }
}

/// Mutex-guarded map of per-path queues. Safe to share between threads.
#[derive(Default)]
pub struct SharedPool {
    queues: Mutex<HashMap<String, PoolQueue>>,
}

impl SharedPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PoolQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConnectionPool for SharedPool {
    fn remove(&self, path: &str, max_size: usize) -> (Option<ConnectionHandle>, u64) {
        let (handle, version, evicted) = {
            let mut queues = self.lock();
            let queue = queues.entry(path.to_string()).or_default();
            queue.max_size = max_size;
            let evicted = queue.trim(max_size);
            let handle = queue.idle.pop_back();
            if handle.is_some() {
                queue.opened += 1;
            }
            (handle, queue.version, evicted)
        };
        // Evicted handles close outside the lock.
        drop(evicted);
        (handle, version)
    }

    fn add(&self, path: &str, handle: ConnectionHandle, version: u64) {
        let discarded = {
            let mut queues = self.lock();
            let queue = queues.entry(path.to_string()).or_default();
            if version < queue.version {
                debug!(path, version, current = queue.version, "discarding stale pooled handle");
                vec![handle]
            } else {
                queue.idle.push_back(handle);
                queue.closed += 1;
                let limit = queue.max_size;
                queue.trim(limit)
            }
        };
        drop(discarded);
    }

    fn counts(&self, path: Option<&str>) -> PoolCounts {
        let queues = self.lock();
        let sum = |acc: PoolCounts, q: &PoolQueue| PoolCounts {
            opened: acc.opened + q.opened,
            closed: acc.closed + q.closed,
            total: acc.total + q.idle.len(),
        };
        match path {
            Some(path) => queues
                .get(path)
                .map(|q| sum(PoolCounts::default(), q))
                .unwrap_or_default(),
            None => queues.values().fold(PoolCounts::default(), sum),
        }
    }

    fn clear_pool(&self, path: &str) {
        let evicted = {
            let mut queues = self.lock();
            let queue = queues.entry(path.to_string()).or_default();
            queue.version += 1;
            queue.trim(0)
        };
        debug!(path, closed = evicted.len(), "cleared pool");
        drop(evicted);
    }

    fn clear_all(&self) {
        let evicted: Vec<ConnectionHandle> = {
            let mut queues = self.lock();
            queues
                .values_mut()
                .flat_map(|queue| {
                    queue.version += 1;
                    queue.trim(0)
                })
                .collect()
        };
        debug!(closed = evicted.len(), "cleared all pools");
        drop(evicted);
    }
}

/// The process-wide pool used by connections created without an explicit pool.
pub fn shared() -> Arc<dyn ConnectionPool> {
    static POOL: OnceLock<Arc<SharedPool>> = OnceLock::new();
    POOL.get_or_init(|| Arc::new(SharedPool::new())).clone()
}
