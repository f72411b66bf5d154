//! Connection lifecycle events for diagnostic observers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A fresh native handle was opened.
    NewHandle { path: String },
    /// An idle handle was taken from the pool.
    OpenedFromPool { path: String, version: u64 },
    /// The handle was reset and handed back to the pool.
    ClosedToPool { path: String, version: u64 },
    /// The handle was released for good.
    Disposed { path: String },
}

impl LifecycleEvent {
    pub fn path(&self) -> &str {
        match self {
            LifecycleEvent::NewHandle { path }
            | LifecycleEvent::OpenedFromPool { path, .. }
            | LifecycleEvent::ClosedToPool { path, .. }
            | LifecycleEvent::Disposed { path } => path,
        }
    }
}

pub type Observer = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

static OBSERVERS: Mutex<Vec<(ObserverId, Observer)>> = Mutex::new(Vec::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn add_observer(observer: impl Fn(&LifecycleEvent) + Send + Sync + 'static) -> ObserverId {
    let id = ObserverId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
    OBSERVERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push((id, Arc::new(observer)));
    id
}

pub fn remove_observer(id: ObserverId) -> bool {
    let mut observers = OBSERVERS.lock().unwrap_or_else(PoisonError::into_inner);
    let before = observers.len();
    observers.retain(|(existing, _)| *existing != id);
    observers.len() != before
}

pub(crate) fn emit(event: LifecycleEvent) {
    match &event {
        LifecycleEvent::NewHandle { path } => debug!(path, "new-handle"),
        LifecycleEvent::OpenedFromPool { path, version } => {
            debug!(path, version, "opened-from-pool")
        }
        LifecycleEvent::ClosedToPool { path, version } => debug!(path, version, "closed-to-pool"),
        LifecycleEvent::Disposed { path } => debug!(path, "disposed"),
    }
    let observers: Vec<Observer> = OBSERVERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(_, observer)| Arc::clone(observer))
        .collect();
    for observer in observers {
        observer(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observers_receive_events_until_removed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = add_observer(move |event| {
            if event.path() == "/events/test.db" {
                sink.lock().unwrap().push(event.clone());
            }
        });

        emit(LifecycleEvent::NewHandle {
            path: "/events/test.db".into(),
        });
        assert!(remove_observer(id));
        assert!(!remove_observer(id));
        emit(LifecycleEvent::Disposed {
            path: "/events/test.db".into(),
        });

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![LifecycleEvent::NewHandle {
                path: "/events/test.db".into()
            }]
        );
    }
}
