//! Scoped resource tracking.
//!
//! A [`Scope`] groups disposable resources (signal connections, spawned
//! tasks, arbitrary cleanup callbacks, child scopes) so they are released
//! together. Release runs in reverse registration order. Anything registered
//! after the scope was released is released immediately.

use crate::signal::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;

type Cleanup = Box<dyn FnOnce() + Send>;

/// Handle to one registered resource, for [`Scope::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

#[derive(Default)]
struct ScopeInner {
    entries: Vec<(ResourceId, Cleanup)>,
    released: bool,
}

#[derive(Default)]
pub struct Scope {
    next_id: AtomicU64,
    inner: Mutex<ScopeInner>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cleanup callback.
    pub fn register<F>(&self, cleanup: F) -> ResourceId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.released {
            drop(inner);
            cleanup();
        } else {
            inner.entries.push((id, Box::new(cleanup)));
        }
        id
    }

    pub fn register_connection(&self, connection: Connection) -> ResourceId {
        self.register(move || connection.disconnect())
    }

    /// Aborts the task on release. Aborting a finished task does nothing.
    pub fn register_task(&self, task: AbortHandle) -> ResourceId {
        self.register(move || task.abort())
    }

    /// Creates a child scope released together with this one.
    pub fn extend(&self) -> Arc<Scope> {
        let child = Arc::new(Scope::new());
        let tracked = Arc::clone(&child);
        self.register(move || tracked.release_all());
        child
    }

    /// Releases one resource now. Returns false if it was not tracked.
    pub fn release(&self, id: ResourceId) -> bool {
        let cleanup = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let position = inner.entries.iter().position(|(entry_id, _)| *entry_id == id);
            position.map(|index| inner.entries.remove(index).1)
        };
        match cleanup {
            Some(cleanup) => {
                cleanup();
                true
            }
            None => false,
        }
    }

    pub fn release_all(&self) {
        let entries = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.released = true;
            std::mem::take(&mut inner.entries)
        };
        for (_, cleanup) in entries.into_iter().rev() {
            cleanup();
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).released
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.release_all();
    }
}
