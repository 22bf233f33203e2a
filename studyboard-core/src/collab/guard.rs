//! Reentrancy guard shared by the two change bridges.
//!
//! While one bridge is writing into the other store, the opposite bridge
//! must not mirror the resulting notification back. The guard records, per
//! thread, which bridge is currently applying. Writes made by the UI on other
//! threads are never mistaken for echoes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::origin::SyncOrigin;

#[derive(Debug, Default)]
pub struct SyncGuard {
    active: Mutex<HashMap<ThreadId, SyncOrigin>>,
}

impl SyncGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Which bridge is applying on the calling thread, if any.
    pub fn current(&self) -> Option<SyncOrigin> {
        self.lock().get(&thread::current().id()).copied()
    }

    pub fn is_active(&self) -> bool {
        self.current().is_some()
    }

    /// Mark the calling thread as applying on behalf of `origin` until the
    /// returned token is dropped. Nested entries restore the outer origin.
    #[must_use = "the guard is released as soon as the token is dropped"]
    pub fn enter(&self, origin: SyncOrigin) -> GuardToken<'_> {
        let thread = thread::current().id();
        let previous = self.lock().insert(thread, origin);
        GuardToken {
            guard: self,
            thread,
            previous,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, SyncOrigin>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases its guard entry on drop, including while unwinding.
#[derive(Debug)]
pub struct GuardToken<'a> {
    guard: &'a SyncGuard,
    thread: ThreadId,
    previous: Option<SyncOrigin>,
}

impl GuardToken<'_> {
    pub fn origin(&self) -> Option<SyncOrigin> {
        self.guard.lock().get(&self.thread).copied()
    }
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        let mut active = self.guard.lock();
        match self.previous {
            Some(origin) => {
                active.insert(self.thread, origin);
            }
            None => {
                active.remove(&self.thread);
            }
        }
    }
}
