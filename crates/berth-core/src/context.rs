//! Thread-scoped execution context.
//!
//! Cleanup code that runs while an application is being retired must
//! resolve lazy lookups against the retiring loader, not against whatever
//! loader the calling thread happened to carry. [`enter`] switches the
//! current thread's context and restores the previous one on drop.

use std::cell::Cell;

use crate::id::LoaderId;

thread_local! {
    static CURRENT_LOADER: Cell<Option<LoaderId>> = Cell::new(None);
}

/// The loader currently associated with this thread, if any.
#[must_use]
pub fn current() -> Option<LoaderId> {
    CURRENT_LOADER.with(Cell::get)
}

/// Guard restoring the previous thread context when dropped.
#[derive(Debug)]
pub struct ContextGuard {
    previous: Option<LoaderId>,
}

/// Switch the current thread's execution context to `loader` until the
/// returned guard is dropped.
#[must_use]
pub fn enter(loader: LoaderId) -> ContextGuard {
    let previous = CURRENT_LOADER.with(|cell| cell.replace(Some(loader)));
    ContextGuard { previous }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT_LOADER.with(|cell| cell.set(self.previous));
    }
}
