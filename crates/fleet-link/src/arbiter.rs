use std::sync::{Mutex, PoisonError};

use crate::mav::LinkSession;

/// Mutual-exclusion gate in front of one vehicle link.
///
/// Every multi-step exchange runs inside one [`LinkArbiter::with_exclusive_link`]
/// call. Nested steps take the `&mut LinkSession` they are handed instead of
/// locking again, so the lock never needs to be re-entrant.
pub struct LinkArbiter {
    session: Mutex<LinkSession>,
}

impl LinkArbiter {
    pub fn new(session: LinkSession) -> Self {
        Self { session: Mutex::new(session) }
    }

    /// Run `f` with the link to itself. The lock is released on every exit
    /// path, including a panic inside `f`.
    pub fn with_exclusive_link<T>(&self, f: impl FnOnce(&mut LinkSession) -> T) -> T {
        // a panicking holder leaves no partial state behind
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}
