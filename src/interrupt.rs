// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Consumed interruption capability: every blocking wait in this crate polls
// `interrupted()` between bounded wait slices and returns a Signaled outcome
// instead of continuing to block. The crate never sets the flag itself; an
// embedding runtime interrupts a thread through its `InterruptHandle`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

thread_local! {
    static CURRENT: InterruptHandle = InterruptHandle::new();
}

/// Handle to one thread's interruption flag.
///
/// Obtained on the target thread via [`handle`] and handed to whatever
/// external system is allowed to cancel that thread's blocking waits.
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the owning thread as interrupted. Every blocking wait it is in,
    /// or enters afterwards, returns Signaled until [`clear`](Self::clear).
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Reset the flag so the owning thread can block again.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// The calling thread's interruption handle.
pub fn handle() -> InterruptHandle {
    CURRENT.with(|h| h.clone())
}

/// Whether the calling thread has been interrupted.
pub fn interrupted() -> bool {
    CURRENT.with(|h| h.flag.load(Ordering::Acquire))
}
