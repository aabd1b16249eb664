// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-wide abnormal-termination event. Every open named semaphore and
// shared segment subscribes a best-effort unwind callback at construction
// and removes it on drop. The embedder's fatal-signal / terminate handler
// calls `fire()` once, just before the process dies.

use std::sync::{Arc, Mutex};

use slab::Slab;

type AbortFn = Box<dyn Fn() + Send + Sync>;

/// Arena of abort subscribers.
///
/// Passed by `Arc` to every primitive at construction — there is no hidden
/// global. Callbacks run synchronously, in arena order, on the thread that
/// calls [`fire`](Self::fire); they must not subscribe or unsubscribe.
pub struct AbortBroadcaster {
    subs: Mutex<Slab<AbortFn>>,
}

impl AbortBroadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subs: Mutex::new(Slab::new()),
        })
    }

    /// Register a callback; returns the key for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, f: impl Fn() + Send + Sync + 'static) -> usize {
        self.subs.lock().unwrap().insert(Box::new(f))
    }

    pub fn unsubscribe(&self, key: usize) {
        let mut subs = self.subs.lock().unwrap();
        if subs.contains(key) {
            subs.remove(key);
        }
    }

    /// Run every subscribed callback. The process is assumed to be
    /// terminating abnormally; callbacks release held semaphore acquisitions
    /// and unlink named objects so surviving processes are not stranded.
    pub fn fire(&self) {
        log::warn!("abort broadcast: unwinding {} subscriber(s)", self.subscriber_count());
        let subs = self.subs.lock().unwrap();
        for (_, f) in subs.iter() {
            f();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().unwrap().len()
    }
}
