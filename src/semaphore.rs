// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process counting semaphore with interruption-aware waits and
// best-effort abort unwind. Blocking waits are chopped into bounded slices
// so the thread's interruption flag is observed without an OS-level
// cancellable wait.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::abort::AbortBroadcaster;
use crate::error::{fatal, ResourceError};
use crate::interrupt;
use crate::platform::PlatformSem;

/// Upper bound of one OS-level wait before the interruption flag is
/// re-checked.
pub(crate) const WAIT_SLICE_MS: u64 = 50;

/// Outcome of a semaphore acquisition, exhaustive and returned by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The count was taken.
    Acquired,
    /// The timeout expired without acquiring (timed waits only).
    TimedOut,
    /// The wait was cancelled by external interruption; nothing was acquired.
    Signaled,
}

struct SemInner {
    sem: PlatformSem,
    /// Acquisitions made through this instance and not yet released. Only an
    /// approximation used for abort unwind — over- or under-release while
    /// the process is already dying is accepted.
    held: AtomicU32,
}

/// A named counting semaphore shared between processes.
pub struct IpcSemaphore {
    inner: Arc<SemInner>,
    abort: Arc<AbortBroadcaster>,
    abort_key: usize,
}

impl IpcSemaphore {
    /// Open (or create) a named semaphore with `initial` count.
    ///
    /// `truncate` forces reinitialization of a stale persistent instance on
    /// the OS family where semaphores outlive process death; only the
    /// process holding the bootstrap file lock for the name may request it.
    pub fn open(
        name: &str,
        initial: u32,
        truncate: bool,
        abort: &Arc<AbortBroadcaster>,
    ) -> Result<Self, ResourceError> {
        let sem = PlatformSem::open(name, initial, truncate).map_err(|source| {
            log::error!("failed to create named semaphore `{name}`: {source}");
            ResourceError::CreateSemaphore {
                name: name.to_string(),
                source,
            }
        })?;

        let inner = Arc::new(SemInner {
            sem,
            held: AtomicU32::new(0),
        });

        // On process abort, release every acquisition this instance still
        // holds so peers blocked on the semaphore are not stranded.
        let weak = Arc::downgrade(&inner);
        let abort_key = abort.subscribe(move || {
            if let Some(inner) = weak.upgrade() {
                let held = inner.held.swap(0, Ordering::AcqRel);
                for _ in 0..held {
                    let _ = inner.sem.post();
                }
            }
        });

        Ok(Self {
            inner,
            abort: Arc::clone(abort),
            abort_key,
        })
    }

    /// Acquire with a timeout in milliseconds. `timeout_ms == 0` is a
    /// non-blocking poll and never reports `Signaled`.
    pub fn try_acquire(&self, timeout_ms: u64) -> AcquireOutcome {
        if timeout_ms == 0 {
            return match self.inner.sem.try_wait() {
                Ok(true) => {
                    self.inner.held.fetch_add(1, Ordering::AcqRel);
                    AcquireOutcome::Acquired
                }
                Ok(false) => AcquireOutcome::TimedOut,
                Err(e) => fatal!("semaphore `{}` wait failed: {e}", self.inner.sem.name()),
            };
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if interrupt::interrupted() {
                return AcquireOutcome::Signaled;
            }
            let now = Instant::now();
            if now >= deadline {
                return AcquireOutcome::TimedOut;
            }
            let remaining = deadline.saturating_duration_since(now).as_millis() as u64;
            let slice = remaining.clamp(1, WAIT_SLICE_MS);
            match self.inner.sem.timed_wait(slice) {
                Ok(true) => {
                    self.inner.held.fetch_add(1, Ordering::AcqRel);
                    return AcquireOutcome::Acquired;
                }
                Ok(false) => {}
                Err(e) => fatal!("semaphore `{}` wait failed: {e}", self.inner.sem.name()),
            }
        }
    }

    /// Block until acquired. Returns `Signaled` without acquiring when the
    /// calling thread is interrupted, unless `ignore_signal` is set, in
    /// which case interruption is ignored and the wait retries until it
    /// actually acquires (used where correctness requires the acquisition,
    /// e.g. draining a resource during teardown).
    pub fn blocking_acquire(&self, ignore_signal: bool) -> AcquireOutcome {
        loop {
            if !ignore_signal && interrupt::interrupted() {
                return AcquireOutcome::Signaled;
            }
            match self.inner.sem.timed_wait(WAIT_SLICE_MS) {
                Ok(true) => {
                    self.inner.held.fetch_add(1, Ordering::AcqRel);
                    return AcquireOutcome::Acquired;
                }
                Ok(false) => {}
                Err(e) => fatal!("semaphore `{}` wait failed: {e}", self.inner.sem.name()),
            }
        }
    }

    /// Increment the semaphore, waking one blocked waiter if any.
    pub fn release(&self) {
        if let Err(e) = self.inner.sem.post() {
            fatal!("semaphore `{}` post failed: {e}", self.inner.sem.name());
        }
        let _ = self
            .inner
            .held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |h| h.checked_sub(1));
    }

    /// Acquisitions made through this instance and not yet released.
    pub fn held_count(&self) -> u32 {
        self.inner.held.load(Ordering::Acquire)
    }

    /// Force-unlink a named semaphore left behind by a crashed process.
    /// No liveness check — the caller guarantees nobody is using the name.
    pub fn clear_storage(name: &str) {
        PlatformSem::unlink_by_name(name);
    }
}

impl Drop for IpcSemaphore {
    fn drop(&mut self) {
        self.abort.unsubscribe(self.abort_key);
    }
}
