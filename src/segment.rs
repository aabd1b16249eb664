// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared segment: a named region of `size` user bytes plus a trailing
// subscriber counter, guarded by a named lock semaphore. The hard part is
// the bootstrap: before the lock semaphore is known to be initialized, two
// processes could both believe they created the segment, so every open and
// the final close run under a per-name file lock. Exactly one process
// observes a zero counter and becomes the initializer; everyone else blocks
// until it calls `finish_initialization`.

use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use crate::abort::AbortBroadcaster;
use crate::error::{fatal, ResourceError};
use crate::platform::{FileLock, PlatformSem, PlatformShm};
use crate::semaphore::{AcquireOutcome, IpcSemaphore};
use crate::shm_name;

// ---------------------------------------------------------------------------
// Bootstrap lock — file lock plus per-name in-process serialization.
// lockf/LockFileEx exclude other processes but not other threads of this
// process, so a process-local name table provides the intra-process half.
// ---------------------------------------------------------------------------

struct NameTable {
    held: Mutex<HashSet<String>>,
    cv: Condvar,
}

fn name_table() -> &'static NameTable {
    static TABLE: OnceLock<NameTable> = OnceLock::new();
    TABLE.get_or_init(|| NameTable {
        held: Mutex::new(HashSet::new()),
        cv: Condvar::new(),
    })
}

fn local_acquire(base: &str) {
    let t = name_table();
    let mut held = t.held.lock().unwrap();
    while held.contains(base) {
        held = t.cv.wait(held).unwrap();
    }
    held.insert(base.to_string());
}

fn local_release(base: &str) {
    let t = name_table();
    t.held.lock().unwrap().remove(base);
    t.cv.notify_all();
}

struct BootLock {
    base: String,
    file: Option<FileLock>,
}

impl BootLock {
    fn acquire(base: &str) -> std::io::Result<Self> {
        local_acquire(base);
        match FileLock::acquire(base) {
            Ok(file) => Ok(Self {
                base: base.to_string(),
                file: Some(file),
            }),
            Err(e) => {
                local_release(base);
                Err(e)
            }
        }
    }
}

impl Drop for BootLock {
    fn drop(&mut self) {
        // File lock released before the local slot so a same-process waiter
        // never acquires the name while the file lock is still held here.
        self.file.take();
        local_release(&self.base);
    }
}

// ---------------------------------------------------------------------------
// ShmSegment
// ---------------------------------------------------------------------------

struct SegInner {
    shm: PlatformShm,
    lock: IpcSemaphore,
    base: String,
    lock_name: String,
    torn_down: AtomicBool,
}

type DetachFn = Box<dyn Fn(&ShmSegment) + Send + Sync>;

/// A named shared memory segment with distributed reference counting.
///
/// Opens-or-creates the region `<base>_h`, attaches as a subscriber, and
/// exposes `lock`/`unlock` over the named semaphore `<base>_s` (or a
/// caller-supplied semaphore name). The process whose detach drops the
/// subscriber count to zero unlinks every backing OS object.
pub struct ShmSegment {
    inner: Arc<SegInner>,
    is_first: bool,
    finished: AtomicBool,
    boot: Mutex<Option<BootLock>>,
    callbacks: Mutex<Vec<DetachFn>>,
    abort: Arc<AbortBroadcaster>,
    abort_key: usize,
}

impl ShmSegment {
    /// Open (or create) the segment `<name>_h` of `size` user bytes, locked
    /// by the semaphore `<name>_s`.
    pub fn open(
        name: &str,
        size: usize,
        abort: &Arc<AbortBroadcaster>,
    ) -> Result<Self, ResourceError> {
        let lock_name = shm_name::mutex_name(name);
        Self::open_with_lock(name, &lock_name, size, abort)
    }

    /// Open with an explicit lock semaphore name. Used by the ring queue,
    /// whose wire contract mounts `<queue>_allqs` on the `<queue>_h` region.
    pub fn open_with_lock(
        name: &str,
        lock_name: &str,
        size: usize,
        abort: &Arc<AbortBroadcaster>,
    ) -> Result<Self, ResourceError> {
        if name.is_empty() {
            return Err(ResourceError::InvalidParameter {
                name: name.to_string(),
                reason: "segment name is empty",
            });
        }
        if size == 0 {
            return Err(ResourceError::InvalidParameter {
                name: name.to_string(),
                reason: "segment size is 0",
            });
        }

        // Every process takes the bootstrap lock before touching any named
        // object, and keeps it until fully attached.
        let boot = BootLock::acquire(name).map_err(|source| {
            log::error!("failed to acquire bootstrap lock for `{name}`: {source}");
            ResourceError::BootstrapLock {
                name: name.to_string(),
                source,
            }
        })?;

        let region = shm_name::header_name(name);
        let shm = PlatformShm::acquire(&region, size).map_err(|source| {
            log::error!("failed to create shared memory region `{region}`: {source}");
            ResourceError::CreateRegion {
                name: region.clone(),
                source,
            }
        })?;

        // First-ness is decided by the counter value at lock time; a fresh
        // region is zero-filled by the OS. The first process reinitializes
        // the (possibly stale) lock semaphore while still under the file
        // lock — nobody else can be between shm_open and here.
        let subscribers = unsafe { ptr::read_volatile(shm.counter_ptr() as *const u32) };
        let is_first = subscribers == 0;

        let lock = IpcSemaphore::open(lock_name, 1, is_first, abort)?;

        unsafe { ptr::write_volatile(shm.counter_ptr(), subscribers + 1) };

        let inner = Arc::new(SegInner {
            shm,
            lock,
            base: name.to_string(),
            lock_name: lock_name.to_string(),
            torn_down: AtomicBool::new(false),
        });

        // Abort unwind: unlink the named objects so they do not outlive an
        // abnormally dying process forever. The subscriber count cannot be
        // maintained from here; survivors recover via clear_storage.
        let weak = Arc::downgrade(&inner);
        let abort_key = abort.subscribe(move || {
            if let Some(inner) = weak.upgrade() {
                if !inner.torn_down.load(Ordering::Acquire) {
                    inner.shm.unlink();
                    PlatformSem::unlink_by_name(&inner.lock_name);
                }
            }
        });

        log::debug!(
            "attached segment `{region}` (first = {is_first}, subscribers = {})",
            subscribers + 1
        );

        // Later openers are fully attached now; only the initializer keeps
        // the bootstrap lock until finish_initialization.
        Ok(Self {
            inner,
            is_first,
            finished: AtomicBool::new(false),
            boot: Mutex::new(if is_first { Some(boot) } else { None }),
            callbacks: Mutex::new(Vec::new()),
            abort: Arc::clone(abort),
            abort_key,
        })
    }

    /// Whether this call created the segment rather than attaching to it.
    pub fn is_first_process(&self) -> bool {
        self.is_first
    }

    /// Mark first-process-only setup complete and let other processes'
    /// `open` proceed. Must be called exactly once per instance; calling it
    /// twice is a programming error and aborts.
    pub fn finish_initialization(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            fatal!(
                "finish_initialization called twice for segment `{}`",
                self.inner.base
            );
        }
        *self.boot.lock().unwrap() = None;
    }

    /// Acquire the segment lock. Returns `false` when the wait was cancelled
    /// by external interruption (the lock is then NOT held) or the segment
    /// is already torn down. Not re-entrant.
    pub fn lock(&self) -> bool {
        if self.inner.torn_down.load(Ordering::Acquire) {
            return false;
        }
        self.inner.lock.blocking_acquire(false) == AcquireOutcome::Acquired
    }

    /// Acquire the segment lock, ignoring interruption. Used by bookkeeping
    /// that must complete (condition-variable release step, detach).
    pub(crate) fn lock_uninterruptible(&self) {
        if self.inner.torn_down.load(Ordering::Acquire) {
            return;
        }
        self.inner.lock.blocking_acquire(true);
    }

    /// Release the segment lock. No-op on a torn-down instance.
    pub fn unlock(&self) {
        if self.inner.torn_down.load(Ordering::Acquire) {
            return;
        }
        self.inner.lock.release();
    }

    /// Pointer to the start of the user region. Embedded structs are laid
    /// out from offset 0; callers validate their size against `user_size`
    /// once at attach time.
    pub fn user_ptr(&self) -> *mut u8 {
        self.inner.shm.as_mut_ptr()
    }

    /// The user-visible size requested at open.
    pub fn user_size(&self) -> usize {
        self.inner.shm.user_size()
    }

    /// Current subscriber count, read under the segment lock.
    pub fn subscriber_count(&self) -> u32 {
        if self.inner.torn_down.load(Ordering::Acquire) {
            return 0;
        }
        self.lock_uninterruptible();
        let count = unsafe { ptr::read_volatile(self.inner.shm.counter_ptr() as *const u32) };
        self.unlock();
        count
    }

    /// Register a callback fired by the detach that observes the subscriber
    /// count reach zero, after the segment lock is released and before the
    /// OS objects are unlinked.
    pub fn on_last_detach(&self, f: impl Fn(&ShmSegment) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().push(Box::new(f));
    }

    /// The base name this segment was opened with.
    pub fn name(&self) -> &str {
        &self.inner.base
    }

    /// Force-unlink the OS objects behind `<name>` (region, lock semaphore,
    /// lock file). No liveness check.
    pub fn clear_storage(name: &str) {
        Self::clear_storage_with_lock(name, &shm_name::mutex_name(name));
    }

    /// `clear_storage` for a segment opened via `open_with_lock`.
    pub fn clear_storage_with_lock(name: &str, lock_name: &str) {
        PlatformShm::unlink_by_name(&shm_name::header_name(name));
        PlatformSem::unlink_by_name(lock_name);
        FileLock::remove(name);
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        self.abort.unsubscribe(self.abort_key);
        if self.inner.torn_down.load(Ordering::Acquire) {
            return;
        }

        // Detach runs under the bootstrap lock so a concurrent opener cannot
        // slip between our decrement and the unlink. An initializer dropped
        // before finish_initialization still holds its own lock — reuse it.
        let boot = match self.boot.lock().unwrap().take() {
            Some(b) => Some(b),
            None => match BootLock::acquire(&self.inner.base) {
                Ok(b) => Some(b),
                Err(e) => {
                    log::warn!(
                        "bootstrap lock unavailable while detaching `{}`: {e}",
                        self.inner.base
                    );
                    None
                }
            },
        };

        self.lock_uninterruptible();
        let remaining = unsafe {
            let p = self.inner.shm.counter_ptr();
            let v = ptr::read_volatile(p as *const u32).saturating_sub(1);
            ptr::write_volatile(p, v);
            v
        };
        self.unlock();

        if remaining == 0 {
            self.inner.torn_down.store(true, Ordering::Release);

            let callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap());
            for cb in &callbacks {
                cb(self);
            }

            self.inner.shm.unlink();
            PlatformSem::unlink_by_name(&self.inner.lock_name);
            FileLock::remove(&self.inner.base);
            log::debug!("last detach from `{}`: objects unlinked", self.inner.base);
        } else {
            log::debug!(
                "detached from `{}` ({remaining} subscriber(s) left)",
                self.inner.base
            );
        }

        drop(boot);
    }
}
