// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Monitor-style condition variable built from a fixed pool of raw counting
// semaphores — no OS family offers a native cross-process condvar usable
// here. Waiter bookkeeping lives in a shared segment as two bounded lists:
// `notifiable` (registered, not yet notified, FIFO) and `released` (notify
// issued, wake not yet consumed). The released list is the single source of
// truth distinguishing "woke because notified" from "woke because
// interrupted or timed out", which is what makes a notify impossible to
// lose when it races with an interruption-driven wake.

use std::ptr;
use std::sync::Arc;

use crate::abort::AbortBroadcaster;
use crate::error::{fatal, ResourceError};
use crate::semaphore::{AcquireOutcome, IpcSemaphore};
use crate::shm_name;
use crate::ShmSegment;

/// Hard cap on concurrently registered waiters.
pub const WAITER_SLOTS: usize = 8;

/// Outcome of a condition wait. The external mutex is re-acquired and held
/// again in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOutcome {
    /// A notify was consumed (possibly detected after an interrupted or
    /// timed-out slot wait — the notify still counts).
    Notified,
    /// The timeout expired before any notify (`wait_for` only).
    TimedOut,
    /// The wait was cancelled by external interruption.
    Signaled,
}

/// Waiter bookkeeping shared between processes, embedded at offset 0 of the
/// condition's segment.
#[repr(C)]
struct CondShared {
    notifiable_count: u32,
    notifiable: [u32; WAITER_SLOTS],
    released_count: u32,
    released: [u32; WAITER_SLOTS],
    /// Hint for the next free slot probe; actual freedom is decided by
    /// membership in the two lists.
    circular: u32,
}

/// A named cross-process condition variable.
pub struct IpcCondition {
    // Slot semaphores close before the segment detaches, so a last-detach
    // unlink sees no open handles from this process.
    slots: Vec<IpcSemaphore>,
    seg: ShmSegment,
    base: String,
}

impl IpcCondition {
    /// Open (or create) the condition `<base>` — segment `<base>_h`, state
    /// lock `<base>_s`, waiter slots `<base>_s_0..7`.
    pub fn open(base: &str, abort: &Arc<AbortBroadcaster>) -> Result<Self, ResourceError> {
        let seg = ShmSegment::open(base, std::mem::size_of::<CondShared>(), abort)?;
        if seg.user_size() < std::mem::size_of::<CondShared>() {
            fatal!("condition `{base}` segment too small for waiter state");
        }

        let first = seg.is_first_process();
        let mut slots = Vec::with_capacity(WAITER_SLOTS);
        for i in 0..WAITER_SLOTS {
            slots.push(IpcSemaphore::open(
                &shm_name::cond_slot_name(base, i),
                0,
                first,
                abort,
            )?);
        }

        if first {
            unsafe { ptr::write_bytes(seg.user_ptr(), 0, std::mem::size_of::<CondShared>()) };
        }

        let base_owned = base.to_string();
        seg.on_last_detach(move |_| {
            for i in 0..WAITER_SLOTS {
                IpcSemaphore::clear_storage(&shm_name::cond_slot_name(&base_owned, i));
            }
        });

        seg.finish_initialization();

        Ok(Self {
            slots,
            seg,
            base: base.to_string(),
        })
    }

    fn state(&self) -> *mut CondShared {
        self.seg.user_ptr() as *mut CondShared
    }

    /// Block until notified. The caller must hold `external` locked; it is
    /// released around the wait and held again on return.
    pub fn wait(&self, external: &IpcSemaphore) -> CondOutcome {
        self.wait_inner(external, None)
    }

    /// As [`wait`](Self::wait), giving up after `timeout_ms` milliseconds.
    pub fn wait_for(&self, external: &IpcSemaphore, timeout_ms: u64) -> CondOutcome {
        self.wait_inner(external, Some(timeout_ms))
    }

    fn wait_inner(&self, external: &IpcSemaphore, timeout_ms: Option<u64>) -> CondOutcome {
        if !self.seg.lock() {
            // Interrupted before registering; the external mutex was never
            // released, nothing to unwind.
            return CondOutcome::Signaled;
        }
        let slot = unsafe { self.reserve_slot() };
        self.seg.unlock();

        external.release();

        let outcome = match timeout_ms {
            None => self.slots[slot].blocking_acquire(false),
            Some(ms) => self.slots[slot].try_acquire(ms),
        };

        // Re-acquire unconditionally: the caller always gets its mutex back,
        // and a notify that raced with interruption or timeout is detected
        // against the released list below, so none is lost.
        external.blocking_acquire(true);

        self.seg.lock_uninterruptible();
        let result = unsafe {
            let st = &mut *self.state();
            if list_remove(&mut st.released, &mut st.released_count, slot as u32) {
                if outcome != AcquireOutcome::Acquired {
                    // The notify posted our slot after we stopped waiting;
                    // drain the stray count so the slot starts clean.
                    let _ = self.slots[slot].try_acquire(0);
                }
                CondOutcome::Notified
            } else {
                list_remove(&mut st.notifiable, &mut st.notifiable_count, slot as u32);
                match outcome {
                    AcquireOutcome::TimedOut => CondOutcome::TimedOut,
                    AcquireOutcome::Signaled => CondOutcome::Signaled,
                    AcquireOutcome::Acquired => {
                        // Slot count left over from a crashed waiter.
                        log::warn!("stray wake on condition `{}` slot {slot}", self.base);
                        CondOutcome::Notified
                    }
                }
            }
        };
        self.seg.unlock();
        result
    }

    /// Claim a free slot and register it as notifiable (FIFO). Caller holds
    /// the state lock. Slot exhaustion is a hard capacity limit, not a
    /// recoverable error.
    unsafe fn reserve_slot(&self) -> usize {
        let st = &mut *self.state();
        let mut probe = st.circular as usize % WAITER_SLOTS;
        let mut scanned = 0;
        while scanned < WAITER_SLOTS {
            let p = probe as u32;
            if !list_contains(&st.notifiable[..st.notifiable_count as usize], p)
                && !list_contains(&st.released[..st.released_count as usize], p)
            {
                break;
            }
            probe = (probe + 1) % WAITER_SLOTS;
            scanned += 1;
        }
        if scanned == WAITER_SLOTS || st.notifiable_count as usize == WAITER_SLOTS {
            fatal!(
                "condition `{}` waiter slots exhausted ({WAITER_SLOTS} concurrent waiters)",
                self.base
            );
        }
        st.notifiable[st.notifiable_count as usize] = probe as u32;
        st.notifiable_count += 1;
        st.circular = ((probe + 1) % WAITER_SLOTS) as u32;
        probe
    }

    /// Wake the oldest registered waiter. No-op when none is registered.
    pub fn notify(&self) {
        self.seg.lock_uninterruptible();
        unsafe { self.notify_one_locked() };
        self.seg.unlock();
    }

    /// Wake every registered waiter. No ordering guarantee among them.
    pub fn notify_all(&self) {
        self.seg.lock_uninterruptible();
        unsafe { while self.notify_one_locked() {} }
        self.seg.unlock();
    }

    /// Move the FIFO head of `notifiable` to `released` and post its slot.
    /// Caller holds the state lock.
    unsafe fn notify_one_locked(&self) -> bool {
        let st = &mut *self.state();
        let slot = match list_pop_front(&mut st.notifiable, &mut st.notifiable_count) {
            Some(s) => s,
            None => return false,
        };
        if (st.released_count as usize) < WAITER_SLOTS {
            st.released[st.released_count as usize] = slot;
            st.released_count += 1;
        }
        self.slots[slot as usize].release();
        true
    }

    /// Force-unlink every OS object behind the condition `<base>`.
    pub fn clear_storage(base: &str) {
        ShmSegment::clear_storage(base);
        for i in 0..WAITER_SLOTS {
            IpcSemaphore::clear_storage(&shm_name::cond_slot_name(base, i));
        }
    }
}

fn list_contains(list: &[u32], slot: u32) -> bool {
    list.iter().any(|&s| s == slot)
}

/// Remove `slot` from the first `count` entries, shifting the tail left so
/// FIFO order is preserved. Returns whether it was present.
fn list_remove(list: &mut [u32; WAITER_SLOTS], count: &mut u32, slot: u32) -> bool {
    let n = *count as usize;
    match list[..n].iter().position(|&s| s == slot) {
        Some(pos) => {
            list.copy_within(pos + 1..n, pos);
            *count -= 1;
            true
        }
        None => false,
    }
}

fn list_pop_front(list: &mut [u32; WAITER_SLOTS], count: &mut u32) -> Option<u32> {
    if *count == 0 {
        return None;
    }
    let head = list[0];
    let n = *count as usize;
    list.copy_within(1..n, 0);
    *count -= 1;
    Some(head)
}
