// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// One implementation per OS family behind a uniform surface, selected at
// compile time: create/open/unlink of named regions and semaphores plus the
// bootstrap file lock. The segment, condition and queue logic is written
// once against these types.

#[cfg(unix)]
pub mod posix;

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use posix::{FileLock, PlatformSem, PlatformShm};

#[cfg(windows)]
pub use windows::{FileLock, PlatformSem, PlatformShm};

/// Adaptive backoff between polls of a condition the OS cannot wait on:
///
/// - k < 4:  busy spin
/// - k < 16: CPU pause hint
/// - k < 32: thread yield
/// - k >= 32: sleep 1ms
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}
