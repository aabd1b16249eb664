// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX implementation of the shared memory, named semaphore and bootstrap
// file lock primitives: shm_open/mmap, sem_open, and lockf on a per-name
// lock file. Named objects persist until explicitly unlinked, so teardown
// and crash recovery must unlink by name.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;

use crate::shm_name;

// ---------------------------------------------------------------------------
// Layout helpers
// ---------------------------------------------------------------------------

/// The subscriber counter appended after the user region is 4-byte aligned.
const ALIGN: usize = std::mem::size_of::<u32>();

/// Total mapped size: user size rounded up to the counter alignment, plus
/// the trailing subscriber counter.
pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<u32>()
}

/// Offset of the trailing counter. Computed from the user size, which every
/// process passes identically, so the offset agrees across processes even
/// when the OS rounds the mapping itself to a page boundary.
pub(crate) fn counter_offset(user_size: usize) -> usize {
    calc_size(user_size) - std::mem::size_of::<u32>()
}

// ---------------------------------------------------------------------------
// PlatformShm — POSIX shared memory
// ---------------------------------------------------------------------------

/// A named, mapped shared memory region of `user_size` bytes plus the
/// trailing subscriber counter.
///
/// The counter is NOT maintained here: it is a plain `u32` the segment layer
/// mutates under its own locks, never through shared-memory atomics, so the
/// region layout stays portable across OS families. Drop unmaps only;
/// unlinking is an explicit decision of the last detacher.
pub struct PlatformShm {
    mem: *mut u8,
    size: usize,      // total mapped size (including the counter)
    user_size: usize, // user-requested size
    name: String,     // POSIX name (with leading '/')
}

// Safety: the region is process-shared by design; all mutation is guarded by
// the segment's own locks.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    /// Acquire a named shared memory region, creating it if missing. A
    /// freshly created region is zero-filled by the OS, so the subscriber
    /// counter starts at 0.
    pub fn acquire(name: &str, user_size: usize) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = shm_name::make_ipc_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let perms: libc::mode_t = 0o666;
        let total_size = calc_size(user_size);

        // Try exclusive create first so ftruncate only runs on an object we
        // actually own. On macOS, calling ftruncate on an already-sized shm
        // object can zero its contents before returning EINVAL.
        let (fd, need_truncate) = {
            let f = unsafe {
                libc::shm_open(
                    c_name.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    perms as libc::c_uint,
                )
            };
            if f != -1 {
                (f, true)
            } else {
                let e = io::Error::last_os_error();
                if e.raw_os_error() != Some(libc::EEXIST) {
                    return Err(e);
                }
                let f2 = unsafe {
                    libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
                };
                if f2 == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f2, false)
            }
        };

        unsafe { libc::fchmod(fd, perms) };

        if need_truncate {
            let ret = unsafe { libc::ftruncate(fd, total_size as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            mem: mem as *mut u8,
            size: total_size,
            user_size,
            name: posix_name,
        })
    }

    /// Pointer to the user-visible region (excluding the trailing counter).
    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    /// Mutable pointer to the user-visible region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// User-requested size.
    pub fn user_size(&self) -> usize {
        self.user_size
    }

    /// Pointer to the trailing subscriber counter. Callers must hold the
    /// bootstrap file lock or the segment's lock semaphore while accessing it.
    pub fn counter_ptr(&self) -> *mut u32 {
        unsafe { self.mem.add(counter_offset(self.user_size)) as *mut u32 }
    }

    /// Force-remove the backing object (shm_unlink). Does NOT unmap.
    pub fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    /// Unlink a named shm region by name (static helper).
    pub fn unlink_by_name(name: &str) {
        let posix_name = shm_name::make_ipc_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
    }
}

// ---------------------------------------------------------------------------
// PlatformSem — POSIX named counting semaphore (sem_open family)
// ---------------------------------------------------------------------------

/// A named counting semaphore. POSIX semaphores are persistent kernel
/// objects: they survive process death and must be sem_unlink'ed, which is
/// why creation supports `truncate` to reinitialize a stale instance.
pub struct PlatformSem {
    sem: *mut libc::sem_t,
    name: String, // POSIX name (with leading '/')
}

unsafe impl Send for PlatformSem {}
unsafe impl Sync for PlatformSem {}

impl PlatformSem {
    /// Open (or create) a named semaphore with `initial` count.
    ///
    /// `truncate` unlinks any existing instance first so the new one starts
    /// from `initial`; the caller must hold the bootstrap file lock for the
    /// name while requesting it.
    pub fn open(name: &str, initial: u32, truncate: bool) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        let posix_name = shm_name::make_ipc_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        if truncate {
            unsafe { libc::sem_unlink(c_name.as_ptr()) };
        }

        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                0o666 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            sem,
            name: posix_name,
        })
    }

    /// Wait up to `timeout_ms` for the count to become positive and take one.
    /// Returns `Ok(true)` if acquired, `Ok(false)` on timeout. EINTR counts
    /// as an expired slice — callers re-check their deadline and the
    /// interruption flag and call again.
    #[cfg(not(target_os = "macos"))]
    pub fn timed_wait(&self, timeout_ms: u64) -> io::Result<bool> {
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        let ns_total = ts.tv_nsec as u64 + (timeout_ms % 1000) * 1_000_000;
        ts.tv_sec +=
            (timeout_ms / 1000) as libc::time_t + (ns_total / 1_000_000_000) as libc::time_t;
        ts.tv_nsec = (ns_total % 1_000_000_000) as libc::c_long;

        let ret = unsafe { libc::sem_timedwait(self.sem, &ts) };
        if ret == 0 {
            return Ok(true);
        }
        let e = io::Error::last_os_error();
        match e.raw_os_error() {
            Some(libc::ETIMEDOUT) | Some(libc::EINTR) => Ok(false),
            _ => Err(e),
        }
    }

    /// macOS lacks sem_timedwait — emulate with sem_trywait polling and the
    /// adaptive backoff, mirroring the timed mutex emulation on that family.
    #[cfg(target_os = "macos")]
    pub fn timed_wait(&self, timeout_ms: u64) -> io::Result<bool> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        let mut k = 0u32;
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            super::adaptive_yield(&mut k);
        }
    }

    /// Take one count without blocking. Returns `Ok(false)` if the count is 0.
    pub fn try_wait(&self) -> io::Result<bool> {
        let ret = unsafe { libc::sem_trywait(self.sem) };
        if ret == 0 {
            return Ok(true);
        }
        let e = io::Error::last_os_error();
        match e.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(false),
            _ => Err(e),
        }
    }

    /// Increment the count, waking one blocked waiter if any.
    pub fn post(&self) -> io::Result<()> {
        let ret = unsafe { libc::sem_post(self.sem) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Unlink a named semaphore by name (static helper).
    pub fn unlink_by_name(name: &str) {
        let posix_name = shm_name::make_ipc_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::sem_unlink(c_name.as_ptr()) };
        }
    }

    /// The platform name used to open the semaphore.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PlatformSem {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
    }
}

// ---------------------------------------------------------------------------
// FileLock — bootstrap lock over lockf
// ---------------------------------------------------------------------------

/// Exclusive file-system lock on the per-name lock file.
///
/// Held only during the first-open / last-close window, where it provides
/// mutual exclusion before (or after) the named lock semaphore can be
/// trusted. lockf locks are per-process; the segment layer adds its own
/// per-name in-process serialization on top.
pub struct FileLock {
    file: std::fs::File,
}

impl FileLock {
    pub fn acquire(base: &str) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let path = shm_name::lock_file_path(base);
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            loop {
                let ret = unsafe { libc::lockf(file.as_raw_fd(), libc::F_LOCK, 0) };
                if ret == 0 {
                    break;
                }
                let e = io::Error::last_os_error();
                if e.raw_os_error() != Some(libc::EINTR) {
                    return Err(e);
                }
            }
            // A last detacher may have unlinked the lock file between our
            // open and lock, leaving us locked on a dead inode while a fresh
            // file exists on disk. Retry against the current inode.
            match std::fs::metadata(&path) {
                Ok(on_disk) if on_disk.ino() == file.metadata()?.ino() => {
                    return Ok(Self { file });
                }
                _ => continue, // dropping `file` releases the stale lock
            }
        }
    }

    /// Remove the lock file itself (last-detach teardown).
    pub fn remove(base: &str) {
        let _ = std::fs::remove_file(shm_name::lock_file_path(base));
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe { libc::lockf(self.file.as_raw_fd(), libc::F_ULOCK, 0) };
    }
}
