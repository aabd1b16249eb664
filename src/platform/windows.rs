// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Windows implementation of the shared memory, named semaphore and bootstrap
// file lock primitives: CreateFileMapping, CreateSemaphore, and LockFileEx
// on a per-name lock file. The named-object namespace is flat and kernel
// objects vanish with their last handle, so unlink operations are no-ops.

use std::fs::OpenOptions;
use std::io;
use std::os::windows::io::AsRawHandle;
use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::Storage::FileSystem::{
    LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE, SEC_COMMIT,
};
use windows_sys::Win32::System::Threading::{
    CreateSemaphoreW, ReleaseSemaphore, WaitForSingleObject,
};
use windows_sys::Win32::System::IO::OVERLAPPED;

use crate::shm_name;

// ---------------------------------------------------------------------------
// Layout helpers — identical to the POSIX family
// ---------------------------------------------------------------------------

const ALIGN: usize = std::mem::size_of::<u32>();

pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<u32>()
}

pub(crate) fn counter_offset(user_size: usize) -> usize {
    calc_size(user_size) - std::mem::size_of::<u32>()
}

/// Encode a name as a null-terminated wide string for Win32 APIs.
fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

// ---------------------------------------------------------------------------
// PlatformShm — Windows shared memory via pagefile-backed file mapping
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    handle: HANDLE,
    mem: *mut u8,
    user_size: usize, // user-requested size; the mapped view is calc_size(user_size)
}

unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    /// Acquire a named shared memory region, creating it if missing. Fresh
    /// mappings are zero-filled, so the subscriber counter starts at 0.
    /// Every process passes the same `user_size` (the capacity invariant),
    /// which keeps the counter offset identical even though Windows rounds
    /// the view itself to a page.
    pub fn acquire(name: &str, user_size: usize) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let wide_name = to_wide(name);
        let total_size = calc_size(user_size);

        // CreateFileMappingW opens the existing object when the name is
        // already in use, which is exactly the create-or-open we need.
        let handle = unsafe {
            CreateFileMappingW(
                windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE,
                ptr::null(),
                PAGE_READWRITE | SEC_COMMIT,
                0,
                total_size as u32,
                wide_name.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }

        let view: MEMORY_MAPPED_VIEW_ADDRESS =
            unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        if view.Value.is_null() {
            let e = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(e);
        }

        Ok(Self {
            handle,
            mem: view.Value as *mut u8,
            user_size,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    /// Pointer to the trailing subscriber counter. Callers must hold the
    /// bootstrap file lock or the segment's lock semaphore while accessing it.
    pub fn counter_ptr(&self) -> *mut u32 {
        unsafe { self.mem.add(counter_offset(self.user_size)) as *mut u32 }
    }

    /// No backing file on Windows — the object dies with its last handle.
    pub fn unlink(&self) {}

    pub fn unlink_by_name(_name: &str) {}
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if !self.mem.is_null() {
            unsafe {
                UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                    Value: self.mem as *mut core::ffi::c_void,
                })
            };
        }
        if !self.handle.is_null() {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformSem — Windows named kernel semaphore
// ---------------------------------------------------------------------------

pub struct PlatformSem {
    handle: HANDLE,
    name: String,
}

unsafe impl Send for PlatformSem {}
unsafe impl Sync for PlatformSem {}

impl PlatformSem {
    /// Open (or create) a named semaphore with `initial` count.
    ///
    /// `truncate` has no effect here: kernel semaphores do not outlive their
    /// last handle, so there is never a stale persistent instance to reset.
    /// When the object already exists, `initial` is ignored by the kernel.
    pub fn open(name: &str, initial: u32, _truncate: bool) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        let wide_name = to_wide(name);
        let h = unsafe {
            CreateSemaphoreW(
                ptr::null(),
                initial as i32,
                i32::MAX,
                wide_name.as_ptr(),
            )
        };
        if h.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            handle: h,
            name: name.to_string(),
        })
    }

    /// Wait up to `timeout_ms` for the count to become positive and take one.
    pub fn timed_wait(&self, timeout_ms: u64) -> io::Result<bool> {
        let ms = timeout_ms.min(u32::MAX as u64 - 1) as u32;
        match unsafe { WaitForSingleObject(self.handle, ms) } {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// Take one count without blocking.
    pub fn try_wait(&self) -> io::Result<bool> {
        self.timed_wait(0)
    }

    /// Increment the count, waking one blocked waiter if any.
    pub fn post(&self) -> io::Result<()> {
        if unsafe { ReleaseSemaphore(self.handle, 1, ptr::null_mut()) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// No-op on Windows — see `open`.
    pub fn unlink_by_name(_name: &str) {}

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PlatformSem {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

// ---------------------------------------------------------------------------
// FileLock — bootstrap lock over LockFileEx
// ---------------------------------------------------------------------------

/// Exclusive lock over the whole per-name lock file.
pub struct FileLock {
    file: std::fs::File,
}

impl FileLock {
    pub fn acquire(base: &str) -> io::Result<Self> {
        let path = shm_name::lock_file_path(base);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let mut ov: OVERLAPPED = unsafe { std::mem::zeroed() };
        let ok = unsafe {
            LockFileEx(
                file.as_raw_handle() as HANDLE,
                LOCKFILE_EXCLUSIVE_LOCK,
                0,
                u32::MAX,
                u32::MAX,
                &mut ov,
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { file })
    }

    /// Remove the lock file itself (last-detach teardown).
    pub fn remove(base: &str) {
        let _ = std::fs::remove_file(shm_name::lock_file_path(base));
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let mut ov: OVERLAPPED = unsafe { std::mem::zeroed() };
        unsafe {
            UnlockFileEx(
                self.file.as_raw_handle() as HANDLE,
                0,
                u32::MAX,
                u32::MAX,
                &mut ov,
            )
        };
    }
}
