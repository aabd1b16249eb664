// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bounded ring-buffer message queue over a shared segment. Frames are
// length-prefixed and stored in slot-granular units of
// `buffer_size + FRAME_HEADER_SIZE` bytes, so a queue of `queue_size` slots
// holds exactly `queue_size` maximum-size frames and backpressure triggers
// per slot, not per byte. Writes and reads that straddle the end of the
// region are split into exactly two contiguous copies.

use std::ptr;
use std::sync::Arc;

use crate::abort::AbortBroadcaster;
use crate::condition::CondOutcome;
use crate::error::{fatal, ResourceError};
use crate::interrupt;
use crate::platform::{adaptive_yield, PlatformShm};
use crate::semaphore::AcquireOutcome;
use crate::shm_name;
use crate::{IpcCondition, IpcSemaphore, ShmSegment};

/// Bytes of the per-frame length prefix (native-endian `u32`).
pub const FRAME_HEADER_SIZE: usize = std::mem::size_of::<u32>();

/// Which directions this endpoint uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Read,
    Write,
    ReadWrite,
}

impl QueueMode {
    fn can_read(self) -> bool {
        matches!(self, QueueMode::Read | QueueMode::ReadWrite)
    }

    fn can_write(self) -> bool {
        matches!(self, QueueMode::Write | QueueMode::ReadWrite)
    }
}

/// Geometry and blocking behavior. Every process opening the same name must
/// pass the same values; the first opener's geometry is stored in the header
/// and later openers inherit it.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Number of maximum-size frames the ring holds.
    pub queue_size: u32,
    /// Maximum payload bytes of a single-slot frame.
    pub buffer_size: u32,
    /// Create the data-availability semaphore and block reads on it.
    pub blocking_read: bool,
    /// Create the write-backpressure condition variable; without it, full-
    /// queue writers poll with an adaptive yield.
    pub write_backpressure: bool,
}

/// Outcome of a read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One frame was copied into the output buffer.
    Frame,
    /// The queue was empty. With multiple consumers racing on the data
    /// semaphore this is a legitimate outcome, not an error.
    Empty,
    /// The wait was cancelled by external interruption.
    Signaled,
}

/// Ring bookkeeping, embedded at offset 0 of the `<name>_h` segment. The
/// subscriber count of the queue is the segment's own trailing counter.
#[repr(C)]
struct RingHeader {
    write_pos: u32,
    read_pos: u32,
    queue_size: u32,
    buffer_size: u32,
    capacity: u32,
    /// Bytes currently occupied — the single source of truth for free-space
    /// queries.
    size: u32,
}

struct WriteCondition {
    cond: IpcCondition,
    mutex: IpcSemaphore,
}

/// A named cross-process message queue.
///
/// Object names derived from base name `X`: header region `X_h`, ring
/// region `X_b`, mutex semaphore `X_allqs`, data-availability semaphore
/// `X_allqsc`, nested write condition `X_c_v` (slots `X_c_v_s_0..7`) with
/// paired mutex `X_cv_wc`.
pub struct ShmQueue {
    // Handles close in declaration order, before `seg` detaches and the
    // last-detach callback unlinks the derived names.
    data_sem: Option<IpcSemaphore>,
    write_cond: Option<WriteCondition>,
    buf: PlatformShm,
    seg: ShmSegment,
    mode: QueueMode,
    name: String,
    capacity: usize,
    stride: usize,
}

impl ShmQueue {
    /// Open (or create) the queue `name` and register as a subscriber.
    pub fn open(
        name: &str,
        mode: QueueMode,
        cfg: QueueConfig,
        abort: &Arc<AbortBroadcaster>,
    ) -> Result<Self, ResourceError> {
        if name.is_empty() {
            return Err(ResourceError::InvalidParameter {
                name: name.to_string(),
                reason: "queue name is empty",
            });
        }

        let sync_base = shm_name::queue_sync_base(name);
        let lock_name = shm_name::mutex_name(&sync_base);
        let seg = ShmSegment::open_with_lock(
            name,
            &lock_name,
            std::mem::size_of::<RingHeader>(),
            abort,
        )?;
        let first = seg.is_first_process();

        let hdr = seg.user_ptr() as *mut RingHeader;
        let (queue_size, buffer_size) = if first {
            if cfg.queue_size == 0 || cfg.buffer_size == 0 {
                return Err(ResourceError::InvalidParameter {
                    name: name.to_string(),
                    reason: "queue_size and buffer_size must be positive",
                });
            }
            (cfg.queue_size, cfg.buffer_size)
        } else {
            // The creator finished initialization before our bootstrap lock
            // was granted, so the header geometry is final.
            unsafe { ((*hdr).queue_size, (*hdr).buffer_size) }
        };
        if queue_size == 0 || buffer_size == 0 {
            fatal!("queue `{name}` header holds no geometry — storage is corrupt");
        }

        let stride = buffer_size as usize + FRAME_HEADER_SIZE;
        let capacity = queue_size as usize * stride;

        let buf_name = shm_name::buffer_name(name);
        let buf = PlatformShm::acquire(&buf_name, capacity).map_err(|source| {
            log::error!("failed to create shared memory region `{buf_name}`: {source}");
            ResourceError::CreateRegion {
                name: buf_name.clone(),
                source,
            }
        })?;

        let data_sem = if cfg.blocking_read {
            Some(IpcSemaphore::open(
                &shm_name::data_sem_name(&sync_base),
                0,
                first,
                abort,
            )?)
        } else {
            None
        };

        let write_cond = if cfg.write_backpressure {
            Some(WriteCondition {
                cond: IpcCondition::open(&shm_name::cond_base(name), abort)?,
                mutex: IpcSemaphore::open(
                    &shm_name::write_cond_mutex_name(name),
                    1,
                    first,
                    abort,
                )?,
            })
        } else {
            None
        };

        if first {
            unsafe {
                ptr::write(
                    hdr,
                    RingHeader {
                        write_pos: 0,
                        read_pos: 0,
                        queue_size,
                        buffer_size,
                        capacity: capacity as u32,
                        size: 0,
                    },
                );
            }
        }

        let name_owned = name.to_string();
        let sync_owned = sync_base.clone();
        seg.on_last_detach(move |_| {
            PlatformShm::unlink_by_name(&shm_name::buffer_name(&name_owned));
            IpcSemaphore::clear_storage(&shm_name::data_sem_name(&sync_owned));
            IpcSemaphore::clear_storage(&shm_name::write_cond_mutex_name(&name_owned));
        });

        seg.finish_initialization();

        log::debug!(
            "opened queue `{name}` ({queue_size} x {buffer_size} bytes, capacity {capacity}, \
             mode {mode:?})"
        );

        Ok(Self {
            data_sem,
            write_cond,
            buf,
            seg,
            mode,
            name: name.to_string(),
            capacity,
            stride,
        })
    }

    fn hdr(&self) -> *mut RingHeader {
        self.seg.user_ptr() as *mut RingHeader
    }

    /// Ring bytes one frame of `len` payload bytes occupies: its slot count
    /// times the slot stride.
    fn frame_bytes(&self, len: usize) -> usize {
        let slots = (len + FRAME_HEADER_SIZE + self.stride - 1) / self.stride;
        slots * self.stride
    }

    /// Whether a frame of `len` payload bytes would fit right now. Peeks
    /// only; the answer can be stale by the time a write runs.
    pub fn write_has_enough_space(&self, len: usize) -> bool {
        if !self.seg.lock() {
            return false;
        }
        let free = self.capacity - unsafe { (*self.hdr()).size as usize };
        self.seg.unlock();
        free >= self.frame_bytes(len)
    }

    /// Bytes currently free in the ring.
    pub fn free_space(&self) -> usize {
        if !self.seg.lock() {
            return 0;
        }
        let free = self.capacity - unsafe { (*self.hdr()).size as usize };
        self.seg.unlock();
        free
    }

    /// Append one frame. Returns `false` without writing when the wait was
    /// interrupted, or — for non-blocking calls — when the ring has no room.
    /// A frame is never partially written.
    pub fn write(&self, frame: &[u8], blocking: bool) -> bool {
        if !self.mode.can_write() {
            log::warn!("write on read-only queue `{}`", self.name);
            return false;
        }
        if frame.len() + FRAME_HEADER_SIZE > self.capacity {
            fatal!(
                "frame of {} bytes cannot ever fit queue `{}` (capacity {})",
                frame.len(),
                self.name,
                self.capacity
            );
        }
        let need = self.frame_bytes(frame.len());

        match &self.write_cond {
            Some(wc) => {
                if wc.mutex.blocking_acquire(false) != AcquireOutcome::Acquired {
                    return false;
                }
                if !self.seg.lock() {
                    wc.mutex.release();
                    return false;
                }
                while self.capacity - unsafe { (*self.hdr()).size as usize } < need {
                    if !blocking {
                        self.seg.unlock();
                        wc.mutex.release();
                        return false;
                    }
                    self.seg.unlock();
                    if wc.cond.wait(&wc.mutex) == CondOutcome::Signaled {
                        wc.mutex.release();
                        return false;
                    }
                    if !self.seg.lock() {
                        wc.mutex.release();
                        return false;
                    }
                }
                unsafe { self.push_frame_locked(frame) };
                self.seg.unlock();
                wc.mutex.release();
            }
            None => {
                // Poll with adaptive backoff. Less efficient, but immune to
                // lost wakeups; chosen by writers that tolerate spinning.
                let mut k = 0u32;
                loop {
                    if !self.seg.lock() {
                        return false;
                    }
                    if self.capacity - unsafe { (*self.hdr()).size as usize } >= need {
                        break;
                    }
                    self.seg.unlock();
                    if !blocking || interrupt::interrupted() {
                        return false;
                    }
                    adaptive_yield(&mut k);
                }
                unsafe { self.push_frame_locked(frame) };
                self.seg.unlock();
            }
        }

        // One release per frame, so blocking readers wake exactly once each.
        if let Some(ds) = &self.data_sem {
            ds.release();
        }
        true
    }

    /// Take the oldest frame into `out` (resized to the payload length).
    pub fn read(&self, out: &mut Vec<u8>) -> ReadOutcome {
        if !self.mode.can_read() {
            log::warn!("read on write-only queue `{}`", self.name);
            return ReadOutcome::Empty;
        }

        if let Some(ds) = &self.data_sem {
            if ds.blocking_acquire(false) != AcquireOutcome::Acquired {
                return ReadOutcome::Signaled;
            }
        }

        if !self.seg.lock() {
            return ReadOutcome::Signaled;
        }
        let got = unsafe {
            if (*self.hdr()).size == 0 {
                false
            } else {
                self.pop_frame_locked(out);
                true
            }
        };
        self.seg.unlock();

        if !got {
            return ReadOutcome::Empty;
        }
        if let Some(wc) = &self.write_cond {
            wc.cond.notify_all();
        }
        ReadOutcome::Frame
    }

    unsafe fn push_frame_locked(&self, frame: &[u8]) {
        let hdr = &mut *self.hdr();
        let pos = self.ring_put(
            hdr.write_pos as usize,
            &(frame.len() as u32).to_ne_bytes(),
        );
        self.ring_put(pos, frame);
        let consumed = self.frame_bytes(frame.len());
        hdr.write_pos = ((hdr.write_pos as usize + consumed) % self.capacity) as u32;
        hdr.size += consumed as u32;
    }

    unsafe fn pop_frame_locked(&self, out: &mut Vec<u8>) {
        let hdr = &mut *self.hdr();
        let mut len_bytes = [0u8; FRAME_HEADER_SIZE];
        let pos = self.ring_get(hdr.read_pos as usize, &mut len_bytes);
        let len = u32::from_ne_bytes(len_bytes) as usize;
        out.resize(len, 0);
        if len > 0 {
            self.ring_get(pos, out.as_mut_slice());
        }
        let consumed = self.frame_bytes(len);
        hdr.read_pos = ((hdr.read_pos as usize + consumed) % self.capacity) as u32;
        hdr.size -= consumed as u32;
    }

    /// Copy `src` into the ring at `pos`, splitting once at the wrap point.
    /// Returns the position after the copy.
    unsafe fn ring_put(&self, pos: usize, src: &[u8]) -> usize {
        let ring = self.buf.as_mut_ptr();
        let first = src.len().min(self.capacity - pos);
        ptr::copy_nonoverlapping(src.as_ptr(), ring.add(pos), first);
        if first < src.len() {
            ptr::copy_nonoverlapping(src.as_ptr().add(first), ring, src.len() - first);
        }
        (pos + src.len()) % self.capacity
    }

    /// Copy out of the ring at `pos` into `dst`, splitting once at the wrap
    /// point. Returns the position after the copy.
    unsafe fn ring_get(&self, pos: usize, dst: &mut [u8]) -> usize {
        let ring = self.buf.as_ptr();
        let first = dst.len().min(self.capacity - pos);
        ptr::copy_nonoverlapping(ring.add(pos), dst.as_mut_ptr(), first);
        if first < dst.len() {
            ptr::copy_nonoverlapping(ring, dst.as_mut_ptr().add(first), dst.len() - first);
        }
        (pos + dst.len()) % self.capacity
    }

    /// Total ring capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> u32 {
        self.seg.subscriber_count()
    }

    /// The base name this queue was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Force-unlink every OS object derived from the queue name. For
    /// recovering from a crashed process; no liveness check.
    pub fn clear_storage(name: &str) {
        let sync_base = shm_name::queue_sync_base(name);
        ShmSegment::clear_storage_with_lock(name, &shm_name::mutex_name(&sync_base));
        PlatformShm::unlink_by_name(&shm_name::buffer_name(name));
        IpcSemaphore::clear_storage(&shm_name::data_sem_name(&sync_base));
        IpcCondition::clear_storage(&shm_name::cond_base(name));
        IpcSemaphore::clear_storage(&shm_name::write_cond_mutex_name(name));
    }
}
