// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process synchronization and messaging over shared memory.
// Named counting semaphores, a monitor-style condition variable built from a
// fixed pool of raw semaphores, and a bounded ring-buffer message queue —
// same object names, same POSIX/Win32 syscalls on both OS families.

pub mod shm_name;

mod platform;

pub mod interrupt;

mod abort;
pub use abort::AbortBroadcaster;

mod error;
pub use error::ResourceError;

mod segment;
pub use segment::ShmSegment;

mod semaphore;
pub use semaphore::{AcquireOutcome, IpcSemaphore};

mod condition;
pub use condition::{CondOutcome, IpcCondition};

mod queue;
pub use queue::{QueueConfig, QueueMode, ReadOutcome, ShmQueue};
