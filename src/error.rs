// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy for resource construction plus the fatal-misuse path.
// Construction failures carry the OS error; misuse (capacity exceeded,
// double initialization, waiter-slot exhaustion) aborts the process.

use std::io;

use thiserror::Error;

/// Failure to create or attach a named OS resource.
///
/// These are construction-time errors only. Once a primitive is open, its
/// operations report outcomes by value (`AcquireOutcome`, `ReadOutcome`, …)
/// or abort on programmer misuse — they never return `ResourceError`.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("invalid parameter for `{name}`: {reason}")]
    InvalidParameter { name: String, reason: &'static str },

    #[error("failed to create shared memory region `{name}`: {source}")]
    CreateRegion {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to create named semaphore `{name}`: {source}")]
    CreateSemaphore {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to acquire bootstrap lock for `{name}`: {source}")]
    BootstrapLock {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Abort the process after logging. Used for the fatal-misuse error class:
/// configuration and programming errors with no safe recovery.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::abort()
    }};
}

pub(crate) use fatal;
