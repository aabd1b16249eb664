// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage:
//   demo_producer <name> <count> <size> [interval_ms]
//
// Opens (or creates) the queue <name> and writes <count> frames of <size>
// bytes, blocking on backpressure when the consumer falls behind. Run
// demo_consumer in another terminal with the same name.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shmq::{AbortBroadcaster, QueueConfig, QueueMode, ShmQueue};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!("usage: demo_producer <name> <count> <size> [interval_ms]");
        std::process::exit(1);
    }
    let name = &args[1];
    let count: u64 = args[2].parse().expect("count");
    let size: usize = args[3].parse().expect("size");
    let interval: u64 = args.get(4).map(|s| s.parse().expect("interval")).unwrap_or(0);

    let abort = AbortBroadcaster::new();
    install_abort_hook(Arc::clone(&abort));

    let queue = ShmQueue::open(
        name,
        QueueMode::Write,
        QueueConfig {
            queue_size: 16,
            buffer_size: 4096,
            blocking_read: true,
            write_backpressure: true,
        },
        &abort,
    )
    .expect("open queue");

    println!("producer: queue `{name}` open, sending {count} frame(s) of {size} byte(s)");

    let mut frame = vec![0u8; size];
    for i in 0..count {
        frame.fill((i % 256) as u8);
        if !queue.write(&frame, true) {
            println!("producer: write interrupted, stopping");
            break;
        }
        println!("producer: sent frame {i}");
        if interval > 0 {
            thread::sleep(Duration::from_millis(interval));
        }
    }

    println!("producer: done");
}

/// Run the abort broadcast on SIGINT/SIGTERM so held semaphore acquisitions
/// are released before the process dies.
fn install_abort_hook(abort: Arc<AbortBroadcaster>) {
    #[cfg(unix)]
    {
        use std::sync::{Mutex, OnceLock};
        static HOOK: OnceLock<Mutex<Arc<AbortBroadcaster>>> = OnceLock::new();
        HOOK.get_or_init(|| Mutex::new(abort));
        extern "C" fn handler(_: libc::c_int) {
            if let Some(hook) = HOOK.get() {
                if let Ok(ab) = hook.lock() {
                    ab.fire();
                }
            }
            std::process::exit(1);
        }
        unsafe {
            libc::signal(libc::SIGINT, handler as *const () as libc::sighandler_t);
            libc::signal(libc::SIGTERM, handler as *const () as libc::sighandler_t);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = abort;
    }
}

#[cfg(unix)]
extern crate libc;
