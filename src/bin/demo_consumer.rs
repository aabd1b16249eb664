// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage:
//   demo_consumer <name>
//
// Opens (or creates) the queue <name> and prints every frame it reads,
// blocking on the data-availability semaphore while the queue is empty.
// Ctrl-C interrupts the blocked read through the interruption flag and the
// consumer exits cleanly.

use shmq::{interrupt, AbortBroadcaster, QueueConfig, QueueMode, ReadOutcome, ShmQueue};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: demo_consumer <name>");
        std::process::exit(1);
    }
    let name = &args[1];

    install_interrupt_hook(interrupt::handle());

    let abort = AbortBroadcaster::new();
    let queue = ShmQueue::open(
        name,
        QueueMode::Read,
        QueueConfig {
            queue_size: 16,
            buffer_size: 4096,
            blocking_read: true,
            write_backpressure: true,
        },
        &abort,
    )
    .expect("open queue");

    println!("consumer: queue `{name}` open, waiting for frames");

    let mut frame = Vec::new();
    let mut received = 0u64;
    loop {
        match queue.read(&mut frame) {
            ReadOutcome::Frame => {
                received += 1;
                println!("consumer: frame {received}: {} byte(s)", frame.len());
            }
            ReadOutcome::Empty => continue,
            ReadOutcome::Signaled => {
                println!("consumer: interrupted after {received} frame(s)");
                break;
            }
        }
    }
}

/// Route SIGINT/SIGTERM to the main thread's interruption flag so a blocked
/// read returns Signaled instead of dying mid-wait.
fn install_interrupt_hook(handle: interrupt::InterruptHandle) {
    #[cfg(unix)]
    {
        use std::sync::{Mutex, OnceLock};
        static HOOK: OnceLock<Mutex<interrupt::InterruptHandle>> = OnceLock::new();
        HOOK.get_or_init(|| Mutex::new(handle));
        extern "C" fn handler(_: libc::c_int) {
            if let Some(hook) = HOOK.get() {
                if let Ok(h) = hook.lock() {
                    h.interrupt();
                }
            }
        }
        unsafe {
            libc::signal(libc::SIGINT, handler as *const () as libc::sighandler_t);
            libc::signal(libc::SIGTERM, handler as *const () as libc::sighandler_t);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = handle;
    }
}

#[cfg(unix)]
extern crate libc;
