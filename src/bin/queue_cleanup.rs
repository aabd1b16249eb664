// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage:
//   queue_cleanup <name> [<name> ...]
//
// Force-unlinks every OS object derived from each queue name: header and
// ring regions, mutex and data-availability semaphores, the nested write
// condition with its waiter slots, and the bootstrap lock file. For
// recovering from a crashed process; performs no liveness check, so make
// sure nothing is still using the names.

use shmq::ShmQueue;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: queue_cleanup <name> [<name> ...]");
        std::process::exit(1);
    }

    for name in &args[1..] {
        ShmQueue::clear_storage(name);
        println!("cleaned `{name}`");
    }
}
