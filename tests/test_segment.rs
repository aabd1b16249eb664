// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared segment: first-process bootstrap, subscriber refcounting, locked
// access to the user region, last-detach teardown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use shmq::{AbortBroadcaster, ShmSegment};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("shmq_{prefix}_seg_{}_{n}", std::process::id())
}

#[test]
fn invalid_parameters_fail() {
    let abort = AbortBroadcaster::new();
    assert!(ShmSegment::open("", 64, &abort).is_err());
    assert!(ShmSegment::open("shmq_zero_size", 0, &abort).is_err());
}

#[test]
fn first_then_attach() {
    let abort = AbortBroadcaster::new();
    let name = unique_name("attach");
    ShmSegment::clear_storage(&name);

    let s1 = ShmSegment::open(&name, 64, &abort).expect("open first");
    assert!(s1.is_first_process());
    s1.finish_initialization();
    assert_eq!(s1.subscriber_count(), 1);

    let s2 = ShmSegment::open(&name, 64, &abort).expect("open second");
    assert!(!s2.is_first_process());
    s2.finish_initialization();
    assert_eq!(s1.subscriber_count(), 2);
    assert_eq!(s2.subscriber_count(), 2);

    drop(s2);
    assert_eq!(s1.subscriber_count(), 1);
}

#[test]
fn refcount_matches_opens_minus_closes() {
    let abort = AbortBroadcaster::new();
    let name = unique_name("refcount");
    ShmSegment::clear_storage(&name);

    let mut handles = Vec::new();
    for i in 0..5 {
        let s = ShmSegment::open(&name, 32, &abort).expect("open");
        s.finish_initialization();
        assert_eq!(s.is_first_process(), i == 0);
        handles.push(s);
    }
    assert_eq!(handles[0].subscriber_count(), 5);

    handles.truncate(2);
    assert_eq!(handles[0].subscriber_count(), 2);
}

#[test]
fn user_region_is_shared() {
    let abort = AbortBroadcaster::new();
    let name = unique_name("shared");
    ShmSegment::clear_storage(&name);

    let s1 = ShmSegment::open(&name, 128, &abort).expect("open 1");
    s1.finish_initialization();
    let s2 = ShmSegment::open(&name, 128, &abort).expect("open 2");
    s2.finish_initialization();

    assert!(s1.lock());
    unsafe {
        std::ptr::copy_nonoverlapping(b"segment payload".as_ptr(), s1.user_ptr(), 15);
    }
    s1.unlock();

    assert!(s2.lock());
    let read_back = unsafe { std::slice::from_raw_parts(s2.user_ptr(), 15) };
    assert_eq!(read_back, b"segment payload");
    s2.unlock();
}

#[test]
fn lock_provides_mutual_exclusion() {
    let abort = AbortBroadcaster::new();
    let name = unique_name("mutex");
    ShmSegment::clear_storage(&name);

    let seg = Arc::new(ShmSegment::open(&name, 8, &abort).expect("open"));
    seg.finish_initialization();
    unsafe { std::ptr::write(seg.user_ptr() as *mut u64, 0) };

    let rounds = 200;
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let seg = Arc::clone(&seg);
            thread::spawn(move || {
                for _ in 0..rounds {
                    assert!(seg.lock());
                    unsafe {
                        let p = seg.user_ptr() as *mut u64;
                        // non-atomic read-modify-write, safe only under the lock
                        std::ptr::write(p, std::ptr::read(p) + 1);
                    }
                    seg.unlock();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert!(seg.lock());
    let total = unsafe { std::ptr::read(seg.user_ptr() as *const u64) };
    seg.unlock();
    assert_eq!(total, 4 * rounds);
}

// Two "processes" race to create the same name: exactly one wins the
// bootstrap, and the attacher observes the initializer's header contents.
#[test]
fn concurrent_open_elects_one_initializer() {
    let abort = AbortBroadcaster::new();
    let name = unique_name("race");
    ShmSegment::clear_storage(&name);

    let barrier = Arc::new(Barrier::new(2));
    let threads: Vec<_> = (0..2)
        .map(|_| {
            let abort = Arc::clone(&abort);
            let name = name.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let seg = ShmSegment::open(&name, 64, &abort).expect("open");
                let first = seg.is_first_process();
                if first {
                    unsafe { std::ptr::write(seg.user_ptr(), 0xab) };
                }
                seg.finish_initialization();
                // visible to both: the initializer wrote it before releasing
                // the bootstrap lock
                let marker = unsafe { std::ptr::read(seg.user_ptr()) };
                // keep the segment alive until both threads checked
                (first, marker, seg)
            })
        })
        .collect();

    let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    let firsts = results.iter().filter(|(first, _, _)| *first).count();
    assert_eq!(firsts, 1, "exactly one process may create the segment");
    for (_, marker, _) in &results {
        assert_eq!(*marker, 0xab);
    }
}

#[test]
fn last_detach_event_fires_once() {
    let abort = AbortBroadcaster::new();
    let name = unique_name("detach");
    ShmSegment::clear_storage(&name);

    let fired = Arc::new(AtomicUsize::new(0));

    let s1 = ShmSegment::open(&name, 16, &abort).expect("open 1");
    s1.finish_initialization();
    let s2 = ShmSegment::open(&name, 16, &abort).expect("open 2");
    s2.finish_initialization();

    let f = Arc::clone(&fired);
    s1.on_last_detach(move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    });
    let f = Arc::clone(&fired);
    s2.on_last_detach(move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    });

    drop(s2);
    assert_eq!(fired.load(Ordering::SeqCst), 0, "not the last detach yet");

    drop(s1);
    assert_eq!(fired.load(Ordering::SeqCst), 1, "only the last detacher fires");
}

#[test]
fn reopen_after_last_detach_is_first_again() {
    let abort = AbortBroadcaster::new();
    let name = unique_name("reopen");
    ShmSegment::clear_storage(&name);

    {
        let s = ShmSegment::open(&name, 16, &abort).expect("open");
        assert!(s.is_first_process());
        s.finish_initialization();
    }

    // everything was unlinked; a new open bootstraps from scratch
    let s = ShmSegment::open(&name, 16, &abort).expect("reopen");
    assert!(s.is_first_process());
    s.finish_initialization();
}

#[test]
fn detach_callback_sees_torn_down_segment() {
    let abort = AbortBroadcaster::new();
    let name = unique_name("torn");
    ShmSegment::clear_storage(&name);

    let observed = Arc::new(AtomicBool::new(false));
    let s = ShmSegment::open(&name, 16, &abort).expect("open");
    s.finish_initialization();

    let obs = Arc::clone(&observed);
    s.on_last_detach(move |seg| {
        // lock() on a torn-down instance is a no-op returning false
        obs.store(!seg.lock(), Ordering::SeqCst);
    });
    drop(s);

    assert!(observed.load(Ordering::SeqCst));
}
