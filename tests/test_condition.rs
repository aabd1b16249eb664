// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process condition variable: wait/notify over the waiter-slot pool,
// FIFO notify order, timeouts, interruption, and the no-lost-wakeup
// guarantee.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use shmq::{
    interrupt, AbortBroadcaster, AcquireOutcome, CondOutcome, IpcCondition, IpcSemaphore,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("shmq_{prefix}_cv_{}_{n}", std::process::id())
}

struct Fixture {
    cond: Arc<IpcCondition>,
    mtx: Arc<IpcSemaphore>,
    cond_name: String,
    mtx_name: String,
}

fn fixture(prefix: &str, abort: &Arc<AbortBroadcaster>) -> Fixture {
    let cond_name = unique_name(prefix);
    let mtx_name = format!("{cond_name}_mtx");
    IpcCondition::clear_storage(&cond_name);
    IpcSemaphore::clear_storage(&mtx_name);

    Fixture {
        cond: Arc::new(IpcCondition::open(&cond_name, abort).expect("open condition")),
        mtx: Arc::new(IpcSemaphore::open(&mtx_name, 1, true, abort).expect("open mutex")),
        cond_name,
        mtx_name,
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        IpcCondition::clear_storage(&self.cond_name);
        IpcSemaphore::clear_storage(&self.mtx_name);
    }
}

#[test]
fn notify_wakes_single_waiter() {
    let abort = AbortBroadcaster::new();
    let fx = fixture("single", &abort);

    let cond = Arc::clone(&fx.cond);
    let mtx = Arc::clone(&fx.mtx);
    let waiter = thread::spawn(move || {
        assert_eq!(mtx.blocking_acquire(false), AcquireOutcome::Acquired);
        let outcome = cond.wait(&mtx);
        mtx.release();
        outcome
    });

    thread::sleep(Duration::from_millis(50));
    fx.cond.notify();

    assert_eq!(waiter.join().unwrap(), CondOutcome::Notified);
}

#[test]
fn notify_without_waiter_is_not_stored() {
    let abort = AbortBroadcaster::new();
    let fx = fixture("unstored", &abort);

    // no waiter registered — this must not leave a wakeup behind
    fx.cond.notify();

    assert_eq!(fx.mtx.blocking_acquire(false), AcquireOutcome::Acquired);
    let outcome = fx.cond.wait_for(&fx.mtx, 100);
    fx.mtx.release();
    assert_eq!(outcome, CondOutcome::TimedOut);
}

#[test]
fn wait_for_times_out() {
    let abort = AbortBroadcaster::new();
    let fx = fixture("timeout", &abort);

    assert_eq!(fx.mtx.blocking_acquire(false), AcquireOutcome::Acquired);
    let start = Instant::now();
    let outcome = fx.cond.wait_for(&fx.mtx, 100);
    fx.mtx.release();

    assert_eq!(outcome, CondOutcome::TimedOut);
    assert!(
        start.elapsed().as_millis() >= 80,
        "should have waited ~100ms, got {}ms",
        start.elapsed().as_millis()
    );
}

#[test]
fn notify_all_wakes_every_waiter() {
    let abort = AbortBroadcaster::new();
    let fx = fixture("broadcast", &abort);
    let num_waiters = 5;
    let woken = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..num_waiters)
        .map(|_| {
            let cond = Arc::clone(&fx.cond);
            let mtx = Arc::clone(&fx.mtx);
            let woken = Arc::clone(&woken);
            thread::spawn(move || {
                assert_eq!(mtx.blocking_acquire(false), AcquireOutcome::Acquired);
                let outcome = cond.wait(&mtx);
                mtx.release();
                assert_eq!(outcome, CondOutcome::Notified);
                woken.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(150));
    fx.cond.notify_all();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), num_waiters);
}

// The full slot pool: 8 concurrent waiters register and are all released.
#[test]
fn eight_waiters_fill_the_slot_pool() {
    let abort = AbortBroadcaster::new();
    let fx = fixture("full_pool", &abort);
    let woken = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cond = Arc::clone(&fx.cond);
            let mtx = Arc::clone(&fx.mtx);
            let woken = Arc::clone(&woken);
            thread::spawn(move || {
                assert_eq!(mtx.blocking_acquire(false), AcquireOutcome::Acquired);
                let outcome = cond.wait(&mtx);
                mtx.release();
                assert_eq!(outcome, CondOutcome::Notified);
                woken.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(200));
    fx.cond.notify_all();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 8);
}

// notify() releases the oldest-registered waiter first.
#[test]
fn notify_order_is_fifo() {
    let abort = AbortBroadcaster::new();
    let fx = fixture("fifo", &abort);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for id in 0..3 {
        let cond = Arc::clone(&fx.cond);
        let mtx = Arc::clone(&fx.mtx);
        let order = Arc::clone(&order);
        handles.push(thread::spawn(move || {
            assert_eq!(mtx.blocking_acquire(false), AcquireOutcome::Acquired);
            let outcome = cond.wait(&mtx);
            mtx.release();
            assert_eq!(outcome, CondOutcome::Notified);
            order.lock().unwrap().push(id);
        }));
        // registration order must be deterministic for the assertion
        thread::sleep(Duration::from_millis(100));
    }

    for _ in 0..3 {
        fx.cond.notify();
        thread::sleep(Duration::from_millis(100));
    }

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

// Interruption cancels a wait; the notify that never matched it is not lost
// for later waiters, and no phantom wakeup remains either.
#[test]
fn interrupted_wait_is_signaled() {
    let abort = AbortBroadcaster::new();
    let fx = fixture("signaled", &abort);

    let (tx, rx) = mpsc::channel();
    let cond = Arc::clone(&fx.cond);
    let mtx = Arc::clone(&fx.mtx);
    let waiter = thread::spawn(move || {
        tx.send(interrupt::handle()).unwrap();
        assert_eq!(mtx.blocking_acquire(false), AcquireOutcome::Acquired);
        let outcome = cond.wait(&mtx);
        mtx.release();
        outcome
    });

    let handle = rx.recv().unwrap();
    thread::sleep(Duration::from_millis(100));
    handle.interrupt();

    assert_eq!(waiter.join().unwrap(), CondOutcome::Signaled);

    // the cancelled waiter deregistered itself: a notify now has nobody to
    // wake and must not leave state behind
    fx.cond.notify();
    assert_eq!(fx.mtx.blocking_acquire(false), AcquireOutcome::Acquired);
    let outcome = fx.cond.wait_for(&fx.mtx, 100);
    fx.mtx.release();
    assert_eq!(outcome, CondOutcome::TimedOut);
}

// A notify issued while the waiter is timing out still counts as Notified —
// the wake is consumed, not lost.
#[test]
fn notify_beats_timeout_bookkeeping() {
    let abort = AbortBroadcaster::new();
    let fx = fixture("race", &abort);

    let cond = Arc::clone(&fx.cond);
    let mtx = Arc::clone(&fx.mtx);
    let waiter = thread::spawn(move || {
        assert_eq!(mtx.blocking_acquire(false), AcquireOutcome::Acquired);
        let outcome = cond.wait_for(&mtx, 10_000);
        mtx.release();
        outcome
    });

    thread::sleep(Duration::from_millis(100));
    fx.cond.notify();

    assert_eq!(waiter.join().unwrap(), CondOutcome::Notified);
}

// One notify per registered waiter: the number of Notified outcomes equals
// the number of notify() calls.
#[test]
fn wakeups_match_notifies() {
    let abort = AbortBroadcaster::new();
    let fx = fixture("count", &abort);
    let num_waiters = 4;
    let notified = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..num_waiters)
        .map(|_| {
            let cond = Arc::clone(&fx.cond);
            let mtx = Arc::clone(&fx.mtx);
            let notified = Arc::clone(&notified);
            thread::spawn(move || {
                assert_eq!(mtx.blocking_acquire(false), AcquireOutcome::Acquired);
                let outcome = cond.wait(&mtx);
                mtx.release();
                if outcome == CondOutcome::Notified {
                    notified.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(150));
    for _ in 0..num_waiters {
        fx.cond.notify();
        thread::sleep(Duration::from_millis(50));
    }

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(notified.load(Ordering::SeqCst), num_waiters);
}

// Producer/consumer over a shared predicate guarded by the external mutex.
#[test]
fn producer_consumer_predicate() {
    let abort = AbortBroadcaster::new();
    let fx = fixture("predicate", &abort);
    let value = Arc::new(AtomicUsize::new(0));

    let cond = Arc::clone(&fx.cond);
    let mtx = Arc::clone(&fx.mtx);
    let val = Arc::clone(&value);
    let consumer = thread::spawn(move || {
        assert_eq!(mtx.blocking_acquire(false), AcquireOutcome::Acquired);
        while val.load(Ordering::SeqCst) == 0 {
            assert_eq!(cond.wait(&mtx), CondOutcome::Notified);
        }
        let seen = val.load(Ordering::SeqCst);
        mtx.release();
        seen
    });

    thread::sleep(Duration::from_millis(50));
    assert_eq!(fx.mtx.blocking_acquire(false), AcquireOutcome::Acquired);
    value.store(42, Ordering::SeqCst);
    fx.cond.notify();
    fx.mtx.release();

    assert_eq!(consumer.join().unwrap(), 42);
}
