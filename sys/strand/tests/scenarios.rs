// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios, run against the hosted kernel backend.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use strand::error::ErrorCode;
use strand::future;
use strand::signal;
use strand::sync::{Latch, TimedMutex};
use strand::thread::{self, Attributes};
use strand::time::{HighResClock, Instant, SystemClock};
use strand::twq::WaitQueue;
use strand::{Error, Priority};

fn enable_heap_stacks() {
    thread::set_stack_allocation_enabled(true);
    thread::set_default_stack_size(4096);
}

#[test]
fn s1_priority_handover() {
    enable_heap_stacks();

    let q = Arc::new(WaitQueue::new());
    let order = Arc::new(StdMutex::new(Vec::new()));
    let enrolled = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for prio in [Priority::LOW, Priority::NORMAL, Priority::HIGH] {
        let q = Arc::clone(&q);
        let order = Arc::clone(&order);
        let enrolled = Arc::clone(&enrolled);
        workers.push(
            thread::spawn(Attributes::new().priority(prio), move || {
                q.with_waiter(|w| {
                    enrolled.fetch_add(1, Ordering::SeqCst);
                    w.wait();
                    order.lock().unwrap().push(prio);
                })
                .unwrap();
            })
            .unwrap(),
        );
    }

    while enrolled.load(Ordering::SeqCst) < 3 {
        std::thread::yield_now();
    }

    // Each notification wakes the highest-priority waiter still enrolled;
    // the pause lets the woken thread record itself before the next round.
    for _ in 0..3 {
        q.notify_one();
        std::thread::sleep(Duration::from_millis(50));
    }

    for mut w in workers {
        w.join().unwrap();
    }
    assert_eq!(
        *order.lock().unwrap(),
        vec![Priority::HIGH, Priority::NORMAL, Priority::LOW]
    );
}

#[test]
fn twq_is_fifo_within_one_priority() {
    enable_heap_stacks();

    let q = Arc::new(WaitQueue::new());
    let order = Arc::new(StdMutex::new(Vec::new()));
    let enrolled = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for tag in [1u32, 2] {
        let q = Arc::clone(&q);
        let order = Arc::clone(&order);
        let enrolled_for_worker = Arc::clone(&enrolled);
        workers.push(
            thread::spawn(Attributes::new(), move || {
                q.with_waiter(|w| {
                    enrolled_for_worker.fetch_add(1, Ordering::SeqCst);
                    w.wait();
                    order.lock().unwrap().push(tag);
                })
                .unwrap();
            })
            .unwrap(),
        );
        // Make the enroll order deterministic.
        let target = tag as usize;
        while enrolled.load(Ordering::SeqCst) < target {
            std::thread::yield_now();
        }
    }

    for _ in 0..2 {
        q.notify_one();
        std::thread::sleep(Duration::from_millis(50));
    }
    for mut w in workers {
        w.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
}

#[test]
fn s2_signal_ping_pong() {
    enable_heap_stacks();

    const ROUNDS: usize = 1000;
    let main_id = rtos::task_current();

    let mut worker = thread::spawn(Attributes::new().name("pong"), move || {
        for _ in 0..ROUNDS {
            signal::wait_for_all_signals(0x0001).unwrap();
            rtos::signal_set(main_id, 0x0002);
        }
    })
    .unwrap();

    let started = std::time::Instant::now();
    for _ in 0..ROUNDS {
        worker.set_signals(0x0001).unwrap();
        signal::wait_for_all_signals(0x0002).unwrap();
    }
    worker.join().unwrap();

    // Generous bound; the exchange itself is the property under test.
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn s3_latch_of_three() {
    enable_heap_stacks();

    let latch = Arc::new(Latch::new(3));
    let mut workers = Vec::new();
    for _ in 0..3 {
        let latch = Arc::clone(&latch);
        workers.push(
            thread::spawn(Attributes::new(), move || {
                latch.count_down_and_wait().unwrap();
            })
            .unwrap(),
        );
    }

    latch.wait().unwrap();
    assert!(latch.is_ready());
    for mut w in workers {
        w.join().unwrap();
    }
}

#[test]
fn s4_async_square() {
    enable_heap_stacks();

    let f = future::spawn(Attributes::new(), || Ok(7 * 7)).unwrap();
    assert_eq!(f.get().unwrap(), 49);

    let f = future::spawn::<u32, _>(Attributes::new(), || {
        Err(Error::new(ErrorCode::InvalidArgument))
    })
    .unwrap();
    assert_eq!(f.get().unwrap_err(), ErrorCode::InvalidArgument);
}

#[test]
fn s5_timed_mutex_timeout() {
    enable_heap_stacks();

    let m = Arc::new(TimedMutex::new(()));
    let guard = m.lock().unwrap();

    let contender = {
        let m = Arc::clone(&m);
        std::thread::spawn(move || {
            let before = Instant::now();
            let got = m.try_lock_for(Duration::from_millis(100)).unwrap();
            let waited = before.elapsed();
            assert!(got.is_none());
            assert!(waited >= Duration::from_millis(100), "waited {:?}", waited);
            assert!(waited < Duration::from_millis(400), "waited {:?}", waited);

            // Once the holder lets go, the lock is obtainable again.
            let got = m.try_lock_for(Duration::from_millis(1000)).unwrap();
            assert!(got.is_some());
        })
    };

    std::thread::sleep(Duration::from_millis(250));
    drop(guard);
    contender.join().unwrap();
}

#[test]
fn p4_clock_is_monotonic_across_threads() {
    let mut samplers = Vec::new();
    for _ in 0..4 {
        samplers.push(std::thread::spawn(|| {
            let mut prev = HighResClock::now();
            for _ in 0..20_000 {
                let next = HighResClock::now();
                assert!(next >= prev);
                prev = next;
            }
        }));
    }
    for s in samplers {
        s.join().unwrap();
    }
}

#[test]
fn p5_clock_tracks_wall_time() {
    let wall = std::time::Instant::now();
    let a = HighResClock::now();
    std::thread::sleep(Duration::from_secs(1));
    let b = HighResClock::now();
    let wall_secs = wall.elapsed().as_secs_f64();

    let measured = (b - a) as f64 / HighResClock::FREQUENCY as f64;
    let ratio = measured / wall_secs;
    assert!((0.99..=1.01).contains(&ratio), "ratio {}", ratio);

    // The coarse clock advanced consistently too.
    let t = SystemClock::now();
    assert!(t.ticks() > 0);
}

#[test]
fn p8_thread_lifecycle_rules() {
    enable_heap_stacks();

    // join() returns only after the task function has returned.
    let done = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&done);
    let mut t = thread::spawn(Attributes::new(), move || {
        std::thread::sleep(Duration::from_millis(50));
        flag.store(1, Ordering::SeqCst);
    })
    .unwrap();
    t.join().unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 1);

    // Dropping a joinable handle is fatal.
    let t = thread::spawn(Attributes::new(), || {}).unwrap();
    let panicked = std::panic::catch_unwind(AssertUnwindSafe(move || drop(t)));
    assert!(panicked.is_err());
}

#[test]
fn isr_context_can_enumerate_threads() {
    enable_heap_stacks();

    let hold = Arc::new(AtomicUsize::new(1));
    let held = Arc::clone(&hold);
    let mut t = thread::spawn(Attributes::new().name("enumerated"), move || {
        while held.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
    })
    .unwrap();

    let mut seen = false;
    rtos::hosted::with_interrupt_context(|| {
        thread::for_each_thread(|info| {
            if info.name() == "enumerated" {
                seen = true;
                false
            } else {
                true
            }
        });
    });
    assert!(seen);

    hold.store(0, Ordering::SeqCst);
    t.join().unwrap();
}
