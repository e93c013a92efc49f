// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Handoff between a realtime role and background roles: retry on a
// re-taken lock, racing waiters, mutual exclusion and no lost wake-ups.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use libhandoff::{Handoff, HandoffStep, ImageConfig, SharedMemory};

fn handoff() -> (SharedMemory, Handoff) {
    let mem = SharedMemory::new(ImageConfig {
        signal_slots: 8,
        user_bytes: 64,
    })
    .expect("image");
    let handoff = Handoff::allocate(&mem).expect("handoff");
    (mem, handoff)
}

// Free lock: the background side enters straight away.
#[test]
fn uncontended_background_entry() {
    let (_mem, h) = handoff();
    let guard = h.enter_background();
    assert_eq!(guard.retries(), 0);
    assert_eq!(h.waiters(), 1);
    drop(guard);
    assert_eq!(h.waiters(), 0);
}

// Rebuilding from indices addresses the same cells.
#[test]
fn from_indices_shares_cells() {
    let (mem, h) = handoff();
    let other = Handoff::from_indices(&mem, h.indices());
    h.reserve();
    assert!(other.is_held());
    other.release();
    assert!(!h.is_held());
}

// The handoff's cells go back to the image with its last clone.
#[test]
fn dropping_handoff_frees_cells() {
    let (mem, h) = handoff();
    assert_eq!(mem.free_signals(), 6);
    let clone = h.clone();
    drop(h);
    assert_eq!(mem.free_signals(), 6);
    drop(clone);
    assert_eq!(mem.free_signals(), 8);
}

// The lock is re-taken between the background wait and its registration:
// the worker retracts, retries, and the counter is back at 0 afterwards.
#[test]
fn background_retries_when_lock_retaken() {
    let (_mem, h) = handoff();
    h.reserve();

    let worker = {
        let h = h.clone();
        thread::spawn(move || {
            let mut first = true;
            let mut steps = Vec::new();
            let guard = h.enter_background_with(|step| {
                if step == HandoffStep::Waited && first {
                    first = false;
                    // Realtime side grabs the lock again right here.
                    h.reserve();
                    let h = h.clone();
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(30));
                        h.release();
                    });
                }
                steps.push(step);
            });
            let retries = guard.retries();
            drop(guard);
            (retries, steps)
        })
    };

    thread::sleep(Duration::from_millis(30));
    h.release();

    let (retries, steps) = worker.join().unwrap();
    assert!(retries >= 1, "expected at least one retry, got {retries}");
    assert!(steps.contains(&HandoffStep::Retracted));
    assert_eq!(steps.last(), Some(&HandoffStep::Entered));
    assert_eq!(h.waiters(), 0);
    assert!(!h.is_held());
}

// Two workers race to register while the lock flips 1 -> 0 between their wait
// and add; neither stays blocked.
#[test]
fn racing_waiters_both_enter() {
    let (_mem, h) = handoff();
    h.reserve();
    let entered = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    for _ in 0..2 {
        let h = h.clone();
        let entered = entered.clone();
        let tx = tx.clone();
        thread::spawn(move || {
            let mut retaken = false;
            let guard = h.enter_background_with(|step| {
                if step == HandoffStep::Waited && !retaken {
                    retaken = true;
                    h.reserve();
                }
            });
            entered.fetch_add(1, Ordering::SeqCst);
            drop(guard);
            tx.send(()).unwrap();
        });
    }

    // Keep releasing the lock for a while, like a realtime side finishing
    // short exclusive sections.
    let releaser = {
        let h = h.clone();
        thread::spawn(move || {
            for _ in 0..20 {
                thread::sleep(Duration::from_millis(10));
                h.release();
            }
        })
    };

    for _ in 0..2 {
        rx.recv_timeout(Duration::from_secs(5))
            .expect("background worker stayed blocked");
    }
    releaser.join().unwrap();
    assert_eq!(entered.load(Ordering::SeqCst), 2);
    assert_eq!(h.waiters(), 0);
}

// The realtime side never shares the protected section with a background one.
#[test]
fn mutual_exclusion_under_contention() {
    let (_mem, h) = handoff();
    let in_rt = Arc::new(AtomicBool::new(false));
    let in_bg = Arc::new(AtomicU32::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let realtime = {
        let (h, in_rt, in_bg, violations, stop) = (
            h.clone(),
            in_rt.clone(),
            in_bg.clone(),
            violations.clone(),
            stop.clone(),
        );
        thread::spawn(move || {
            let mut entered = 0u32;
            while !stop.load(Ordering::SeqCst) {
                if let Some(guard) = h.try_enter_realtime() {
                    in_rt.store(true, Ordering::SeqCst);
                    if in_bg.load(Ordering::SeqCst) != 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::yield_now();
                    in_rt.store(false, Ordering::SeqCst);
                    drop(guard);
                    entered += 1;
                }
                thread::yield_now();
            }
            entered
        })
    };

    let background: Vec<_> = (0..3)
        .map(|_| {
            let (h, in_rt, in_bg, violations) =
                (h.clone(), in_rt.clone(), in_bg.clone(), violations.clone());
            thread::spawn(move || {
                for _ in 0..200 {
                    let guard = h.enter_background();
                    in_bg.fetch_add(1, Ordering::SeqCst);
                    if in_rt.load(Ordering::SeqCst) {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::yield_now();
                    in_bg.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                }
            })
        })
        .collect();

    for b in background {
        b.join().unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    realtime.join().unwrap();

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(h.waiters(), 0);
}

// The realtime side waiting at construction time proceeds only once the
// registered background context has left.
#[test]
fn realtime_blocking_entry_waits_for_waiters() {
    let (_mem, h) = handoff();
    let bg = h.enter_background();
    let bg_left = Arc::new(AtomicBool::new(false));

    let realtime = {
        let h = h.clone();
        let bg_left = bg_left.clone();
        thread::spawn(move || {
            let _guard = h.enter_realtime_blocking();
            bg_left.load(Ordering::SeqCst)
        })
    };

    thread::sleep(Duration::from_millis(30));
    assert!(h.is_held());
    bg_left.store(true, Ordering::SeqCst);
    drop(bg);

    assert!(realtime.join().unwrap(), "realtime entered before background left");
    assert!(!h.is_held());
}

// try_enter_realtime fails while a background context is inside and leaves
// the lock free for it.
#[test]
fn try_enter_realtime_backs_off() {
    let (_mem, h) = handoff();
    let bg = h.enter_background();
    assert!(h.try_enter_realtime().is_none());
    assert!(!h.is_held());
    drop(bg);

    let guard = h.try_enter_realtime().expect("free now");
    assert!(h.is_held());
    drop(guard);
    assert!(!h.is_held());
}

// A waiter registered before the release always observes it.
#[test]
fn no_lost_wakeup_on_release() {
    let (_mem, h) = handoff();
    let deadline = Instant::now() + Duration::from_secs(10);
    for _ in 0..50 {
        h.reserve();
        let (tx, rx) = mpsc::channel();
        let worker = {
            let h = h.clone();
            thread::spawn(move || {
                let _guard = h.enter_background();
                tx.send(()).unwrap();
            })
        };
        thread::yield_now();
        h.release();
        rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .expect("waiter missed the release");
        worker.join().unwrap();
    }
    assert_eq!(h.waiters(), 0);
}
