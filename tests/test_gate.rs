// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// InitGate: exactly-once setup, follower wake-up, and the failed state.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use libhandoff::gate::{GATE_FAILED, GATE_INITIALIZING, GATE_READY};
use libhandoff::{GateRole, GateState, ImageConfig, InitGate, SharedMemory, SignalLease};

fn gate() -> (SharedMemory, SignalLease, InitGate) {
    let mem = SharedMemory::new(ImageConfig {
        signal_slots: 8,
        user_bytes: 64,
    })
    .expect("image");
    let lease = mem.alloc_signal().expect("lease");
    let gate = InitGate::new(lease.signal());
    (mem, lease, gate)
}

// The initializer runs setup and opens the gate without ever waiting.
#[test]
fn initializer_opens_gate() {
    let (_mem, _lease, gate) = gate();
    assert_eq!(gate.poll(), GateState::NotReady);

    let runs = AtomicUsize::new(0);
    gate.enter(GateRole::Initializer, || {
        runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .expect("initialize");

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(gate.poll(), GateState::Ready);
    assert_eq!(gate.signal().load(), GATE_READY);
    gate.wait_ready().expect("ready");
}

// Followers block until setup is visible, then see everything it wrote.
#[test]
fn followers_observe_setup_writes() {
    let (mem, _lease, gate) = gate();
    let followers: Vec<_> = (0..4)
        .map(|_| {
            let gate = gate.clone();
            let mem = mem.clone();
            thread::spawn(move || {
                gate.enter(GateRole::Follower, || unreachable!())
                    .expect("follower");
                let mut buf = [0u8; 4];
                mem.read_user(0, &mut buf).expect("read");
                buf
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(30));
    gate.initialize(|| mem.write_user(0, b"init")).expect("initialize");

    for f in followers {
        assert_eq!(&f.join().unwrap(), b"init");
    }
}

// A gate can only be initialized once.
#[test]
fn second_initialize_is_rejected() {
    let (_mem, _lease, gate) = gate();
    gate.initialize(|| Ok(())).expect("first");
    let err = gate
        .initialize(|| panic!("setup must not run again"))
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
}

// Racing initializers: exactly one runs setup, the rest are refused.
#[test]
fn concurrent_initialize_runs_setup_once() {
    let (_mem, _lease, gate) = gate();
    let runs = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(4));

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let (gate, runs, barrier) = (gate.clone(), runs.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                gate.initialize(|| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    Ok(())
                })
            })
        })
        .collect();

    let results: Vec<_> = callers.into_iter().map(|c| c.join().unwrap()).collect();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
    assert_eq!(gate.poll(), GateState::Ready);
}

// Followers keep waiting while setup is still running.
#[test]
fn followers_wait_through_initializing() {
    let (_mem, _lease, gate) = gate();
    let (started_tx, started_rx) = std::sync::mpsc::channel();
    let initializer = {
        let gate = gate.clone();
        thread::spawn(move || {
            gate.initialize(|| {
                started_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                Ok(())
            })
        })
    };

    started_rx.recv().unwrap();
    assert_eq!(gate.poll(), GateState::Initializing);
    assert_eq!(gate.signal().load(), GATE_INITIALIZING);
    let err = gate
        .wait_ready_timeout(Duration::from_millis(10))
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);

    gate.wait_ready().expect("ready");
    assert_eq!(gate.poll(), GateState::Ready);
    initializer.join().unwrap().expect("initialize");
}

// A failed setup wakes followers with InvalidData instead of stranding them.
#[test]
fn failed_setup_wakes_followers() {
    let (_mem, _lease, gate) = gate();
    let follower = {
        let gate = gate.clone();
        thread::spawn(move || gate.wait_ready())
    };

    thread::sleep(Duration::from_millis(30));
    let err = gate
        .initialize(|| Err(io::Error::new(io::ErrorKind::Other, "no module")))
        .unwrap_err();
    assert_eq!(err.to_string(), "no module");
    assert_eq!(gate.poll(), GateState::Failed);
    assert_eq!(gate.signal().load(), GATE_FAILED);

    let err = follower.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
}

// A panicking setup also leaves the gate failed.
#[test]
fn panicking_setup_marks_failed() {
    let (_mem, _lease, gate) = gate();
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = gate.initialize(|| panic!("setup exploded"));
    }));
    assert!(result.is_err());
    assert_eq!(gate.poll(), GateState::Failed);
    assert_eq!(
        gate.wait_ready().unwrap_err().kind(),
        io::ErrorKind::InvalidData
    );
}

#[test]
fn wait_ready_timeout_expires() {
    let (_mem, _lease, gate) = gate();
    let err = gate
        .wait_ready_timeout(Duration::from_millis(20))
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
}

// The image gate itself is opened by SharedMemory::new.
#[test]
fn image_gate_is_ready() {
    let (mem, _lease, _gate) = gate();
    let image_gate = mem.gate();
    assert_eq!(image_gate.poll(), GateState::Ready);
    assert_eq!(
        image_gate.initialize(|| Ok(())).unwrap_err().kind(),
        io::ErrorKind::AlreadyExists
    );
    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();
    image_gate
        .enter(GateRole::Follower, move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("follower");
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}
