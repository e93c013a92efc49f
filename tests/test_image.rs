// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// SharedMemory image: layout, signal slot table, user region and named
// attachment with exactly-once setup.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use libhandoff::{GateState, ImageConfig, SharedMemory};

fn small(slots: u32) -> ImageConfig {
    ImageConfig {
        signal_slots: slots,
        user_bytes: 256,
    }
}

// A fresh process-local image is ready before the handle is returned.
#[test]
fn new_image_is_ready() {
    let mem = SharedMemory::new(ImageConfig::default()).expect("image");
    assert_eq!(mem.gate().poll(), GateState::Ready);
    assert_eq!(mem.signal_slots(), 256);
    assert_eq!(mem.free_signals(), 256);
    assert_eq!(mem.user_len(), 64 * 1024);
    assert!(mem.name().is_none());
}

#[test]
fn zero_slots_rejected() {
    let err = SharedMemory::new(small(0)).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
}

// A user region too large to lay out is an input error, not an overflow.
#[test]
fn oversized_user_region_rejected() {
    for user_bytes in [usize::MAX, usize::MAX - 3] {
        let err = SharedMemory::new(ImageConfig {
            signal_slots: 4,
            user_bytes,
        })
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}

// Slot counts that do not fill the last bitmap word still allocate exactly
// that many slots.
#[test]
fn alloc_until_exhausted() {
    let mem = SharedMemory::new(small(40)).expect("image");
    assert_eq!(mem.free_signals(), 40);

    let leases: Vec<_> = (0..40).map(|_| mem.alloc_signal().expect("lease")).collect();
    let unique: HashSet<_> = leases.iter().map(|l| l.index()).collect();
    assert_eq!(unique.len(), 40);
    assert_eq!(mem.free_signals(), 0);

    let err = mem.alloc_signal().unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
}

// Dropping a lease returns its slot, and a re-leased slot starts at 0.
#[test]
fn lease_drop_frees_slot() {
    let mem = SharedMemory::new(small(1)).expect("image");
    let lease = mem.alloc_signal().expect("lease");
    let index = lease.index();
    lease.signal().store(5);
    drop(lease);
    assert_eq!(mem.free_signals(), 1);

    let again = mem.alloc_signal().expect("lease again");
    assert_eq!(again.index(), index);
    assert_eq!(again.signal().load(), 0);
}

// Concurrent allocation never hands out the same slot twice.
#[test]
fn concurrent_alloc_is_unique() {
    let mem = SharedMemory::new(small(64)).expect("image");
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let mem = mem.clone();
            thread::spawn(move || {
                (0..8)
                    .map(|_| mem.alloc_signal().expect("lease"))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let leases: Vec<_> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let unique: HashSet<_> = leases.iter().map(|l| l.index()).collect();
    assert_eq!(unique.len(), 64);
    assert_eq!(mem.free_signals(), 0);
}

#[test]
fn user_region_round_trip_and_bounds() {
    let mem = SharedMemory::new(small(4)).expect("image");
    mem.write_user(10, b"abc").expect("write");
    let mut buf = [0u8; 3];
    mem.read_user(10, &mut buf).expect("read");
    assert_eq!(&buf, b"abc");

    let err = mem.write_user(254, b"abc").unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    let err = mem.read_user(usize::MAX, &mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
}

// A failing setup leaves no image behind and surfaces the setup error.
#[test]
fn with_setup_error_propagates() {
    let err = SharedMemory::with_setup(small(4), |_| {
        Err(io::Error::new(io::ErrorKind::Other, "boom"))
    })
    .unwrap_err();
    assert_eq!(err.to_string(), "boom");
}

// ========== Named images ==========

#[cfg(unix)]
mod named {
    use super::*;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_name(tag: &str) -> String {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("lh_img_{tag}_{}_{n}", std::process::id())
    }

    // The first attacher runs the setup; later ones only see its result.
    #[test]
    fn second_attacher_sees_setup() {
        let name = unique_name("follow");
        SharedMemory::clear_storage(&name);

        let a = SharedMemory::open_named_with(&name, small(8), |m| m.write_user(0, b"ready"))
            .expect("first");
        let b = SharedMemory::open_named_with(&name, small(8), |_| {
            panic!("setup must not run twice");
        })
        .expect("second");

        assert_eq!(a.attached(), 2);
        let mut buf = [0u8; 5];
        b.read_user(0, &mut buf).expect("read");
        assert_eq!(&buf, b"ready");

        // Signals leased through one handle are visible through the other.
        let lease = a.alloc_signal().expect("lease");
        assert_eq!(b.free_signals(), 7);
        b.signal(lease.index()).store(3);
        assert_eq!(lease.signal().load(), 3);
    }

    // N concurrent attachers: exactly one runs setup, all see it complete.
    #[test]
    fn concurrent_attach_initializes_once() {
        const N: usize = 8;
        let name = unique_name("race");
        SharedMemory::clear_storage(&name);

        let setups = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(N));
        let done = Arc::new(Barrier::new(N));

        let handles: Vec<_> = (0..N)
            .map(|_| {
                let name = name.clone();
                let setups = setups.clone();
                let start = start.clone();
                let done = done.clone();
                thread::spawn(move || {
                    start.wait();
                    let mem = SharedMemory::open_named_with(&name, small(8), |m| {
                        setups.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(std::time::Duration::from_millis(20));
                        m.write_user(0, &[0x5a])
                    })
                    .expect("attach");
                    let mut byte = [0u8; 1];
                    mem.read_user(0, &mut byte).expect("read");
                    // Keep every handle alive until all have looked.
                    done.wait();
                    byte[0]
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), 0x5a);
        }
        assert_eq!(setups.load(Ordering::SeqCst), 1);
    }

    // Attaching with a different layout is detected.
    #[test]
    fn layout_mismatch_is_invalid_data() {
        let name = unique_name("mismatch");
        SharedMemory::clear_storage(&name);

        let _a = SharedMemory::open_named(&name, small(64)).expect("first");
        let err = SharedMemory::open_named(&name, small(32)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn empty_name_rejected() {
        let err = SharedMemory::open_named("", small(8)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
