// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// SharedSignal: one 32-bit cell of a shared image, driven through
// sequentially consistent atomics and a futex-style wait/notify.
// LocalSignal is the same contract on a cell that lives outside any image.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context;
use crate::image::SharedMemory;
use crate::platform;

/// Index of a 32-bit cell inside a shared image (an `Int32Array` index, not a
/// byte offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalIndex(pub u32);

impl SignalIndex {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SignalIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of a single wait call, mirroring `Atomics.wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Woken by a notify (or spuriously); the value may still equal `expected`.
    Woken,
    /// The value already differed from `expected`.
    NotEqual,
    TimedOut,
}

/// Block on `cell` until it no longer holds `expected`.
fn wait_until_changed(cell: &AtomicI32, expected: i32) {
    context::assert_may_block();
    while cell.load(Ordering::SeqCst) == expected {
        platform::futex_wait(cell, expected, None);
    }
}

/// Bounded form of [`wait_until_changed`]. Returns `false` on timeout.
fn wait_until_changed_for(cell: &AtomicI32, expected: i32, timeout: Duration) -> bool {
    context::assert_may_block();
    let deadline = Instant::now() + timeout;
    loop {
        if cell.load(Ordering::SeqCst) != expected {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        platform::futex_wait(cell, expected, Some(deadline - now));
    }
}

/// A cell of a [`SharedMemory`] image used for blocking coordination.
///
/// Cloning is cheap; every clone refers to the same cell. Constructing a
/// signal for an index outside the image panics.
#[derive(Clone)]
pub struct SharedSignal {
    memory: SharedMemory,
    index: SignalIndex,
}

impl SharedSignal {
    pub(crate) fn new(memory: SharedMemory, index: SignalIndex) -> Self {
        assert!(
            (index.0 as usize) < memory.cell_count(),
            "signal index {index} outside shared image of {} cells",
            memory.cell_count()
        );
        Self { memory, index }
    }

    fn cell(&self) -> &AtomicI32 {
        self.memory.cell(self.index)
    }

    pub fn index(&self) -> SignalIndex {
        self.index
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn load(&self) -> i32 {
        self.cell().load(Ordering::SeqCst)
    }

    pub fn store(&self, value: i32) {
        self.cell().store(value, Ordering::SeqCst);
    }

    /// Returns the previous value.
    pub fn add(&self, delta: i32) -> i32 {
        self.cell().fetch_add(delta, Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn sub(&self, delta: i32) -> i32 {
        self.cell().fetch_sub(delta, Ordering::SeqCst)
    }

    pub fn compare_exchange(&self, current: i32, new: i32) -> Result<i32, i32> {
        self.cell()
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    /// Block until the value differs from `expected`; returns at once if it
    /// already does. Spurious wakes are absorbed by re-checking the value.
    ///
    /// # Panics
    /// When called inside a realtime processing quantum.
    pub fn wait(&self, expected: i32) {
        wait_until_changed(self.cell(), expected);
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    /// Returns `false` on timeout.
    pub fn wait_timeout(&self, expected: i32, timeout: Duration) -> bool {
        wait_until_changed_for(self.cell(), expected, timeout)
    }

    /// One raw wait call. May return [`WaitResult::Woken`] while the value
    /// still equals `expected`.
    pub fn wait_once(&self, expected: i32, timeout: Option<Duration>) -> WaitResult {
        context::assert_may_block();
        platform::futex_wait(self.cell(), expected, timeout)
    }

    /// Wake every context blocked on this cell. Returns the number woken
    /// where the platform reports it, 0 otherwise.
    pub fn notify(&self) -> u32 {
        platform::futex_wake(self.cell(), u32::MAX)
    }

    pub fn notify_one(&self) -> u32 {
        platform::futex_wake(self.cell(), 1)
    }
}

impl fmt::Debug for SharedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSignal")
            .field("index", &self.index)
            .field("value", &self.load())
            .finish()
    }
}

/// A signal cell private to the contexts holding a clone, not part of any
/// image. Used for the terminal park cell and host-side readiness flags.
#[derive(Clone, Debug, Default)]
pub struct LocalSignal(Arc<AtomicI32>);

impl LocalSignal {
    pub fn new(value: i32) -> Self {
        Self(Arc::new(AtomicI32::new(value)))
    }

    pub fn load(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn store(&self, value: i32) {
        self.0.store(value, Ordering::SeqCst);
    }

    pub fn wait(&self, expected: i32) {
        wait_until_changed(&self.0, expected);
    }

    pub fn wait_timeout(&self, expected: i32, timeout: Duration) -> bool {
        wait_until_changed_for(&self.0, expected, timeout)
    }

    pub fn notify(&self) -> u32 {
        platform::futex_wake(&self.0, u32::MAX)
    }

    /// Store then wake all waiters.
    pub fn set(&self, value: i32) {
        self.store(value);
        self.notify();
    }
}
