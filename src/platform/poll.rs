// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Wait/wake fallback for targets without an address-wait primitive.
// Waiters poll the cell with adaptive backoff; wake is a no-op because
// every waiter re-reads the value on its own.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::signal::WaitResult;

pub(crate) fn futex_wait(cell: &AtomicI32, expected: i32, timeout: Option<Duration>) -> WaitResult {
    if cell.load(Ordering::SeqCst) != expected {
        return WaitResult::NotEqual;
    }
    let deadline = timeout.map(|d| Instant::now() + d);
    let mut backoff = Backoff::new();
    loop {
        backoff.snooze();
        if cell.load(Ordering::SeqCst) != expected {
            return WaitResult::Woken;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return WaitResult::TimedOut;
            }
        }
    }
}

pub(crate) fn futex_wake(_cell: &AtomicI32, _count: u32) -> u32 {
    0
}
