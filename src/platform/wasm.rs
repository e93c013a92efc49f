// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// wasm32 wait/wake on linear memory via `memory.atomic.wait32` and
// `memory.atomic.notify`. Only available with the `atomics` target feature;
// without it the polling fallback is used instead.

#[cfg(target_feature = "atomics")]
use std::sync::atomic::AtomicI32;
#[cfg(target_feature = "atomics")]
use std::time::Duration;

#[cfg(target_feature = "atomics")]
use crate::signal::WaitResult;

/// Returns: 0 = woken by notify, 1 = value mismatch, 2 = timeout.
#[cfg(target_feature = "atomics")]
pub(crate) fn futex_wait(cell: &AtomicI32, expected: i32, timeout: Option<Duration>) -> WaitResult {
    let timeout_ns = timeout.map_or(-1, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX));
    let ret = unsafe { core::arch::wasm32::memory_atomic_wait32(cell.as_ptr(), expected, timeout_ns) };
    match ret {
        0 => WaitResult::Woken,
        1 => WaitResult::NotEqual,
        _ => WaitResult::TimedOut,
    }
}

#[cfg(target_feature = "atomics")]
pub(crate) fn futex_wake(cell: &AtomicI32, count: u32) -> u32 {
    unsafe { core::arch::wasm32::memory_atomic_notify(cell.as_ptr(), count) }
}
