// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Adaptive backoff for polling loops: spin, then pause, then yield, then
// sleep. Used where no address-wait primitive exists and by controller-side
// polling of completion signals.

use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) const fn new() -> Self {
        Self { step: 0 }
    }

    /// - step < 4:  busy spin
    /// - step < 16: CPU pause hint
    /// - step < 32: thread yield
    /// - otherwise: sleep 1ms
    #[inline]
    pub(crate) fn snooze(&mut self) {
        if self.step < 4 {
            // busy spin
        } else if self.step < 16 {
            std::hint::spin_loop();
        } else if self.step < 32 {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_millis(1));
            return;
        }
        self.step += 1;
    }
}
