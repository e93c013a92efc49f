// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// InitGate: exactly-once initialization of a shared image. The designated
// initializer runs the setup and publishes it with store + notify; every
// other context waits on the gate cell until the store is visible.

use std::io;
use std::time::{Duration, Instant};

use crate::signal::SharedSignal;

pub const GATE_NOT_READY: i32 = 0;
pub const GATE_READY: i32 = 1;
pub const GATE_FAILED: i32 = -1;
/// Claimed by an initializer whose setup is still running.
pub const GATE_INITIALIZING: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    NotReady,
    Initializing,
    Ready,
    Failed,
}

impl GateState {
    fn is_pending(self) -> bool {
        matches!(self, Self::NotReady | Self::Initializing)
    }

    fn from_raw(v: i32) -> Self {
        match v {
            GATE_NOT_READY => Self::NotReady,
            GATE_INITIALIZING => Self::Initializing,
            GATE_READY => Self::Ready,
            _ => Self::Failed,
        }
    }
}

/// Which side of the gate a context is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRole {
    Initializer,
    Follower,
}

/// Stores the failed value if the setup closure unwinds, so followers are
/// woken instead of left waiting on a gate nobody will open.
struct FailOnUnwind<'a> {
    signal: &'a SharedSignal,
    armed: bool,
}

impl Drop for FailOnUnwind<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.signal.store(GATE_FAILED);
            self.signal.notify();
        }
    }
}

fn setup_failed() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "shared image setup failed")
}

#[derive(Debug, Clone)]
pub struct InitGate {
    signal: SharedSignal,
}

impl InitGate {
    pub fn new(signal: SharedSignal) -> Self {
        Self { signal }
    }

    pub fn signal(&self) -> &SharedSignal {
        &self.signal
    }

    /// Current state without blocking.
    pub fn poll(&self) -> GateState {
        GateState::from_raw(self.signal.load())
    }

    /// Run `setup` as the designated initializer, then open the gate.
    ///
    /// The initializer never waits here. The gate is claimed atomically, so
    /// of several concurrent callers exactly one runs `setup`; the others,
    /// and any caller after the gate has left the not-ready state, get
    /// `AlreadyExists`. A failing setup moves the gate to the failed state,
    /// wakes followers and returns the setup error.
    pub fn initialize<F>(&self, setup: F) -> io::Result<()>
    where
        F: FnOnce() -> io::Result<()>,
    {
        if let Err(current) = self.signal.compare_exchange(GATE_NOT_READY, GATE_INITIALIZING) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!(
                    "init gate {} already {:?}",
                    self.signal.index(),
                    GateState::from_raw(current)
                ),
            ));
        }

        let mut guard = FailOnUnwind {
            signal: &self.signal,
            armed: true,
        };
        let result = setup();
        guard.armed = false;

        match result {
            Ok(()) => {
                self.signal.store(GATE_READY);
                self.signal.notify();
                Ok(())
            }
            Err(e) => {
                log::error!("init gate {}: setup failed: {e}", self.signal.index());
                self.signal.store(GATE_FAILED);
                self.signal.notify();
                Err(e)
            }
        }
    }

    /// Block until the initializer has finished. Returns `InvalidData` if its
    /// setup failed.
    pub fn wait_ready(&self) -> io::Result<()> {
        loop {
            let current = self.signal.load();
            if !GateState::from_raw(current).is_pending() {
                return self.settled(current);
            }
            self.signal.wait(current);
        }
    }

    /// [`wait_ready`](Self::wait_ready) bounded by `timeout`.
    pub fn wait_ready_timeout(&self, timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.signal.load();
            if !GateState::from_raw(current).is_pending() {
                return self.settled(current);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || !self.signal.wait_timeout(current, left) {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("init gate {} not ready after {timeout:?}", self.signal.index()),
                ));
            }
        }
    }

    fn settled(&self, raw: i32) -> io::Result<()> {
        match GateState::from_raw(raw) {
            GateState::Failed => Err(setup_failed()),
            _ => Ok(()),
        }
    }

    /// Initialize or wait, depending on `role`.
    pub fn enter<F>(&self, role: GateRole, setup: F) -> io::Result<()>
    where
        F: FnOnce() -> io::Result<()>,
    {
        match role {
            GateRole::Initializer => self.initialize(setup),
            GateRole::Follower => self.wait_ready(),
        }
    }
}
