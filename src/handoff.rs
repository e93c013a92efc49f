// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Mutual-exclusion handoff between one realtime context and background
// contexts sharing an image. Two cells: an occupancy lock (1 = held by the
// realtime side) and a waiter counter. All blocking lands on the background
// side; the realtime side only stores, loads and notifies once it is past
// construction.
//
// Background: wait(lock, HELD) -> add(waiters, 1) -> lock still HELD?
//             retract (sub, notify at zero) and start over : enter.
// Realtime:   store(lock, HELD) -> waiters == 0 ? enter : wait or back off.
//
// Both sides publish first and check second, so with sequentially
// consistent cells at most one of them sees the other's flag as clear.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::image::{SharedMemory, SignalLease};
use crate::signal::{SharedSignal, SignalIndex};

pub const LOCK_FREE: i32 = 0;
pub const LOCK_HELD: i32 = 1;

/// The two cell indices handed to a paired context at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandoffIndices {
    pub occupancy: SignalIndex,
    pub waiters: SignalIndex,
}

/// Points of the background entry loop, reported to the observer of
/// [`Handoff::enter_background_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffStep {
    /// The occupancy lock was seen free.
    Waited,
    /// Registered as a waiter.
    Registered,
    /// The lock was re-taken after registering; registration withdrawn.
    Retracted,
    Entered,
}

/// Drop one registration and wake the realtime side if it was the last.
fn deregister(waiters: &SharedSignal) {
    if waiters.sub(1) == 1 {
        waiters.notify();
    }
}

#[derive(Clone)]
pub struct Handoff {
    occupancy: SharedSignal,
    waiters: SharedSignal,
    leases: Option<Arc<[SignalLease; 2]>>,
}

impl Handoff {
    /// Lease both cells from `memory`. They return to the image once every
    /// clone of this handle is gone.
    pub fn allocate(memory: &SharedMemory) -> io::Result<Self> {
        let occupancy = memory.alloc_signal()?;
        let waiters = memory.alloc_signal()?;
        Ok(Self {
            occupancy: occupancy.signal(),
            waiters: waiters.signal(),
            leases: Some(Arc::new([occupancy, waiters])),
        })
    }

    /// Rebuild the handoff inside a context from the indices it was handed.
    pub fn from_indices(memory: &SharedMemory, indices: HandoffIndices) -> Self {
        Self {
            occupancy: memory.signal(indices.occupancy),
            waiters: memory.signal(indices.waiters),
            leases: None,
        }
    }

    pub fn indices(&self) -> HandoffIndices {
        HandoffIndices {
            occupancy: self.occupancy.index(),
            waiters: self.waiters.index(),
        }
    }

    pub fn is_held(&self) -> bool {
        self.occupancy.load() == LOCK_HELD
    }

    /// Background contexts currently registered (entered or about to retract).
    pub fn waiters(&self) -> i32 {
        self.waiters.load()
    }

    pub fn occupancy_signal(&self) -> &SharedSignal {
        &self.occupancy
    }

    pub fn waiter_signal(&self) -> &SharedSignal {
        &self.waiters
    }

    // -----------------------------------------------------------------------
    // Background role
    // -----------------------------------------------------------------------

    /// Enter as a background context. Blocks while the realtime side holds
    /// the lock.
    pub fn enter_background(&self) -> BackgroundGuard {
        self.enter_background_with(|_| {})
    }

    /// [`enter_background`](Self::enter_background), reporting each step of
    /// the entry loop to `observe`.
    pub fn enter_background_with<F>(&self, mut observe: F) -> BackgroundGuard
    where
        F: FnMut(HandoffStep),
    {
        let mut retries = 0u32;
        loop {
            self.occupancy.wait(LOCK_HELD);
            observe(HandoffStep::Waited);

            self.waiters.add(1);
            observe(HandoffStep::Registered);

            // Re-check after registering: the lock may have been taken again
            // between the wait and the add.
            if self.occupancy.load() == LOCK_FREE {
                break;
            }
            deregister(&self.waiters);
            retries += 1;
            observe(HandoffStep::Retracted);
            log::debug!(
                "handoff {}: lock re-taken after registering, retry {retries}",
                self.occupancy.index()
            );
        }
        observe(HandoffStep::Entered);
        BackgroundGuard {
            waiters: self.waiters.clone(),
            retries,
        }
    }

    // -----------------------------------------------------------------------
    // Realtime role
    // -----------------------------------------------------------------------

    /// Mark the lock held without waiting for anything. Used by the
    /// controller before the realtime context exists, so background contexts
    /// started in between queue up behind it.
    pub fn reserve(&self) {
        self.occupancy.store(LOCK_HELD);
    }

    /// [`reserve`](Self::reserve), returning a guard that frees the lock
    /// when dropped. Lets the reservation outlive a construction that fails,
    /// panics or never runs without stranding background contexts.
    pub fn reserve_guarded(&self) -> RealtimeGuard {
        self.reserve();
        RealtimeGuard {
            occupancy: self.occupancy.clone(),
        }
    }

    /// Take the lock and wait until no background context is registered.
    ///
    /// Blocks, so only valid while the realtime context is being constructed.
    pub fn enter_realtime_blocking(&self) -> RealtimeGuard {
        self.occupancy.store(LOCK_HELD);
        loop {
            let n = self.waiters.load();
            if n == 0 {
                break;
            }
            self.waiters.wait(n);
        }
        RealtimeGuard {
            occupancy: self.occupancy.clone(),
        }
    }

    /// Take the lock if no background context is registered; never blocks.
    ///
    /// On failure the lock is released again (dropping any earlier
    /// [`reserve`](Self::reserve)) so registered background contexts can
    /// finish.
    pub fn try_enter_realtime(&self) -> Option<RealtimeGuard> {
        self.occupancy.store(LOCK_HELD);
        if self.waiters.load() == 0 {
            return Some(RealtimeGuard {
                occupancy: self.occupancy.clone(),
            });
        }
        self.release();
        None
    }

    /// Free the lock and wake blocked background contexts.
    pub fn release(&self) {
        self.occupancy.store(LOCK_FREE);
        self.occupancy.notify();
    }
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handoff")
            .field("occupancy", &self.occupancy)
            .field("waiters", &self.waiters)
            .field("leased", &self.leases.is_some())
            .finish()
    }
}

/// Held by a background context inside the protected section.
#[must_use = "dropping the guard leaves the protected section"]
pub struct BackgroundGuard {
    waiters: SharedSignal,
    retries: u32,
}

impl BackgroundGuard {
    /// Register/retract cycles taken before entering.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

impl Drop for BackgroundGuard {
    fn drop(&mut self) {
        deregister(&self.waiters);
    }
}

impl fmt::Debug for BackgroundGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundGuard")
            .field("retries", &self.retries)
            .finish()
    }
}

/// Held by the realtime context while it runs exclusively. Dropping it
/// stores free and notifies.
#[must_use = "dropping the guard releases the lock"]
pub struct RealtimeGuard {
    occupancy: SharedSignal,
}

impl RealtimeGuard {
    pub fn index(&self) -> SignalIndex {
        self.occupancy.index()
    }
}

impl Drop for RealtimeGuard {
    fn drop(&mut self) {
        self.occupancy.store(LOCK_FREE);
        self.occupancy.notify();
    }
}

impl fmt::Debug for RealtimeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeGuard")
            .field("occupancy", &self.occupancy.index())
            .finish()
    }
}
