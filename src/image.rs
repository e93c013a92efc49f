// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The shared memory image: one contiguous region of 32-bit cells that every
// execution context receives a handle to. The first cells hold a small
// header and a lock-free allocation table for signal slots; the rest is a
// user byte region.
//
// Layout (in cells):
//   [0] magic  [1] slot count  [2] init gate
//   [3 .. 3+W)          allocation bitmap, W = ceil(slots / 32)
//   [3+W .. 3+W+slots)  signal slots
//   then the user byte region.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::gate::{GateRole, InitGate};
use crate::signal::{SharedSignal, SignalIndex};

#[cfg(any(unix, windows))]
use crate::platform::PlatformShm;

/// Written last by the one-time setup; attachers check it after the gate.
pub const IMAGE_MAGIC: i32 = 0x4846_4f31;

const MAGIC_CELL: usize = 0;
const SLOTS_CELL: usize = 1;
const HEADER_CELLS: usize = 3;

/// Cell of the image-wide initialization gate.
pub const GATE_INDEX: SignalIndex = SignalIndex(2);

const CELL: usize = std::mem::size_of::<AtomicI32>();

/// Sizing of a shared image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageConfig {
    /// Number of allocatable signal slots.
    pub signal_slots: u32,
    /// Size of the user byte region.
    pub user_bytes: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            signal_slots: 256,
            user_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    slots: usize,
    bitmap_start: usize,
    bitmap_words: usize,
    slot_start: usize,
    user_offset: usize,
    user_len: usize,
    total_bytes: usize,
}

impl Layout {
    fn new(config: &ImageConfig) -> io::Result<Self> {
        if config.signal_slots == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared image needs at least one signal slot",
            ));
        }
        let slots = config.signal_slots as usize;
        let bitmap_words = slots.div_ceil(32);
        let too_large = || {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared image too large to address",
            )
        };
        let slot_start = HEADER_CELLS + bitmap_words;
        let user_offset = (slot_start + slots).checked_mul(CELL).ok_or_else(too_large)?;
        let total_bytes = user_offset
            .checked_add(config.user_bytes)
            .and_then(|n| n.div_ceil(CELL).checked_mul(CELL))
            .ok_or_else(too_large)?;
        if total_bytes / CELL > u32::MAX as usize {
            return Err(too_large());
        }
        Ok(Self {
            slots,
            bitmap_start: HEADER_CELLS,
            bitmap_words,
            slot_start,
            user_offset,
            user_len: config.user_bytes,
            total_bytes,
        })
    }
}

enum Backing {
    Heap(#[allow(dead_code)] Box<[AtomicI32]>),
    #[cfg(any(unix, windows))]
    Mapped(PlatformShm),
}

struct Inner {
    backing: Backing,
    base: *mut u8,
    layout: Layout,
    name: Option<String>,
}

// Safety: every access to the region goes through atomics.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

/// Handle to a shared memory image.
///
/// Clones are cheap and refer to the same region; the region lives as long
/// as the longest-lived handle (and, for named images, across processes
/// until the last mapping goes away).
#[derive(Clone)]
pub struct SharedMemory {
    inner: Arc<Inner>,
}

impl SharedMemory {
    /// A process-local image. The caller is the designated initializer, so the
    /// layout is ready before this returns and no waiting takes place.
    pub fn new(config: ImageConfig) -> io::Result<Self> {
        Self::with_setup(config, |_| Ok(()))
    }

    /// Like [`new`](Self::new), running `setup` as part of the one-time
    /// initialization (after the layout is prepared, before the gate opens).
    pub fn with_setup<F>(config: ImageConfig, setup: F) -> io::Result<Self>
    where
        F: FnOnce(&SharedMemory) -> io::Result<()>,
    {
        let layout = Layout::new(&config)?;
        let cells: Box<[AtomicI32]> = (0..layout.total_bytes / CELL)
            .map(|_| AtomicI32::new(0))
            .collect();
        let base = cells.as_ptr() as *mut u8;
        let memory = Self::from_backing(Backing::Heap(cells), base, layout, None);
        memory.gate().initialize(|| {
            memory.format();
            setup(&memory)
        })?;
        Ok(memory)
    }

    /// Attach to a named image shared across processes.
    ///
    /// The first handle to map the object is the designated initializer; every
    /// other attacher blocks until the initializer's setup is visible. All
    /// attachers must use the same `config`.
    #[cfg(any(unix, windows))]
    pub fn open_named(name: &str, config: ImageConfig) -> io::Result<Self> {
        Self::open_named_with(name, config, |_| Ok(()))
    }

    /// [`open_named`](Self::open_named) with an extra one-time `setup` that
    /// only the initializer runs.
    #[cfg(any(unix, windows))]
    pub fn open_named_with<F>(name: &str, config: ImageConfig, setup: F) -> io::Result<Self>
    where
        F: FnOnce(&SharedMemory) -> io::Result<()>,
    {
        let layout = Layout::new(&config)?;
        let shm = PlatformShm::attach(name, layout.total_bytes)?;
        let base = shm.as_mut_ptr();
        let role = if shm.first_attach() {
            GateRole::Initializer
        } else {
            GateRole::Follower
        };
        let memory = Self::from_backing(Backing::Mapped(shm), base, layout, Some(name.to_owned()));
        log::debug!("image {name}: attached as {role:?}");
        memory.gate().enter(role, || {
            memory.format();
            setup(&memory)
        })?;
        memory.validate()?;
        Ok(memory)
    }

    /// Remove the backing object of a named image.
    #[cfg(any(unix, windows))]
    pub fn clear_storage(name: &str) {
        PlatformShm::unlink_by_name(name);
    }

    fn from_backing(backing: Backing, base: *mut u8, layout: Layout, name: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                backing,
                base,
                layout,
                name,
            }),
        }
    }

    /// One-time layout preparation; runs behind the init gate.
    fn format(&self) {
        let l = &self.inner.layout;
        for i in HEADER_CELLS..l.slot_start + l.slots {
            self.raw_cell(i).store(0, Ordering::Relaxed);
        }
        // Bits past the last slot are permanently taken.
        let tail = l.slots % 32;
        if tail != 0 {
            let last = self.raw_cell(l.bitmap_start + l.bitmap_words - 1);
            last.store((!0u32 << tail) as i32, Ordering::Relaxed);
        }
        self.raw_cell(SLOTS_CELL).store(l.slots as i32, Ordering::Relaxed);
        self.raw_cell(MAGIC_CELL).store(IMAGE_MAGIC, Ordering::Relaxed);
    }

    fn validate(&self) -> io::Result<()> {
        let magic = self.raw_cell(MAGIC_CELL).load(Ordering::SeqCst);
        let slots = self.raw_cell(SLOTS_CELL).load(Ordering::SeqCst);
        if magic != IMAGE_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shared image magic {magic:#x}, expected {IMAGE_MAGIC:#x}"),
            ));
        }
        if slots as usize != self.inner.layout.slots {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "shared image has {slots} signal slots, expected {}",
                    self.inner.layout.slots
                ),
            ));
        }
        Ok(())
    }

    fn raw_cell(&self, i: usize) -> &AtomicI32 {
        assert!(i < self.cell_count(), "cell {i} outside shared image");
        unsafe { &*(self.inner.base as *const AtomicI32).add(i) }
    }

    pub(crate) fn cell(&self, index: SignalIndex) -> &AtomicI32 {
        self.raw_cell(index.0 as usize)
    }

    /// Number of 32-bit cells in the image (header, table, slots and user region).
    pub fn cell_count(&self) -> usize {
        self.inner.layout.total_bytes / CELL
    }

    /// Name of a named image, `None` for a process-local one.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Handles mapping the image: across processes for named images, within
    /// this process otherwise.
    pub fn attached(&self) -> usize {
        match &self.inner.backing {
            Backing::Heap(_) => Arc::strong_count(&self.inner),
            #[cfg(any(unix, windows))]
            Backing::Mapped(shm) => shm.attached().max(0) as usize,
        }
    }

    /// Whether two handles refer to the same mapping.
    pub fn same_image(&self, other: &SharedMemory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Raw access to any cell. Panics if `index` is outside the image.
    pub fn signal(&self, index: SignalIndex) -> SharedSignal {
        SharedSignal::new(self.clone(), index)
    }

    /// The image-wide initialization gate.
    pub fn gate(&self) -> InitGate {
        InitGate::new(self.signal(GATE_INDEX))
    }

    pub fn signal_slots(&self) -> usize {
        self.inner.layout.slots
    }

    /// Claim a free signal slot, initialised to 0. The slot returns to the
    /// table when the lease is dropped.
    pub fn alloc_signal(&self) -> io::Result<SignalLease> {
        let l = &self.inner.layout;
        for w in 0..l.bitmap_words {
            let word = self.raw_cell(l.bitmap_start + w);
            let mut cur = word.load(Ordering::SeqCst);
            while cur != -1 {
                let bit = (cur as u32).trailing_ones();
                let next = (cur as u32 | (1u32 << bit)) as i32;
                match word.compare_exchange_weak(cur, next, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => {
                        let index = SignalIndex((l.slot_start + w * 32 + bit as usize) as u32);
                        self.cell(index).store(0, Ordering::SeqCst);
                        return Ok(SignalLease {
                            memory: self.clone(),
                            index,
                        });
                    }
                    Err(actual) => cur = actual,
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            "shared image signal table exhausted",
        ))
    }

    fn release_slot(&self, index: SignalIndex) {
        let l = &self.inner.layout;
        let slot = index.0 as usize - l.slot_start;
        let word = self.raw_cell(l.bitmap_start + slot / 32);
        word.fetch_and(!(1u32 << (slot % 32)) as i32, Ordering::SeqCst);
    }

    /// Signal slots currently free.
    pub fn free_signals(&self) -> usize {
        let l = &self.inner.layout;
        (0..l.bitmap_words)
            .map(|w| self.raw_cell(l.bitmap_start + w).load(Ordering::SeqCst).count_zeros() as usize)
            .sum()
    }

    /// Length of the user byte region.
    pub fn user_len(&self) -> usize {
        self.inner.layout.user_len
    }

    fn user_bytes(&self) -> &[AtomicU8] {
        let l = &self.inner.layout;
        unsafe {
            std::slice::from_raw_parts(
                self.inner.base.add(l.user_offset) as *const AtomicU8,
                l.user_len,
            )
        }
    }

    fn check_user_range(&self, offset: usize, len: usize) -> io::Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.user_len() => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range {offset}+{len} outside user region of {} bytes",
                    self.user_len()
                ),
            )),
        }
    }

    /// Copy `buf` into the user region at `offset`.
    ///
    /// Byte accesses are relaxed; order them against other contexts through a
    /// signal (gate, handoff or completion).
    pub fn write_user(&self, offset: usize, buf: &[u8]) -> io::Result<()> {
        self.check_user_range(offset, buf.len())?;
        for (dst, &b) in self.user_bytes()[offset..].iter().zip(buf) {
            dst.store(b, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copy from the user region at `offset` into `buf`.
    pub fn read_user(&self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        self.check_user_range(offset, buf.len())?;
        for (dst, src) in buf.iter_mut().zip(&self.user_bytes()[offset..]) {
            *dst = src.load(Ordering::Relaxed);
        }
        Ok(())
    }
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.inner.name)
            .field("cells", &self.cell_count())
            .field("signal_slots", &self.inner.layout.slots)
            .field("user_len", &self.inner.layout.user_len)
            .finish()
    }
}

/// Exclusive claim on one signal slot of an image.
pub struct SignalLease {
    memory: SharedMemory,
    index: SignalIndex,
}

impl SignalLease {
    pub fn index(&self) -> SignalIndex {
        self.index
    }

    pub fn signal(&self) -> SharedSignal {
        self.memory.signal(self.index)
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }
}

impl fmt::Debug for SignalLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SignalLease").field(&self.index).finish()
    }
}

impl Drop for SignalLease {
    fn drop(&mut self) {
        self.memory.release_slot(self.index);
    }
}
