// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX backing for named shared images (shm_open + mmap with a leading
// attach counter) and, on Linux, the shared futex wait/wake pair.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// Longest POSIX shm name accepted by the platform (including the leading '/').
/// 0 disables shortening.
#[cfg(target_os = "macos")]
const NAME_MAX: usize = 31;
#[cfg(not(target_os = "macos"))]
const NAME_MAX: usize = 0;

/// FNV-1a 64-bit, used to keep shortened names unique.
fn fnv1a_64(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325_u64, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

/// Produce the POSIX object name for an image name.
///
/// Names longer than `NAME_MAX` become `/<prefix>_<16 hex digits>` where the
/// prefix is the longest leading part of the original that still fits.
pub(crate) fn object_name(name: &str) -> String {
    let bare = name.trim_start_matches('/');
    let full = format!("/{bare}");
    if NAME_MAX == 0 || full.len() <= NAME_MAX {
        return full;
    }
    // '/' + '_' + 16 hex digits
    let room = NAME_MAX.saturating_sub(18);
    let cut = bare
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|&end| end <= room)
        .last()
        .unwrap_or(0);
    format!("/{}_{:016x}", &bare[..cut], fnv1a_64(bare.as_bytes()))
}

// ---------------------------------------------------------------------------
// Layout: an AtomicI32 counting the handles that currently map the object,
// then the user bytes. The counter sits at offset 0 so attachers agree on
// it even when they disagree about the size.
// ---------------------------------------------------------------------------

const COUNTER: usize = std::mem::size_of::<AtomicI32>();

pub(crate) fn mapped_len(user_size: usize) -> usize {
    COUNTER + user_size.div_ceil(COUNTER) * COUNTER
}

/// # Safety
/// `mem` must point to a live mapping.
unsafe fn attach_counter<'a>(mem: *mut u8) -> &'a AtomicI32 {
    &*(mem as *const AtomicI32)
}

/// Wait for the creator's `ftruncate` so the mapping below never touches
/// pages past the end of the object.
fn wait_sized(fd: libc::c_int, total: usize) -> io::Result<()> {
    let mut backoff = crate::backoff::Backoff::new();
    for _ in 0..2_000 {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let size = st.st_size as usize;
        if size >= total {
            return Ok(());
        }
        if size != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shared object is {size} bytes, expected {total}"),
            ));
        }
        backoff.snooze();
    }
    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        "shared object was never sized by its creator",
    ))
}

// ---------------------------------------------------------------------------
// PlatformShm
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    total: usize,
    name: String,
    prev_attached: i32,
}

// Safety: all access to the mapping goes through atomics.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    /// Map the named object, creating and sizing it if it does not exist yet.
    pub fn attach(name: &str, user_size: usize) -> io::Result<Self> {
        if name.trim_start_matches('/').is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "image name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "image size is 0"));
        }

        let posix_name = object_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let perms: libc::mode_t = 0o666;
        let total = mapped_len(user_size);

        // Exclusive create first so only the creator ever calls ftruncate;
        // truncating an object that is already sized may clobber it on macOS.
        let created = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                perms as libc::c_uint,
            )
        };
        let (fd, fresh) = if created != -1 {
            (created, true)
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err);
            }
            let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
            if fd == -1 {
                return Err(io::Error::last_os_error());
            }
            (fd, false)
        };

        unsafe { libc::fchmod(fd, perms) };

        if fresh {
            if unsafe { libc::ftruncate(fd, total as libc::off_t) } != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
        } else if let Err(err) = wait_sized(fd, total) {
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let prev_attached =
            unsafe { attach_counter(mem as *mut u8).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem: mem as *mut u8,
            total,
            name: posix_name,
            prev_attached,
        })
    }

    /// Start of the user bytes, past the attach counter.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        unsafe { self.mem.add(COUNTER) }
    }

    /// Whether no other handle mapped the object when this one attached.
    pub fn first_attach(&self) -> bool {
        self.prev_attached == 0
    }

    /// Handles currently mapping the object, across all processes.
    pub fn attached(&self) -> i32 {
        unsafe { attach_counter(self.mem).load(Ordering::Acquire) }
    }

    /// Remove an object by image name without mapping it.
    pub fn unlink_by_name(name: &str) {
        if let Ok(c_name) = CString::new(object_name(name)) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        // The last handle out removes the object.
        let prev = unsafe { attach_counter(self.mem).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.total) };
        if prev <= 1 {
            if let Ok(c_name) = CString::new(self.name.as_bytes()) {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Futex (Linux). Shared, not FUTEX_PRIVATE, so waits on a MAP_SHARED image
// are woken by notifies from other processes.
// ---------------------------------------------------------------------------

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn futex_wait(
    cell: &AtomicI32,
    expected: i32,
    timeout: Option<std::time::Duration>,
) -> crate::signal::WaitResult {
    use crate::signal::WaitResult;

    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const libc::timespec);
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            cell.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
        )
    };
    if ret == 0 {
        return WaitResult::Woken;
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) => WaitResult::NotEqual,
        Some(libc::ETIMEDOUT) => WaitResult::TimedOut,
        // EINTR and anything else: report a wake, callers re-check the value.
        _ => WaitResult::Woken,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn futex_wake(cell: &AtomicI32, count: u32) -> u32 {
    let count = count.min(i32::MAX as u32) as libc::c_int;
    let ret = unsafe { libc::syscall(libc::SYS_futex, cell.as_ptr(), libc::FUTEX_WAKE, count) };
    if ret < 0 {
        0
    } else {
        ret as u32
    }
}
