// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Windows backing for named shared images (pagefile-backed file mapping with
// a leading attach counter) and WaitOnAddress-based wait/wake.

use std::ffi::c_void;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, ERROR_TIMEOUT, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE, SEC_COMMIT,
};
use windows_sys::Win32::System::Threading::{
    WaitOnAddress, WakeByAddressAll, WakeByAddressSingle, INFINITE,
};

use crate::signal::WaitResult;

const COUNTER: usize = std::mem::size_of::<AtomicI32>();

pub(crate) fn mapped_len(user_size: usize) -> usize {
    COUNTER + user_size.div_ceil(COUNTER) * COUNTER
}

/// # Safety
/// `mem` must point to a live mapping.
unsafe fn attach_counter<'a>(mem: *mut u8) -> &'a AtomicI32 {
    &*(mem as *const AtomicI32)
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

pub struct PlatformShm {
    handle: HANDLE,
    mem: *mut u8,
    prev_attached: i32,
}

unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    /// Map the named object, creating it if it does not exist yet.
    pub fn attach(name: &str, user_size: usize) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "image name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "image size is 0"));
        }

        let total = mapped_len(user_size);
        let wide_name = to_wide(name);
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                ptr::null(),
                PAGE_READWRITE | SEC_COMMIT,
                (total as u64 >> 32) as u32,
                total as u32,
                wide_name.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }

        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, total) };
        if view.Value.is_null() {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(err);
        }
        let mem = view.Value as *mut u8;

        let prev_attached = unsafe { attach_counter(mem).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            handle,
            mem,
            prev_attached,
        })
    }

    /// Start of the user bytes, past the attach counter.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        unsafe { self.mem.add(COUNTER) }
    }

    pub fn first_attach(&self) -> bool {
        self.prev_attached == 0
    }

    pub fn attached(&self) -> i32 {
        unsafe { attach_counter(self.mem).load(Ordering::Acquire) }
    }

    /// Pagefile-backed mappings vanish with their last handle.
    pub fn unlink_by_name(_name: &str) {}
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        unsafe {
            attach_counter(self.mem).fetch_sub(1, Ordering::AcqRel);
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.mem as *mut c_void,
            });
            CloseHandle(self.handle);
        }
    }
}

/// WaitOnAddress only sees wakes from the same process, so each wait is cut
/// into slices and stores made by another process are picked up on re-check.
const CROSS_PROCESS_SLICE_MS: u32 = 10;

pub(crate) fn futex_wait(cell: &AtomicI32, expected: i32, timeout: Option<Duration>) -> WaitResult {
    if cell.load(Ordering::SeqCst) != expected {
        return WaitResult::NotEqual;
    }
    let requested = timeout.map_or(INFINITE, |d| d.as_millis().min(u128::from(INFINITE - 1)) as u32);
    let ms = requested.min(CROSS_PROCESS_SLICE_MS);
    let ok = unsafe {
        WaitOnAddress(
            cell.as_ptr() as *const c_void,
            &expected as *const i32 as *const c_void,
            std::mem::size_of::<i32>(),
            ms,
        )
    };
    if ok != 0 {
        WaitResult::Woken
    } else if unsafe { GetLastError() } == ERROR_TIMEOUT && ms == requested {
        WaitResult::TimedOut
    } else {
        WaitResult::Woken
    }
}

pub(crate) fn futex_wake(cell: &AtomicI32, count: u32) -> u32 {
    let addr = cell.as_ptr() as *const c_void;
    if count == 1 {
        unsafe { WakeByAddressSingle(addr) };
    } else {
        unsafe { WakeByAddressAll(addr) };
    }
    // WaitOnAddress does not report how many threads it woke.
    0
}
