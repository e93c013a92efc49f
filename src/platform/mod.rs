// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Platform layer: named shared image backing plus the futex-style
// wait/wake pair every SharedSignal is built on.

#[cfg(unix)]
pub mod posix;

#[cfg(windows)]
pub mod windows;

#[cfg(target_arch = "wasm32")]
pub mod wasm;

#[cfg(any(
    all(unix, not(any(target_os = "linux", target_os = "android"))),
    all(target_arch = "wasm32", not(target_feature = "atomics")),
))]
mod poll;

// Re-export the platform-specific implementations under a uniform name.

#[cfg(unix)]
pub use posix::PlatformShm;
#[cfg(windows)]
pub use windows::PlatformShm;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use posix::{futex_wait, futex_wake};

#[cfg(windows)]
pub(crate) use windows::{futex_wait, futex_wake};

#[cfg(all(target_arch = "wasm32", target_feature = "atomics"))]
pub(crate) use wasm::{futex_wait, futex_wake};

#[cfg(any(
    all(unix, not(any(target_os = "linux", target_os = "android"))),
    all(target_arch = "wasm32", not(target_feature = "atomics")),
))]
pub(crate) use poll::{futex_wait, futex_wake};
