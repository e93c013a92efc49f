// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Execution context bookkeeping: which kind of context the current thread
// is running as, whether it is inside a realtime processing quantum, the
// per-context lifecycle state and the start-up configuration.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Environment variable overriding [`ContextConfig::stack_size`], in bytes.
pub const STACK_SIZE_ENV: &str = "LIBHANDOFF_STACK_SIZE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// May block indefinitely on a signal.
    BackgroundWorker,
    /// Ticked once per quantum on a strict budget; must never block inside
    /// a quantum.
    RealtimeAudioProcessor,
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BackgroundWorker => f.write_str("worker"),
            Self::RealtimeAudioProcessor => f.write_str("realtime"),
        }
    }
}

/// Lifecycle of the execution resource, kept apart from the lifecycle of the
/// task it runs: `Idle` means the work is done but the resource is still
/// held, `Released` means the resource itself is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Starting,
    Running,
    Idle,
    Released,
}

impl ContextState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Idle,
            _ => Self::Released,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Running => 1,
            Self::Idle => 2,
            Self::Released => 3,
        }
    }
}

/// What a worker does with its resource after signalling completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitPolicy {
    /// Close immediately after signalling (plain background worker).
    #[default]
    SelfRelease,
    /// Idle on a private, never-signalled cell until the host reclaims it.
    ParkUntilReclaimed,
}

/// Shared view of a context's [`ContextState`].
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ContextState::Starting.as_u8())))
    }

    pub fn get(&self) -> ContextState {
        ContextState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ContextState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// Start-up configuration for a spawned context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextConfig {
    pub name: Option<String>,
    /// Stack size handed both to the thread and to the module binding.
    pub stack_size: Option<usize>,
}

impl ContextConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Defaults, with the stack size taken from `LIBHANDOFF_STACK_SIZE` when set.
    pub fn from_env() -> io::Result<Self> {
        let stack_size = match std::env::var(STACK_SIZE_ENV) {
            Ok(raw) => Some(raw.trim().parse::<usize>().map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{STACK_SIZE_ENV}={raw:?}: {e}"),
                )
            })?),
            Err(std::env::VarError::NotPresent) => None,
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidInput, e)),
        };
        Ok(Self {
            name: None,
            stack_size,
        })
    }
}

// ---------------------------------------------------------------------------
// Thread-local current context
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT: Cell<Option<ContextKind>> = const { Cell::new(None) };
    static IN_QUANTUM: Cell<bool> = const { Cell::new(false) };
}

/// Kind of context the calling thread runs as, `None` for the controller or
/// any thread not started by this crate.
pub fn current_kind() -> Option<ContextKind> {
    CURRENT.with(Cell::get)
}

/// Whether the calling thread is inside a realtime processing quantum.
pub fn in_quantum() -> bool {
    IN_QUANTUM.with(Cell::get)
}

/// Panics if the calling thread is not allowed to block right now.
///
/// Realtime contexts may block during construction but never inside the
/// periodic processing callback.
#[track_caller]
pub fn assert_may_block() {
    if in_quantum() {
        panic!("blocking wait called inside a realtime processing quantum");
    }
}

/// Marks the current thread as a context of `kind` until dropped.
pub(crate) struct ContextScope {
    prev: Option<ContextKind>,
}

impl ContextScope {
    pub(crate) fn enter(kind: ContextKind) -> Self {
        let prev = CURRENT.with(|c| c.replace(Some(kind)));
        Self { prev }
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.prev));
    }
}

/// Marks the current thread as inside a processing quantum until dropped.
/// Hosts driving processors themselves wrap each callback in one.
pub struct QuantumScope(());

impl QuantumScope {
    pub fn enter() -> Self {
        IN_QUANTUM.with(|q| q.set(true));
        Self(())
    }
}

impl Drop for QuantumScope {
    fn drop(&mut self) {
        IN_QUANTUM.with(|q| q.set(false));
    }
}
