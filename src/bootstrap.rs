// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Entry sequences per context kind.
//
//   worker          gate -> bind -> run -> complete -> release
//   paired worker   gate -> handoff(background) { bind } -> run -> complete -> release
//   simple proc.    bind -> run inside construction
//   registrable     bind -> free lock -> register -> first port message runs
//                   the task (or just stops) -> stop asking for quanta

use std::fmt;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::context::{ContextConfig, ContextKind, ContextScope, ContextState, ExitPolicy, StateCell};
use crate::handoff::{Handoff, HandoffIndices, RealtimeGuard};
use crate::image::SharedMemory;
use crate::processor::{AudioProcessor, ProcessorRegistry, Quantum};
use crate::signal::LocalSignal;
use crate::task::{Dispatched, Payload, ReplyPort};

// ---------------------------------------------------------------------------
// Module image
// ---------------------------------------------------------------------------

/// Loader for the code every context runs against the shared image.
///
/// `instantiate` binds the module to `memory` inside the calling context.
pub trait ModuleImage: Send + Sync {
    fn instantiate(&self, memory: &SharedMemory, stack_size: Option<usize>) -> io::Result<()>;
}

/// The module linked into this binary: there is nothing to load.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkedModule;

impl ModuleImage for LinkedModule {
    fn instantiate(&self, _memory: &SharedMemory, _stack_size: Option<usize>) -> io::Result<()> {
        Ok(())
    }
}

impl<F> ModuleImage for F
where
    F: Fn(&SharedMemory, Option<usize>) -> io::Result<()> + Send + Sync,
{
    fn instantiate(&self, memory: &SharedMemory, stack_size: Option<usize>) -> io::Result<()> {
        self(memory, stack_size)
    }
}

// ---------------------------------------------------------------------------
// Creation messages
// ---------------------------------------------------------------------------

/// Start message of a plain background worker.
pub struct WorkerStart {
    pub module: Arc<dyn ModuleImage>,
    pub memory: SharedMemory,
    pub stack_size: Option<usize>,
    pub task: Dispatched,
}

/// Start message of a background worker paired with a realtime context.
pub struct PairedWorkerStart {
    pub module: Arc<dyn ModuleImage>,
    pub memory: SharedMemory,
    pub handoff: HandoffIndices,
    pub task: Dispatched,
}

pub type Registration = Box<dyn FnOnce(&mut ProcessorRegistry) -> io::Result<()> + Send>;

/// Construction options of a realtime processor context.
pub enum ProcessorStart {
    /// Run the task once, synchronously, during construction.
    Simple {
        module: Arc<dyn ModuleImage>,
        memory: SharedMemory,
        task: Dispatched,
    },
    /// Free the reserved occupancy lock once bound, register, then wait for
    /// a task on the port. Dropping the start unused also frees the lock.
    Registrable {
        module: Arc<dyn ModuleImage>,
        memory: SharedMemory,
        stack_size: Option<usize>,
        lock: RealtimeGuard,
        registration: Registration,
    },
}

impl fmt::Debug for ProcessorStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple { task, .. } => f.debug_struct("Simple").field("task", task).finish(),
            Self::Registrable { lock, stack_size, .. } => f
                .debug_struct("Registrable")
                .field("lock", lock)
                .field("stack_size", stack_size)
                .finish(),
        }
    }
}

/// Message to a registrable processor after registration. A message without
/// a task only asks the processor to stop.
#[derive(Debug, Default)]
pub struct PortMessage {
    pub task: Option<Dispatched>,
    pub payload: Option<Payload>,
    pub reply: Option<ReplyPort>,
}

impl PortMessage {
    pub fn run(task: Dispatched) -> Self {
        Self {
            task: Some(task),
            ..Self::default()
        }
    }

    pub fn stop() -> Self {
        Self::default()
    }

    pub fn with_payload<T: std::any::Any + Send>(mut self, value: T) -> Self {
        self.payload = Some(Payload::new(value));
        self
    }

    pub fn with_reply(mut self, port: ReplyPort) -> Self {
        self.reply = Some(port);
        self
    }
}

pub type PortSender = mpsc::Sender<PortMessage>;

// ---------------------------------------------------------------------------
// Background workers
// ---------------------------------------------------------------------------

/// Pass the image gate and bind the module. The caller marks the task
/// abandoned on error.
fn bind(module: &dyn ModuleImage, memory: &SharedMemory, stack_size: Option<usize>) -> io::Result<()> {
    memory.gate().wait_ready()?;
    module.instantiate(memory, stack_size)
}

fn run_bound(bound: io::Result<()>, task: Dispatched, memory: &SharedMemory) {
    match bound {
        Ok(()) => {
            task.run(memory);
        }
        Err(e) => {
            log::error!("{}: context init failed: {e}", task.id());
            task.abandon();
        }
    }
}

/// Terminal transition after completion was signalled.
fn finish(state: &StateCell, park: &LocalSignal, policy: ExitPolicy) {
    state.set(ContextState::Idle);
    if policy == ExitPolicy::ParkUntilReclaimed {
        log::debug!("context parked until reclaimed");
        park.wait(0);
    }
    state.set(ContextState::Released);
    log::debug!("context released");
}

fn spawn_context<F>(
    config: &ContextConfig,
    stack_size: Option<usize>,
    policy: ExitPolicy,
    body: F,
) -> io::Result<WorkerHandle>
where
    F: FnOnce() + Send + 'static,
{
    let state = StateCell::new();
    let park = LocalSignal::new(0);

    let mut builder = thread::Builder::new();
    if let Some(name) = &config.name {
        builder = builder.name(name.clone());
    }
    if let Some(size) = stack_size {
        builder = builder.stack_size(size);
    }

    let thread = {
        let state = state.clone();
        let park = park.clone();
        builder.spawn(move || {
            let _scope = ContextScope::enter(ContextKind::BackgroundWorker);
            state.set(ContextState::Running);
            body();
            finish(&state, &park, policy);
        })?
    };

    Ok(WorkerHandle {
        thread: Some(thread),
        state,
        park,
        policy,
    })
}

/// Start a plain background worker.
pub fn spawn_worker(
    start: WorkerStart,
    config: &ContextConfig,
    policy: ExitPolicy,
) -> io::Result<WorkerHandle> {
    let stack_size = start.stack_size.or(config.stack_size);
    spawn_context(config, stack_size, policy, move || {
        let WorkerStart {
            module,
            memory,
            task,
            ..
        } = start;
        let bound = bind(&*module, &memory, stack_size);
        run_bound(bound, task, &memory);
    })
}

/// Start a background worker that binds the module only while the paired
/// realtime context does not hold the occupancy lock.
pub fn spawn_paired_worker(
    start: PairedWorkerStart,
    config: &ContextConfig,
    policy: ExitPolicy,
) -> io::Result<WorkerHandle> {
    let stack_size = config.stack_size;
    spawn_context(config, stack_size, policy, move || {
        let PairedWorkerStart {
            module,
            memory,
            handoff,
            task,
        } = start;
        let handoff = Handoff::from_indices(&memory, handoff);
        let bound = memory.gate().wait_ready().and_then(|()| {
            let guard = handoff.enter_background();
            if guard.retries() > 0 {
                log::debug!("{}: entered handoff after {} retries", task.id(), guard.retries());
            }
            module.instantiate(&memory, stack_size)
        });
        run_bound(bound, task, &memory);
    })
}

/// Controller-side handle on a background worker context.
pub struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    state: StateCell,
    park: LocalSignal,
    policy: ExitPolicy,
}

impl WorkerHandle {
    pub fn state(&self) -> ContextState {
        self.state.get()
    }

    pub fn policy(&self) -> ExitPolicy {
        self.policy
    }

    pub fn is_released(&self) -> bool {
        self.state() == ContextState::Released
    }

    /// Let a parked context release its resource. No effect on a
    /// self-releasing one. Dropping the handle does the same.
    pub fn reclaim(&self) {
        self.park.set(1);
    }

    /// Wait for the context to release its resource. A parked context must be
    /// reclaimed first.
    pub fn join(mut self) -> io::Result<()> {
        self.join_inner()
    }

    /// [`join`](Self::join) giving up after `timeout`; the handle stays
    /// usable on `TimedOut`.
    pub fn join_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        while self.thread.as_ref().is_some_and(|t| !t.is_finished()) {
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("context not released after {timeout:?}"),
                ));
            }
            backoff.snooze();
        }
        self.join_inner()
    }

    fn join_inner(&mut self) -> io::Result<()> {
        match self.thread.take() {
            Some(t) => t
                .join()
                .map_err(|_| io::Error::other("context thread panicked")),
            None => Ok(()),
        }
    }
}

// A parked context whose handle is gone would otherwise never be reclaimed.
impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.reclaim();
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("state", &self.state())
            .field("policy", &self.policy)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Realtime processors
// ---------------------------------------------------------------------------

/// Realtime context whose task ran during construction. Asks for no quanta.
#[derive(Debug)]
pub struct SimpleProcessor {
    _memory: SharedMemory,
}

impl SimpleProcessor {
    /// Bind the module and run the task once, synchronously.
    pub fn construct(
        module: Arc<dyn ModuleImage>,
        memory: SharedMemory,
        task: Dispatched,
    ) -> io::Result<Self> {
        if let Err(e) = module.instantiate(&memory, None) {
            log::error!("{}: processor init failed: {e}", task.id());
            task.abandon();
            return Err(e);
        }
        task.run(&memory);
        Ok(Self { _memory: memory })
    }
}

impl AudioProcessor for SimpleProcessor {
    fn process(&mut self, _quantum: &mut Quantum<'_>) -> bool {
        false
    }
}

/// Realtime context that registers processors, then runs at most one task
/// delivered on its port.
pub struct RegistrableProcessor {
    memory: SharedMemory,
    port: mpsc::Receiver<PortMessage>,
    continue_processing: bool,
}

impl RegistrableProcessor {
    /// Bind the module, free the reserved occupancy `lock` and run
    /// `registration`. The lock is freed whether binding succeeds, fails or
    /// unwinds, so paired workers are never stranded.
    pub fn construct(
        module: Arc<dyn ModuleImage>,
        memory: SharedMemory,
        stack_size: Option<usize>,
        lock: RealtimeGuard,
        registration: Registration,
        registry: &mut ProcessorRegistry,
        port: mpsc::Receiver<PortMessage>,
    ) -> io::Result<Self> {
        let gate = lock.index();
        let bound = module.instantiate(&memory, stack_size);
        drop(lock);
        bound?;

        registration(registry)?;
        log::debug!("registrable processor on lock {gate}: registered");
        Ok(Self {
            memory,
            port,
            continue_processing: true,
        })
    }

    /// Handle the port between quanta. The first message (or a closed port)
    /// ends processing; only a message carrying a task runs anything.
    pub fn service(&mut self) {
        if !self.continue_processing {
            return;
        }
        match self.port.try_recv() {
            Ok(msg) => {
                self.continue_processing = false;
                match msg.task {
                    Some(mut task) => {
                        task.attach(msg.payload, msg.reply);
                        task.run(&self.memory);
                    }
                    None => log::debug!("registrable processor: stop requested"),
                }
            }
            Err(mpsc::TryRecvError::Empty) => {}
            Err(mpsc::TryRecvError::Disconnected) => {
                log::debug!("registrable processor: port closed");
                self.continue_processing = false;
            }
        }
    }

    pub fn continues(&self) -> bool {
        self.continue_processing
    }
}

impl AudioProcessor for RegistrableProcessor {
    fn process(&mut self, _quantum: &mut Quantum<'_>) -> bool {
        self.continue_processing
    }
}

impl fmt::Debug for RegistrableProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrableProcessor")
            .field("continue_processing", &self.continue_processing)
            .finish()
    }
}
