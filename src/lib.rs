// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Synchronization layer for execution contexts sharing one memory image:
// exactly-once image setup, the realtime/background occupancy handoff, and
// task completion signalling, plus the bootstrap sequences that tie them
// together per context kind.

mod backoff;
mod platform;

pub mod context;
pub use context::{ContextConfig, ContextKind, ContextState, ExitPolicy, QuantumScope};

pub mod image;
pub use image::{ImageConfig, SharedMemory, SignalLease};

pub mod signal;
pub use signal::{LocalSignal, SharedSignal, SignalIndex, WaitResult};

pub mod gate;
pub use gate::{GateRole, GateState, InitGate};

pub mod handoff;
pub use handoff::{BackgroundGuard, Handoff, HandoffIndices, HandoffStep, RealtimeGuard};

pub mod task;
pub use task::{
    dispatch, reply_channel, Dispatched, Payload, ReplyPort, Task, TaskHandle, TaskId, TaskInput,
    TaskOutcome, TaskState,
};

pub mod processor;
pub use processor::{
    AudioProcessor, AutomationRate, ExtendProcessor, FactoryFor, ParameterDescriptor,
    ProcessorFactory, ProcessorOptions, ProcessorRegistry, Quantum,
};

pub mod bootstrap;
pub use bootstrap::{
    spawn_paired_worker, spawn_worker, LinkedModule, ModuleImage, PairedWorkerStart, PortMessage,
    ProcessorStart, WorkerHandle, WorkerStart,
};

pub mod host;
pub use host::{AudioHost, QuantumConfig, RegisteredContext};

pub mod controller;
pub use controller::Controller;

pub mod rt_prio;
