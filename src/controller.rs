// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Dispatching side: owns the module and the shared image, starts one context
// per task and reclaims contexts once their task is terminal.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::bootstrap::{
    spawn_paired_worker, spawn_worker, ModuleImage, PairedWorkerStart, WorkerHandle, WorkerStart,
};
use crate::context::{ContextConfig, ContextKind, ContextState, ExitPolicy};
use crate::handoff::HandoffIndices;
use crate::image::SharedMemory;
use crate::task::{dispatch, Task, TaskHandle};

struct Context {
    task: TaskHandle,
    worker: WorkerHandle,
}

pub struct Controller {
    module: Arc<dyn ModuleImage>,
    memory: SharedMemory,
    config: ContextConfig,
    contexts: Vec<Context>,
}

impl Controller {
    pub fn new(module: Arc<dyn ModuleImage>, memory: SharedMemory, config: ContextConfig) -> Self {
        Self {
            module,
            memory,
            config,
            contexts: Vec::new(),
        }
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn module(&self) -> Arc<dyn ModuleImage> {
        self.module.clone()
    }

    /// Contexts not yet reaped.
    pub fn live(&self) -> usize {
        self.contexts.len()
    }

    fn track(&mut self, task: TaskHandle, worker: WorkerHandle) -> TaskHandle {
        self.contexts.push(Context {
            task: task.clone(),
            worker,
        });
        task
    }

    /// Run `task` on a fresh self-releasing worker.
    pub fn spawn(&mut self, task: Task) -> io::Result<TaskHandle> {
        let config = self.config.clone();
        self.spawn_with(task, &config, ExitPolicy::SelfRelease)
    }

    /// Run `task` on a worker that stays parked after completion until reaped.
    pub fn spawn_parked(&mut self, task: Task) -> io::Result<TaskHandle> {
        let config = self.config.clone();
        self.spawn_with(task, &config, ExitPolicy::ParkUntilReclaimed)
    }

    pub fn spawn_with(
        &mut self,
        task: Task,
        config: &ContextConfig,
        policy: ExitPolicy,
    ) -> io::Result<TaskHandle> {
        let (dispatched, handle) = dispatch(task, &self.memory, ContextKind::BackgroundWorker)?;
        let worker = spawn_worker(
            WorkerStart {
                module: self.module.clone(),
                memory: self.memory.clone(),
                stack_size: config.stack_size,
                task: dispatched,
            },
            config,
            policy,
        )?;
        Ok(self.track(handle, worker))
    }

    /// Run `task` on a worker paired with the realtime context owning `handoff`.
    pub fn spawn_paired(
        &mut self,
        task: Task,
        handoff: HandoffIndices,
        policy: ExitPolicy,
    ) -> io::Result<TaskHandle> {
        let (dispatched, handle) = dispatch(task, &self.memory, ContextKind::BackgroundWorker)?;
        let worker = spawn_paired_worker(
            PairedWorkerStart {
                module: self.module.clone(),
                memory: self.memory.clone(),
                handoff,
                task: dispatched,
            },
            &self.config,
            policy,
        )?;
        Ok(self.track(handle, worker))
    }

    /// Reclaim parked contexts whose task is terminal and join released ones.
    /// Returns the number of contexts joined.
    pub fn reap(&mut self) -> io::Result<usize> {
        let mut reaped = 0;
        let mut i = 0;
        while i < self.contexts.len() {
            let ctx = &self.contexts[i];
            if ctx.task.is_finished() && ctx.worker.state() == ContextState::Idle {
                ctx.worker.reclaim();
            }
            if ctx.worker.is_released() {
                let ctx = self.contexts.swap_remove(i);
                ctx.worker.join()?;
                reaped += 1;
            } else {
                i += 1;
            }
        }
        Ok(reaped)
    }

    /// Wait for every outstanding task, then release and join its context.
    ///
    /// Every context is reclaimed before anything is waited on, so a timeout
    /// on one still lets the others release. Returns the first error.
    pub fn shutdown(&mut self, timeout: Duration) -> io::Result<()> {
        for ctx in &self.contexts {
            ctx.worker.reclaim();
        }
        let mut first_err = None;
        for mut ctx in self.contexts.drain(..) {
            let result = ctx
                .task
                .wait_timeout(timeout)
                .and_then(|_| ctx.worker.join_timeout(timeout));
            if let Err(e) = result {
                log::warn!("controller shutdown: {}: {e}", ctx.task.id());
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("memory", &self.memory)
            .field("config", &self.config)
            .field("live", &self.contexts.len())
            .finish()
    }
}
