// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Task lifecycle: Pending -> Running -> Completed, or Abandoned when the
// context failed before the entry point could run. Terminal state is
// reported through a completion cell leased from the shared image.

use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use crate::context::ContextKind;
use crate::image::{SharedMemory, SignalLease};
use crate::signal::{SharedSignal, SignalIndex};

pub const COMPLETION_PENDING: i32 = 0;
pub const COMPLETION_DONE: i32 = 1;
pub const COMPLETION_ABANDONED: i32 = 2;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Abandoned,
}

/// Terminal state as seen through the completion cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The entry point ran and returned (with or without an error).
    Completed,
    /// The entry point never ran.
    Abandoned,
}

impl TaskOutcome {
    fn from_raw(v: i32) -> Option<Self> {
        match v {
            COMPLETION_DONE => Some(Self::Completed),
            COMPLETION_ABANDONED => Some(Self::Abandoned),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload and reply port
// ---------------------------------------------------------------------------

/// Type-erased message value carried with a task or sent back on a reply port.
pub struct Payload(Box<dyn Any + Send>);

impl Payload {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Take the value out, or get the payload back if it holds another type.
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        self.0.downcast::<T>().map(|b| *b).map_err(Self)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Payload(..)")
    }
}

pub type ReplyPort = mpsc::Sender<Payload>;

pub fn reply_channel() -> (ReplyPort, mpsc::Receiver<Payload>) {
    mpsc::channel()
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// What the entry point receives inside the context.
pub struct TaskInput {
    pub id: TaskId,
    pub memory: SharedMemory,
    pub payload: Option<Payload>,
    pub reply: Option<ReplyPort>,
}

impl TaskInput {
    /// Take the payload as `T`. `None` if there is none or it holds another type.
    pub fn take_payload<T: Any>(&mut self) -> Option<T> {
        match self.payload.take()?.downcast::<T>() {
            Ok(v) => Some(v),
            Err(p) => {
                self.payload = Some(p);
                None
            }
        }
    }

    /// Send `value` on the reply port. Returns `false` when there is no port
    /// or the receiver is gone.
    pub fn reply<T: Any + Send>(&self, value: T) -> bool {
        self.reply
            .as_ref()
            .is_some_and(|port| port.send(Payload::new(value)).is_ok())
    }
}

type Entry = Box<dyn FnOnce(TaskInput) -> io::Result<()> + Send>;

/// One unit of work. Consumed exactly once by the context that runs it.
pub struct Task {
    id: TaskId,
    entry: Entry,
    payload: Option<Payload>,
    reply: Option<ReplyPort>,
}

impl Task {
    pub fn new<F>(entry: F) -> Self
    where
        F: FnOnce(TaskInput) -> io::Result<()> + Send + 'static,
    {
        Self {
            id: TaskId::next(),
            entry: Box::new(entry),
            payload: None,
            reply: None,
        }
    }

    pub fn with_payload<T: Any + Send>(mut self, value: T) -> Self {
        self.payload = Some(Payload::new(value));
        self
    }

    pub fn with_reply(mut self, port: ReplyPort) -> Self {
        self.reply = Some(port);
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Attach a payload and reply port delivered later, as on a realtime
    /// processor's port. Existing values are kept when the new ones are `None`.
    pub(crate) fn attach(&mut self, payload: Option<Payload>, reply: Option<ReplyPort>) {
        if payload.is_some() {
            self.payload = payload;
        }
        if reply.is_some() {
            self.reply = reply;
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("payload", &self.payload.is_some())
            .field("reply", &self.reply.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// The completion cell of one task. The slot goes back to the image when the
/// last clone (context side or controller side) is dropped.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    lease: Arc<SignalLease>,
}

impl CompletionSignal {
    fn new(lease: SignalLease) -> Self {
        Self {
            lease: Arc::new(lease),
        }
    }

    pub fn signal(&self) -> SharedSignal {
        self.lease.signal()
    }

    pub fn index(&self) -> SignalIndex {
        self.lease.index()
    }

    /// First terminal value wins; later calls only notify again.
    fn finish(&self, value: i32) {
        let signal = self.signal();
        let _ = signal.compare_exchange(COMPLETION_PENDING, value);
        signal.notify();
    }

    pub fn complete(&self) {
        self.finish(COMPLETION_DONE);
    }

    pub fn abandon(&self) {
        self.finish(COMPLETION_ABANDONED);
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        TaskOutcome::from_raw(self.signal().load())
    }

    /// Block until terminal. Returns at once when already terminal.
    pub fn wait(&self) -> TaskOutcome {
        let signal = self.signal();
        loop {
            signal.wait(COMPLETION_PENDING);
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        if self.signal().wait_timeout(COMPLETION_PENDING, timeout) {
            self.outcome()
        } else {
            None
        }
    }
}

/// Completes the task when dropped, whichever way the entry point exits.
struct CompletionGuard<'a>(&'a CompletionSignal);

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.0.complete();
    }
}

fn panic_message(p: &(dyn Any + Send)) -> &str {
    p.downcast_ref::<&str>()
        .copied()
        .or_else(|| p.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

/// A task bound to its completion cell, ready to be consumed by a context.
///
/// Dropping it unrun marks the task abandoned so the waiter is never stranded.
pub struct Dispatched {
    id: TaskId,
    task: Option<Task>,
    completion: CompletionSignal,
    target: ContextKind,
    running: Arc<AtomicBool>,
}

impl Dispatched {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn target(&self) -> ContextKind {
        self.target
    }

    pub fn completion_index(&self) -> SignalIndex {
        self.completion.index()
    }

    pub(crate) fn attach(&mut self, payload: Option<Payload>, reply: Option<ReplyPort>) {
        if let Some(task) = self.task.as_mut() {
            task.attach(payload, reply);
        }
    }

    /// Invoke the entry point and signal completion on every exit path.
    ///
    /// Errors and panics from the entry point stop here: they are logged and
    /// the task still completes. Carrying a failure value back is the job of
    /// the reply port.
    pub fn run(mut self, memory: &SharedMemory) -> TaskOutcome {
        let Some(task) = self.task.take() else {
            return TaskOutcome::Abandoned;
        };
        self.running.store(true, Ordering::Release);
        log::debug!("{}: running", self.id);

        let _guard = CompletionGuard(&self.completion);
        let input = TaskInput {
            id: task.id,
            memory: memory.clone(),
            payload: task.payload,
            reply: task.reply,
        };
        let entry = task.entry;
        match panic::catch_unwind(AssertUnwindSafe(move || entry(input))) {
            Ok(Ok(())) => log::debug!("{}: completed", self.id),
            Ok(Err(e)) => log::error!("{}: entry point failed: {e}", self.id),
            Err(p) => log::error!("{}: entry point panicked: {}", self.id, panic_message(&*p)),
        }
        TaskOutcome::Completed
    }

    /// Give up on the task without running it.
    pub fn abandon(mut self) {
        self.task = None;
        log::debug!("{}: abandoned", self.id);
        self.completion.abandon();
    }
}

impl Drop for Dispatched {
    fn drop(&mut self) {
        if self.task.take().is_some() {
            log::warn!("{}: dropped without running", self.id);
            self.completion.abandon();
        }
    }
}

impl fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatched")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("completion", &self.completion.index())
            .finish()
    }
}

/// Controller-side view of a dispatched task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    completion: CompletionSignal,
    running: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn completion_index(&self) -> SignalIndex {
        self.completion.index()
    }

    pub fn completion(&self) -> &CompletionSignal {
        &self.completion
    }

    /// Block until the task is terminal.
    pub fn wait(&self) -> TaskOutcome {
        self.completion.wait()
    }

    /// Stop waiting after `timeout`. The context keeps running regardless.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<TaskOutcome> {
        self.completion.wait_timeout(timeout).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} not finished after {timeout:?}", self.id),
            )
        })
    }

    pub fn poll(&self) -> TaskState {
        match self.completion.outcome() {
            Some(TaskOutcome::Completed) => TaskState::Completed,
            Some(TaskOutcome::Abandoned) => TaskState::Abandoned,
            None if self.running.load(Ordering::Acquire) => TaskState::Running,
            None => TaskState::Pending,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completion.outcome().is_some()
    }
}

/// Lease a completion cell (initial value 0) and split the task into the part
/// handed to the new context and the part the controller keeps.
pub fn dispatch(
    task: Task,
    memory: &SharedMemory,
    target: ContextKind,
) -> io::Result<(Dispatched, TaskHandle)> {
    let completion = CompletionSignal::new(memory.alloc_signal()?);
    let running = Arc::new(AtomicBool::new(false));
    let id = task.id;
    log::debug!(
        "{id}: dispatched to {target}, completion cell {}",
        completion.index()
    );
    let handle = TaskHandle {
        id,
        completion: completion.clone(),
        running: running.clone(),
    };
    Ok((
        Dispatched {
            id,
            task: Some(task),
            completion,
            target,
            running,
        },
        handle,
    ))
}
