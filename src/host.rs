// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Realtime host: one render thread that ticks every live processor once per
// quantum and constructs new processors between quanta. Stands in for the
// audio rendering thread of the environment.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bootstrap::{
    ModuleImage, PortMessage, PortSender, ProcessorStart, RegistrableProcessor, SimpleProcessor,
};
use crate::context::{ContextKind, ContextScope, QuantumScope};
use crate::handoff::{Handoff, HandoffIndices};
use crate::image::SharedMemory;
use crate::processor::{
    AudioProcessor, ParameterDescriptor, ProcessorOptions, ProcessorRegistry, Quantum,
};
use crate::rt_prio::{audio_period_ns, promote_current_thread};
use crate::signal::LocalSignal;
use crate::task::Dispatched;

const REGISTER_PENDING: i32 = 0;
const REGISTER_OK: i32 = 1;
const REGISTER_FAILED: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantumConfig {
    pub sample_rate: u32,
    pub frames_per_quantum: u32,
    /// Try to promote the render thread to a realtime scheduling class.
    pub realtime_priority: bool,
}

impl Default for QuantumConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            frames_per_quantum: 128,
            realtime_priority: false,
        }
    }
}

impl QuantumConfig {
    pub fn period(&self) -> Duration {
        Duration::from_nanos(audio_period_ns(self.sample_rate, self.frames_per_quantum))
    }
}

fn host_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "audio host render thread is gone")
}

fn lock_registry(registry: &Mutex<ProcessorRegistry>) -> io::Result<MutexGuard<'_, ProcessorRegistry>> {
    registry
        .lock()
        .map_err(|_| io::Error::other("processor registry poisoned"))
}

/// Reports the outcome of a registrable construction. Dropped unset (the
/// command never ran), it reports failure.
struct RegisteredFlag(LocalSignal);

impl RegisteredFlag {
    fn set(&self, ok: bool) {
        self.0.set(if ok { REGISTER_OK } else { REGISTER_FAILED });
    }
}

impl Drop for RegisteredFlag {
    fn drop(&mut self) {
        if self.0.load() == REGISTER_PENDING {
            self.0.set(REGISTER_FAILED);
        }
    }
}

enum Command {
    Construct {
        start: ProcessorStart,
        port: Option<mpsc::Receiver<PortMessage>>,
        done: Option<mpsc::Sender<io::Result<()>>>,
        registered: Option<RegisteredFlag>,
    },
    AddNode {
        name: String,
        options: ProcessorOptions,
        done: mpsc::Sender<io::Result<()>>,
    },
    Close,
}

enum Node {
    Simple(SimpleProcessor),
    Registrable(RegistrableProcessor),
    Custom {
        processor: Box<dyn AudioProcessor>,
        params: Vec<f32>,
    },
}

impl Node {
    fn render(&mut self, index: u64, sample_rate: u32, inputs: &[f32], outputs: &mut [f32]) -> bool {
        let (processor, params): (&mut dyn AudioProcessor, &[f32]) = match self {
            Node::Simple(p) => (p as &mut dyn AudioProcessor, &[][..]),
            Node::Registrable(p) => (p as &mut dyn AudioProcessor, &[][..]),
            Node::Custom { processor, params } => (processor.as_mut(), params.as_slice()),
        };
        let mut quantum = Quantum {
            index,
            sample_rate,
            inputs,
            outputs,
            params,
        };
        processor.process(&mut quantum)
    }
}

struct RenderLoop {
    config: QuantumConfig,
    commands: mpsc::Receiver<Command>,
    registry: Arc<Mutex<ProcessorRegistry>>,
    quanta: Arc<AtomicU64>,
    live: Arc<AtomicUsize>,
    nodes: Vec<Node>,
}

impl RenderLoop {
    fn construct(
        &mut self,
        start: ProcessorStart,
        port: Option<mpsc::Receiver<PortMessage>>,
    ) -> io::Result<()> {
        let node = match start {
            ProcessorStart::Simple {
                module,
                memory,
                task,
            } => Node::Simple(SimpleProcessor::construct(module, memory, task)?),
            ProcessorStart::Registrable {
                module,
                memory,
                stack_size,
                lock,
                registration,
            } => {
                let port = port.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "registrable processor needs a port")
                })?;
                let mut registry = lock_registry(&self.registry)?;
                Node::Registrable(RegistrableProcessor::construct(
                    module,
                    memory,
                    stack_size,
                    lock,
                    registration,
                    &mut registry,
                    port,
                )?)
            }
        };
        self.nodes.push(node);
        Ok(())
    }

    fn add_node(&mut self, name: &str, options: ProcessorOptions) -> io::Result<()> {
        let factory = lock_registry(&self.registry)?.factory(name)?;
        let params = factory
            .parameter_descriptors()
            .iter()
            .map(|d| d.default_value)
            .collect();
        let processor = factory.instantiate(options)?;
        self.nodes.push(Node::Custom { processor, params });
        Ok(())
    }

    /// Run pending commands. Returns `false` once the host is closing.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Construct {
                    start,
                    port,
                    done,
                    registered,
                }) => {
                    let result = self.construct(start, port);
                    if let Err(e) = &result {
                        log::error!("audio host: processor construction failed: {e}");
                    }
                    if let Some(flag) = registered {
                        flag.set(result.is_ok());
                    }
                    if let Some(done) = done {
                        let _ = done.send(result);
                    }
                }
                Ok(Command::AddNode {
                    name,
                    options,
                    done,
                }) => {
                    let _ = done.send(self.add_node(&name, options));
                }
                Ok(Command::Close) | Err(mpsc::TryRecvError::Disconnected) => return false,
                Err(mpsc::TryRecvError::Empty) => return true,
            }
        }
    }

    fn run(mut self) {
        let _scope = ContextScope::enter(ContextKind::RealtimeAudioProcessor);
        let period = self.config.period();
        if self.config.realtime_priority {
            let period_ns = audio_period_ns(self.config.sample_rate, self.config.frames_per_quantum);
            if !promote_current_thread(period_ns) {
                log::warn!("audio host: running without realtime priority");
            }
        }

        let frames = self.config.frames_per_quantum as usize;
        let inputs = vec![0.0f32; frames];
        let mut outputs = vec![0.0f32; frames];
        let mut next_wake = Instant::now();

        while self.drain_commands() {
            for node in &mut self.nodes {
                if let Node::Registrable(p) = node {
                    p.service();
                }
            }
            self.live.store(self.nodes.len(), Ordering::Release);

            let index = self.quanta.load(Ordering::Relaxed);
            let sample_rate = self.config.sample_rate;
            {
                let _quantum = QuantumScope::enter();
                self.nodes.retain_mut(|node| {
                    outputs.fill(0.0);
                    node.render(index, sample_rate, &inputs, &mut outputs)
                });
            }
            self.quanta.fetch_add(1, Ordering::AcqRel);
            self.live.store(self.nodes.len(), Ordering::Release);

            next_wake += period;
            let now = Instant::now();
            if next_wake > now {
                thread::sleep(next_wake - now);
            } else {
                next_wake = now;
            }
        }
        self.live.store(0, Ordering::Release);
        log::debug!("audio host: render loop stopped");
    }
}

/// Handle on a running realtime host.
pub struct AudioHost {
    config: QuantumConfig,
    commands: mpsc::Sender<Command>,
    thread: Option<JoinHandle<()>>,
    registry: Arc<Mutex<ProcessorRegistry>>,
    quanta: Arc<AtomicU64>,
    live: Arc<AtomicUsize>,
    registered: AtomicBool,
}

impl AudioHost {
    pub fn start(config: QuantumConfig) -> io::Result<Self> {
        if config.sample_rate == 0 || config.frames_per_quantum == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "quantum needs a non-zero sample rate and frame count",
            ));
        }
        let (tx, rx) = mpsc::channel();
        let registry = Arc::new(Mutex::new(ProcessorRegistry::new()));
        let quanta = Arc::new(AtomicU64::new(0));
        let live = Arc::new(AtomicUsize::new(0));

        let render = RenderLoop {
            config,
            commands: rx,
            registry: registry.clone(),
            quanta: quanta.clone(),
            live: live.clone(),
            nodes: Vec::new(),
        };
        let thread = thread::Builder::new()
            .name("libhandoff-render".into())
            .spawn(move || render.run())?;
        log::debug!(
            "audio host: started ({} Hz, {} frames)",
            config.sample_rate,
            config.frames_per_quantum
        );

        Ok(Self {
            config,
            commands: tx,
            thread: Some(thread),
            registry,
            quanta,
            live,
            registered: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> QuantumConfig {
        self.config
    }

    fn submit(&self, make: impl FnOnce(mpsc::Sender<io::Result<()>>) -> Command) -> io::Result<()> {
        let (done, result) = mpsc::channel();
        self.commands.send(make(done)).map_err(|_| host_closed())?;
        result.recv().map_err(|_| host_closed())?
    }

    /// Start the host's one registrable realtime context.
    ///
    /// Leases a handoff from `memory` and marks it held before the context
    /// exists, so paired workers started right away wait until the context
    /// has bound the module. Construction continues on the render thread;
    /// use [`RegisteredContext::wait_registered`] to observe it.
    pub fn register_thread<R>(
        &self,
        module: Arc<dyn ModuleImage>,
        memory: &SharedMemory,
        stack_size: Option<usize>,
        registration: R,
    ) -> io::Result<RegisteredContext>
    where
        R: FnOnce(&mut ProcessorRegistry) -> io::Result<()> + Send + 'static,
    {
        if self.registered.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "audio host already has a registered context",
            ));
        }

        let handoff = Handoff::allocate(memory)?;
        let lock = handoff.reserve_guarded();
        let (port, port_rx) = mpsc::channel();
        let registered = LocalSignal::new(REGISTER_PENDING);

        let command = Command::Construct {
            start: ProcessorStart::Registrable {
                module,
                memory: memory.clone(),
                stack_size,
                lock,
                registration: Box::new(registration),
            },
            port: Some(port_rx),
            done: None,
            registered: Some(RegisteredFlag(registered.clone())),
        };
        // A command that never runs frees the lock when it is dropped.
        if self.commands.send(command).is_err() {
            return Err(host_closed());
        }

        Ok(RegisteredContext {
            handoff,
            port,
            registered,
        })
    }

    /// Construct a processor that runs `task` once during construction.
    pub fn run_once(
        &self,
        module: Arc<dyn ModuleImage>,
        memory: &SharedMemory,
        task: Dispatched,
    ) -> io::Result<()> {
        let memory = memory.clone();
        self.submit(move |done| Command::Construct {
            start: ProcessorStart::Simple {
                module,
                memory,
                task,
            },
            port: None,
            done: Some(done),
            registered: None,
        })
    }

    /// Instantiate a registered processor by name and schedule it.
    pub fn add_node(&self, name: &str, options: ProcessorOptions) -> io::Result<()> {
        let name = name.to_owned();
        self.submit(move |done| Command::AddNode {
            name,
            options,
            done,
        })
    }

    pub fn parameter_descriptors(&self, name: &str) -> io::Result<Vec<ParameterDescriptor>> {
        lock_registry(&self.registry)?.parameter_descriptors(name)
    }

    /// Register a processor factory from the controller side.
    pub fn with_registry<T>(&self, f: impl FnOnce(&mut ProcessorRegistry) -> T) -> io::Result<T> {
        Ok(f(&mut *lock_registry(&self.registry)?))
    }

    /// Processors still asking for quanta.
    pub fn live_nodes(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Quanta rendered so far.
    pub fn quanta(&self) -> u64 {
        self.quanta.load(Ordering::Acquire)
    }

    /// Wait until no processor asks for quanta any more.
    pub fn wait_idle(&self, timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        // Let at least one full quantum pass so freshly queued commands land.
        let seen = self.quanta();
        while self.quanta() < seen + 2 || self.live_nodes() > 0 {
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} processors still live after {timeout:?}", self.live_nodes()),
                ));
            }
            if self.thread.as_ref().map_or(true, |t| t.is_finished()) {
                return Err(host_closed());
            }
            thread::sleep(self.config.period());
        }
        Ok(())
    }

    /// Stop the render thread and drop every processor.
    pub fn close(&mut self) -> io::Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let _ = self.commands.send(Command::Close);
        thread
            .join()
            .map_err(|_| io::Error::other("audio host render thread panicked"))
    }
}

impl Drop for AudioHost {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("audio host: {e}");
        }
    }
}

impl fmt::Debug for AudioHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioHost")
            .field("config", &self.config)
            .field("quanta", &self.quanta())
            .field("live_nodes", &self.live_nodes())
            .finish()
    }
}

/// Controller-side view of the host's registrable context.
#[derive(Debug)]
pub struct RegisteredContext {
    handoff: Handoff,
    port: PortSender,
    registered: LocalSignal,
}

impl RegisteredContext {
    /// Indices to hand to the paired background worker.
    pub fn handoff_indices(&self) -> HandoffIndices {
        self.handoff.indices()
    }

    pub fn handoff(&self) -> &Handoff {
        &self.handoff
    }

    pub fn port(&self) -> PortSender {
        self.port.clone()
    }

    pub fn send(&self, msg: PortMessage) -> io::Result<()> {
        self.port.send(msg).map_err(|_| host_closed())
    }

    /// Ask the context to stop without running anything.
    pub fn stop(&self) -> io::Result<()> {
        self.send(PortMessage::stop())
    }

    fn registration_result(&self) -> io::Result<()> {
        match self.registered.load() {
            REGISTER_OK => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "registrable context failed to construct",
            )),
        }
    }

    /// Block until the context has bound the module and registered.
    pub fn wait_registered(&self) -> io::Result<()> {
        self.registered.wait(REGISTER_PENDING);
        self.registration_result()
    }

    pub fn wait_registered_timeout(&self, timeout: Duration) -> io::Result<()> {
        if !self.registered.wait_timeout(REGISTER_PENDING, timeout) {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("context not registered after {timeout:?}"),
            ));
        }
        self.registration_result()
    }
}
