// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage: demo_paired_worker [idle_timeout_ms]
//
// Starts a realtime host, registers its context (which holds the occupancy
// lock until it has bound the module), and starts a paired background worker
// right away. The worker queues behind the lock, binds, runs its task and
// reports back. Then a task is handed to the realtime context over its port.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use libhandoff::{
    dispatch, reply_channel, AudioHost, ContextConfig, ContextKind, Controller, ExitPolicy,
    ImageConfig, ModuleImage, ParameterDescriptor, PortMessage, QuantumConfig, SharedMemory, Task,
};

/// Counts bindings so the output shows which context bound first.
struct CountingModule {
    binds: AtomicUsize,
}

impl ModuleImage for CountingModule {
    fn instantiate(&self, _memory: &SharedMemory, stack_size: Option<usize>) -> std::io::Result<()> {
        let n = self.binds.fetch_add(1, Ordering::SeqCst) + 1;
        let kind = libhandoff::context::current_kind()
            .map_or_else(|| "controller".to_owned(), |k| k.to_string());
        println!("demo[{kind}]: module bound (#{n}, stack={stack_size:?})");
        // Binding takes a while; long enough for the worker to queue up.
        thread::sleep(Duration::from_millis(50));
        Ok(())
    }
}

fn main() {
    let idle_timeout_ms: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    let memory = SharedMemory::new(ImageConfig::default()).expect("image");
    println!(
        "demo[controller]: image ready ({} cells, {} free signals)",
        memory.cell_count(),
        memory.free_signals()
    );

    let module = Arc::new(CountingModule {
        binds: AtomicUsize::new(0),
    });

    let mut host = AudioHost::start(QuantumConfig::default()).expect("audio host");
    let ctx = host
        .register_thread(module.clone(), &memory, Some(1 << 20), |registry| {
            registry.register_processor::<Gain>("gain")
        })
        .expect("register thread");
    println!("demo[controller]: realtime context queued, lock held={}", ctx.handoff().is_held());

    let config = ContextConfig::from_env().expect("context config");
    let mut controller = Controller::new(module, memory.clone(), config);
    let (reply, replies) = reply_channel();
    let worker_task = Task::new(|input| {
        println!("demo[worker]: running {}", input.id);
        input.reply(format!("hello from {}", input.id));
        Ok(())
    })
    .with_reply(reply);
    let handle = controller
        .spawn_paired(worker_task, ctx.handoff_indices(), ExitPolicy::SelfRelease)
        .expect("spawn paired");

    ctx.wait_registered().expect("registration");
    println!("demo[controller]: realtime context registered");

    let outcome = handle.wait();
    println!("demo[controller]: worker task {outcome:?}");
    if let Ok(p) = replies.recv_timeout(Duration::from_secs(1)) {
        if let Ok(text) = p.downcast::<String>() {
            println!("demo[controller]: reply {text:?}");
        }
    }

    let descriptors: Vec<ParameterDescriptor> =
        host.parameter_descriptors("gain").expect("descriptors");
    println!("demo[controller]: gain parameters {descriptors:?}");

    let (rt_task, rt_handle) = dispatch(
        Task::new(|input| {
            let n: u32 = input.payload.and_then(|p| p.downcast().ok()).unwrap_or(0);
            println!("demo[realtime]: running with payload {n}");
            Ok(())
        }),
        &memory,
        ContextKind::RealtimeAudioProcessor,
    )
    .expect("dispatch");
    ctx.send(PortMessage::run(rt_task).with_payload(7u32))
        .expect("port");
    println!("demo[controller]: realtime task {:?}", rt_handle.wait());

    host.wait_idle(Duration::from_millis(idle_timeout_ms))
        .expect("host idle");
    println!("demo[controller]: {} quanta rendered", host.quanta());

    controller.shutdown(Duration::from_secs(5)).expect("shutdown");
    host.close().expect("close");
    println!("demo[controller]: done, {} free signals", memory.free_signals());
}

/// Registered processor; scales silence, which is enough to show the plumbing.
struct Gain {
    level: f32,
}

impl libhandoff::AudioProcessor for Gain {
    fn process(&mut self, quantum: &mut libhandoff::Quantum<'_>) -> bool {
        let gain = quantum.params.first().copied().unwrap_or(self.level);
        for (out, inp) in quantum.outputs.iter_mut().zip(quantum.inputs) {
            *out = inp * gain;
        }
        true
    }
}

impl libhandoff::ExtendProcessor for Gain {
    type Data = f32;

    fn construct(data: Option<f32>) -> std::io::Result<Self> {
        Ok(Self {
            level: data.unwrap_or(1.0),
        })
    }

    fn parameter_descriptors() -> Vec<ParameterDescriptor> {
        vec![ParameterDescriptor::new("gain", 1.0).range(0.0, 2.0)]
    }
}
