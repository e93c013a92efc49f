// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage: demo_image_attach [name]
//
// The parent creates a named image (it is the first to map it, so it runs
// the one-time setup), leases a signal, and starts itself again as a child.
// The child attaches as a follower, reads what the setup wrote, and flips
// the leased signal; the parent is blocked on that signal until it does.

use std::process::Command;
use std::time::Duration;

use libhandoff::{ImageConfig, SharedMemory, SignalIndex};

const GREETING: &[u8] = b"image ready";

fn parent(name: &str) {
    SharedMemory::clear_storage(name);
    let memory = SharedMemory::open_named_with(name, ImageConfig::default(), |m| {
        println!("demo[parent]: running one-time setup");
        m.write_user(0, GREETING)
    })
    .expect("open image");
    println!("demo[parent]: attached to '{name}' ({} handles)", memory.attached());

    let lease = memory.alloc_signal().expect("signal");
    let signal = lease.signal();
    println!("demo[parent]: leased signal {}", lease.index());

    let exe = std::env::current_exe().expect("current exe");
    let mut child = Command::new(exe)
        .arg("child")
        .arg(name)
        .arg(lease.index().get().to_string())
        .spawn()
        .expect("spawn child");

    if signal.wait_timeout(0, Duration::from_secs(10)) {
        println!("demo[parent]: child answered with {}", signal.load());
    } else {
        println!("demo[parent]: no answer from child (timeout)");
    }
    let status = child.wait().expect("child wait");
    println!("demo[parent]: child exited with {status}");
}

fn child(name: &str, index: u32) {
    let memory = SharedMemory::open_named(name, ImageConfig::default()).expect("attach image");
    println!("demo[child]: attached to '{name}' ({} handles)", memory.attached());

    let mut buf = vec![0u8; GREETING.len()];
    memory.read_user(0, &mut buf).expect("read user region");
    println!("demo[child]: setup wrote {:?}", String::from_utf8_lossy(&buf));

    let signal = memory.signal(SignalIndex(index));
    signal.store(42);
    signal.notify();
    println!("demo[child]: signalled {}", signal.index());
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("child") if args.len() >= 4 => {
            let index = args[3].parse().expect("signal index");
            child(&args[2], index);
        }
        Some(name) => parent(name),
        None => parent("libhandoff_demo"),
    }
}
