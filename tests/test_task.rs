// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Task lifecycle: dispatch, run, completion visibility and abandonment.

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use libhandoff::task::{COMPLETION_ABANDONED, COMPLETION_DONE, COMPLETION_PENDING};
use libhandoff::{
    dispatch, reply_channel, ContextKind, ImageConfig, LocalSignal, SharedMemory, Task,
    TaskOutcome, TaskState,
};

fn image() -> SharedMemory {
    SharedMemory::new(ImageConfig {
        signal_slots: 8,
        user_bytes: 64,
    })
    .expect("image")
}

// A dispatched task is pending with a zeroed completion cell.
#[test]
fn dispatch_starts_pending() {
    let mem = image();
    let (dispatched, handle) =
        dispatch(Task::new(|_| Ok(())), &mem, ContextKind::BackgroundWorker).expect("dispatch");

    assert_eq!(handle.poll(), TaskState::Pending);
    assert!(!handle.is_finished());
    assert_eq!(dispatched.completion_index(), handle.completion_index());
    assert_eq!(mem.signal(handle.completion_index()).load(), COMPLETION_PENDING);
    assert_eq!(dispatched.target(), ContextKind::BackgroundWorker);
    assert_eq!(dispatched.id(), handle.id());
}

// Running the task flips the cell to 1; later waits return at once.
#[test]
fn run_completes_and_stays_completed() {
    let mem = image();
    let (dispatched, handle) =
        dispatch(Task::new(|_| Ok(())), &mem, ContextKind::BackgroundWorker).expect("dispatch");

    assert_eq!(dispatched.run(&mem), TaskOutcome::Completed);
    assert_eq!(mem.signal(handle.completion_index()).load(), COMPLETION_DONE);
    assert_eq!(handle.poll(), TaskState::Completed);

    let start = Instant::now();
    for _ in 0..3 {
        assert_eq!(handle.wait(), TaskOutcome::Completed);
    }
    assert!(start.elapsed() < Duration::from_secs(1));
}

// A failing or panicking entry point still completes the task.
#[test]
fn failures_still_complete() {
    let mem = image();

    let (failing, h1) = dispatch(
        Task::new(|_| Err(io::Error::new(io::ErrorKind::Other, "task failed"))),
        &mem,
        ContextKind::BackgroundWorker,
    )
    .expect("dispatch");
    assert_eq!(failing.run(&mem), TaskOutcome::Completed);
    assert_eq!(h1.poll(), TaskState::Completed);

    let (panicking, h2) = dispatch(
        Task::new(|_| panic!("task exploded")),
        &mem,
        ContextKind::BackgroundWorker,
    )
    .expect("dispatch");
    assert_eq!(panicking.run(&mem), TaskOutcome::Completed);
    assert_eq!(h2.poll(), TaskState::Completed);
}

// A thread blocked on completion is woken when the task finishes elsewhere.
#[test]
fn blocked_waiter_is_woken() {
    let mem = image();
    let (dispatched, handle) =
        dispatch(Task::new(|_| Ok(())), &mem, ContextKind::BackgroundWorker).expect("dispatch");

    let waiter = {
        let handle = handle.clone();
        thread::spawn(move || handle.wait())
    };
    thread::sleep(Duration::from_millis(30));
    let runner = {
        let mem = mem.clone();
        thread::spawn(move || dispatched.run(&mem))
    };

    assert_eq!(runner.join().unwrap(), TaskOutcome::Completed);
    assert_eq!(waiter.join().unwrap(), TaskOutcome::Completed);
}

// Running is observable while the entry point is inside.
#[test]
fn running_state_is_visible() {
    let mem = image();
    let release = LocalSignal::new(0);
    let entered = LocalSignal::new(0);
    let task = {
        let (release, entered) = (release.clone(), entered.clone());
        Task::new(move |_| {
            entered.set(1);
            release.wait(0);
            Ok(())
        })
    };
    let (dispatched, handle) =
        dispatch(task, &mem, ContextKind::BackgroundWorker).expect("dispatch");

    let runner = {
        let mem = mem.clone();
        thread::spawn(move || dispatched.run(&mem))
    };
    entered.wait(0);
    assert_eq!(handle.poll(), TaskState::Running);
    release.set(1);
    runner.join().unwrap();
    assert_eq!(handle.poll(), TaskState::Completed);
}

// A task that never reaches a context ends up abandoned instead of pending.
#[test]
fn dropped_or_abandoned_task_is_abandoned() {
    let mem = image();
    let (dropped, h1) =
        dispatch(Task::new(|_| Ok(())), &mem, ContextKind::BackgroundWorker).expect("dispatch");
    drop(dropped);
    assert_eq!(h1.wait(), TaskOutcome::Abandoned);
    assert_eq!(mem.signal(h1.completion_index()).load(), COMPLETION_ABANDONED);

    let (abandoned, h2) =
        dispatch(Task::new(|_| Ok(())), &mem, ContextKind::BackgroundWorker).expect("dispatch");
    abandoned.abandon();
    assert_eq!(h2.poll(), TaskState::Abandoned);
}

// Payload goes in, a reply comes back over the reply port.
#[test]
fn payload_and_reply() {
    let mem = image();
    let (reply, replies) = reply_channel();
    let task = Task::new(|mut input| {
        let n: u32 = input.take_payload().expect("payload");
        assert!(input.reply(n * 2));
        Ok(())
    })
    .with_payload(21u32)
    .with_reply(reply);
    let (dispatched, _handle) =
        dispatch(task, &mem, ContextKind::BackgroundWorker).expect("dispatch");
    dispatched.run(&mem);

    let answer = replies
        .recv_timeout(Duration::from_secs(1))
        .expect("reply")
        .downcast::<u32>()
        .expect("u32");
    assert_eq!(answer, 42);
}

// The completion slot returns to the image once both sides let go.
#[test]
fn completion_slot_released_after_both_sides_drop() {
    let mem = image();
    let free = mem.free_signals();
    let (dispatched, handle) =
        dispatch(Task::new(|_| Ok(())), &mem, ContextKind::BackgroundWorker).expect("dispatch");
    assert_eq!(mem.free_signals(), free - 1);

    dispatched.run(&mem);
    assert_eq!(mem.free_signals(), free - 1);
    drop(handle);
    assert_eq!(mem.free_signals(), free);
}

#[test]
fn wait_timeout_on_pending_task() {
    let mem = image();
    let (_dispatched, handle) =
        dispatch(Task::new(|_| Ok(())), &mem, ContextKind::BackgroundWorker).expect("dispatch");
    let err = handle.wait_timeout(Duration::from_millis(20)).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
}

#[test]
fn task_ids_are_unique() {
    let a = Task::new(|_| Ok(()));
    let b = Task::new(|_| Ok(()));
    assert_ne!(a.id(), b.id());
    assert!(b.id() > a.id());
}
