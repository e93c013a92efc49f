// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Best-effort realtime scheduling for the render thread.

/// Nominal period of one quantum in nanoseconds.
pub fn audio_period_ns(sample_rate: u32, frames_per_quantum: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    u64::from(frames_per_quantum) * 1_000_000_000 / u64::from(sample_rate)
}

/// Raise the calling thread to a realtime class suited to a callback every
/// `period_ns`. The thread may use up to half the period per quantum.
///
/// Returns `false` when the platform refuses (missing privileges) or has no
/// such class; the caller keeps running at normal priority.
pub fn promote_current_thread(period_ns: u64) -> bool {
    #[cfg(target_os = "macos")]
    {
        time_constraint(period_ns, period_ns / 2, period_ns)
    }
    #[cfg(target_os = "linux")]
    {
        let _ = period_ns;
        fifo()
    }
    #[cfg(windows)]
    {
        let _ = period_ns;
        time_critical()
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
    {
        let _ = period_ns;
        false
    }
}

// macOS: Mach time-constraint policy, expressed in absolute time units.
#[cfg(target_os = "macos")]
fn time_constraint(period_ns: u64, computation_ns: u64, constraint_ns: u64) -> bool {
    #[repr(C)]
    struct Timebase {
        numer: u32,
        denom: u32,
    }

    #[repr(C)]
    struct TimeConstraintPolicy {
        period: u32,
        computation: u32,
        constraint: u32,
        preemptible: i32,
    }

    extern "C" {
        fn mach_timebase_info(info: *mut Timebase) -> i32;
        fn pthread_mach_thread_np(thread: libc::pthread_t) -> u32;
        fn thread_policy_set(thread: u32, flavor: u32, policy_info: *const u32, count: u32) -> i32;
    }

    const THREAD_TIME_CONSTRAINT_POLICY: u32 = 2;
    const THREAD_TIME_CONSTRAINT_POLICY_COUNT: u32 = 4;

    let mut tb = Timebase { numer: 0, denom: 0 };
    unsafe { mach_timebase_info(&mut tb) };
    if tb.numer == 0 || tb.denom == 0 {
        return false;
    }
    let abs = |ns: u64| (ns * u64::from(tb.denom) / u64::from(tb.numer)) as u32;

    let policy = TimeConstraintPolicy {
        period: abs(period_ns),
        computation: abs(computation_ns),
        constraint: abs(constraint_ns),
        preemptible: 1,
    };
    let kr = unsafe {
        thread_policy_set(
            pthread_mach_thread_np(libc::pthread_self()),
            THREAD_TIME_CONSTRAINT_POLICY,
            &policy as *const TimeConstraintPolicy as *const u32,
            THREAD_TIME_CONSTRAINT_POLICY_COUNT,
        )
    };
    kr == 0
}

// Linux: SCHED_FIFO, needs CAP_SYS_NICE or an rtprio limit.
#[cfg(target_os = "linux")]
fn fifo() -> bool {
    let param = libc::sched_param { sched_priority: 80 };
    unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) == 0 }
}

#[cfg(windows)]
fn time_critical() -> bool {
    use windows_sys::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
    };
    unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL) != 0 }
}
