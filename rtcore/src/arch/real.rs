// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Privileged Linux backend: full scheduling elevation and exception
//! dispatch.
//!
//! Ported from `realtime_set_priority`/`deadline_exception` in
//! `original_source/rtapi/linux_rtapi.c`: attempt `SCHED_DEADLINE` via the
//! raw `sched_setattr` syscall on the architectures where its syscall number
//! is known, otherwise (or on failure) fall back to `SCHED_FIFO`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::err::RtError;

use super::PriorityOutcome;

const SCHED_DEADLINE: u32 = 6;

#[repr(C)]
struct SchedAttr {
    size: u32,
    sched_policy: u32,
    sched_flags: u64,
    sched_nice: i32,
    sched_priority: u32,
    sched_runtime: u64,
    sched_deadline: u64,
    sched_period: u64,
}

/// Attempts `SCHED_DEADLINE` first (only on architectures with a known
/// `sched_setattr` syscall number), then falls back to `SCHED_FIFO`.
pub(crate) fn elevate_priority(
    native: libc::pthread_t,
    priority: i32,
    period_ns: u64,
) -> Result<PriorityOutcome, RtError> {
    if let Some(nr) = super::deadline_syscall_number() {
        if try_deadline(nr, period_ns) {
            return Ok(PriorityOutcome::Deadline);
        }
    }
    fifo(native, priority)
}

/// A conservative runtime budget: half the period. The real rtapi leaves
/// this tunable; this crate picks a fixed fraction since nothing in the
/// spec's external interface exposes a separate runtime/period split.
fn try_deadline(nr: libc::c_long, period_ns: u64) -> bool {
    let attr = SchedAttr {
        size: std::mem::size_of::<SchedAttr>() as u32,
        sched_policy: SCHED_DEADLINE,
        sched_flags: 0,
        sched_nice: 0,
        sched_priority: 0,
        sched_runtime: period_ns / 2,
        sched_deadline: period_ns,
        sched_period: period_ns,
    };
    // SAFETY: `attr` is a valid, correctly-sized sched_attr; pid 0 means
    // "the calling thread", matching how the worker elevates itself.
    let rc = unsafe { libc::syscall(nr, 0i32, &attr as *const SchedAttr, 0u32) };
    rc == 0
}

fn fifo(
    native: libc::pthread_t,
    priority: i32,
) -> Result<PriorityOutcome, RtError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: `native` is the caller's own thread handle; `param` is valid.
    let rc = unsafe {
        libc::pthread_setschedparam(native, libc::SCHED_FIFO, &param)
    };
    if rc != 0 {
        return Err(RtError::WorkerInitFailed);
    }
    Ok(PriorityOutcome::Fifo(priority))
}

static DEADLINE_OVERRUN_COUNT: AtomicU64 = AtomicU64::new(0);

extern "C" fn handle_sigxcpu(_signum: libc::c_int) {
    // Signal-handler context: only async-signal-safe operations allowed.
    DEADLINE_OVERRUN_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Installs the `SIGXCPU` handler used to notice `SCHED_DEADLINE` runtime
/// overruns, matching `deadline_exception` in `linux_rtapi.c`.
pub(crate) fn install_deadline_signal_handler() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_sigxcpu as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGXCPU, &sa, std::ptr::null_mut());
    }
}

/// Drains the overrun count accumulated since the last call.
pub(crate) fn take_deadline_overrun_count() -> u64 {
    DEADLINE_OVERRUN_COUNT.swap(0, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_elevation_on_self_succeeds_or_reports_worker_init_failed() {
        let native = unsafe { libc::pthread_self() };
        match fifo(native, 1) {
            Ok(PriorityOutcome::Fifo(p)) => assert_eq!(p, 1),
            // Unprivileged CI/test environments commonly lack CAP_SYS_NICE.
            Err(RtError::WorkerInitFailed) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
