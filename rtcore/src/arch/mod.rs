// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backend selection.
//!
//! Mirrors the teacher's `arch` module: a thin, mostly-`unsafe` layer behind
//! a small stable call surface, selected at compile time. Here the split is
//! between the `realtime` flavor (full scheduling elevation) and the
//! `simulator` flavor (same affinity pinning, no priority elevation, no
//! exception dispatch), instead of between instruction sets.

cfg_if::cfg_if! {
    if #[cfg(feature = "simulator")] {
        mod sim;
        pub(crate) use sim::{
            elevate_priority, install_deadline_signal_handler,
            take_deadline_overrun_count,
        };
    } else {
        mod real;
        pub(crate) use real::{
            elevate_priority, install_deadline_signal_handler,
            take_deadline_overrun_count,
        };
    }
}

use crate::err::RtError;

/// What scheduling discipline a worker thread ended up under, for logging
/// and for the exception handler to report alongside a miss.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PriorityOutcome {
    /// Running under `SCHED_DEADLINE` with the given runtime/period/deadline
    /// already configured by the kernel.
    Deadline,
    /// Running under `SCHED_FIFO` at the given priority — either because
    /// DEADLINE isn't attempted on this architecture, or the DEADLINE
    /// request failed and this is the mandated fallback.
    Fifo(i32),
    /// The simulator flavor: priority was never touched.
    NotElevated,
}

/// Pins the calling thread (identified by `native`) to `cpu` if given,
/// otherwise reads the thread's current CPU-allowed set and pins it to the
/// highest-numbered CPU in it — mirroring `realtime_set_affinity`'s
/// `for (cpu_nr = CPU_SETSIZE-1; ...)` scan in
/// `original_source/rtapi/linux_rtapi.c`. Shared between both flavors — the
/// spec applies affinity pinning regardless of delivery flavor.
pub(crate) fn set_affinity(
    native: libc::pthread_t,
    cpu: Option<u32>,
) -> Result<(), RtError> {
    let cpu = match cpu {
        Some(cpu) => cpu,
        None => highest_allowed_cpu(native)?,
    };
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
        let rc = libc::pthread_setaffinity_np(
            native,
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if rc != 0 {
            return Err(RtError::WorkerInitFailed);
        }
    }
    Ok(())
}

/// The highest-numbered CPU in `native`'s current allowed set.
fn highest_allowed_cpu(native: libc::pthread_t) -> Result<u32, RtError> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        let rc = libc::pthread_getaffinity_np(
            native,
            std::mem::size_of::<libc::cpu_set_t>(),
            &mut set,
        );
        if rc != 0 {
            return Err(RtError::WorkerInitFailed);
        }
        for cpu in (0..libc::CPU_SETSIZE as usize).rev() {
            if libc::CPU_ISSET(cpu, &set) {
                return Ok(cpu as u32);
            }
        }
    }
    Err(RtError::WorkerInitFailed)
}

/// Architectures on which `SCHED_DEADLINE` (via the raw `sched_setattr`
/// syscall) is attempted at all. `sched_setattr`'s syscall number is not
/// portable, so outside of these two this crate goes straight to
/// `SCHED_FIFO`, which is the spec-mandated fallback everywhere.
pub(crate) fn deadline_syscall_number() -> Option<libc::c_long> {
    #[cfg(target_arch = "x86_64")]
    {
        Some(314)
    }
    #[cfg(target_arch = "aarch64")]
    {
        Some(274)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        None
    }
}

/// Blocks until the kernel replenishes the calling thread's `SCHED_DEADLINE`
/// runtime budget at the start of its next period — the modern-kernel
/// equivalent of the `sched_wait_interval` syscall
/// `original_source/rtapi/linux_rtapi.c` calls when `deadline_scheduling` is
/// set (that syscall number was never merged upstream; `sched_yield()` is
/// the mainline mechanism a `SCHED_DEADLINE` thread uses to tell the
/// scheduler "done for this instance, wake me at the next one").
pub(crate) fn wait_for_deadline_interval() {
    unsafe {
        libc::sched_yield();
    }
}

/// Truncates a thread name to `TASK_COMM_LEN - 1` (15) bytes, matching
/// `prctl(PR_SET_NAME, ...)`'s limit, and names the current thread.
pub(crate) fn set_thread_name(name: &str) {
    const TASK_COMM_LEN: usize = 16;
    let mut bytes: Vec<u8> = name.as_bytes().iter().copied().take(TASK_COMM_LEN - 1).collect();
    bytes.push(0);
    // SAFETY: `bytes` is NUL-terminated and PR_SET_NAME only reads it.
    unsafe {
        libc::prctl(libc::PR_SET_NAME, bytes.as_ptr(), 0, 0, 0);
    }
}
