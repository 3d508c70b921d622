// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodic wait and statistics (C5).
//!
//! Ported from `rtapi_wait` in both `original_source/rtapi/linux_rtapi.c`
//! and `rt-preempt.c`, with one deliberate deviation: both original files
//! compare `now` against the **already-advanced** `next_wake` when deciding
//! whether a deadline was missed, which can never be true and is flagged in
//! the spec as almost certainly a bug. This module compares against the
//! **pre-advance** deadline instead — the one the task just slept for — by
//! checking whether `wait()` was even *entered* late, before the absolute
//! sleep (which then returns immediately if so).

use std::sync::atomic::Ordering;

use crate::arch;
use crate::time::Timestamp;

use super::worker::{self, TaskContext, TaskExit};
use super::{ExceptionKind, TaskStats};

/// Blocks until the task's next period boundary, then advances to the
/// following one. Must be called from a task's own worker thread (bound via
/// a one-shot thread-local set by the worker before the task's entry runs)
/// — never pass another task's identity in.
///
/// If the task has been marked for deletion (via `task_stop`), this
/// terminates the calling thread instead of returning: no further
/// statements in the task body execute.
pub fn wait() {
    let ctx = worker::CURRENT.with(|c| c.borrow().clone());
    let Some(ctx) = ctx else {
        tracing::error!("wait() called from a thread with no task bound");
        return;
    };

    maybe_exit(&ctx);

    let deadline = Timestamp::from(ctx.task.next_wake.load(Ordering::Relaxed));
    let entered_late = Timestamp::now() > deadline;

    sleep_until(&ctx.task, deadline);

    let now = Timestamp::now();

    let period = ctx.task.period_ns.load(Ordering::Relaxed);
    let mut next = deadline;
    while u64::from(next) <= u64::from(now) {
        next = next.add_nanos(period.max(1));
    }
    ctx.task.next_wake.store(u64::from(next), Ordering::Relaxed);

    // Stats must be refreshed before the exception handler runs below, so a
    // handler invoked for this cycle's miss sees this cycle's rusage, not
    // the previous one's.
    update_stats(&ctx);

    if entered_late {
        record_missed_deadline(&ctx);
    }

    for _ in 0..arch::take_deadline_overrun_count() {
        dispatch(&ctx, ExceptionKind::RuntimeOverrun);
    }

    maybe_exit(&ctx);
}

fn maybe_exit(ctx: &TaskContext) {
    if ctx.task.deleted.load(Ordering::Acquire) {
        std::panic::panic_any(TaskExit);
    }
}

fn record_missed_deadline(ctx: &TaskContext) {
    let count = ctx.task.missed_deadlines.fetch_add(1, Ordering::Relaxed) + 1;
    // Decaying severity: the first miss is worth a loud message, the next
    // few are worth a warning, and a task stuck missing every period isn't
    // worth repeating at any volume past that.
    match count {
        1 => tracing::error!(task = ctx.task.id.0, count, "task missed its deadline"),
        2..=9 => tracing::warn!(task = ctx.task.id.0, count, "task missed its deadline"),
        _ => {}
    }
    dispatch(ctx, ExceptionKind::DeadlineMissed);
}

fn dispatch(ctx: &TaskContext, kind: ExceptionKind) {
    if cfg!(feature = "simulator") {
        return;
    }
    if let Some(handler) = &ctx.exception_handler {
        let stats = ctx.task.stats();
        handler.handle(kind, ctx.task.id, &stats);
    }
}

fn update_stats(ctx: &TaskContext) {
    let usage = worker::full_thread_rusage();
    let (base_minor, base_major) = ctx.task.pagefault_baseline();
    let stats = TaskStats {
        user_time_us: usage.ru_utime.tv_sec as i64 * 1_000_000
            + usage.ru_utime.tv_usec as i64,
        system_time_us: usage.ru_stime.tv_sec as i64 * 1_000_000
            + usage.ru_stime.tv_usec as i64,
        minor_faults: usage.ru_minflt as i64 - base_minor,
        major_faults: usage.ru_majflt as i64 - base_major,
        voluntary_context_switches: usage.ru_nvcsw as i64,
        involuntary_context_switches: usage.ru_nivcsw as i64,
        signals_received: usage.ru_nsignals as i64,
        missed_deadlines: ctx.task.missed_deadlines.load(Ordering::Relaxed),
    };
    ctx.task.update_stats(stats);
}

fn sleep_until(task: &super::Task, deadline: Timestamp) {
    if task.deadline_scheduling.load(Ordering::Relaxed) {
        arch::wait_for_deadline_interval();
        return;
    }

    let ts: libc::timespec = deadline.into();
    loop {
        // SAFETY: `ts` is a valid absolute timespec; a null remain pointer
        // is allowed for TIMER_ABSTIME sleeps.
        let rc = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };
        if rc != libc::EINTR {
            break;
        }
    }
}

/// Nanoseconds since an arbitrary, unspecified epoch, read from
/// `CLOCK_MONOTONIC`.
pub fn get_time() -> u64 {
    Timestamp::now().into()
}

/// Rebaselines the calling task's page-fault counters to the current
/// `RUSAGE_THREAD` snapshot. No-op (with a log line) if called from a
/// thread with no bound task.
pub fn reset_pagefault_count() {
    let ctx = worker::CURRENT.with(|c| c.borrow().clone());
    match ctx {
        Some(ctx) => {
            let (minor, major) = worker::thread_rusage();
            ctx.task.reset_pagefault_baseline(minor, major);
        }
        None => {
            tracing::error!(
                "reset_pagefault_count() called from a thread with no task bound"
            );
        }
    }
}

/// Page faults (minor + major) accumulated by the calling task's thread
/// since the last [`reset_pagefault_count`]. A sample that reads below the
/// baseline (a counter reset, or two baselines racing) is logged and
/// reported as zero rather than returned as a negative count.
pub fn get_pagefault_count() -> i64 {
    let ctx = worker::CURRENT.with(|c| c.borrow().clone());
    match ctx {
        Some(ctx) => {
            let (minor, major) = worker::thread_rusage();
            let (base_minor, base_major) = ctx.task.pagefault_baseline();
            let delta = (minor - base_minor) + (major - base_major);
            if delta < 0 {
                tracing::warn!(
                    task = ctx.task.id.0,
                    minor,
                    major,
                    base_minor,
                    base_major,
                    "pagefault count below baseline, reporting zero"
                );
                0
            } else {
                delta
            }
        }
        None => {
            tracing::error!(
                "get_pagefault_count() called from a thread with no task bound"
            );
            0
        }
    }
}
