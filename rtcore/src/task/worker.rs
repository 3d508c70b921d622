// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The realtime worker thread (C4).
//!
//! Ported from `realtime_thread` in
//! `original_source/rtapi/linux_rtapi.c`: name the thread, reset the
//! page-fault baseline, clamp the period against the clock tick, pin
//! affinity, negotiate scheduling priority, seed the first deadline, signal
//! the init barrier, then hand control to the task body.
//!
//! `std::thread::Builder` cannot give a worker a caller-owned, pre-allocated
//! stack (only a requested size), so this module talks to `pthread_create`
//! directly, the same way the original C code does. The stack buffer itself
//! is allocated by `task_new` (`Task::stack`), not here — this module only
//! borrows its address for `pthread_attr_setstack`.

use std::cell::RefCell;
use std::os::raw::c_void;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};

use crate::arch::{self, PriorityOutcome};
use crate::err::RtError;
use crate::time::Timestamp;

use super::{ExceptionHandler, Task, TaskId, TaskState, ThreadHandle};

/// Panic payload used to unwind a task's worker thread cleanly once its
/// entry must not continue — the idiomatic Rust stand-in for `pthread_exit`:
/// a one-shot, deliberate unwind caught at the thread's own root, never
/// treated as a reportable failure.
pub(crate) struct TaskExit;

pub(crate) struct TaskContext {
    pub(crate) task: Arc<Task>,
    pub(crate) exception_handler: Option<Arc<dyn ExceptionHandler>>,
}

thread_local! {
    pub(crate) static CURRENT: RefCell<Option<Arc<TaskContext>>> = RefCell::new(None);
}

struct WorkerArgs {
    task: Arc<Task>,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
    barrier: Arc<Barrier>,
    entry: Box<dyn FnOnce() + Send + 'static>,
    clock_tick_ns: u64,
}

impl crate::RtCore {
    /// Starts the worker thread for a previously admitted task, requesting
    /// `period_ns` (clamped up to the clock tick). Blocks until the worker
    /// has completed its init handshake (affinity + priority negotiation),
    /// then returns `Ok(())` or `WorkerInitFailed` if any of those steps
    /// failed — matching the two-party, startup-only barrier in the
    /// concurrency model.
    pub fn task_start(&self, id: TaskId, period_ns: u64) -> Result<(), RtError> {
        let task = self.task_for(id)?;
        let tick = self.clock_period_ns.load(Ordering::Relaxed);
        let period = period_ns.max(tick);
        task.period_ns.store(period, Ordering::Relaxed);

        let entry = task.take_entry().ok_or(RtError::InvalidHandle)?;
        let barrier = Arc::new(Barrier::new(2));
        let args = Box::new(WorkerArgs {
            task: task.clone(),
            exception_handler: self.exception_handler.clone(),
            barrier: barrier.clone(),
            entry,
            clock_tick_ns: tick,
        });
        let raw = Box::into_raw(args) as *mut c_void;

        // The stack was allocated at admission time (`task_new`); it stays
        // owned by `task` (so `task_delete` can free it after the join)
        // rather than moving into the thread handle.
        let (stack_ptr, stack_size) = task
            .stack_ptr_and_len()
            .expect("task_new always allocates a stack before a slot exists");
        let stack_ptr = stack_ptr as *mut c_void;

        let mut native: libc::pthread_t = unsafe { std::mem::zeroed() };
        // SAFETY: `attr` is initialized before use and destroyed on every
        // path; `task`'s stack buffer outlives the thread regardless of
        // outcome, since only `task_delete` (after the join) ever frees it.
        let create_rc = unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            libc::pthread_attr_init(&mut attr);
            let stack_rc =
                libc::pthread_attr_setstack(&mut attr, stack_ptr, stack_size);
            let rc = if stack_rc == 0 {
                libc::pthread_create(&mut native, &attr, trampoline, raw)
            } else {
                stack_rc
            };
            libc::pthread_attr_destroy(&mut attr);
            rc
        };

        if create_rc != 0 {
            // SAFETY: the thread never started, so we still own `raw`.
            unsafe {
                drop(Box::from_raw(raw as *mut WorkerArgs));
            }
            return Err(RtError::WorkerInitFailed);
        }

        task.set_thread(ThreadHandle { native });

        barrier.wait();

        if task.init_failed() {
            return Err(RtError::WorkerInitFailed);
        }
        task.set_state(TaskState::Running);
        Ok(())
    }
}

extern "C" fn trampoline(arg: *mut c_void) -> *mut c_void {
    // SAFETY: `arg` was produced by `Box::into_raw` above and is only ever
    // passed to this function once, by `pthread_create`.
    let args = unsafe { Box::from_raw(arg as *mut WorkerArgs) };
    worker_body(*args);
    std::ptr::null_mut()
}

fn worker_body(args: WorkerArgs) {
    let WorkerArgs {
        task,
        exception_handler,
        barrier,
        entry,
        clock_tick_ns,
    } = args;

    arch::set_thread_name(&task.display_name());

    let baseline = thread_rusage();
    task.reset_pagefault_baseline(baseline.0, baseline.1);

    let period = task.period_ns.load(Ordering::Relaxed).max(clock_tick_ns);
    task.period_ns.store(period, Ordering::Relaxed);

    let native = unsafe { libc::pthread_self() };
    let mut init_ok = arch::set_affinity(native, task.cpu).is_ok();

    let mut outcome = None;
    if init_ok {
        match arch::elevate_priority(native, task.requested_priority.get(), period) {
            Ok(o) => outcome = Some(o),
            Err(_) => init_ok = false,
        }
    }
    let deadline_scheduling = matches!(outcome, Some(PriorityOutcome::Deadline));
    task.deadline_scheduling
        .store(deadline_scheduling, Ordering::Relaxed);
    if deadline_scheduling {
        arch::install_deadline_signal_handler();
    }
    task.set_init_failed(!init_ok);

    let start = Timestamp::now();
    task.next_wake
        .store(u64::from(start.add_nanos(period)), Ordering::Relaxed);

    barrier.wait();

    if !init_ok {
        tracing::error!(task = task.id.0, "worker init failed before entry ran");
        return;
    }

    CURRENT.with(|c| {
        *c.borrow_mut() = Some(Arc::new(TaskContext {
            task: task.clone(),
            exception_handler,
        }));
    });

    tracing::debug!(task = task.id.0, period, "task entry starting");

    let result = std::panic::catch_unwind(AssertUnwindSafe(entry));
    match result {
        Ok(()) => {
            tracing::warn!(task = task.id.0, "task entry returned unexpectedly");
        }
        Err(payload) => {
            if payload.downcast_ref::<TaskExit>().is_none() {
                tracing::error!(task = task.id.0, "task entry panicked");
            }
        }
    }
    task.mark_deleted();
}

/// `(minor, major)` page faults for the calling thread, via
/// `getrusage(RUSAGE_THREAD, ...)`.
pub(crate) fn thread_rusage() -> (i64, i64) {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: `usage` is a valid out-pointer; RUSAGE_THREAD is Linux-only
    // but that's this crate's only target.
    unsafe {
        libc::getrusage(libc::RUSAGE_THREAD, &mut usage);
    }
    (usage.ru_minflt as i64, usage.ru_majflt as i64)
}

pub(crate) fn full_thread_rusage() -> libc::rusage {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    unsafe {
        libc::getrusage(libc::RUSAGE_THREAD, &mut usage);
    }
    usage
}
