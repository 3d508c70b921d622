// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end exercises of admission, the worker init handshake, periodic
//! wait, and teardown, driven entirely through the public API — no
//! fixed-up internal state, matching how a real caller would exercise the
//! crate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rtcore::{ExceptionKind, Priority, RtCore, TaskDescriptorSpec, TaskId, TaskStats};

fn admit(rt: &RtCore, entry: impl FnOnce() + Send + 'static) -> TaskId {
    let owner = rt.module_init(None).expect("module init");
    let spec = TaskDescriptorSpec {
        name: None,
        owner,
        priority: Priority::lowest(),
        stack_size: 256 * 1024,
        cpu: None,
        entry: Box::new(entry),
    };
    rt.task_new(spec).expect("task admission")
}

#[test]
fn task_runs_periodically_then_stops_cleanly() {
    let rt = RtCore::new();
    rt.clock_set_period(1_000_000).unwrap(); // 1ms tick

    let ticks = Arc::new(AtomicU64::new(0));
    let counted = ticks.clone();
    let id = admit(&rt, move || loop {
        rtcore::wait();
        counted.fetch_add(1, Ordering::Relaxed);
    });

    rt.task_start(id, 2_000_000).expect("task start"); // 2ms period

    std::thread::sleep(Duration::from_millis(50));

    rt.task_stop(id).expect("task stop");
    rt.task_delete(id).expect("task delete");

    // ~25 periods fit in 50ms at a 2ms period; the worker needed time to
    // come up, so require a handful rather than the theoretical maximum.
    assert!(
        ticks.load(Ordering::Relaxed) >= 5,
        "expected several periodic wakeups, saw {}",
        ticks.load(Ordering::Relaxed)
    );

    // The slot is freed: a second delete on the same id is now invalid.
    assert_eq!(rt.task_delete(id), Err(rtcore::RtError::InvalidHandle));
}

#[test]
fn task_admission_respects_max_tasks_capacity() {
    let rt = RtCore::new();
    let owner = rt.module_init(None).unwrap();

    let mut ids = Vec::new();
    loop {
        let spec = TaskDescriptorSpec {
            name: None,
            owner,
            priority: Priority::lowest(),
            stack_size: 64 * 1024,
            cpu: None,
            entry: Box::new(|| {}),
        };
        match rt.task_new(spec) {
            Ok(id) => ids.push(id),
            Err(rtcore::RtError::NoTaskSlots) => break,
            Err(e) => panic!("unexpected admission error: {e:?}"),
        }
    }
    assert!(!ids.is_empty());

    for id in ids {
        rt.task_delete(id).expect("never-started task deletes cleanly");
    }
}

#[test]
fn priority_outside_sched_fifo_range_is_rejected() {
    let rt = RtCore::new();
    let owner = rt.module_init(None).unwrap();
    let spec = TaskDescriptorSpec {
        name: None,
        owner,
        priority: Priority::new(Priority::highest().get() + 1),
        stack_size: 64 * 1024,
        cpu: None,
        entry: Box::new(|| {}),
    };
    assert_eq!(rt.task_new(spec), Err(rtcore::RtError::PriorityOutOfRange));
}

#[test]
fn clock_period_can_only_be_set_once() {
    let rt = RtCore::new();
    assert_eq!(rt.clock_set_period(200_000), Ok(200_000));
    assert_eq!(
        rt.clock_set_period(400_000),
        Err(rtcore::RtError::ClockPeriodSet)
    );
}

#[test]
fn task_period_is_clamped_up_to_the_clock_tick() {
    let rt = RtCore::new();
    rt.clock_set_period(5_000_000).unwrap(); // 5ms tick, deliberately coarse

    let ticks = Arc::new(AtomicU64::new(0));
    let counted = ticks.clone();
    // Requests a period far finer than the tick; the task must not be let
    // to run faster than the global clock, so over 30ms it should see at
    // most a handful of wakeups rather than thousands.
    let id = admit(&rt, move || loop {
        rtcore::wait();
        counted.fetch_add(1, Ordering::Relaxed);
    });
    rt.task_start(id, 100).expect("task start");

    std::thread::sleep(Duration::from_millis(30));
    rt.task_stop(id).unwrap();
    rt.task_delete(id).unwrap();

    let n = ticks.load(Ordering::Relaxed);
    assert!(n <= 10, "clamping failed to cap the tick rate, saw {n} ticks");
}

#[test]
fn a_task_entered_late_reports_a_missed_deadline() {
    struct Counter(AtomicU64);
    impl rtcore::ExceptionHandler for Counter {
        fn handle(&self, kind: ExceptionKind, _task: TaskId, _stats: &TaskStats) {
            if kind == ExceptionKind::DeadlineMissed {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    let counter = Arc::new(Counter(AtomicU64::new(0)));
    let rt = RtCore::with_exception_handler(Some(counter.clone()));
    rt.clock_set_period(1_000).unwrap(); // 1us tick, so the period below isn't clamped

    let owner = rt.module_init(None).unwrap();
    let spec = TaskDescriptorSpec {
        name: None,
        owner,
        priority: Priority::lowest(),
        stack_size: 256 * 1024,
        cpu: None,
        // Deliberately oversleeps its own first period before ever calling
        // wait(), guaranteeing the first wait() is entered late.
        entry: Box::new(|| {
            std::thread::sleep(Duration::from_millis(10));
            rtcore::wait();
        }),
    };
    let id = rt.task_new(spec).unwrap();
    rt.task_start(id, 1_000).expect("task start"); // 1us requested period

    std::thread::sleep(Duration::from_millis(50));
    rt.task_delete(id).unwrap();

    assert!(
        counter.0.load(Ordering::Relaxed) >= 1,
        "expected at least one missed-deadline notification"
    );
}

#[test]
fn module_exit_invalidates_tasks_owned_by_it() {
    let rt = RtCore::new();
    let owner = rt.module_init(Some("transient")).unwrap();
    assert!(rt.module_is_valid(owner));
    rt.module_exit(owner).unwrap();
    assert!(!rt.module_is_valid(owner));

    let spec = TaskDescriptorSpec {
        name: None,
        owner,
        priority: Priority::lowest(),
        stack_size: 64 * 1024,
        cpu: None,
        entry: Box::new(|| {}),
    };
    assert_eq!(rt.task_new(spec), Err(rtcore::RtError::InvalidHandle));
}
