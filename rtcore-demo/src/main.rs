// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line demonstration of `rtcore`: admits a handful of periodic
//! tasks, lets them run for a fixed duration, then tears them down in
//! order. Grounded on the workspace's own demo binaries (see
//! `oxidecomputer-hubris/demo`) for the shape of a small standalone runner,
//! and on `NON-OS-N0N-OS/cli` for `clap`-derived argument parsing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rtcore::{ExceptionKind, Priority, RtCore, TaskDescriptorSpec, TaskId, TaskStats};

/// Run a handful of periodic tasks under rtcore and report their stats.
#[derive(Parser, Debug)]
#[clap(name = "rtcore-demo")]
struct Args {
    /// Number of periodic tasks to admit.
    #[clap(long, default_value = "2")]
    tasks: u32,

    /// Period of each task, in milliseconds.
    #[clap(long, default_value = "10")]
    period_ms: u64,

    /// How long to let the tasks run before stopping them, in seconds.
    #[clap(long, default_value = "2")]
    run_seconds: u64,

    /// CPU to pin every task to. Left unset, no affinity is requested.
    #[clap(long)]
    cpu: Option<u32>,

    /// Global clock tick, in microseconds. Task periods are clamped up to
    /// this value.
    #[clap(long, default_value = "1000")]
    clock_tick_us: u64,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

struct LoggingExceptionHandler;

impl rtcore::ExceptionHandler for LoggingExceptionHandler {
    fn handle(&self, kind: ExceptionKind, task: TaskId, stats: &TaskStats) {
        match kind {
            ExceptionKind::DeadlineMissed => {
                tracing::warn!(
                    ?task,
                    missed = stats.missed_deadlines,
                    "deadline missed"
                );
            }
            ExceptionKind::RuntimeOverrun => {
                tracing::warn!(?task, "SCHED_DEADLINE runtime budget overrun");
            }
        }
    }
}

fn main() {
    init_tracing();
    let args = Args::parse();

    let rt = RtCore::with_exception_handler(Some(Arc::new(LoggingExceptionHandler)));

    match rt.clock_set_period(args.clock_tick_us * 1_000) {
        Ok(tick) => tracing::info!(tick_ns = tick, "clock tick configured"),
        Err(e) => tracing::error!(error = %e, "failed to set clock tick"),
    }

    let owner = match rt.module_init(Some("rtcore-demo")) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "module registration failed");
            std::process::exit(e.errno());
        }
    };

    let mut ids = Vec::new();
    for i in 0..args.tasks {
        let loop_count = Arc::new(AtomicU64::new(0));
        let counted = loop_count.clone();
        let spec = TaskDescriptorSpec {
            name: Some(format!("demo-{i}")),
            owner,
            priority: Priority::lowest().next_higher(),
            stack_size: 256 * 1024,
            cpu: args.cpu,
            entry: Box::new(move || loop {
                rtcore::wait();
                let n = counted.fetch_add(1, Ordering::Relaxed) + 1;
                if n % 50 == 0 {
                    tracing::debug!(task = i, iterations = n, "heartbeat");
                }
            }),
        };
        match rt.task_new(spec) {
            Ok(id) => {
                if let Err(e) = rt.task_start(id, args.period_ms * 1_000_000) {
                    tracing::error!(error = %e, task = i, "task failed to start");
                    continue;
                }
                tracing::info!(task = i, %id, "task started");
                ids.push((id, loop_count));
            }
            Err(e) => tracing::error!(error = %e, task = i, "task admission failed"),
        }
    }

    std::thread::sleep(Duration::from_secs(args.run_seconds));

    for (id, loop_count) in &ids {
        if let Err(e) = rt.task_stop(*id) {
            tracing::error!(error = %e, %id, "stop failed");
            continue;
        }
        if let Err(e) = rt.task_delete(*id) {
            tracing::error!(error = %e, %id, "delete failed");
            continue;
        }
        tracing::info!(
            %id,
            iterations = loop_count.load(Ordering::Relaxed),
            "task stopped and torn down"
        );
    }

    if let Err(e) = rt.module_exit(owner) {
        tracing::error!(error = %e, "module teardown failed");
    }
}
