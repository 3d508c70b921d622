// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task lifecycle and periodic-wait core for a realtime task runtime.
//!
//! This crate owns admission of tasks into a fixed-capacity slot table, the
//! init handshake between a task's worker thread and its creator,
//! CPU-affinity and scheduling-policy negotiation, the absolute-time
//! periodic wait loop, page-fault accounting, and orderly teardown.
//!
//! # Design principles
//!
//! 1. Fixed configuration. Module and task tables are sized at compile time;
//!    there is no dynamic growth.
//! 2. A strong preference for safe code. The small amount of `unsafe` needed
//!    to talk to `pthread`/`sched_*` is confined to [`arch`].
//! 3. Two delivery flavors, selected at compile time by the `simulator`
//!    feature: `realtime` attempts full scheduling elevation; `simulator`
//!    pins affinity the same way but never touches priority or exception
//!    dispatch.

pub mod arch;
pub mod err;
pub mod module;
pub mod slots;
pub mod task;
pub mod time;

pub use err::RtError;
pub use module::ModuleHandle;
pub use task::{
    wait, ExceptionHandler, ExceptionKind, Priority, TaskDescriptorSpec,
    TaskId, TaskStats,
};
pub use time::Timestamp;

use std::sync::Arc;

use module::ModuleRegistry;
use slots::SlotTable;
use task::{ExceptionHandler, Task, MAX_TASKS};

/// Process-wide (or test-local) runtime instance.
///
/// The teacher threads an explicit `&mut [Task]` through its scheduler
/// rather than reaching for global mutable statics wherever avoidable; this
/// crate follows the same idiom. A production process constructs exactly
/// one `RtCore` (for example behind a `OnceLock`) to get the "process-wide"
/// semantics the task model assumes, while tests construct independent
/// instances that can run concurrently without cross-contamination.
pub struct RtCore {
    pub(crate) modules: ModuleRegistry,
    pub(crate) tasks: SlotTable<Arc<Task>, MAX_TASKS>,
    pub(crate) clock_period_set: std::sync::atomic::AtomicBool,
    pub(crate) clock_period_ns: std::sync::atomic::AtomicU64,
    pub(crate) exception_handler: Option<Arc<dyn ExceptionHandler>>,
}

/// Clock tick assumed before `clock_set_period` is ever called. The original
/// rtapi leaves `period` zero-initialized until a caller sets it; this crate
/// instead seeds a conservative 1ms default so a task started with no prior
/// `clock_set_period` call gets a workable tick instead of a zero period.
/// `clock_set_period`'s own query behavior (returning 0 if never explicitly
/// set) is unaffected — that's tracked separately by `clock_period_set`.
const DEFAULT_CLOCK_PERIOD_NS: u64 = 1_000_000;

impl RtCore {
    /// Builds a runtime instance with no exception handler installed.
    pub fn new() -> Self {
        Self::with_exception_handler(None)
    }

    /// Builds a runtime instance, routing deadline/runtime-overrun
    /// notifications to `handler`. Ignored entirely when compiled with the
    /// `simulator` feature (see [`arch`]).
    pub fn with_exception_handler(
        handler: Option<Arc<dyn ExceptionHandler>>,
    ) -> Self {
        RtCore {
            modules: ModuleRegistry::new(),
            tasks: SlotTable::new(),
            clock_period_set: std::sync::atomic::AtomicBool::new(false),
            clock_period_ns: std::sync::atomic::AtomicU64::new(
                DEFAULT_CLOCK_PERIOD_NS,
            ),
            exception_handler: handler,
        }
    }
}

impl Default for RtCore {
    fn default() -> Self {
        Self::new()
    }
}
