// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling support.
//!
//! Generalizes the C ABI's per-call `int` errno return into a single enum,
//! each variant aware of the POSIX errno a C-ABI-facing caller would expect
//! back. Transient conditions (a missed deadline, a rusage counter dipping
//! below its baseline) are never represented here — those are reported
//! through `tracing` and the exception handler, not as an `Err`.

use thiserror::Error;

/// Everything that can go wrong calling into this crate.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RtError {
    /// The module table has no free slot.
    #[error("no free module slots")]
    NoModuleSlots,
    /// The task table has no free slot.
    #[error("no free task slots")]
    NoTaskSlots,
    /// A handle (module or task) did not refer to a live slot.
    #[error("invalid handle")]
    InvalidHandle,
    /// A requested priority fell outside `[prio_lowest, prio_highest]`.
    #[error("priority out of range")]
    PriorityOutOfRange,
    /// `clock_set_period` was called a second time.
    #[error("clock period already set")]
    ClockPeriodSet,
    /// The operation is not implemented (pause/resume).
    #[error("operation not supported")]
    Unsupported,
    /// The worker thread could not be brought up (affinity or scheduling
    /// negotiation failed before the init barrier).
    #[error("worker thread initialization failed")]
    WorkerInitFailed,
    /// `task_new` could not allocate the task's stack. No slot is reserved
    /// when this is returned.
    #[error("task stack allocation failed")]
    StackAllocFailed,
}

impl RtError {
    /// The POSIX errno a C-ABI-facing caller would see for this condition.
    pub const fn errno(self) -> libc::c_int {
        match self {
            RtError::NoModuleSlots => libc::EMFILE,
            RtError::NoTaskSlots => libc::ENOMEM,
            RtError::InvalidHandle => libc::EINVAL,
            RtError::PriorityOutOfRange => libc::EINVAL,
            RtError::ClockPeriodSet => libc::EINVAL,
            RtError::Unsupported => libc::ENOSYS,
            RtError::WorkerInitFailed => libc::ENOMEM,
            RtError::StackAllocFailed => libc::ENOMEM,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_spec_table() {
        assert_eq!(RtError::NoModuleSlots.errno(), libc::EMFILE);
        assert_eq!(RtError::NoTaskSlots.errno(), libc::ENOMEM);
        assert_eq!(RtError::InvalidHandle.errno(), libc::EINVAL);
        assert_eq!(RtError::PriorityOutOfRange.errno(), libc::EINVAL);
        assert_eq!(RtError::ClockPeriodSet.errno(), libc::EINVAL);
        assert_eq!(RtError::Unsupported.errno(), libc::ENOSYS);
        assert_eq!(RtError::WorkerInitFailed.errno(), libc::ENOMEM);
        assert_eq!(RtError::StackAllocFailed.errno(), libc::ENOMEM);
    }
}
