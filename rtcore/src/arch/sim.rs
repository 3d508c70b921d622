// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulator backend: same affinity pinning as the real backend, no
//! priority elevation, no exception dispatch.
//!
//! Mirrors `RTAPI_POSIX`-gated code in `original_source/rtapi/rt-preempt.c`,
//! which skips the entire priority-negotiation step under that flavor.

use crate::err::RtError;

use super::PriorityOutcome;

pub(crate) fn elevate_priority(
    _native: libc::pthread_t,
    _priority: i32,
    _period_ns: u64,
) -> Result<PriorityOutcome, RtError> {
    Ok(PriorityOutcome::NotElevated)
}

/// No-op: the simulator flavor never installs a `SIGXCPU` handler and never
/// sees a deadline overrun reported this way.
pub(crate) fn install_deadline_signal_handler() {}

pub(crate) fn take_deadline_overrun_count() -> u64 {
    0
}
