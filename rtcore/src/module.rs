// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module registry (C2).
//!
//! A "module" here is nothing more than a registration record: a name and a
//! handle. It exists so tasks can be owned by something coarser-grained than
//! a bare task id, mirroring `rtapi_init`/`rtapi_exit` in
//! `original_source/rtapi/linux_rtapi.c`.

use crate::slots::SlotTable;

/// Upper bound on concurrently registered modules.
pub const MAX_MODULES: usize = 64;

/// Handles returned by `init` are offset by this much so they can't be
/// confused with a raw slot index or a task handle.
pub const MODULE_OFFSET: u32 = 32768;

/// Opaque handle to a registered module.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ModuleHandle(u32);

impl ModuleHandle {
    fn from_slot(idx: usize) -> Self {
        ModuleHandle(MODULE_OFFSET + idx as u32)
    }

    fn to_slot(self) -> Option<usize> {
        self.0.checked_sub(MODULE_OFFSET).map(|v| v as usize)
    }
}

struct ModuleRecord {
    name: String,
}

pub(crate) struct ModuleRegistry {
    slots: SlotTable<ModuleRecord, MAX_MODULES>,
}

impl ModuleRegistry {
    pub(crate) fn new() -> Self {
        ModuleRegistry {
            slots: SlotTable::new(),
        }
    }

    /// Registers a module, synthesizing a `ULMOD%03d` name if `name` is
    /// `None`, matching the original's default naming when the caller
    /// doesn't supply one.
    pub(crate) fn init(
        &self,
        name: Option<&str>,
    ) -> Result<ModuleHandle, crate::RtError> {
        let name = match name {
            Some(n) => n.to_string(),
            None => {
                // Synthesize from the next free slot so names stay unique
                // for the lifetime of the process in the common case.
                let probe = self.slots.len();
                format!("ULMOD{:03}", probe)
            }
        };
        let idx = self
            .slots
            .allocate(ModuleRecord { name })
            .ok_or(crate::RtError::NoModuleSlots)?;
        Ok(ModuleHandle::from_slot(idx))
    }

    /// Bounds-checks `handle` and clears its slot. Idempotent: exiting an
    /// already-exited (but in-range) handle is not an error, matching
    /// `rtapi_exit`'s unconditional `module_array[n].state = NO_MODULE`.
    pub(crate) fn exit(
        &self,
        handle: ModuleHandle,
    ) -> Result<(), crate::RtError> {
        let idx = handle.to_slot().ok_or(crate::RtError::InvalidHandle)?;
        if idx >= self.slots.capacity() {
            return Err(crate::RtError::InvalidHandle);
        }
        self.slots.free(idx);
        Ok(())
    }

    pub(crate) fn is_valid(&self, handle: ModuleHandle) -> bool {
        match handle.to_slot() {
            Some(idx) => self.slots.with(idx, |_| ()).is_some(),
            None => false,
        }
    }
}

impl crate::RtCore {
    /// Registers a module, synthesizing a `ULMOD%03d` name if `name` is
    /// `None`.
    pub fn module_init(
        &self,
        name: Option<&str>,
    ) -> Result<ModuleHandle, crate::RtError> {
        self.modules.init(name)
    }

    /// Unregisters a module. Fails with [`crate::RtError::InvalidHandle`] if
    /// `handle` is stale or already exited.
    pub fn module_exit(&self, handle: ModuleHandle) -> Result<(), crate::RtError> {
        self.modules.exit(handle)
    }

    /// Whether `handle` currently refers to a live module.
    pub fn module_is_valid(&self, handle: ModuleHandle) -> bool {
        self.modules.is_valid(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RtError;

    #[test]
    fn init_and_exit_round_trip() {
        let reg = ModuleRegistry::new();
        let h = reg.init(Some("rtcore-demo")).unwrap();
        assert!(reg.is_valid(h));
        reg.exit(h).unwrap();
        assert!(!reg.is_valid(h));
    }

    #[test]
    fn exit_twice_is_idempotent() {
        let reg = ModuleRegistry::new();
        let h = reg.init(None).unwrap();
        reg.exit(h).unwrap();
        assert_eq!(reg.exit(h), Ok(()));
    }

    #[test]
    fn exit_out_of_range_handle_fails_with_invalid_handle() {
        let reg = ModuleRegistry::new();
        let bogus = ModuleHandle(MODULE_OFFSET + MAX_MODULES as u32 + 1);
        assert_eq!(reg.exit(bogus), Err(RtError::InvalidHandle));
    }

    #[test]
    fn default_name_is_synthesized() {
        let reg = ModuleRegistry::new();
        let h = reg.init(None).unwrap();
        assert!(reg.is_valid(h));
    }

    #[test]
    fn exhausting_table_fails() {
        let reg = ModuleRegistry::new();
        let mut handles = Vec::new();
        for _ in 0..MAX_MODULES {
            handles.push(reg.init(None).unwrap());
        }
        assert_eq!(reg.init(None), Err(RtError::NoModuleSlots));
    }
}
