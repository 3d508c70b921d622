// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-capacity slot tables.
//!
//! The original C arrays validate an entry with a magic-number tag
//! (`TASK_MAGIC`/`MODULE_MAGIC`). The idiomatic restatement is a
//! discriminated union: a slot is either [`Slot::Empty`] or
//! [`Slot::Occupied`], so "is this slot valid" is a match arm rather than an
//! integer comparison that could accidentally succeed against uninitialized
//! memory.

use std::sync::Mutex;

/// One entry in a [`SlotTable`].
#[derive(Debug)]
pub enum Slot<T> {
    Empty,
    Occupied(T),
}

impl<T> Slot<T> {
    pub fn is_occupied(&self) -> bool {
        matches!(self, Slot::Occupied(_))
    }

    pub fn as_ref(&self) -> Option<&T> {
        match self {
            Slot::Occupied(v) => Some(v),
            Slot::Empty => None,
        }
    }
}

/// A fixed-capacity table of `N` slots, each independently empty or
/// occupied, guarded by a single mutex. Allocation and free are short
/// critical sections; callers do work that doesn't need the lock (such as
/// stack allocation) before or after calling in.
pub struct SlotTable<T, const N: usize> {
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T, const N: usize> SlotTable<T, N> {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(N);
        slots.resize_with(N, || Slot::Empty);
        SlotTable {
            slots: Mutex::new(slots),
        }
    }

    /// Finds the first empty slot, occupies it with `value`, and returns its
    /// index. Returns `None` if the table is full.
    pub fn allocate(&self, value: T) -> Option<usize> {
        self.allocate_with(|_idx| value)
    }

    /// Finds the first empty slot and occupies it with `f(idx)`, so the
    /// value being constructed can know its own slot index up front
    /// (avoiding a separate fix-up step after allocation). Returns `None`
    /// without calling `f` if the table is full.
    pub fn allocate_with(&self, f: impl FnOnce(usize) -> T) -> Option<usize> {
        let mut slots = self.slots.lock().unwrap();
        let idx = slots.iter().position(|s| !s.is_occupied())?;
        slots[idx] = Slot::Occupied(f(idx));
        Some(idx)
    }

    /// Frees the slot at `idx`, returning its value if it was occupied.
    pub fn free(&self, idx: usize) -> Option<T> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(idx)?;
        match std::mem::replace(slot, Slot::Empty) {
            Slot::Occupied(v) => Some(v),
            Slot::Empty => None,
        }
    }

    /// Runs `f` against the slot's contents under the table lock, if
    /// occupied.
    pub fn with<R>(&self, idx: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slots = self.slots.lock().unwrap();
        slots.get(idx)?.as_ref().map(f)
    }

    /// Number of slots currently occupied.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().iter().filter(|s| s.is_occupied()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Default for SlotTable<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_fills_first_empty_slot() {
        let table: SlotTable<u32, 4> = SlotTable::new();
        assert_eq!(table.allocate(10), Some(0));
        assert_eq!(table.allocate(20), Some(1));
        table.free(0);
        assert_eq!(table.allocate(30), Some(0));
    }

    #[test]
    fn allocate_fails_when_full() {
        let table: SlotTable<u32, 2> = SlotTable::new();
        assert_eq!(table.allocate(1), Some(0));
        assert_eq!(table.allocate(2), Some(1));
        assert_eq!(table.allocate(3), None);
    }

    #[test]
    fn free_of_empty_slot_is_none() {
        let table: SlotTable<u32, 2> = SlotTable::new();
        assert_eq!(table.free(0), None);
    }

    #[test]
    fn with_reads_occupied_value() {
        let table: SlotTable<u32, 2> = SlotTable::new();
        let idx = table.allocate(42).unwrap();
        assert_eq!(table.with(idx, |v| *v), Some(42));
        table.free(idx);
        assert_eq!(table.with(idx, |v| *v), None);
    }

    proptest::proptest! {
        #[test]
        fn len_never_exceeds_capacity_under_arbitrary_alloc_free_traffic(
            ops in proptest::collection::vec(0u8..=1, 0..200),
        ) {
            let table: SlotTable<u32, 8> = SlotTable::new();
            let mut next = 0u32;
            for op in ops {
                if op == 0 {
                    table.allocate(next);
                    next += 1;
                } else {
                    table.free((next as usize) % table.capacity());
                }
                proptest::prop_assert!(table.len() <= table.capacity());
                proptest::prop_assert_eq!(table.is_empty(), table.len() == 0);
            }
        }
    }
}
