// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wall-clock time representation.
//!
//! The teacher's kernel counts abstract ticks since it never talks to a real
//! clock; this crate always talks to `CLOCK_MONOTONIC`, so its `Timestamp`
//! is nanoseconds since an arbitrary, unspecified epoch (whatever
//! `CLOCK_MONOTONIC` starts counting from).

/// A point in monotonic time, in nanoseconds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Reads `CLOCK_MONOTONIC` right now.
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid out-pointer for clock_gettime.
        let rc = unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts as *mut _)
        };
        debug_assert_eq!(rc, 0, "CLOCK_MONOTONIC must be available");
        Timestamp::from(ts)
    }

    /// Adds a nanosecond duration, saturating rather than wrapping.
    pub fn add_nanos(self, nanos: u64) -> Self {
        Timestamp(self.0.saturating_add(nanos))
    }

    /// Nanoseconds elapsed since `earlier`, or `0` if `self` is not after
    /// `earlier` (never returns a negative duration).
    pub fn saturating_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

impl From<libc::timespec> for Timestamp {
    fn from(ts: libc::timespec) -> Self {
        Timestamp(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
    }
}

impl From<Timestamp> for libc::timespec {
    fn from(t: Timestamp) -> Self {
        libc::timespec {
            tv_sec: (t.0 / 1_000_000_000) as libc::time_t,
            tv_nsec: (t.0 % 1_000_000_000) as libc::c_long,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_nanos_saturates() {
        let t = Timestamp::from(u64::MAX - 1);
        assert_eq!(u64::from(t.add_nanos(10)), u64::MAX);
    }

    #[test]
    fn saturating_since_never_negative() {
        let earlier = Timestamp::from(100);
        let later = Timestamp::from(50);
        assert_eq!(later.saturating_since(earlier), 0);
        assert_eq!(earlier.saturating_since(later), 50);
    }

    #[test]
    fn timespec_round_trip() {
        let t = Timestamp::from(1_500_000_001u64);
        let ts: libc::timespec = t.into();
        assert_eq!(ts.tv_sec, 1);
        assert_eq!(ts.tv_nsec, 500_000_001);
        assert_eq!(Timestamp::from(ts), t);
    }

    proptest::proptest! {
        #[test]
        fn add_nanos_never_moves_time_backwards(base: u64, delta: u64) {
            let t = Timestamp::from(base);
            let advanced = t.add_nanos(delta);
            proptest::prop_assert!(advanced >= t);
        }

        #[test]
        fn timespec_conversion_round_trips_for_any_nanosecond_count(
            nanos in 0u64..=(i64::MAX as u64),
        ) {
            let t = Timestamp::from(nanos);
            let ts: libc::timespec = t.into();
            proptest::prop_assert_eq!(Timestamp::from(ts), t);
        }
    }
}
