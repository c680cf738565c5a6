//! Monotonic-clock primitives: timestamp reads, busy-wait spins, and
//! nanosecond ⇄ `timespec` conversion.
use core::sync::atomic::{fence, Ordering};

use crate::error::Result;
use crate::threading;

/// Nanosecond timestamp or duration in the monotonic-clock domain.
pub type RtTime = u64;

pub const NANOSEC_PER_SEC: u64 = 1_000_000_000;

/// The clock every timestamp, deadline, and sleep in this crate is bound to.
pub(crate) const CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;

/// A seconds + nanoseconds pair in the monotonic-clock domain.
///
/// The derived ordering is lexicographic over `(sec, nsec)`, which is the
/// correct instant ordering as long as `nsec` is kept in `0..NANOSEC_PER_SEC`.
/// Everything in this crate that stores a `TimeSpec` maintains that range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeSpec {
    pub(crate) fn to_raw(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.sec as libc::time_t,
            tv_nsec: self.nsec as libc::c_long,
        }
    }

    pub(crate) fn from_raw(ts: libc::timespec) -> Self {
        Self {
            sec: ts.tv_sec as i64,
            nsec: ts.tv_nsec as i64,
        }
    }

    /// Advance by `ns` nanoseconds, renormalizing `nsec` into
    /// `0..NANOSEC_PER_SEC`.
    pub(crate) fn add_ns(&mut self, ns: u64) {
        self.nsec += ns as i64;
        self.sec += self.nsec / NANOSEC_PER_SEC as i64;
        self.nsec %= NANOSEC_PER_SEC as i64;
    }
}

/// Convert nanoseconds to a normalized [`TimeSpec`].
pub fn ns_to_ts(ns: RtTime) -> TimeSpec {
    TimeSpec {
        sec: (ns / NANOSEC_PER_SEC) as i64,
        nsec: (ns % NANOSEC_PER_SEC) as i64,
    }
}

/// Convert a [`TimeSpec`] to nanoseconds.
pub fn ts_to_ns(ts: TimeSpec) -> RtTime {
    ts.sec as u64 * NANOSEC_PER_SEC + ts.nsec as u64
}

pub(crate) fn clock_now() -> Result<TimeSpec> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    threading::ok_or_errno(unsafe { libc::clock_gettime(CLOCK, &mut ts) })?;
    Ok(TimeSpec::from_raw(ts))
}

/// Read the monotonic clock, in nanoseconds.
///
/// Returns [`RtTime::MAX`] if the clock is unavailable. Callers comparing
/// timestamps should treat very-large-magnitude values defensively.
pub fn read_timer() -> RtTime {
    match clock_now() {
        Ok(ts) => ts_to_ns(ts),
        Err(e) => {
            log::error!("read_timer: monotonic clock read failed: {}", e);
            RtTime::MAX
        }
    }
}

/// Busy-wait until at least `ns` nanoseconds have elapsed.
///
/// The calling thread neither sleeps nor yields; each iteration re-reads the
/// clock behind a full memory barrier.
pub fn spin_timer(ns: RtTime) {
    let end = read_timer().saturating_add(ns);
    while read_timer() < end {
        fence(Ordering::SeqCst);
    }
}

/// Sleep until the absolute monotonic instant `deadline`.
///
/// `clock_nanosleep` reports failures through its return value, not `errno`.
pub(crate) fn sleep_until(deadline: TimeSpec) -> core::result::Result<(), errno::Errno> {
    let raw = deadline.to_raw();
    let ret = unsafe { libc::clock_nanosleep(CLOCK, libc::TIMER_ABSTIME, &raw, core::ptr::null_mut()) };
    if ret == 0 {
        Ok(())
    } else {
        Err(errno::Errno(ret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn ns_round_trips_through_ts(ns: u64) -> bool {
        ts_to_ns(ns_to_ts(ns)) == ns
    }

    #[quickcheck]
    fn ts_round_trips_through_ns(sec: u32, nsec: u32) -> bool {
        let ts = TimeSpec {
            sec: sec as i64,
            nsec: (nsec % NANOSEC_PER_SEC as u32) as i64,
        };
        ns_to_ts(ts_to_ns(ts)) == ts
    }

    #[test]
    fn add_ns_renormalizes() {
        let mut ts = TimeSpec {
            sec: 5,
            nsec: 999_999_999,
        };
        ts.add_ns(2);
        assert_eq!(
            ts,
            TimeSpec {
                sec: 6,
                nsec: 1
            }
        );

        let mut ts = TimeSpec { sec: 0, nsec: 0 };
        ts.add_ns(3 * NANOSEC_PER_SEC + 7);
        assert_eq!(ts, TimeSpec { sec: 3, nsec: 7 });
    }

    #[test]
    fn instant_ordering_is_lexicographic() {
        let early = TimeSpec {
            sec: 1,
            nsec: 999_999_999,
        };
        let late = TimeSpec { sec: 2, nsec: 0 };
        assert!(early < late);
        assert!(TimeSpec { sec: 2, nsec: 1 } > late);
        assert_eq!(late.cmp(&late), core::cmp::Ordering::Equal);
    }

    #[test]
    fn monotonic_read_advances() {
        let t0 = read_timer();
        let t1 = read_timer();
        assert!(t0 != RtTime::MAX);
        assert!(t1 >= t0);
    }

    #[test]
    fn spin_waits_at_least_the_requested_time() {
        let t0 = read_timer();
        spin_timer(1_000_000);
        let t1 = read_timer();
        assert!(t1 - t0 >= 1_000_000);
    }
}
