use std::hint;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::NS_PER_SEC;

/// Below this distance to the deadline `SpinSleep` stops sleeping and spins.
pub const MIN_TIMER_SLEEP: Duration = Duration::from_micros(50);

/// A nanosecond time source. Readings from one clock are comparable with each
/// other; nothing else is assumed, in particular no monotonicity guard.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Blocks the calling thread until `clock` reads at least `deadline_ns`.
pub trait WaitUntil: Send + Sync {
    fn wait_until<C: Clock + ?Sized>(&self, clock: &C, deadline_ns: u64);
}

fn clock_gettime_ns(clock_id: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime cannot fail for the two clock ids used here.
    unsafe {
        libc::clock_gettime(clock_id, &mut ts);
    }
    ts.tv_sec as u64 * NS_PER_SEC + ts.tv_nsec as u64
}

#[derive(Copy, Clone, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        clock_gettime_ns(libc::CLOCK_MONOTONIC)
    }
}

/// Nanoseconds since the Unix epoch. Subject to wall-clock adjustments.
#[derive(Copy, Clone, Debug, Default)]
pub struct RealtimeClock;

impl Clock for RealtimeClock {
    fn now_ns(&self) -> u64 {
        clock_gettime_ns(libc::CLOCK_REALTIME)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClockSource {
    Monotonic,
    Realtime,
}

impl Clock for ClockSource {
    #[inline]
    fn now_ns(&self) -> u64 {
        match self {
            ClockSource::Monotonic => MonotonicClock.now_ns(),
            ClockSource::Realtime => RealtimeClock.now_ns(),
        }
    }
}

impl FromStr for ClockSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monotonic" => Ok(ClockSource::Monotonic),
            "realtime" => Ok(ClockSource::Realtime),
            _ => Err(format!("Unknown clock source: {}", s)),
        }
    }
}

/// A clock that only moves when told to. Waiting on it jumps straight to the
/// deadline, which makes paced loops run instantly and deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        ManualClock {
            now: AtomicU64::new(start_ns),
        }
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn set(&self, ns: u64) {
        self.now.fetch_max(ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl WaitUntil for ManualClock {
    fn wait_until<C: Clock + ?Sized>(&self, _clock: &C, deadline_ns: u64) {
        self.set(deadline_ns);
    }
}

/// Pure busy-wait. Burns a core but never hands control to the scheduler.
#[derive(Copy, Clone, Debug, Default)]
pub struct Spin;

impl WaitUntil for Spin {
    #[inline]
    fn wait_until<C: Clock + ?Sized>(&self, clock: &C, deadline_ns: u64) {
        while clock.now_ns() < deadline_ns {
            hint::spin_loop();
        }
    }
}

/// Sleeps while the deadline is further away than `threshold`, then spins.
#[derive(Copy, Clone, Debug)]
pub struct SpinSleep {
    pub threshold: Duration,
}

impl Default for SpinSleep {
    fn default() -> Self {
        SpinSleep {
            threshold: MIN_TIMER_SLEEP,
        }
    }
}

impl WaitUntil for SpinSleep {
    fn wait_until<C: Clock + ?Sized>(&self, clock: &C, deadline_ns: u64) {
        let threshold = self.threshold.as_nanos() as u64;
        let mut t = clock.now_ns();
        while t + threshold < deadline_ns {
            thread::sleep(Duration::from_nanos(deadline_ns - t - threshold));
            t = clock.now_ns();
        }
        Spin.wait_until(clock, deadline_ns);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pacing {
    Spin,
    Hybrid,
}

impl WaitUntil for Pacing {
    #[inline]
    fn wait_until<C: Clock + ?Sized>(&self, clock: &C, deadline_ns: u64) {
        match self {
            Pacing::Spin => Spin.wait_until(clock, deadline_ns),
            Pacing::Hybrid => SpinSleep::default().wait_until(clock, deadline_ns),
        }
    }
}

impl FromStr for Pacing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spin" => Ok(Pacing::Spin),
            "hybrid" => Ok(Pacing::Hybrid),
            _ => Err(format!("Unknown pacing strategy: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let a = MonotonicClock.now_ns();
        let b = MonotonicClock.now_ns();
        assert!(b >= a);
    }

    #[test]
    fn realtime_clock_is_past_2020() {
        // 2020-01-01T00:00:00Z
        assert!(RealtimeClock.now_ns() > 1_577_836_800 * NS_PER_SEC);
    }

    #[test]
    fn spin_reaches_deadline() {
        let clock = MonotonicClock;
        let deadline = clock.now_ns() + 200_000;
        Spin.wait_until(&clock, deadline);
        assert!(clock.now_ns() >= deadline);
    }

    #[test]
    fn spin_sleep_reaches_deadline() {
        let clock = MonotonicClock;
        let deadline = clock.now_ns() + 2_000_000;
        SpinSleep::default().wait_until(&clock, deadline);
        assert!(clock.now_ns() >= deadline);
    }

    #[test]
    fn manual_clock_jumps_and_never_rewinds() {
        let clock = ManualClock::new(10);
        clock.wait_until(&clock, 500);
        assert_eq!(clock.now_ns(), 500);
        clock.wait_until(&clock, 100);
        assert_eq!(clock.now_ns(), 500);
        clock.advance(5);
        assert_eq!(clock.now_ns(), 505);
    }

    #[test]
    fn parses_names() {
        assert_eq!("spin".parse::<Pacing>(), Ok(Pacing::Spin));
        assert_eq!("hybrid".parse::<Pacing>(), Ok(Pacing::Hybrid));
        assert!("nap".parse::<Pacing>().is_err());
        assert_eq!("realtime".parse::<ClockSource>(), Ok(ClockSource::Realtime));
    }
}
