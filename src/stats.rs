//! Time statistics for the streaming hot paths.
//!
//! Each worker tracks two intervals: the period between successive DMA
//! readiness events and the duration spent inside the blocking DMA call.
//! A periodic timer registered with the worker's selector flushes a
//! min/max/avg report every few seconds and resets the accumulators.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::ptr;
use std::time::Duration;

/// Current monotonic time in microseconds.
///
/// `CLOCK_MONOTONIC_RAW` is immune to NTP slewing, which matters when the
/// measured intervals are tens of microseconds.
pub fn monotonic_micros() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if syscall!(clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts)).is_err() {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

/// Min/max/avg accumulator over a series of interval measurements.
#[derive(Clone, Copy, Debug)]
pub struct TimeStats {
    initialized: bool,
    last: u64,
    total: u64,
    count: u64,
    min: u64,
    max: u64,
}

impl TimeStats {
    pub fn new() -> TimeStats {
        TimeStats {
            initialized: false,
            last: 0,
            total: 0,
            count: 0,
            min: u64::MAX,
            max: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = TimeStats::new();
    }

    /// Arms the accumulator: the next `update` measures from this instant.
    pub fn start(&mut self) {
        self.last = monotonic_micros();
        self.initialized = true;
    }

    /// Folds the interval since the previous `start`/`update` into the
    /// accumulator and rearms it.
    pub fn update(&mut self) {
        let now = monotonic_micros();
        if self.initialized {
            let diff = now.saturating_sub(self.last);
            self.total += diff;
            self.count += 1;
            if diff < self.min {
                self.min = diff;
            }
            if diff > self.max {
                self.max = diff;
            }
        }
        self.last = now;
        self.initialized = true;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// Mean interval in microseconds. Only meaningful after at least one
    /// `update`; callers check `count()` first.
    pub fn average(&self) -> u64 {
        self.total / self.count
    }
}

impl Default for TimeStats {
    fn default() -> TimeStats {
        TimeStats::new()
    }
}

/// Repeating timer, readable through a selector when it fires.
#[derive(Debug)]
pub struct PeriodicTimer {
    fd: File,
}

impl PeriodicTimer {
    pub fn new(interval: Duration) -> io::Result<PeriodicTimer> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK
        ))?;
        // SAFETY: `timerfd_create(2)` ensures the fd is valid.
        let file = unsafe { File::from_raw_fd(fd) };

        let spec = libc::timespec {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_nsec: interval.subsec_nanos() as libc::c_long,
        };
        let period = libc::itimerspec {
            it_interval: spec,
            it_value: spec,
        };
        syscall!(timerfd_settime(
            file.as_raw_fd(),
            0,
            &period,
            ptr::null_mut()
        ))?;
        Ok(PeriodicTimer { fd: file })
    }

    /// Acknowledges all expirations since the last read so the fd goes back
    /// to sleep.
    #[allow(clippy::unused_io_amount)] // Reads of 8 bytes never split.
    pub fn ack(&self) -> io::Result<()> {
        let mut buf = [0u8; 8];
        match (&self.fd).read(&mut buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for PeriodicTimer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn clock_is_monotonic() {
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn accumulator_folds_intervals() {
        let mut stats = TimeStats::new();
        assert_eq!(stats.count(), 0);

        // An update without a prior start only arms the accumulator.
        stats.update();
        assert_eq!(stats.count(), 0);

        stats.reset();
        stats.start();
        thread::sleep(Duration::from_millis(2));
        stats.update();
        thread::sleep(Duration::from_millis(1));
        stats.update();
        assert_eq!(stats.count(), 2);
        assert!(stats.min() <= stats.max());
        assert!(stats.average() >= stats.min());
        assert!(stats.average() <= stats.max());
        assert!(stats.min() >= 1_000, "slept 2ms, measured {}us", stats.min());

        stats.reset();
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.min(), u64::MAX);
        assert_eq!(stats.max(), 0);
    }

    #[test]
    fn timer_fires_repeatedly() {
        let timer = PeriodicTimer::new(Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(20));
        timer.ack().unwrap();
        // Acked: a second ack is a no-op rather than an error.
        timer.ack().unwrap();
    }
}
