//! Monotonic time: an injectable clock and a timerfd that feeds the
//! client's poll descriptor.

use crate::{Error, Result};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// Injected monotonic time source. Production uses [`MonotonicClock`];
/// tests substitute a fake advancing by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The system monotonic clock.
#[derive(Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Non-blocking CLOCK_MONOTONIC timerfd. Arming it makes the client's poll
/// descriptor readable at the next deadline.
pub struct TimerFd {
    fd: RawFd,
}

impl TimerFd {
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(Self { fd })
    }

    /// Arm for `timeout` from now; `None` disarms. A zero timeout fires
    /// immediately (timerfd treats an all-zero itimerspec as disarm, so it
    /// is bumped to one nanosecond).
    pub fn arm(&self, timeout: Option<Duration>) -> Result<()> {
        let value = match timeout {
            Some(t) => libc::timespec {
                tv_sec: t.as_secs() as libc::time_t,
                tv_nsec: if t.as_secs() == 0 && t.subsec_nanos() == 0 {
                    1
                } else {
                    t.subsec_nanos() as libc::c_long
                },
            },
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: value,
        };
        let ret = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Consume a pending expiration so the descriptor goes quiet.
    pub fn clear(&self) {
        let mut expirations = [0u8; 8];
        unsafe {
            libc::read(
                self.fd,
                expirations.as_mut_ptr() as *mut libc::c_void,
                expirations.len(),
            )
        };
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
