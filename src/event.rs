//! Wakeup descriptors: eventfd for peer signalling, one-shot timerfd for
//! wait timeouts, and the EINTR-retrying poll the scheduler blocks in.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Per-coroutine wakeup primitive. Readable after `signal`, quiet again
/// after `drain`.
#[derive(Debug)]
pub(crate) struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn signal(&self) {
        signal_raw(self.fd.as_raw_fd());
    }

    pub fn drain(&self) {
        let mut count = 0u64;
        // EAGAIN just means nobody signalled since the last drain
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                8,
            )
        };
    }

    pub fn pollfd(&self) -> libc::pollfd {
        libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }
    }

    pub fn try_clone(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}

/// Bumps an eventfd counter. Usable on a bare descriptor so a `StopHandle`
/// can carry a dup without the whole wrapper.
pub(crate) fn signal_raw(fd: RawFd) {
    let one: u64 = 1;
    // EAGAIN means the counter is saturated, which is still "signalled"
    unsafe { libc::write(fd, &one as *const u64 as *const libc::c_void, 8) };
}

/// One-shot monotonic timer, readable once the timeout elapses.
#[derive(Debug)]
pub(crate) struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub fn new(timeout: Duration) -> io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut nsec = timeout.subsec_nanos() as libc::c_long;
        if timeout.as_secs() == 0 && nsec == 0 {
            // an all-zero it_value would disarm the timer instead
            nsec = 1;
        }
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_nsec: nsec,
            },
        };
        if unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn pollfd(&self) -> libc::pollfd {
        libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }
    }
}

/// poll(2) with interrupted calls retried.
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{poll, EventFd, TimerFd};

    #[test]
    fn eventfd_signal_then_drain() {
        let ev = EventFd::new().unwrap();
        let mut fds = [ev.pollfd()];
        assert_eq!(poll(&mut fds, 0).unwrap(), 0);

        ev.signal();
        fds[0].revents = 0;
        assert_eq!(poll(&mut fds, 0).unwrap(), 1);
        assert_ne!(fds[0].revents & libc::POLLIN, 0);

        ev.drain();
        fds[0].revents = 0;
        assert_eq!(poll(&mut fds, 0).unwrap(), 0);
    }

    #[test]
    fn timerfd_fires_once_after_timeout() {
        let start = Instant::now();
        let timer = TimerFd::new(Duration::from_millis(20)).unwrap();
        let mut fds = [timer.pollfd()];
        assert_eq!(poll(&mut fds, 2000).unwrap(), 1);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn zero_timeout_still_arms() {
        let timer = TimerFd::new(Duration::ZERO).unwrap();
        let mut fds = [timer.pollfd()];
        assert_eq!(poll(&mut fds, 1000).unwrap(), 1);
    }
}
