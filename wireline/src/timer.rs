//! Timer pool over one-shot timerfds.
//!
//! A readiness reactor consumes timers as file descriptors: arming a timer
//! makes its fd readable when it expires. Entries are pooled with a free
//! list so repeated requests on a connection reuse the same fd. An entry is
//! disarmed, unregistered from its poller, and drained before it re-enters
//! the free list, so a recycled timer can never deliver a stale expiration
//! for an earlier request.

use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::poller::{Notify, PollMode, Poller};

/// One pooled timerfd.
pub struct TimerEntry {
    fd: RawFd,
    registered: Mutex<Option<Arc<Poller>>>,
}

impl TimerEntry {
    fn create() -> io::Result<TimerEntry> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(TimerEntry {
            fd,
            registered: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Arm a one-shot expiration `timeout` from now.
    pub fn arm(&self, timeout: Duration) -> io::Result<()> {
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        spec.it_value.tv_sec = timeout.as_secs() as libc::time_t;
        spec.it_value.tv_nsec = timeout.subsec_nanos() as libc::c_long;
        if spec.it_value.tv_sec == 0 && spec.it_value.tv_nsec == 0 {
            // A zero value would disarm instead of firing immediately.
            spec.it_value.tv_nsec = 1;
        }
        self.settime(&spec)
    }

    /// Cancel a pending expiration and drop the poller registration.
    pub fn disarm(&self) {
        let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        let _ = self.settime(&spec);
        let poller = self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(poller) = poller {
            let _ = poller.remove(self.fd);
        }
    }

    /// Register the timer fd for read readiness with `poller`. The poller is
    /// remembered so [`disarm`](Self::disarm) can unregister.
    pub fn register(&self, poller: &Arc<Poller>) -> io::Result<()> {
        poller.add(self.fd, Notify::READ, PollMode::Edge)?;
        *self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(poller));
        Ok(())
    }

    /// Consume any pending expiration count.
    pub fn drain(&self) {
        let mut expirations: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut expirations as *mut u64 as *mut libc::c_void,
                8,
            );
        }
    }

    fn settime(&self, spec: &libc::itimerspec) -> io::Result<()> {
        let ret = unsafe { libc::timerfd_settime(self.fd, 0, spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for TimerEntry {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Free list of timer entries, growing on demand.
pub struct TimerPool {
    free: Mutex<Vec<Arc<TimerEntry>>>,
}

impl Default for TimerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerPool {
    pub fn new() -> TimerPool {
        TimerPool {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take a timer from the pool, creating a fresh timerfd if the free
    /// list is empty.
    pub fn pick(&self) -> io::Result<Arc<TimerEntry>> {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match recycled {
            Some(entry) => Ok(entry),
            None => TimerEntry::create().map(Arc::new),
        }
    }

    /// Return a timer to the pool. Disarms, unregisters, and drains first.
    pub fn release(&self, timer: Arc<TimerEntry>) {
        timer.disarm();
        timer.drain();
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Events;

    #[test]
    fn armed_timer_becomes_readable() {
        let poller = Arc::new(Poller::new().unwrap());
        let pool = TimerPool::new();
        let timer = pool.pick().unwrap();

        timer.arm(Duration::from_millis(20)).unwrap();
        timer.register(&poller).unwrap();

        let mut events = Events::with_capacity(4);
        let n = poller
            .wait(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(events.iter().next().unwrap().fd, timer.fd());
    }

    #[test]
    fn released_timer_is_reused_without_stale_fire() {
        let poller = Arc::new(Poller::new().unwrap());
        let pool = TimerPool::new();

        let timer = pool.pick().unwrap();
        let fd = timer.fd();
        timer.arm(Duration::from_millis(5)).unwrap();
        timer.register(&poller).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        pool.release(timer);

        // Same fd comes back, disarmed and unregistered.
        let timer = pool.pick().unwrap();
        assert_eq!(timer.fd(), fd);

        let mut events = Events::with_capacity(4);
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(30)))
            .unwrap();
        assert_eq!(n, 0, "stale expiration leaked through the pool");
        pool.release(timer);
    }

    #[test]
    fn disarm_cancels_pending_expiration() {
        let pool = TimerPool::new();
        let timer = pool.pick().unwrap();
        timer.arm(Duration::from_millis(50)).unwrap();
        timer.disarm();
        std::thread::sleep(Duration::from_millis(80));

        let mut expirations: u64 = 0;
        let ret = unsafe {
            libc::read(
                timer.fd(),
                &mut expirations as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        assert!(ret < 0, "disarmed timer must not expire");
    }
}
