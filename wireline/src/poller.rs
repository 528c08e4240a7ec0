//! Thin epoll wrapper: per-fd registration with a notify mask and
//! level/edge/one-shot modes, plus batched readiness delivery.
//!
//! Events are tagged by fd — the registration stores the fd itself in the
//! epoll user data, so dispatch needs no indirection table.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Readiness interest mask for a registration.
///
/// `HANGUP` and error conditions are always delivered by the kernel; the
/// flags are accepted anyway so call sites can state their intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notify(u32);

impl Notify {
    pub const READ: Notify = Notify(1);
    pub const WRITE: Notify = Notify(1 << 1);
    pub const HANGUP: Notify = Notify(1 << 2);
    pub const SHUTDOWN: Notify = Notify(1 << 3);

    fn epoll_bits(self) -> u32 {
        let mut bits = 0u32;
        if self.0 & Notify::READ.0 != 0 {
            bits |= libc::EPOLLIN as u32;
        }
        if self.0 & Notify::WRITE.0 != 0 {
            bits |= libc::EPOLLOUT as u32;
        }
        if self.0 & Notify::HANGUP.0 != 0 {
            bits |= (libc::EPOLLHUP | libc::EPOLLERR) as u32;
        }
        if self.0 & Notify::SHUTDOWN.0 != 0 {
            bits |= libc::EPOLLRDHUP as u32;
        }
        bits
    }
}

impl std::ops::BitOr for Notify {
    type Output = Notify;

    fn bitor(self, rhs: Notify) -> Notify {
        Notify(self.0 | rhs.0)
    }
}

/// Delivery mode for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Readiness reported while the condition holds.
    Level,
    /// Readiness reported on state change only; consumers must drain until
    /// EAGAIN.
    Edge,
}

impl PollMode {
    fn epoll_bits(self) -> u32 {
        match self {
            PollMode::Level => 0,
            PollMode::Edge => libc::EPOLLET as u32,
        }
    }
}

/// One ready entry out of a readiness batch.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// The fd the registration was tagged with.
    pub fd: RawFd,
    bits: u32,
}

impl Event {
    pub fn is_readable(&self) -> bool {
        self.bits & libc::EPOLLIN as u32 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.bits & libc::EPOLLOUT as u32 != 0
    }

    pub fn is_hangup(&self) -> bool {
        self.bits & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0
    }

    pub fn is_shutdown(&self) -> bool {
        self.bits & libc::EPOLLRDHUP as u32 != 0
    }
}

/// Reusable buffer for [`Poller::wait`].
pub struct Events {
    raw: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(cap: usize) -> Events {
        let cap = cap.max(1);
        Events {
            raw: vec![libc::epoll_event { events: 0, u64: 0 }; cap],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.raw[..self.len].iter().map(|e| Event {
            fd: e.u64 as RawFd,
            bits: e.events,
        })
    }
}

/// An epoll instance. Cheap to share (`Arc<Poller>`); all operations are
/// `&self` and thread-safe at the kernel level.
pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, bits: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: bits,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Register `fd` with the given interest. Falls back to modification if
    /// the fd is already present.
    pub fn add(&self, fd: RawFd, notify: Notify, mode: PollMode) -> io::Result<()> {
        let bits = notify.epoll_bits() | mode.epoll_bits();
        match self.ctl(libc::EPOLL_CTL_ADD, fd, bits) {
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, bits)
            }
            other => other,
        }
    }

    /// Register `fd` for a single delivery; the registration disarms itself
    /// after the event fires and can be re-armed with [`Poller::modify`].
    pub fn add_oneshot(&self, fd: RawFd, notify: Notify) -> io::Result<()> {
        let bits = notify.epoll_bits() | libc::EPOLLONESHOT as u32;
        match self.ctl(libc::EPOLL_CTL_ADD, fd, bits) {
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, bits)
            }
            other => other,
        }
    }

    /// Change the interest of an existing registration. Falls back to a
    /// fresh add if the registration is gone.
    pub fn modify(&self, fd: RawFd, notify: Notify, mode: PollMode) -> io::Result<()> {
        let bits = notify.epoll_bits() | mode.epoll_bits();
        match self.ctl(libc::EPOLL_CTL_MOD, fd, bits) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(libc::EPOLL_CTL_ADD, fd, bits)
            }
            other => other,
        }
    }

    /// Drop a registration. Tolerates fds that were already closed or never
    /// registered.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
            Err(e)
                if e.raw_os_error() == Some(libc::ENOENT)
                    || e.raw_os_error() == Some(libc::EBADF) =>
            {
                Ok(())
            }
            other => other,
        }
    }

    /// Block until at least one registration is ready or the timeout
    /// expires. EINTR is retried internally.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.raw.as_mut_ptr(),
                    events.raw.len() as i32,
                    timeout_ms,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            events.len = n as usize;
            return Ok(events.len);
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
