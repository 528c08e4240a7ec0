//! Reactor-integrated notification queue.
//!
//! An MPSC channel paired with an eventfd. Producers on any thread push an
//! item and bump the eventfd; the reactor sees the eventfd readable in its
//! next batch (tagged by the eventfd itself) and drains the channel. The
//! eventfd is registered level-triggered so a wakeup is never lost when a
//! batch is cut short.

use std::io;
use std::os::fd::RawFd;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::poller::{Notify, PollMode, Poller};

/// MPSC queue whose non-empty state wakes a reactor.
pub struct NotifyQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    efd: RawFd,
}

impl<T> NotifyQueue<T> {
    pub fn new() -> io::Result<NotifyQueue<T>> {
        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if efd < 0 {
            return Err(io::Error::last_os_error());
        }
        let (tx, rx) = unbounded();
        Ok(NotifyQueue { tx, rx, efd })
    }

    /// Enqueue an item and wake the bound reactor. Callable from any thread.
    pub fn push(&self, item: T) {
        // Both ends live in self, so the send cannot fail.
        let _ = self.tx.send(item);
        let one: u64 = 1;
        unsafe {
            libc::write(self.efd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    /// Dequeue one item, if any.
    pub fn pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Register this queue's eventfd with the poller. The fd doubles as the
    /// queue's dispatch tag.
    pub fn bind(&self, poller: &Poller) -> io::Result<()> {
        poller.add(self.efd, Notify::READ, PollMode::Level)
    }

    /// The tag fd readiness batches carry for this queue.
    pub fn event_fd(&self) -> RawFd {
        self.efd
    }

    /// Reset the eventfd counter. Call once per wakeup, before draining.
    pub fn drain_signal(&self) {
        let mut value: u64 = 0;
        unsafe {
            libc::read(self.efd, &mut value as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl<T> Drop for NotifyQueue<T> {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.efd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Events;
    use std::time::Duration;

    #[test]
    fn push_wakes_bound_poller_and_items_drain_fifo() {
        let poller = Poller::new().unwrap();
        let queue: NotifyQueue<u32> = NotifyQueue::new().unwrap();
        queue.bind(&poller).unwrap();

        queue.push(1);
        queue.push(2);
        queue.push(3);

        let mut events = Events::with_capacity(8);
        let n = poller
            .wait(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(events.iter().next().unwrap().fd, queue.event_fd());

        queue.drain_signal();
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);

        // Counter drained — no further wakeups until the next push.
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn push_from_other_thread() {
        let poller = Poller::new().unwrap();
        let queue: NotifyQueue<&'static str> = NotifyQueue::new().unwrap();
        queue.bind(&poller).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| queue.push("hello"));
            let mut events = Events::with_capacity(8);
            let n = poller
                .wait(&mut events, Some(Duration::from_secs(1)))
                .unwrap();
            assert_eq!(n, 1);
        });
        queue.drain_signal();
        assert_eq!(queue.pop(), Some("hello"));
    }
}
