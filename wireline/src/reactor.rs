//! Reactor: one epoll poller and one handler instance per worker thread.
//!
//! Each worker owns its poller and blocks in `epoll_wait`, dispatching each
//! readiness batch to its handler. Handlers are created per worker slot and
//! stay pinned to that worker for their lifetime; cross-thread work reaches
//! them through [`NotifyQueue`](crate::NotifyQueue)s bound during
//! [`Handler::attach`]. Shutdown is signaled with a per-worker eventfd so a
//! blocked worker wakes immediately.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::config::{num_cpus, ReactorConfig};
use crate::error::Error;
use crate::poller::{Event, Events, Notify, PollMode, Poller};

/// A per-worker event handler.
///
/// Exactly one instance exists per worker slot, and its [`on_ready`]
/// (and everything it calls inline) runs only on that worker's thread.
///
/// [`on_ready`]: Handler::on_ready
pub trait Handler: Send + Sync + 'static {
    /// Called once on the owning worker thread before the event loop
    /// starts. Register notification queues and record thread identity
    /// here.
    fn attach(&self, poller: &Arc<Poller>) -> io::Result<()>;

    /// One readiness batch.
    fn on_ready(&self, events: &[Event]);
}

/// Worker threads driving per-worker handlers.
pub struct Reactor<H: Handler> {
    handlers: Vec<Arc<H>>,
    pollers: Vec<Arc<Poller>>,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_fds: Vec<RawFd>,
    threads: Vec<thread::JoinHandle<()>>,
    event_batch: usize,
}

impl<H: Handler> Reactor<H> {
    /// Build a reactor with one handler per worker slot. The factory is
    /// called with the worker index.
    pub fn new<F>(config: &ReactorConfig, factory: F) -> Result<Reactor<H>, Error>
    where
        F: Fn(usize) -> io::Result<H>,
    {
        config.validate()?;
        let threads = if config.threads == 0 {
            num_cpus()
        } else {
            config.threads
        };

        let mut handlers = Vec::with_capacity(threads);
        let mut pollers = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            pollers.push(Arc::new(Poller::new()?));
            handlers.push(Arc::new(factory(worker_id)?));
        }

        // Raw fds last, so every earlier failure unwinds through Drop.
        let mut shutdown_fds = Vec::with_capacity(threads);
        for _ in 0..threads {
            let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if efd < 0 {
                let err = io::Error::last_os_error();
                for &fd in &shutdown_fds {
                    unsafe {
                        libc::close(fd);
                    }
                }
                return Err(Error::Io(err));
            }
            shutdown_fds.push(efd);
        }

        Ok(Reactor {
            handlers,
            pollers,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_fds,
            threads: Vec::with_capacity(threads),
            event_batch: config.event_batch,
        })
    }

    /// The per-worker handler slots, in worker order.
    pub fn handlers(&self) -> &[Arc<H>] {
        &self.handlers
    }

    /// Spawn the worker threads. Call once.
    pub fn run(&mut self) -> Result<(), Error> {
        debug_assert!(self.threads.is_empty(), "reactor already running");
        for (worker_id, handler) in self.handlers.iter().enumerate() {
            let handler = Arc::clone(handler);
            let poller = Arc::clone(&self.pollers[worker_id]);
            let shutdown_fd = self.shutdown_fds[worker_id];
            let shutdown_flag = Arc::clone(&self.shutdown_flag);
            let event_batch = self.event_batch;

            let handle = thread::Builder::new()
                .name(format!("wireline-worker-{worker_id}"))
                .spawn(move || {
                    worker_loop(handler, poller, shutdown_fd, shutdown_flag, event_batch);
                })
                .map_err(Error::Io)?;
            self.threads.push(handle);
        }
        Ok(())
    }

    /// Signal all workers and join them. Idempotent.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shutdown_flag.store(true, Ordering::Release);
        for &efd in &self.shutdown_fds {
            let one: u64 = 1;
            unsafe {
                libc::write(efd, &one as *const u64 as *const libc::c_void, 8);
            }
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<H: Handler> Drop for Reactor<H> {
    fn drop(&mut self) {
        self.shutdown();
        for &efd in &self.shutdown_fds {
            unsafe {
                libc::close(efd);
            }
        }
    }
}

fn worker_loop<H: Handler>(
    handler: Arc<H>,
    poller: Arc<Poller>,
    shutdown_fd: RawFd,
    shutdown_flag: Arc<AtomicBool>,
    event_batch: usize,
) {
    if poller
        .add(shutdown_fd, Notify::READ, PollMode::Level)
        .is_err()
    {
        return;
    }
    if handler.attach(&poller).is_err() {
        return;
    }

    let mut events = Events::with_capacity(event_batch);
    let mut batch: Vec<Event> = Vec::with_capacity(event_batch);

    loop {
        if poller.wait(&mut events, None).is_err() {
            break;
        }

        batch.clear();
        let mut stop = false;
        for event in events.iter() {
            if event.fd == shutdown_fd {
                stop = true;
            } else {
                batch.push(event);
            }
        }

        if !batch.is_empty() {
            handler.on_ready(&batch);
        }
        if stop || shutdown_flag.load(Ordering::Acquire) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::NotifyQueue;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Counting {
        queue: NotifyQueue<u32>,
        seen: Mutex<Vec<u32>>,
        batches: AtomicUsize,
    }

    impl Handler for Counting {
        fn attach(&self, poller: &Arc<Poller>) -> io::Result<()> {
            self.queue.bind(poller)
        }

        fn on_ready(&self, events: &[Event]) {
            self.batches.fetch_add(1, Ordering::SeqCst);
            for event in events {
                if event.fd == self.queue.event_fd() {
                    self.queue.drain_signal();
                    while let Some(v) = self.queue.pop() {
                        self.seen
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .push(v);
                    }
                }
            }
        }
    }

    #[test]
    fn queue_items_reach_the_worker() {
        let config = ReactorConfig::default();
        let mut reactor = Reactor::new(&config, |_| {
            Ok(Counting {
                queue: NotifyQueue::new()?,
                seen: Mutex::new(Vec::new()),
                batches: AtomicUsize::new(0),
            })
        })
        .unwrap();
        reactor.run().unwrap();

        let handler = Arc::clone(&reactor.handlers()[0]);
        handler.queue.push(1);
        handler.queue.push(2);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            {
                let seen = handler
                    .seen
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if seen.as_slice() == [1, 2] {
                    break;
                }
            }
            assert!(std::time::Instant::now() < deadline, "items never drained");
            thread::sleep(Duration::from_millis(5));
        }

        reactor.shutdown();
    }

    #[test]
    fn shutdown_joins_workers() {
        let config = ReactorConfig::default().threads(2);
        let mut reactor = Reactor::new(&config, |_| {
            Ok(Counting {
                queue: NotifyQueue::new()?,
                seen: Mutex::new(Vec::new()),
                batches: AtomicUsize::new(0),
            })
        })
        .unwrap();
        assert_eq!(reactor.handlers().len(), 2);
        reactor.run().unwrap();
        reactor.shutdown();
        // Second shutdown is a no-op.
        reactor.shutdown();
    }
}
