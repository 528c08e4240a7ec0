//! Transport: the reactor handler that owns the sockets.
//!
//! One transport instance lives on each reactor worker. All socket syscalls
//! happen on that worker thread: caller threads reach the transport through
//! two notification queues (connects and sends), and `async_send_request`
//! short-circuits to the inline send path when the caller already *is* the
//! owning thread (completion callbacks re-entering the client).
//!
//! The transport holds only weak references to connections — the pool is
//! the strong owner — so every event handler upgrades-or-skips, and a
//! pending promise is cleanly rejected when the connection is gone.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::thread::{self, ThreadId};

use wireline::poller::{Event, Notify, PollMode, Poller};
use wireline::promise::{promise, Promise, Resolver};
use wireline::queue::NotifyQueue;
use wireline::reactor::Handler;
use wireline::timer::TimerEntry;

use crate::connection::Connection;
use crate::error::Error;
use crate::metrics;
use crate::net;

/// Fixed receive buffer size per read pass. Responses larger than one fill
/// are delivered to the parser across successive packets.
const MAX_BUFFER: usize = 64 * 1024;

/// Per-fd state between connect initiation and completion, and the weak
/// connection handle for response delivery afterwards.
struct ConnectionContext {
    conn: Weak<Connection>,
    resolver: Option<Resolver<(), Error>>,
    peer: SocketAddr,
}

/// A connect handed across threads via the connections queue.
struct ConnectEntry {
    conn: Weak<Connection>,
    addr: SocketAddr,
    resolver: Resolver<(), Error>,
}

/// A serialized request in flight toward the kernel. Owns the wire buffer
/// until fully written; `offset` records resume position across EAGAIN.
struct SendEntry {
    conn: Weak<Connection>,
    timer: Option<Arc<TimerEntry>>,
    buffer: Vec<u8>,
    offset: usize,
    rearmed: bool,
    resolver: Option<Resolver<usize, Error>>,
}

pub(crate) struct Transport {
    poller: OnceLock<Arc<Poller>>,
    owner: OnceLock<ThreadId>,
    connections: Mutex<HashMap<RawFd, ConnectionContext>>,
    pending_sends: Mutex<HashMap<RawFd, SendEntry>>,
    timeouts: Mutex<HashMap<RawFd, Weak<Connection>>>,
    connections_queue: NotifyQueue<ConnectEntry>,
    requests_queue: NotifyQueue<SendEntry>,
    recv_buf: Mutex<Vec<u8>>,
}

impl Transport {
    pub(crate) fn new() -> io::Result<Transport> {
        Ok(Transport {
            poller: OnceLock::new(),
            owner: OnceLock::new(),
            connections: Mutex::new(HashMap::new()),
            pending_sends: Mutex::new(HashMap::new()),
            timeouts: Mutex::new(HashMap::new()),
            connections_queue: NotifyQueue::new()?,
            requests_queue: NotifyQueue::new()?,
            recv_buf: Mutex::new(vec![0u8; MAX_BUFFER]),
        })
    }

    /// Queue a non-blocking connect for `conn`'s socket. The promise
    /// resolves once the reactor observes write readiness.
    pub(crate) fn async_connect(
        &self,
        conn: Arc<Connection>,
        addr: SocketAddr,
    ) -> Promise<(), Error> {
        let (future, resolver) = promise();
        self.connections_queue.push(ConnectEntry {
            conn: Arc::downgrade(&conn),
            addr,
            resolver,
        });
        future
    }

    /// Send a serialized request. Runs inline when called on the owning
    /// reactor thread, otherwise hops through the requests queue so all
    /// socket syscalls stay on the owner.
    pub(crate) fn async_send_request(
        &self,
        conn: Arc<Connection>,
        timer: Option<Arc<TimerEntry>>,
        buffer: Vec<u8>,
    ) -> Promise<usize, Error> {
        let (future, resolver) = promise();
        let entry = SendEntry {
            conn: Arc::downgrade(&conn),
            timer,
            buffer,
            offset: 0,
            rearmed: false,
            resolver: Some(resolver),
        };
        if self.owner.get() == Some(&thread::current().id()) {
            self.send_request_impl(entry);
        } else {
            self.requests_queue.push(entry);
        }
        future
    }

    /// Erase a timeout entry. No-op when the timer already fired or was
    /// never registered. Connection terminal paths call this before the
    /// timer returns to its pool, so a recycled timer fd cannot cancel a
    /// later request.
    pub(crate) fn remove_timeout(&self, timer_fd: RawFd) {
        self.timeouts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&timer_fd);
    }

    fn poller(&self) -> &Arc<Poller> {
        // Set in attach(), which the reactor runs before any dispatch.
        self.poller.get().expect("transport not attached")
    }

    // ── Queue drains ─────────────────────────────────────────────────

    fn handle_connection_queue(&self) {
        self.connections_queue.drain_signal();
        while let Some(entry) = self.connections_queue.pop() {
            let ConnectEntry {
                conn,
                addr,
                resolver,
            } = entry;
            let Some(strong) = conn.upgrade() else {
                resolver.reject(Error::Connect("connection dropped before connect".into()));
                continue;
            };
            let fd = strong.fd();

            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let len = net::socket_addr_to_sockaddr(addr, &mut storage);
            let ret = unsafe {
                libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINPROGRESS) {
                    resolver.reject(Error::Connect(err.to_string()));
                    continue;
                }
            }
            // In progress, or an immediate success: either way the one-shot
            // write readiness delivers completion.
            if let Err(e) = self
                .poller()
                .add_oneshot(fd, Notify::WRITE | Notify::HANGUP | Notify::SHUTDOWN)
            {
                resolver.reject(Error::Connect(e.to_string()));
                continue;
            }
            self.connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    fd,
                    ConnectionContext {
                        conn,
                        resolver: Some(resolver),
                        peer: addr,
                    },
                );
        }
    }

    fn handle_requests_queue(&self) {
        self.requests_queue.drain_signal();
        while let Some(entry) = self.requests_queue.pop() {
            self.send_request_impl(entry);
        }
    }

    // ── Send path ────────────────────────────────────────────────────

    fn send_request_impl(&self, mut entry: SendEntry) {
        let Some(conn) = entry.conn.upgrade() else {
            if let Some(resolver) = entry.resolver.take() {
                resolver.reject(Error::Send("connection dropped".into()));
            }
            return;
        };
        let fd = conn.fd();

        loop {
            let remaining = entry.buffer.len() - entry.offset;
            if remaining == 0 {
                break;
            }
            let ret = unsafe {
                libc::send(
                    fd,
                    entry.buffer.as_ptr().add(entry.offset) as *const libc::c_void,
                    remaining,
                    libc::MSG_NOSIGNAL,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    // Kernel send buffer full — first attempt or resumed
                    // alike. Park the entry and resume at the recorded
                    // offset on write readiness.
                    if let Err(e) = self.poller().modify(fd, Notify::WRITE, PollMode::Edge) {
                        conn.handle_error(Error::Send(e.to_string()));
                        return;
                    }
                    entry.rearmed = true;
                    self.pending_sends
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(fd, entry);
                    return;
                }
                conn.handle_error(Error::Send(err.to_string()));
                return;
            }
            entry.offset += ret as usize;
        }

        // Fully written.
        if entry.rearmed {
            let _ = self.poller().modify(fd, Notify::READ, PollMode::Edge);
        }
        if let Some(timer) = &entry.timer {
            self.timeouts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(timer.fd(), entry.conn.clone());
            if timer.register(self.poller()).is_err() {
                self.timeouts
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&timer.fd());
            }
        }
        if let Some(resolver) = entry.resolver.take() {
            resolver.resolve(entry.buffer.len());
        }
    }

    // ── Readiness dispatch ───────────────────────────────────────────

    fn handle_readable(&self, fd: RawFd) {
        let conn = {
            let map = self
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            map.get(&fd).and_then(|ctx| ctx.conn.upgrade())
        };
        if let Some(conn) = conn {
            self.handle_incoming(conn);
            return;
        }

        // Not a socket we know: a request timer fired. The entry is removed
        // before delivery so a response racing in later cannot double-fire.
        let conn = {
            let mut timeouts = self
                .timeouts
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            timeouts.remove(&fd).and_then(|weak| weak.upgrade())
        };
        if let Some(conn) = conn {
            conn.handle_timeout();
        }
    }

    fn handle_incoming(&self, conn: Arc<Connection>) {
        let fd = conn.fd();
        let mut buf = self
            .recv_buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut total = 0usize;

        loop {
            let ret = unsafe {
                libc::recv(
                    fd,
                    buf.as_mut_ptr().add(total) as *mut libc::c_void,
                    MAX_BUFFER - total,
                    0,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    if total > 0 {
                        self.deliver_packet(&conn, fd, &buf[..total]);
                    }
                } else {
                    conn.handle_error(Error::Recv(err.to_string()));
                    self.drop_connection(fd);
                    conn.close_if(fd);
                }
                return;
            }
            if ret == 0 {
                // Orderly shutdown from the remote.
                if total > 0 {
                    if !self.deliver_packet(&conn, fd, &buf[..total]) {
                        return;
                    }
                } else {
                    conn.handle_error(Error::Recv("remote closed connection".into()));
                }
                self.drop_connection(fd);
                conn.close_if(fd);
                return;
            }
            total += ret as usize;
            if total == MAX_BUFFER {
                // Buffer filled: flush and keep draining until EAGAIN.
                metrics::RECV_BUFFER_REFILLS.increment();
                if !self.deliver_packet(&conn, fd, &buf[..total]) {
                    return;
                }
                total = 0;
            }
        }
    }

    /// Feed a packet to the connection, then confirm the socket survived.
    /// A completion hook may close the socket inline (keep-alive off) and
    /// even reconnect with a fresh one — possibly reusing the same fd
    /// number, which is why the link state is checked alongside the fd.
    /// Returns false when the read loop must stop.
    fn deliver_packet(&self, conn: &Arc<Connection>, fd: RawFd, packet: &[u8]) -> bool {
        conn.handle_response_packet(packet);
        if conn.current_fd() == fd && conn.is_connected() {
            return true;
        }
        self.drop_connection(fd);
        false
    }

    fn handle_writable(&self, fd: RawFd) {
        // A parked partial send resumes first — but only if its connection
        // still owns this fd. The fd number may have been recycled into a
        // fresh connect after the original socket failed, in which case
        // the stale entry is discarded and the event is a connect
        // completion.
        let pending = self
            .pending_sends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fd);
        if let Some(entry) = pending {
            let live = entry
                .conn
                .upgrade()
                .map(|conn| conn.current_fd() == fd && conn.is_connected())
                .unwrap_or(false);
            if live {
                self.send_request_impl(entry);
                return;
            }
        }

        // Otherwise this is a connect completing.
        let (resolver, conn, peer) = {
            let mut map = self
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match map.get_mut(&fd) {
                Some(ctx) => (ctx.resolver.take(), ctx.conn.upgrade(), ctx.peer),
                None => return,
            }
        };
        let Some(resolver) = resolver else { return };

        let err = net::socket_error(fd);
        if err != 0 {
            let err = io::Error::from_raw_os_error(err);
            self.drop_connection(fd);
            resolver.reject(Error::Connect(format!("connect to {peer}: {err}")));
            return;
        }

        match conn {
            Some(_) => {
                // Watch for response bytes before the continuation can
                // dispatch a request, so nothing is ever sent on an fd the
                // reactor is not reading.
                if let Err(e) = self.poller().modify(fd, Notify::READ, PollMode::Edge) {
                    self.drop_connection(fd);
                    resolver.reject(Error::Connect(e.to_string()));
                    return;
                }
                // The connection's continuation flips the link state and
                // drains its local queue.
                resolver.resolve(());
            }
            None => {
                self.drop_connection(fd);
                resolver.reject(Error::Connect("connection lost".into()));
            }
        }
    }

    fn handle_hangup(&self, fd: RawFd) {
        let (resolver, conn, peer) = {
            let mut map = self
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match map.get_mut(&fd) {
                Some(ctx) => (ctx.resolver.take(), ctx.conn.upgrade(), ctx.peer),
                None => return,
            }
        };
        if let Some(resolver) = resolver {
            // Hung up before write readiness: the connect failed. The
            // rejection runs the connect continuation, which closes the
            // socket and fails queued requests.
            self.drop_connection(fd);
            resolver.reject(Error::Connect(format!("could not connect to {peer}")));
            return;
        }
        if let Some(conn) = conn {
            conn.handle_error(Error::Recv("connection hangup".into()));
            self.drop_connection(fd);
            conn.close_if(fd);
        }
    }

    fn drop_connection(&self, fd: RawFd) {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fd);
        self.pending_sends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fd);
        let _ = self.poller().remove(fd);
    }
}

impl Handler for Transport {
    fn attach(&self, poller: &Arc<Poller>) -> io::Result<()> {
        let _ = self.poller.set(Arc::clone(poller));
        let _ = self.owner.set(thread::current().id());
        self.connections_queue.bind(poller)?;
        self.requests_queue.bind(poller)?;
        Ok(())
    }

    fn on_ready(&self, events: &[Event]) {
        for event in events {
            if event.fd == self.connections_queue.event_fd() {
                self.handle_connection_queue();
            } else if event.fd == self.requests_queue.event_fd() {
                self.handle_requests_queue();
            } else if event.is_readable() {
                self.handle_readable(event.fd);
            } else if event.is_writable() {
                self.handle_writable(event.fd);
            } else if event.is_hangup() || event.is_shutdown() {
                self.handle_hangup(event.fd);
            }
        }
    }
}
