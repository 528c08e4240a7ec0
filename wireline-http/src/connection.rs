//! A pooled connection: one socket, one parser, at most one in-flight
//! request.
//!
//! Two independent atomic states govern a connection. The *lease*
//! (Idle/Used) gates exclusive use and is only ever taken by CAS; the
//! *link* (NotConnected/Connecting/Connected) tracks the socket. Requests
//! arriving while the link is still connecting queue locally and drain once
//! the connect promise resolves.
//!
//! Terminal paths (response, error, timeout) follow one ordering rule: the
//! timer is removed from the transport and released to the pool first, the
//! caller's promise resolves or rejects next, `inflight` is cleared, and
//! `on_done` runs last — `on_done` may re-enter the client and dispatch the
//! next request on this same connection.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use wireline::promise::{promise, Resolver};
use wireline::timer::{TimerEntry, TimerPool};

use crate::error::Error;
use crate::metrics;
use crate::net::{self, Address};
use crate::parser::{ParseState, ResponseParser};
use crate::request::Request;
use crate::response::Response;
use crate::serialize;
use crate::transport::Transport;
use crate::ResponseFuture;

const LEASE_IDLE: u32 = 0;
const LEASE_USED: u32 = 1;

const LINK_NOT_CONNECTED: u32 = 0;
const LINK_CONNECTING: u32 = 1;
const LINK_CONNECTED: u32 = 2;

/// Completion hook invoked exactly once after a request resolves or
/// rejects. Releases the pool lease and re-enters admission draining.
pub(crate) type OnDone = Box<dyn FnOnce() + Send>;

/// A deferred request, created on the caller thread and consumed on the
/// reactor thread.
pub(crate) struct RequestData {
    pub(crate) resolver: Resolver<Response, Error>,
    pub(crate) request: Request,
    pub(crate) timeout: Duration,
    pub(crate) on_done: Option<OnDone>,
}

/// The single in-flight request on a connection.
struct RequestEntry {
    resolver: Resolver<Response, Error>,
    timer: Option<Arc<TimerEntry>>,
    on_done: Option<OnDone>,
}

/// A pooled HTTP/1.1 connection.
pub struct Connection {
    fd: AtomicI32,
    lease: AtomicU32,
    link: AtomicU32,
    transport: OnceLock<Arc<Transport>>,
    parser: Mutex<ResponseParser>,
    inflight: Mutex<Option<RequestEntry>>,
    local_queue_tx: Sender<RequestData>,
    local_queue_rx: Receiver<RequestData>,
    timers: TimerPool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Connection {
    pub(crate) fn new() -> Connection {
        let (local_queue_tx, local_queue_rx) = unbounded();
        Connection {
            fd: AtomicI32::new(-1),
            lease: AtomicU32::new(LEASE_IDLE),
            link: AtomicU32::new(LINK_NOT_CONNECTED),
            transport: OnceLock::new(),
            parser: Mutex::new(ResponseParser::new()),
            inflight: Mutex::new(None),
            local_queue_tx,
            local_queue_rx,
            timers: TimerPool::new(),
            local_addr: Mutex::new(None),
        }
    }

    // ── Lease state ──────────────────────────────────────────────────

    /// Attempt the Idle→Used transition. Linearizable per connection.
    pub(crate) fn try_lease(&self) -> bool {
        self.lease
            .compare_exchange(
                LEASE_IDLE,
                LEASE_USED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Used→Idle. A plain store: only the lease owner releases.
    pub(crate) fn release_lease(&self) {
        self.lease.store(LEASE_IDLE, Ordering::Release);
    }

    pub fn is_idle(&self) -> bool {
        self.lease.load(Ordering::Acquire) == LEASE_IDLE
    }

    // ── Link state ───────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.link.load(Ordering::Acquire) == LINK_CONNECTED
    }

    /// Local socket address, populated after the connect completes.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_transport(&self) -> bool {
        self.transport.get().is_some()
    }

    /// One-shot association with a transport; a second attempt fails.
    pub(crate) fn associate_transport(&self, transport: Arc<Transport>) -> Result<(), Error> {
        self.transport
            .set(transport)
            .map_err(|_| Error::TransportAssociated)
    }

    pub(crate) fn fd(&self) -> RawFd {
        let fd = self.fd.load(Ordering::Acquire);
        debug_assert!(fd != -1, "connection has no socket");
        fd
    }

    /// Like [`fd`](Self::fd) but without the liveness assertion; −1 once
    /// closed.
    pub(crate) fn current_fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    /// Open a non-blocking socket toward the first resolved candidate and
    /// hand it to the transport. The connect completion (on the reactor
    /// thread) flips the link to Connected and drains the local queue; a
    /// failure rejects every queued request.
    pub(crate) fn connect(self: &Arc<Self>, addr: &Address) -> Result<(), Error> {
        let mut candidates = addr
            .resolve()
            .map_err(|e| Error::Connect(format!("resolve {}: {e}", addr.host)))?;
        let candidate = candidates
            .next()
            .ok_or_else(|| Error::Connect(format!("no usable address for {}", addr.host)))?;
        let transport = self
            .transport
            .get()
            .ok_or_else(|| Error::Connect("no transport associated".into()))?;

        let fd = net::nonblocking_stream_socket(&candidate)
            .map_err(|e| Error::Connect(e.to_string()))?;
        self.link.store(LINK_CONNECTING, Ordering::Release);
        self.fd.store(fd, Ordering::Release);

        let conn = Arc::clone(self);
        transport
            .async_connect(Arc::clone(self), candidate)
            .then(move |result| match result {
                Ok(()) => {
                    *conn
                        .local_addr
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = net::local_addr(conn.fd());
                    conn.link.store(LINK_CONNECTED, Ordering::Release);
                    metrics::CONNECTIONS_OPENED.increment();
                    conn.process_local_queue();
                }
                Err(err) => {
                    metrics::CONNECT_FAILURES.increment();
                    conn.close();
                    conn.fail_pending(err);
                }
            });
        Ok(())
    }

    // ── Request dispatch ─────────────────────────────────────────────

    /// Immediate path: serialize and send now. Requires a connected link.
    pub(crate) fn perform(
        self: &Arc<Self>,
        request: Request,
        timeout: Duration,
        on_done: Option<OnDone>,
    ) -> ResponseFuture {
        let (future, resolver) = promise();
        self.perform_impl(request, timeout, resolver, on_done);
        future
    }

    /// Deferred path: queue until the connect completion drains us.
    pub(crate) fn async_perform(
        &self,
        request: Request,
        timeout: Duration,
        on_done: Option<OnDone>,
    ) -> ResponseFuture {
        let (future, resolver) = promise();
        let _ = self.local_queue_tx.send(RequestData {
            resolver,
            request,
            timeout,
            on_done,
        });
        future
    }

    pub(crate) fn perform_impl(
        self: &Arc<Self>,
        request: Request,
        timeout: Duration,
        resolver: Resolver<Response, Error>,
        on_done: Option<OnDone>,
    ) {
        let buffer = serialize::write_request(&request);

        let timer = if timeout > Duration::ZERO {
            match self.timers.pick() {
                Ok(timer) => match timer.arm(timeout) {
                    Ok(()) => Some(timer),
                    Err(e) => {
                        self.timers.release(timer);
                        resolver.reject(Error::Send(format!("could not arm timer: {e}")));
                        if let Some(on_done) = on_done {
                            on_done();
                        }
                        return;
                    }
                },
                Err(e) => {
                    resolver.reject(Error::Send(format!("no timer available: {e}")));
                    if let Some(on_done) = on_done {
                        on_done();
                    }
                    return;
                }
            }
        } else {
            None
        };

        {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            debug_assert!(
                inflight.is_none(),
                "connection already has an in-flight request"
            );
            *inflight = Some(RequestEntry {
                resolver,
                timer: timer.clone(),
                on_done,
            });
        }

        let transport = match self.transport.get() {
            Some(transport) => Arc::clone(transport),
            None => {
                self.handle_error(Error::Send("no transport associated".into()));
                return;
            }
        };
        metrics::REQUESTS_DISPATCHED.increment();
        // The send promise's outcome is folded into the request entry's
        // terminal paths; the count itself has no further consumer.
        let _sent = transport.async_send_request(Arc::clone(self), timer, buffer);
    }

    /// Park an already-built request on the local queue; the connect
    /// completion drains it.
    pub(crate) fn queue_request(&self, data: RequestData) {
        let _ = self.local_queue_tx.send(data);
    }

    /// Drain requests queued while the link was connecting.
    pub(crate) fn process_local_queue(self: &Arc<Self>) {
        while let Ok(data) = self.local_queue_rx.try_recv() {
            let RequestData {
                resolver,
                request,
                timeout,
                on_done,
            } = data;
            self.perform_impl(request, timeout, resolver, on_done);
        }
    }

    /// Reject every queued request, running each completion hook.
    pub(crate) fn fail_pending(&self, err: Error) {
        while let Ok(data) = self.local_queue_rx.try_recv() {
            let RequestData {
                resolver, on_done, ..
            } = data;
            resolver.reject(err.clone());
            if let Some(on_done) = on_done {
                on_done();
            }
        }
    }

    // ── Terminal paths (reactor thread) ──────────────────────────────

    /// Feed response bytes from the wire; resolves the in-flight request
    /// when the parser completes a message.
    pub(crate) fn handle_response_packet(self: &Arc<Self>, bytes: &[u8]) {
        let outcome = {
            let mut parser = self.parser.lock().unwrap_or_else(PoisonError::into_inner);
            parser.feed(bytes);
            match parser.parse() {
                Ok(ParseState::NeedMore) => None,
                Ok(ParseState::Done) => {
                    let response = parser.take_response();
                    parser.reset();
                    Some(Ok(response))
                }
                Err(err) => Some(Err(err)),
            }
        };
        match outcome {
            None => {}
            Some(Ok(response)) => {
                metrics::RESPONSES_COMPLETED.increment();
                self.complete(Ok(response));
            }
            Some(Err(err)) => {
                // A malformed response poisons the stream; the socket goes
                // down with the request.
                self.close();
                self.complete(Err(err));
            }
        }
    }

    pub(crate) fn handle_error(self: &Arc<Self>, err: Error) {
        self.complete(Err(err));
    }

    /// The request timer fired. The socket is poisoned — a response may
    /// still arrive for the request we are abandoning — so close before
    /// rejecting.
    pub(crate) fn handle_timeout(self: &Arc<Self>) {
        self.close();
        if self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            metrics::REQUEST_TIMEOUTS.increment();
        }
        self.complete(Err(Error::Timeout));
    }

    fn complete(self: &Arc<Self>, result: Result<Response, Error>) {
        let entry = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(entry) = entry else { return };
        let RequestEntry {
            resolver,
            timer,
            on_done,
        } = entry;

        if let Some(timer) = timer {
            if let Some(transport) = self.transport.get() {
                transport.remove_timeout(timer.fd());
            }
            self.timers.release(timer);
        }

        match result {
            Ok(response) => resolver.resolve(response),
            Err(err) => resolver.reject(err),
        }

        // Last: may re-enter perform() on this connection via pool release.
        if let Some(on_done) = on_done {
            on_done();
        }
    }

    pub(crate) fn close(&self) {
        self.link.store(LINK_NOT_CONNECTED, Ordering::Release);
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            self.discard_stream_state();
            metrics::CONNECTIONS_CLOSED.increment();
            unsafe {
                libc::close(fd);
            }
        }
    }

    /// Close only while the connection still owns `fd`. A completion hook
    /// may have closed and reconnected in the meantime; closing blindly
    /// could then hit the replacement socket.
    pub(crate) fn close_if(&self, fd: RawFd) {
        if self
            .fd
            .compare_exchange(fd, -1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.link.store(LINK_NOT_CONNECTED, Ordering::Release);
            self.discard_stream_state();
            metrics::CONNECTIONS_CLOSED.increment();
            unsafe {
                libc::close(fd);
            }
        }
    }

    /// Partial input from a dead socket must not bleed into the next one.
    fn discard_stream_state(&self) {
        self.parser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_cas_wins_once() {
        let conn = Connection::new();
        assert!(conn.is_idle());
        assert!(conn.try_lease());
        assert!(!conn.try_lease());
        conn.release_lease();
        assert!(conn.try_lease());
    }

    #[test]
    fn fresh_connection_is_idle_and_unlinked() {
        let conn = Connection::new();
        assert!(conn.is_idle());
        assert!(!conn.is_connected());
        assert!(!conn.has_transport());
        assert!(conn.local_addr().is_none());
    }

    #[test]
    fn async_perform_queues_until_failed() {
        let conn = Arc::new(Connection::new());
        let future = conn.async_perform(
            Request::new(crate::request::Method::Get, "http://h/".into()),
            Duration::ZERO,
            None,
        );
        conn.fail_pending(Error::Connect("refused".into()));
        match future.wait_timeout(Duration::from_secs(1)) {
            Some(Err(Error::Connect(_))) => {}
            other => panic!("expected connect failure, got {other:?}"),
        }
    }

    #[test]
    fn fail_pending_runs_on_done() {
        let conn = Arc::new(Connection::new());
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let _future = conn.async_perform(
            Request::new(crate::request::Method::Get, "http://h/".into()),
            Duration::ZERO,
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
        );
        conn.fail_pending(Error::Connect("refused".into()));
        assert!(fired.load(Ordering::SeqCst));
    }
}
