//! Client facade: request building, transport selection, and admission.
//!
//! `do_request` leases a pooled connection and dispatches, or — when the
//! host's pool is exhausted — parks the request in a bounded per-host
//! admission queue. Completion hooks release the lease and drain the
//! queues, so deferred requests ride out in FIFO order as slots free up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use wireline::promise::promise;
use wireline::reactor::Reactor;
use wireline::ReactorConfig;

use crate::connection::{Connection, OnDone, RequestData};
use crate::error::Error;
use crate::metrics;
use crate::net::Address;
use crate::pool::ConnectionPool;
use crate::request::{Method, Request, RequestBuilder};
use crate::serialize;
use crate::transport::Transport;
use crate::ResponseFuture;

/// Client options.
#[derive(Clone)]
pub struct Options {
    /// Reactor worker threads. 0 = number of CPUs.
    pub threads: usize,
    /// Reuse connections across requests. When off, every request carries
    /// `Connection: close` and the socket is torn down after one exchange.
    pub keep_alive: bool,
    /// Pool slots per remote host.
    pub max_connections_per_host: usize,
    /// Admission queue capacity per host; a deferred request beyond this
    /// rejects with [`Error::QueueFull`].
    pub max_pending_per_host: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            threads: 1,
            keep_alive: true,
            max_connections_per_host: 8,
            max_pending_per_host: 1024,
        }
    }
}

impl Options {
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn keep_alive(mut self, enable: bool) -> Self {
        self.keep_alive = enable;
        self
    }

    pub fn max_connections_per_host(mut self, n: usize) -> Self {
        self.max_connections_per_host = n;
        self
    }

    pub fn max_pending_per_host(mut self, n: usize) -> Self {
        self.max_pending_per_host = n;
        self
    }
}

struct HostQueue {
    tx: Sender<RequestData>,
    rx: Receiver<RequestData>,
}

impl HostQueue {
    fn with_capacity(cap: usize) -> HostQueue {
        let (tx, rx) = bounded(cap.max(1));
        HostQueue { tx, rx }
    }
}

struct Admission {
    queues: HashMap<String, HostQueue>,
    stopped: bool,
}

struct ClientInner {
    pool: ConnectionPool,
    transports: Vec<Arc<Transport>>,
    io_index: AtomicUsize,
    admission: Mutex<Admission>,
    keep_alive: bool,
    max_pending: usize,
}

/// HTTP/1.1 client over a pool of persistent per-host connections.
///
/// # Example
///
/// ```rust,ignore
/// let client = Client::new(Client::options().threads(2))?;
/// let resp = client.get("http://example.org/").send().wait()?;
/// assert_eq!(resp.status(), 200);
/// client.shutdown();
/// ```
pub struct Client {
    inner: Arc<ClientInner>,
    reactor: Mutex<Option<Reactor<Transport>>>,
}

impl Client {
    /// Default options, for builder-style tweaking.
    pub fn options() -> Options {
        Options::default()
    }

    /// Start the reactor workers and an empty pool.
    pub fn new(options: Options) -> Result<Client, Error> {
        let config = ReactorConfig::default().threads(options.threads);
        let mut reactor =
            Reactor::new(&config, |_| Transport::new()).map_err(|e| Error::Setup(e.to_string()))?;
        reactor.run().map_err(|e| Error::Setup(e.to_string()))?;
        let transports = reactor.handlers().to_vec();

        Ok(Client {
            inner: Arc::new(ClientInner {
                pool: ConnectionPool::new(options.max_connections_per_host),
                transports,
                io_index: AtomicUsize::new(0),
                admission: Mutex::new(Admission {
                    queues: HashMap::new(),
                    stopped: false,
                }),
                keep_alive: options.keep_alive,
                max_pending: options.max_pending_per_host,
            }),
            reactor: Mutex::new(Some(reactor)),
        })
    }

    // ── Verb helpers ─────────────────────────────────────────────────

    pub fn get(&self, resource: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::Get, resource)
    }

    pub fn post(&self, resource: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::Post, resource)
    }

    pub fn put(&self, resource: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::Put, resource)
    }

    pub fn patch(&self, resource: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::Patch, resource)
    }

    pub fn del(&self, resource: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::Delete, resource)
    }

    pub fn head(&self, resource: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::Head, resource)
    }

    // ── Pool introspection ───────────────────────────────────────────

    /// Leased slots for `host` right now.
    pub fn used_connections(&self, host: &str) -> usize {
        self.inner.pool.used_count(host)
    }

    /// Idle slots for `host` right now.
    pub fn idle_connections(&self, host: &str) -> usize {
        self.inner.pool.idle_count(host)
    }

    /// Close every currently idle connection for `host`.
    pub fn close_idle_connections(&self, host: &str) {
        self.inner.pool.close_idle(host);
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    pub(crate) fn do_request(&self, mut request: Request, timeout: Duration) -> ResponseFuture {
        // The User-Agent is pinned at serialization time.
        request.headers.remove("User-Agent");
        if !self.inner.keep_alive {
            request.headers.add("Connection", "close");
        }

        let host = serialize::split_url(&request.resource).0.to_string();
        if host.is_empty() {
            let (future, resolver) = promise();
            resolver.reject(Error::InvalidUrl(request.resource.clone()));
            return future;
        }

        match self.inner.pool.pick(&host) {
            None => {
                let (future, resolver) = promise();
                let data = RequestData {
                    resolver,
                    request,
                    timeout,
                    on_done: None,
                };
                {
                    let mut adm = self
                        .inner
                        .admission
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    let max_pending = self.inner.max_pending;
                    let queue = adm
                        .queues
                        .entry(host)
                        .or_insert_with(|| HostQueue::with_capacity(max_pending));
                    if let Err(err) = queue.tx.try_send(data) {
                        let data = match err {
                            TrySendError::Full(data) | TrySendError::Disconnected(data) => data,
                        };
                        metrics::QUEUE_REJECTIONS.increment();
                        data.resolver.reject(Error::QueueFull);
                        return future;
                    }
                }
                // A slot may have freed between the failed pick and the
                // enqueue; drain once so the request cannot strand.
                ClientInner::process_request_queue(&self.inner);
                future
            }
            Some(conn) => {
                if !conn.has_transport() {
                    let idx = self.inner.io_index.fetch_add(1, Ordering::Relaxed)
                        % self.inner.transports.len();
                    if let Err(err) =
                        conn.associate_transport(Arc::clone(&self.inner.transports[idx]))
                    {
                        self.inner.pool.release(&conn);
                        let (future, resolver) = promise();
                        resolver.reject(err);
                        return future;
                    }
                }

                let on_done = Some(self.inner.on_done_hook(&conn));
                if !conn.is_connected() {
                    let future = conn.async_perform(request, timeout, on_done);
                    if let Err(err) = conn.connect(&Address::from_authority(&host)) {
                        metrics::CONNECT_FAILURES.increment();
                        conn.fail_pending(err);
                    }
                    future
                } else {
                    conn.perform(request, timeout, on_done)
                }
            }
        }
    }

    /// Stop the reactor workers, then flag the admission queues so no
    /// further draining happens. Must be called before drop.
    pub fn shutdown(&self) {
        if let Some(mut reactor) = self
            .reactor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reactor.shutdown();
        }
        self.inner
            .admission
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stopped = true;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let stopped = self
            .inner
            .admission
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stopped;
        if !std::thread::panicking() {
            debug_assert!(stopped, "Client::shutdown must be called before drop");
        }
    }
}

impl ClientInner {
    /// Completion hook shared by every dispatch path: tear down the socket
    /// when keep-alive is off, return the lease, then drain the admission
    /// queues onto whatever freed up.
    fn on_done_hook(self: &Arc<Self>, conn: &Arc<Connection>) -> OnDone {
        let inner = Arc::clone(self);
        let weak = Arc::downgrade(conn);
        Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                if !inner.keep_alive {
                    conn.close();
                }
                inner.pool.release(&conn);
                ClientInner::process_request_queue(&inner);
            }
        })
    }

    /// Pair free connections with queued requests, then dispatch.
    ///
    /// Pairing happens under the admission lock so two threads can never
    /// claim the same connection for different queue items; dispatch runs
    /// after the lock is dropped because a synchronous connect failure
    /// re-enters this function through the completion hook.
    fn process_request_queue(inner: &Arc<ClientInner>) {
        let mut paired: Vec<(String, Arc<Connection>, RequestData)> = Vec::new();
        {
            let adm = inner
                .admission
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if adm.stopped {
                return;
            }
            for (host, queue) in adm.queues.iter() {
                loop {
                    let Some(conn) = inner.pool.pick(host) else {
                        break;
                    };
                    match queue.rx.try_recv() {
                        Ok(data) => paired.push((host.clone(), conn, data)),
                        Err(_) => {
                            inner.pool.release(&conn);
                            break;
                        }
                    }
                }
            }
        }
        for (host, conn, data) in paired {
            Self::dispatch(inner, &host, conn, data);
        }
    }

    /// Route one paired (connection, request). The connection may have
    /// been closed by an earlier failure, in which case it goes back
    /// through the deferred connect path instead of a direct send.
    fn dispatch(inner: &Arc<ClientInner>, host: &str, conn: Arc<Connection>, data: RequestData) {
        let RequestData {
            resolver,
            request,
            timeout,
            ..
        } = data;

        if !conn.has_transport() {
            let idx = inner.io_index.fetch_add(1, Ordering::Relaxed) % inner.transports.len();
            if let Err(err) = conn.associate_transport(Arc::clone(&inner.transports[idx])) {
                inner.pool.release(&conn);
                resolver.reject(err);
                return;
            }
        }

        let on_done = Some(inner.on_done_hook(&conn));
        if conn.is_connected() {
            conn.perform_impl(request, timeout, resolver, on_done);
        } else {
            conn.queue_request(RequestData {
                resolver,
                request,
                timeout,
                on_done,
            });
            if let Err(err) = conn.connect(&Address::from_authority(host)) {
                metrics::CONNECT_FAILURES.increment();
                conn.fail_pending(err);
            }
        }
    }
}
