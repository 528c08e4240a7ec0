//! HTTP/1.1 client engine over the wireline reactor.
//!
//! Logical requests are multiplexed over a bounded pool of persistent TCP
//! connections per remote host. Each connection carries strictly one
//! in-flight request; callers get a future that resolves when the response
//! parses, rejects on connect/send/receive failure or timeout, and never
//! blocks on I/O. When a host's pool is exhausted, requests park in a
//! bounded per-host admission queue and dispatch FIFO as slots free up.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use wireline_http::Client;
//!
//! let client = Client::new(Client::options().threads(2))?;
//! let response = client
//!     .get("http://example.org/api")
//!     .header("accept", "application/json")
//!     .timeout(Duration::from_secs(2))
//!     .send()
//!     .wait()?;
//! assert_eq!(response.status(), 200);
//! client.shutdown();
//! ```
//!
//! # Scope
//!
//! Plaintext HTTP/1.1 only: no TLS, no HTTP/2 or pipelining, no redirect
//! following, no retries, no streaming bodies.

pub mod client;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod net;
pub mod parser;
pub mod pool;
pub mod request;
pub mod response;

mod serialize;
mod transport;

/// Future for a submitted request: resolves with the parsed response or
/// rejects with a terminal [`Error`].
pub type ResponseFuture = wireline::Promise<response::Response, error::Error>;

/// The client facade.
pub use client::Client;
/// Client options.
pub use client::Options;
/// A pooled connection (leased through the pool, shared by reference).
pub use connection::Connection;
/// Caller-visible error kinds.
pub use error::Error;
/// A remote endpoint as (host, port).
pub use net::Address;
/// Incremental response parser.
pub use parser::ResponseParser;
/// Per-host connection pool.
pub use pool::ConnectionPool;
/// Request cookie.
pub use request::Cookie;
/// Ordered header collection.
pub use request::Headers;
/// HTTP request method.
pub use request::Method;
/// Ordered query parameters.
pub use request::Query;
/// A logical request snapshot.
pub use request::Request;
/// Fluent request builder.
pub use request::RequestBuilder;
/// A parsed response.
pub use response::Response;
