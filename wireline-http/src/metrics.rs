//! Client engine metrics.
//!
//! Counters for connection lifecycle, request flow, and backpressure.
//! Exposed through the metriken registry for Prometheus exposition.

use metriken::{metric, Counter};

#[metric(
    name = "wireline/connections/opened",
    description = "Connects completed"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "wireline/connections/closed",
    description = "Connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "wireline/connections/connect_failures",
    description = "Connects that failed before establishment"
)]
pub static CONNECT_FAILURES: Counter = Counter::new();

#[metric(
    name = "wireline/requests/dispatched",
    description = "Requests serialized and handed to a transport"
)]
pub static REQUESTS_DISPATCHED: Counter = Counter::new();

#[metric(
    name = "wireline/requests/completed",
    description = "Responses fully parsed and resolved"
)]
pub static RESPONSES_COMPLETED: Counter = Counter::new();

#[metric(
    name = "wireline/requests/timeouts",
    description = "Requests rejected by a fired timer"
)]
pub static REQUEST_TIMEOUTS: Counter = Counter::new();

#[metric(
    name = "wireline/admission/rejected",
    description = "Deferred requests rejected because a host queue was full"
)]
pub static QUEUE_REJECTIONS: Counter = Counter::new();

#[metric(
    name = "wireline/recv/buffer_refills",
    description = "Receive passes that filled the fixed buffer and flushed early"
)]
pub static RECV_BUFFER_REFILLS: Counter = Counter::new();
