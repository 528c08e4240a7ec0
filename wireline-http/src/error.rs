use thiserror::Error;

/// Errors surfaced to callers through a request future's reject channel.
///
/// All I/O errors are terminal for the in-flight request; none propagates to
/// other in-flight requests, and nothing is retried.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Address resolution, socket creation, or the connect itself failed.
    #[error("could not connect: {0}")]
    Connect(String),

    /// A non-recoverable error while writing the request.
    #[error("could not send request: {0}")]
    Send(String),

    /// A non-recoverable error while reading the response, including an
    /// orderly remote close before any bytes arrived.
    #[error("could not receive response: {0}")]
    Recv(String),

    /// The request timer fired before the response completed.
    #[error("request timed out")]
    Timeout,

    /// The per-host admission queue rejected a deferred request.
    #[error("queue is full")]
    QueueFull,

    /// The response bytes did not parse as HTTP/1.1.
    #[error("invalid response: {0}")]
    Parse(String),

    /// The resource URL had no host part.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// A transport was already associated with the connection.
    #[error("a transport is already associated with this connection")]
    TransportAssociated,

    /// Client runtime setup failed.
    #[error("client setup: {0}")]
    Setup(String),
}
