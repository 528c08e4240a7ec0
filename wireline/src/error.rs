use std::io;

use thiserror::Error;

/// Errors returned by the wireline runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying syscall failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Reactor setup failed (bad configuration, thread spawn failure).
    #[error("reactor setup: {0}")]
    Setup(String),
}
