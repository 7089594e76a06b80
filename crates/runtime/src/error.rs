//! Error types for the runtime crate.

use thiserror::Error;

/// Container-runtime error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The referenced container or image does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine rejected the request.
    #[error("runtime api error (status {status}): {message}")]
    Api {
        /// HTTP status code reported by the engine, 0 when unknown.
        status: u16,
        /// Engine-provided message.
        message: String,
    },

    /// The engine could not be reached.
    #[error("cannot reach container runtime: {0}")]
    Connection(String),

    /// The engine did not answer in time.
    #[error("runtime operation timed out: {0}")]
    Timeout(String),

    /// Reading from or writing to an attached stream failed.
    #[error("attached stream failed: {0}")]
    Stream(String),

    /// The container spec cannot be realized by this runtime.
    #[error("invalid container spec: {0}")]
    InvalidSpec(String),

    /// A failure injected by [`crate::MemoryRuntime`].
    #[error("injected failure in {0}")]
    Injected(&'static str),
}

impl RuntimeError {
    /// Returns true if the error means the target is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

// Conversions from underlying crate errors

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error;
        match err {
            Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            Error::DockerResponseServerError {
                status_code,
                message,
            } => RuntimeError::Api {
                status: status_code,
                message,
            },
            Error::RequestTimeoutError => RuntimeError::Timeout(err.to_string()),
            Error::IOError { .. } | Error::SocketNotFoundError(_) => {
                RuntimeError::Connection(err.to_string())
            }
            other => RuntimeError::Api {
                status: 0,
                message: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => RuntimeError::Timeout(err.to_string()),
            ErrorKind::ConnectionRefused | ErrorKind::NotFound => {
                RuntimeError::Connection(err.to_string())
            }
            _ => RuntimeError::Stream(err.to_string()),
        }
    }
}
