//! Error taxonomy shared by the transport and the transfer engines.

use std::io;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("out of memory")]
    Memory,

    #[error("broken pipe")]
    Pipe,

    #[error("lock poisoned")]
    Mutex,

    #[error("worker failure: {0}")]
    Thread(String),

    #[error("{0}")]
    Generic(String),

    #[error("system error: {0}")]
    System(#[from] io::Error),

    #[error("peer closed the connection")]
    Closed,

    #[error("short {op}: {got} of {want} bytes before EOF")]
    ShortIo {
        op: &'static str,
        got: usize,
        want: usize,
    },

    /// More data will arrive later; the caller retries. Never escapes the
    /// codec loops.
    #[error("partial I/O, retry")]
    PartialIo,

    /// Readiness was signaled but no bytes were available yet. Never escapes
    /// the codec loops.
    #[error("empty read, retry")]
    EmptyRead,

    #[error("TLS failure: {0}")]
    Tls(#[from] rustls::Error),

    #[error("protocol mismatch: {0}")]
    Protocol(String),
}

impl Error {
    /// True for the codec-internal conditions that mean "call again".
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PartialIo | Error::EmptyRead)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn generic(msg: impl Into<String>) -> Self {
        Error::Generic(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Error::PartialIo.is_retryable());
        assert!(Error::EmptyRead.is_retryable());
        assert!(!Error::Closed.is_retryable());
        assert!(!Error::protocol("bad type").is_retryable());
    }

    #[test]
    fn io_error_wraps_as_system() {
        let err: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(matches!(err, Error::System(_)));
    }
}
