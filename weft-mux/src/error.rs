use std::fmt;
use std::io;
use std::sync::Arc;

/// Error returned by session and stream operations.
///
/// The variants are terminal conditions: once a stream reports
/// [`Error::StreamReset`] or a session reports [`Error::Shutdown`], every
/// later operation on it reports the same condition. [`Error::Timeout`] is
/// the exception: it clears when the deadline is moved or disabled.
#[derive(Debug, Clone)]
pub enum Error {
    /// The session has shut down.
    Shutdown,
    /// The operation targeted a locally closed stream or its write half.
    StreamClosed,
    /// The stream was terminated abnormally, locally or by the peer.
    StreamReset,
    /// A read or write deadline elapsed.
    Timeout,
    /// Both sides claim to have originated the same stream.
    ///
    /// Reserved for handshake layers; the session engine never raises it.
    TwoInitiators,
    /// The peer sent a frame that is invalid in the current state.
    InvalidState,
    /// A frame's payload length exceeds the configured maximum.
    MessageTooLarge,
    /// The underlying transport failed.
    Io(Arc<io::Error>),
}

impl Error {
    /// True iff this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// True iff the failed operation may succeed when retried later.
    ///
    /// Only deadline expiries are temporary: moving the deadline and
    /// retrying can succeed. Every other variant is terminal.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Shutdown => f.write_str("session shut down"),
            Error::StreamClosed => f.write_str("stream closed"),
            Error::StreamReset => f.write_str("stream reset"),
            Error::Timeout => f.write_str("i/o deadline exceeded"),
            Error::TwoInitiators => f.write_str("two initiators"),
            Error::InvalidState => {
                f.write_str("received an unexpected message from the peer")
            }
            Error::MessageTooLarge => f.write_str("message size too large"),
            Error::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_temporary_and_classified() {
        assert!(Error::Timeout.is_timeout());
        assert!(Error::Timeout.is_temporary());
        assert!(!Error::StreamReset.is_timeout());
        assert!(!Error::Shutdown.is_temporary());
    }

    #[test]
    fn io_errors_keep_their_source() {
        let err = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "gone");
    }
}
