use std::{fmt, io};

use tokio::sync::{mpsc::error::SendError, oneshot::error::RecvError};

/// Errors raised by the dispatcher and the engine plumbing.
#[derive(Debug, Clone)]
pub(crate) enum Error {
    NetworkIoError(String),
    InternalChannelError(String),
    /// Work submitted after the dispatcher or its wake-up channel was closed.
    Rejected(String),
    InvalidArgument(String),
    /// The engine stopped before the work completed.
    Interrupted,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::NetworkIoError(err.to_string())
    }
}
impl<T> From<SendError<T>> for Error {
    fn from(err: SendError<T>) -> Self {
        Error::InternalChannelError(err.to_string())
    }
}
impl From<RecvError> for Error {
    fn from(_err: RecvError) -> Self {
        Error::Interrupted
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NetworkIoError(msg) => write!(f, "{}", msg),
            Error::InternalChannelError(msg)
            | Error::Rejected(msg)
            | Error::InvalidArgument(msg) => write!(f, "{}", msg),

            Error::Interrupted => f.write_str("reactor exceptionally interrupted"),
        }
    }
}

impl std::error::Error for Error {}
