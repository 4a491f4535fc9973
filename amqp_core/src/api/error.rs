//! Error type can be returned by the APIs.
//!
//! Errors reported by the protocol engine are classified once, at the boundary, into
//! transient errors that are eligible for retry and errors that are surfaced immediately.

use std::fmt;

use tokio::sync::{mpsc::error::SendError, oneshot::error::RecvError};

use crate::{
    engine::{ErrorCondition, RemoteError},
    net,
};

/// Identifies where an error happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub namespace: String,
    pub entity_path: Option<String>,
    pub link_name: Option<String>,
}

impl ErrorContext {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            entity_path: None,
            link_name: None,
        }
    }

    pub fn for_link(namespace: &str, entity_path: &str, link_name: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            entity_path: Some(entity_path.to_owned()),
            link_name: Some(link_name.to_owned()),
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "namespace[{}]", self.namespace)?;
        if let Some(ref entity_path) = self.entity_path {
            write!(f, " entityPath[{}]", entity_path)?;
        }
        if let Some(ref link_name) = self.link_name {
            write!(f, " linkName[{}]", link_name)?;
        }
        Ok(())
    }
}

/// An error condition reported by the broker or the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpError {
    condition: ErrorCondition,
    description: String,
    is_transient: bool,
    context: Option<ErrorContext>,
}

impl AmqpError {
    pub fn new(
        condition: ErrorCondition,
        description: &str,
        context: Option<ErrorContext>,
    ) -> Self {
        let is_transient = is_transient_condition(&condition);
        Self {
            condition,
            description: description.to_owned(),
            is_transient,
            context,
        }
    }

    pub fn condition(&self) -> &ErrorCondition {
        &self.condition
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_transient(&self) -> bool {
        self.is_transient
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        self.context.as_ref()
    }
}

fn is_transient_condition(condition: &ErrorCondition) -> bool {
    matches!(
        condition,
        ErrorCondition::Timeout
            | ErrorCondition::ServerBusy
            | ErrorCondition::ResourceLimitExceeded
            | ErrorCondition::LinkDetachForced
            | ErrorCondition::ConnectionForced
            | ErrorCondition::ProtonIo
            | ErrorCondition::InternalError
    )
}

/// A list of errors can be returned by the APIs.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Condition reported by the broker or the transport.
    AmqpError(AmqpError),
    /// An operation did not complete in time.
    Timeout(String),
    /// The resource was torn down while being used.
    IllegalState(String),
    /// Work was submitted to a closed reactor.
    Rejected(String),
    /// The recovery chain was disposed, no further resources will be created.
    RecoveryTerminated(String),
    /// Error due to incorrect usage by user.
    InvalidArgument(String),
    /// The encoded message does not fit into the link.
    PayloadSizeExceeded(String),
    /// The operation was cancelled and will not be retried.
    OperationCancelled(String),
    /// Downstream code failed while handling a message.
    ConsumerError(String),
    /// Error occurs in network layer.
    NetworkError(String),
    /// Error in sending or receiving messages via internal communication channel.
    InternalChannelError(String),
}

impl Error {
    /// Classifies an error reported by the engine.
    pub fn from_remote(error: RemoteError, context: Option<ErrorContext>) -> Self {
        Error::AmqpError(AmqpError::new(error.condition, &error.description, context))
    }

    /// `true` if the error is eligible for retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::AmqpError(err) => err.is_transient(),
            Error::Timeout(_) | Error::NetworkError(_) => true,
            _ => false,
        }
    }

    /// Errors that say something about the health of the link rather than the message.
    pub(crate) fn is_link_health_error(&self) -> bool {
        match self {
            Error::AmqpError(err) => matches!(
                err.condition(),
                ErrorCondition::ServerBusy
                    | ErrorCondition::Timeout
                    | ErrorCondition::ResourceLimitExceeded
            ),
            _ => false,
        }
    }

    pub(crate) fn is_server_busy(&self) -> bool {
        matches!(self, Error::AmqpError(err) if err.condition() == &ErrorCondition::ServerBusy)
    }

    /// The broker condition, if this error was reported by the broker.
    pub fn condition(&self) -> Option<&ErrorCondition> {
        match self {
            Error::AmqpError(err) => Some(err.condition()),
            _ => None,
        }
    }
}

impl From<net::Error> for Error {
    fn from(err: net::Error) -> Self {
        match err {
            net::Error::Rejected(msg) => Self::Rejected(msg),
            net::Error::InvalidArgument(msg) => Self::InvalidArgument(msg),
            net::Error::Interrupted => {
                Self::IllegalState("reactor exceptionally interrupted".to_string())
            }
            net::Error::NetworkIoError(msg) => Self::NetworkError(msg),
            net::Error::InternalChannelError(msg) => Self::InternalChannelError(msg),
        }
    }
}
impl<T> From<SendError<T>> for Error {
    fn from(err: SendError<T>) -> Self {
        Self::InternalChannelError(err.to_string())
    }
}
impl From<RecvError> for Error {
    fn from(err: RecvError) -> Self {
        Self::InternalChannelError(err.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::AmqpError(err) => match err.context() {
                Some(context) => write!(
                    f,
                    "AMQP error {}: {}, {}",
                    err.condition(),
                    err.description(),
                    context
                ),
                None => write!(f, "AMQP error {}: {}", err.condition(), err.description()),
            },
            Error::Timeout(msg) => write!(f, "AMQP operation timed out: {}", msg),
            Error::IllegalState(msg) => write!(f, "illegal state: {}", msg),
            Error::Rejected(msg) => write!(f, "work rejected: {}", msg),
            Error::RecoveryTerminated(msg) => write!(f, "recovery terminated: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::PayloadSizeExceeded(msg) => write!(f, "payload size exceeded: {}", msg),
            Error::OperationCancelled(msg) => write!(f, "operation cancelled: {}", msg),
            Error::ConsumerError(msg) => write!(f, "consumer error: {}", msg),
            Error::NetworkError(msg) => write!(f, "AMQP network error: {}", msg),
            Error::InternalChannelError(msg) => {
                write!(f, "internal communication error: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}
