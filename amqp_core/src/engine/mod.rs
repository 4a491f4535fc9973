//! Contracts of the AMQP 1.0 protocol engine.
//!
//! The engine (frame codec, endpoint state machines, transport I/O) is not part of this crate.
//! It is consumed through the traits below. Every method that mutates engine state must be
//! called from the connection's dispatcher, the single task running the connection's
//! `Reactor`.
use std::{fmt, io, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/////////////////////////////////////////////////////////////////////////////
/// AMQP endpoint lifecycle of a connection, session or link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointState {
    Uninitialized,
    Active,
    Closed,
    /// Closed with an error, either reported by the peer or by the transport.
    Errored(RemoteError),
}

impl EndpointState {
    /// `true` once the endpoint can no longer become active.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EndpointState::Closed | EndpointState::Errored(_))
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EndpointState::Uninitialized => f.write_str("UNINITIALIZED"),
            EndpointState::Active => f.write_str("ACTIVE"),
            EndpointState::Closed => f.write_str("CLOSED"),
            EndpointState::Errored(err) => write!(f, "ERRORED({})", err),
        }
    }
}

/// Endpoint state stream. A dropped sender reads as `Closed`.
pub type EndpointStates = watch::Receiver<EndpointState>;

/////////////////////////////////////////////////////////////////////////////
/// Symbolic error condition reported by the broker or the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCondition {
    InternalError,
    NotFound,
    UnauthorizedAccess,
    DecodeError,
    ResourceLimitExceeded,
    NotAllowed,
    InvalidField,
    NotImplemented,
    ResourceLocked,
    PreconditionFailed,
    ResourceDeleted,
    IllegalState,
    FrameSizeTooSmall,
    ConnectionForced,
    ConnectionFramingError,
    ConnectionRedirect,
    LinkDetachForced,
    LinkStolen,
    LinkRedirect,
    LinkPayloadSizeExceeded,
    Timeout,
    ServerBusy,
    ArgumentError,
    ArgumentOutOfRange,
    EntityDisabled,
    OperationCancelled,
    ProtonIo,
    Other(String),
}

impl ErrorCondition {
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol {
            "amqp:internal-error" => Self::InternalError,
            "amqp:not-found" => Self::NotFound,
            "amqp:unauthorized-access" => Self::UnauthorizedAccess,
            "amqp:decode-error" => Self::DecodeError,
            "amqp:resource-limit-exceeded" => Self::ResourceLimitExceeded,
            "amqp:not-allowed" => Self::NotAllowed,
            "amqp:invalid-field" => Self::InvalidField,
            "amqp:not-implemented" => Self::NotImplemented,
            "amqp:resource-locked" => Self::ResourceLocked,
            "amqp:precondition-failed" => Self::PreconditionFailed,
            "amqp:resource-deleted" => Self::ResourceDeleted,
            "amqp:illegal-state" => Self::IllegalState,
            "amqp:frame-size-too-small" => Self::FrameSizeTooSmall,
            "amqp:connection:forced" => Self::ConnectionForced,
            "amqp:connection:framing-error" => Self::ConnectionFramingError,
            "amqp:connection:redirect" => Self::ConnectionRedirect,
            "amqp:link:detach-forced" => Self::LinkDetachForced,
            "amqp:link:stolen" => Self::LinkStolen,
            "amqp:link:redirect" => Self::LinkRedirect,
            "amqp:link:message-size-exceeded" => Self::LinkPayloadSizeExceeded,
            "com.microsoft:timeout" => Self::Timeout,
            "com.microsoft:server-busy" => Self::ServerBusy,
            "com.microsoft:argument-error" => Self::ArgumentError,
            "com.microsoft:argument-out-of-range" => Self::ArgumentOutOfRange,
            "com.microsoft:entity-disabled" => Self::EntityDisabled,
            "com.microsoft:operation-cancelled" => Self::OperationCancelled,
            "proton:io" => Self::ProtonIo,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn as_symbol(&self) -> &str {
        match self {
            Self::InternalError => "amqp:internal-error",
            Self::NotFound => "amqp:not-found",
            Self::UnauthorizedAccess => "amqp:unauthorized-access",
            Self::DecodeError => "amqp:decode-error",
            Self::ResourceLimitExceeded => "amqp:resource-limit-exceeded",
            Self::NotAllowed => "amqp:not-allowed",
            Self::InvalidField => "amqp:invalid-field",
            Self::NotImplemented => "amqp:not-implemented",
            Self::ResourceLocked => "amqp:resource-locked",
            Self::PreconditionFailed => "amqp:precondition-failed",
            Self::ResourceDeleted => "amqp:resource-deleted",
            Self::IllegalState => "amqp:illegal-state",
            Self::FrameSizeTooSmall => "amqp:frame-size-too-small",
            Self::ConnectionForced => "amqp:connection:forced",
            Self::ConnectionFramingError => "amqp:connection:framing-error",
            Self::ConnectionRedirect => "amqp:connection:redirect",
            Self::LinkDetachForced => "amqp:link:detach-forced",
            Self::LinkStolen => "amqp:link:stolen",
            Self::LinkRedirect => "amqp:link:redirect",
            Self::LinkPayloadSizeExceeded => "amqp:link:message-size-exceeded",
            Self::Timeout => "com.microsoft:timeout",
            Self::ServerBusy => "com.microsoft:server-busy",
            Self::ArgumentError => "com.microsoft:argument-error",
            Self::ArgumentOutOfRange => "com.microsoft:argument-out-of-range",
            Self::EntityDisabled => "com.microsoft:entity-disabled",
            Self::OperationCancelled => "com.microsoft:operation-cancelled",
            Self::ProtonIo => "proton:io",
            Self::Other(symbol) => symbol,
        }
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_symbol())
    }
}

/// Error attached to a detach/end/close performative or a rejected outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub condition: ErrorCondition,
    pub description: String,
}

impl RemoteError {
    pub fn new(condition: ErrorCondition, description: &str) -> Self {
        Self {
            condition,
            description: description.to_owned(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.condition, self.description)
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Identifier correlating one delivery attempt with its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(Bytes);

impl DeliveryTag {
    /// New random tag, unique per attempt.
    pub fn generate() -> Self {
        Self(Bytes::copy_from_slice(Uuid::new_v4().as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for DeliveryTag {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&[u8]> for DeliveryTag {
    fn from(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match Uuid::from_slice(&self.0) {
            Ok(uuid) => write!(f, "{}", uuid),
            Err(_) => {
                for b in self.0.iter() {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// Delivery state, used both as a remote outcome and as a local disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Accepted,
    Rejected(Option<RemoteError>),
    Released,
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
    },
    Received,
}

/// A message arriving on a receiver link.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub tag: DeliveryTag,
    pub payload: Bytes,
}

/// Remote outcome of a delivery sent on a sender link.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub tag: DeliveryTag,
    pub state: DeliveryState,
}

/////////////////////////////////////////////////////////////////////////////
/// Event loop of the protocol engine.
#[async_trait]
pub trait Reactor: Send + 'static {
    /// Waits for transport readiness (or an engine timer) and processes it.
    ///
    /// Must be cancel-safe: the dispatcher drops the future to run queued work.
    /// Returns `Ok(false)` once the engine has stopped.
    async fn process(&mut self) -> io::Result<bool>;

    /// Stops the engine; the next `process` returns `Ok(false)`.
    fn stop(&mut self);
}

/// Builds a protocol engine for one connection.
pub trait ReactorProvider: Send + Sync + 'static {
    fn create_reactor(
        &self,
        connection_id: &str,
        hostname: &str,
        port: u16,
        max_frame_size: u32,
    ) -> io::Result<(Box<dyn Reactor>, Arc<dyn EngineConnection>)>;
}

pub trait EngineConnection: Send + Sync + 'static {
    fn connection_id(&self) -> &str;
    fn hostname(&self) -> &str;
    fn endpoint_states(&self) -> EndpointStates;
    fn open(&self);
    fn close(&self, error: Option<RemoteError>);
    fn session(&self, name: &str) -> Arc<dyn EngineSession>;
}

pub trait EngineSession: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn endpoint_states(&self) -> EndpointStates;
    fn open(&self);
    fn close(&self, error: Option<RemoteError>);
    fn sender(&self, link_name: &str, entity_path: &str) -> Arc<dyn EngineSender>;
    fn receiver(&self, link_name: &str, entity_path: &str) -> Arc<dyn EngineReceiver>;
}

/// Operations shared by sender and receiver links.
pub trait EngineLink: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn endpoint_states(&self) -> EndpointStates;
    fn open(&self);
    fn close(&self, error: Option<RemoteError>);
    /// Link credit currently available.
    fn credit(&self) -> u32;
}

pub trait EngineReceiver: EngineLink {
    /// Issues a flow frame adding `credits`.
    fn flow(&self, credits: u32);
    /// Inbound deliveries. Can be taken once; ends when the link is detached.
    fn take_deliveries(&self) -> Option<mpsc::UnboundedReceiver<InboundDelivery>>;
    /// Settles a delivery with the given state.
    fn settle(&self, tag: &DeliveryTag, state: &DeliveryState);
}

pub trait EngineSender: EngineLink {
    /// Max message size announced by the peer on attach, if any.
    fn remote_max_message_size(&self) -> Option<u64>;
    /// Writes an encoded message as a new delivery.
    fn send(&self, tag: &DeliveryTag, bytes: &[u8], message_format: u32) -> io::Result<usize>;
    /// Moves to the next delivery; `false` if there is no current delivery.
    fn advance(&self) -> bool;
    /// Link credit, updated whenever the peer issues a flow.
    fn credit_updates(&self) -> watch::Receiver<u32>;
    /// Remote outcomes. Can be taken once; ends when the link is detached.
    fn take_outcomes(&self) -> Option<mpsc::UnboundedReceiver<DeliveryOutcome>>;
}
