use self::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/////////////////////////////////////////////////////////////////////////////
pub mod cache;
pub mod cbs;
pub mod connection;
pub mod credit;
pub mod error;
pub mod flux;
pub mod message;
pub mod options;
pub mod receiver;
pub mod request_response;
pub mod retry;
pub mod sender;
pub mod session;
pub mod token;

pub use credit::CreditFlowMode;
pub use message::{
    Message, MessageSerializer, PropertyValue, BATCH_MESSAGE_FORMAT, DEFAULT_MESSAGE_FORMAT,
    MAX_MESSAGE_LENGTH_BYTES,
};
pub use options::{AuthorizationType, ConnectionOptions, ReceiveOptions, SendOptions};
pub use retry::{AmqpRetryPolicy, RetryMode, RetryOptions, RetryPolicy};
