//! Messages exchanged over links, and the codec contract used to turn them into bytes.
//!
//! Body and section encoding is owned by the caller through [`MessageSerializer`].
use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::engine::DeliveryTag;

use super::Result;

/// Message format of a batched message, an envelope holding several encoded messages.
pub const BATCH_MESSAGE_FORMAT: u32 = 0x8001_3700;
/// Default message format.
pub const DEFAULT_MESSAGE_FORMAT: u32 = 0;
/// Link size used when the peer does not announce a max message size.
pub const MAX_MESSAGE_LENGTH_BYTES: u64 = 256 * 1024;

/// Value of an application property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyValue {
    String(String),
    Long(i64),
    Boolean(bool),
    Binary(Vec<u8>),
    Null,
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_owned())
    }
}
impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}
impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Long(v)
    }
}
impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Boolean(v)
    }
}

/// An AMQP message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub application_properties: BTreeMap<String, PropertyValue>,
    pub body: Bytes,

    /// Set on messages received from a link.
    #[serde(skip)]
    delivery_tag: Option<DeliveryTag>,
    #[serde(skip)]
    link_name: Option<String>,
}

impl Message {
    pub fn new<B: Into<Bytes>>(body: B) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_owned());
        self
    }

    pub fn with_property<V: Into<PropertyValue>>(mut self, key: &str, value: V) -> Self {
        self.application_properties
            .insert(key.to_owned(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.application_properties.get(key)
    }

    /// Tag of the delivery this message was received with.
    pub fn delivery_tag(&self) -> Option<&DeliveryTag> {
        self.delivery_tag.as_ref()
    }

    /// Name of the link this message was received on.
    pub fn link_name(&self) -> Option<&str> {
        self.link_name.as_deref()
    }

    pub(crate) fn set_delivery(&mut self, tag: DeliveryTag, link_name: &str) {
        self.delivery_tag = Some(tag);
        self.link_name = Some(link_name.to_owned());
    }
}

/// Encodes and decodes messages to the bytes carried by a delivery.
pub trait MessageSerializer: Send + Sync + 'static {
    fn encode(&self, message: &Message) -> Result<Bytes>;

    fn decode(&self, payload: &[u8]) -> Result<Message>;

    /// Encodes several messages into the payload of one batched delivery.
    fn encode_batch(&self, messages: &[Message]) -> Result<Bytes>;
}
