//! Messages handed from the streaming pipeline to the listener.

use bytes::Bytes;
use std::collections::HashMap;

/// Anything the [`Sequencer`](crate::core::sequencer::Sequencer) can order.
///
/// An empty ordering key means the message is unordered.
pub trait Sequenced {
    fn ack_id(&self) -> &str;
    fn ordering_key(&self) -> &str;
}

/// A message pulled from a subscription, awaiting processing.
#[derive(Debug, Clone)]
pub struct Message {
    pub ack_id: String,
    pub message_id: String,
    pub ordering_key: String,
    pub payload: Bytes,
    pub attributes: HashMap<String, String>,
}

impl Message {
    pub fn new(ack_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            ack_id: ack_id.into(),
            message_id: String::new(),
            ordering_key: String::new(),
            payload: payload.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = key.into();
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = id.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Payload size plus attributes, as counted against the inventory's
    /// byte limit.
    pub fn byte_size(&self) -> usize {
        self.payload.len()
            + self
                .attributes
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

impl Sequenced for Message {
    #[inline]
    fn ack_id(&self) -> &str {
        &self.ack_id
    }

    #[inline]
    fn ordering_key(&self) -> &str {
        &self.ordering_key
    }
}
