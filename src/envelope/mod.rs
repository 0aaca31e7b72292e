//! Wire-independent message representation.
//!
//! An [`Envelope`] is one message in flight: a flat string-to-string header
//! mapping plus an opaque serialized body. Brokers translate the header map
//! to whatever metadata facility their transport offers (AMQP header tables,
//! in-process structs, ...).
//!
//! No validation happens at construction time. Consumers check for the
//! headers they need (dispatch reads [`headers::MESSAGE_NAME`]).

pub mod headers;

use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::codec;

/// Header mapping attached to every envelope. Keys are unique.
pub type Headers = HashMap<String, String>;

/// One message in flight, independent of transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Message metadata.
    pub headers: Headers,
    /// Serialized payload.
    pub body: Vec<u8>,
}

impl Envelope {
    /// Create an envelope from a header mapping and raw body.
    pub fn new(headers: Headers, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Look up a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Short type name of the payload, empty if the header is missing.
    pub fn message_name(&self) -> &str {
        self.header(headers::MESSAGE_NAME).unwrap_or_default()
    }

    /// Fully-qualified type name of the payload, if present.
    pub fn message_full_name(&self) -> Option<&str> {
        self.header(headers::MESSAGE_FULL_NAME)
    }

    /// Intended recipient. Only set on point-to-point messages.
    pub fn destination(&self) -> Option<&str> {
        self.header(headers::DESTINATION)
    }

    /// Failure description. Only set on dead-lettered messages.
    pub fn error(&self) -> Option<&str> {
        self.header(headers::ERROR)
    }

    /// Insert or replace a header.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Decode the body into a payload type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        codec::decode(&self.body)
    }
}

#[cfg(test)]
mod tests;
