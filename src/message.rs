// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Deliveries
//!
//! This module provides the outbound [`Message`] type with its property bag
//! and the inbound [`Delivery`] handed to consumer handlers. Payloads are
//! opaque byte sequences; JSON helpers cover the common
//! `application/json` case.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Property bag carried alongside a message body.
///
/// The string header map also transports the trace context injected by the
/// publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub app_id: Option<String>,
    pub message_id: Option<String>,
    pub msg_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// An outbound message: body, properties, and the mandatory flag.
///
/// When `mandatory` is set and the message is unroutable, the broker returns
/// it to the client and the publisher surfaces a `MessageUnroutable` event;
/// otherwise unroutable messages are dropped silently unless the exchange
/// has an alternate exchange configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub(crate) body: Vec<u8>,
    pub(crate) properties: MessageProperties,
    pub(crate) mandatory: bool,
}

impl Message {
    /// Creates a message from a raw byte payload.
    pub fn new(body: &[u8]) -> Message {
        Message {
            body: body.to_vec(),
            properties: MessageProperties::default(),
            mandatory: false,
        }
    }

    /// Creates an `application/json` message from a serializable payload.
    pub fn json<T>(payload: &T) -> Result<Message, AmqpError>
    where
        T: Serialize,
    {
        let body = serde_json::to_vec(payload).map_err(|_| AmqpError::ParsePayloadError)?;
        Ok(Message::new(&body).content_type(JSON_CONTENT_TYPE))
    }

    /// Sets the content type property.
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.properties.content_type = Some(content_type.to_owned());
        self
    }

    /// Sets the application id property.
    pub fn app_id(mut self, app_id: &str) -> Self {
        self.properties.app_id = Some(app_id.to_owned());
        self
    }

    /// Sets the message type property.
    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.properties.msg_type = Some(msg_type.to_owned());
        self
    }

    /// Adds a single header entry.
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.properties
            .headers
            .insert(key.to_owned(), value.to_owned());
        self
    }

    /// Requests failure signaling when the message is unroutable.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// The message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The message property bag.
    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

impl Delivery {
    /// Decodes the body as a JSON payload.
    pub fn json<T>(&self) -> Result<T, AmqpError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|_| AmqpError::ParsePayloadError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Payload {
        greeting: String,
    }

    #[test]
    fn json_message_round_trips_through_delivery() {
        let payload = Payload {
            greeting: "Hello!".to_owned(),
        };
        let message = Message::json(&payload).unwrap();
        assert_eq!(
            message.properties().content_type.as_deref(),
            Some(JSON_CONTENT_TYPE)
        );

        let delivery = Delivery {
            body: message.body().to_vec(),
            ..Delivery::default()
        };
        assert_eq!(delivery.json::<Payload>().unwrap(), payload);
    }

    #[test]
    fn malformed_json_body_fails_to_parse() {
        let delivery = Delivery {
            body: b"not json".to_vec(),
            ..Delivery::default()
        };
        assert_eq!(
            delivery.json::<Payload>().unwrap_err(),
            AmqpError::ParsePayloadError
        );
    }

    #[test]
    fn builder_collects_properties() {
        let message = Message::new(b"Hello!")
            .app_id("amqp_client_tests")
            .msg_type("greeting")
            .header("team", "platform")
            .mandatory();

        assert!(message.mandatory);
        assert_eq!(message.properties().app_id.as_deref(), Some("amqp_client_tests"));
        assert_eq!(message.properties().msg_type.as_deref(), Some("greeting"));
        assert_eq!(
            message.properties().headers.get("team").map(String::as_str),
            Some("platform")
        );
    }
}
