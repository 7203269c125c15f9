// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes messages to a declared exchange on one channel. Messages sent
//! in sequence on the same channel reach the broker in that sequence; there
//! is no ordering promise across channels or connections.
//!
//! A mandatory message the broker cannot route comes back as
//! [`PublishOutcome::Returned`] and is also handed to the registered
//! unroutable callback when one is set. That outcome is a reported event,
//! not a failure: the publisher keeps operating afterwards.

use crate::{
    channel::Channel,
    errors::AmqpError,
    message::Message,
    otel,
    transport::{PublishOutcome, ReturnedMessage},
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

type UnroutableCallback = Box<dyn Fn(ReturnedMessage) + Send + Sync>;

/// Publisher bound to a single channel.
pub struct Publisher {
    channel: Arc<Channel>,
    on_unroutable: Option<UnroutableCallback>,
}

impl Publisher {
    /// Creates a new publisher for the given channel.
    pub fn new(channel: Arc<Channel>) -> Publisher {
        Publisher {
            channel,
            on_unroutable: None,
        }
    }

    /// Registers a callback invoked with every returned mandatory message.
    ///
    /// In the asynchronous flow the callback runs on the event-loop thread
    /// driving the publish, never concurrently with other callbacks.
    pub fn on_unroutable<F>(mut self, callback: F) -> Self
    where
        F: Fn(ReturnedMessage) + Send + Sync + 'static,
    {
        self.on_unroutable = Some(Box::new(callback));
        self
    }

    /// Publishes a message to an exchange with the given routing key.
    ///
    /// The target exchange must be declared on this channel (the default
    /// nameless exchange excepted). A missing message id is filled with a
    /// generated one, and the current trace context is injected into the
    /// message headers.
    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<PublishOutcome, AmqpError> {
        self.channel.ensure_open()?;
        self.channel.ensure_publishable(exchange)?;

        let mut outbound = message.clone();
        if outbound.properties.message_id.is_none() {
            outbound.properties.message_id = Some(Uuid::new_v4().to_string());
        }
        otel::inject_context(ctx, &mut outbound.properties.headers);

        match self
            .channel
            .link()
            .publish(exchange, routing_key, &outbound)
            .await?
        {
            PublishOutcome::Returned(returned) => {
                warn!(exchange, routing_key, "message returned as unroutable");
                if let Some(callback) = &self.on_unroutable {
                    callback(returned.clone());
                }
                Ok(PublishOutcome::Returned(returned))
            }
            outcome => {
                debug!(exchange, routing_key, "message published");
                Ok(outcome)
            }
        }
    }
}
