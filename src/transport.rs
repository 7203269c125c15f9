// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Seam
//!
//! The wire protocol is delegated to an underlying client library; this
//! module is the boundary the core talks through. It covers exactly the
//! operations the client issues: connect, open-channel, declare-exchange,
//! declare-queue, bind, publish, consume, and the acknowledgment calls.
//!
//! [`crate::rabbit`] implements the seam over lapin; [`crate::memory`]
//! implements it in-process for tests.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, Message, MessageProperties},
    queue::{QueueBinding, QueueDefinition},
    uri::ConnectionDescriptor,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Stream of deliveries for one consumer registration.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// A message the broker handed back because no binding matched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Broker acknowledgment of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker accepted the message.
    Confirmed,
    /// The message was mandatory and unroutable; the broker returned it.
    Returned(ReturnedMessage),
}

/// Opens transport sessions from a connection descriptor.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn TransportConnection>, AmqpError>;
}

/// An established transport session.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn TransportChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A logical channel multiplexed over a transport session.
///
/// Messages published in sequence on one channel reach the broker in that
/// sequence; the seam makes no ordering promise across channels.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn declare_exchange(&self, definition: &ExchangeDefinition<'_>)
        -> Result<(), AmqpError>;

    /// Declares a queue and returns its effective name (server-generated
    /// when the definition's name is empty).
    async fn declare_queue(&self, definition: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<PublishOutcome, AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
