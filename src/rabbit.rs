// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Transport
//!
//! Implements the transport seam over lapin. Errors from the wire are
//! mapped into the client taxonomy here and nowhere else. Every channel is
//! opened with publisher confirms so that a mandatory message the broker
//! returns is observable as a publish outcome.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, AMQP_HEADERS_ALTERNATE_EXCHANGE},
    message::{Delivery, Message, MessageProperties},
    queue::{QueueBinding, QueueDefinition},
    transport::{DeliveryStream, PublishOutcome, ReturnedMessage, Transport, TransportChannel, TransportConnection},
    uri::ConnectionDescriptor,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{basic::AMQPProperties, AMQPErrorKind, AMQPHardError, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, ConnectionProperties,
};
use std::collections::BTreeMap;
use tracing::error;

/// Reply code sent with client-initiated closes.
const REPLY_SUCCESS: u16 = 200;

/// The default, lapin-backed transport.
pub struct RabbitTransport;

#[async_trait]
impl Transport for RabbitTransport {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn TransportConnection>, AmqpError> {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(descriptor.name.clone()));

        let connection = lapin::Connection::connect(&descriptor.as_uri(), options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                map_error(err)
            })?;

        Ok(Box::new(RabbitConnection { inner: connection }))
    }
}

struct RabbitConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl TransportConnection for RabbitConnection {
    async fn open_channel(&self) -> Result<Box<dyn TransportChannel>, AmqpError> {
        let channel = self.inner.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            map_error(err)
        })?;

        // Confirms stay on for the channel's lifetime; mandatory returns
        // ride on the confirmation.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_error)?;

        Ok(Box::new(RabbitChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "client shutdown")
            .await
            .map_err(map_error)
    }
}

struct RabbitChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl TransportChannel for RabbitChannel {
    async fn declare_exchange(
        &self,
        definition: &ExchangeDefinition<'_>,
    ) -> Result<(), AmqpError> {
        let mut arguments = BTreeMap::new();
        if let Some(alternate) = definition.alternate_exchange {
            arguments.insert(
                ShortString::from(AMQP_HEADERS_ALTERNATE_EXCHANGE),
                AMQPValue::LongString(LongString::from(alternate)),
            );
        }

        self.inner
            .exchange_declare(
                definition.name,
                definition.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: definition.durable,
                    auto_delete: definition.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::from(arguments),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = definition.name,
                    "error to declare the exchange"
                );
                map_error(err)
            })
    }

    async fn declare_queue(&self, definition: &QueueDefinition) -> Result<String, AmqpError> {
        let queue = self
            .inner
            .queue_declare(
                &definition.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: definition.durable,
                    exclusive: definition.exclusive,
                    auto_delete: definition.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = definition.name.as_str(),
                    "error to declare the queue"
                );
                map_error(err)
            })?;

        Ok(queue.name().as_str().to_owned())
    }

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(
                binding.queue_name,
                binding.exchange_name,
                binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                map_error(err)
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<PublishOutcome, AmqpError> {
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: message.mandatory,
                    immediate: false,
                },
                &message.body,
                basic_properties(&message.properties),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                map_error(err)
            })?;

        match confirm.await.map_err(map_error)? {
            Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
                Ok(PublishOutcome::Returned(returned_message(*returned)))
            }
            Confirmation::Nack(None) => {
                error!("broker rejected message without returning it");
                Err(AmqpError::InternalError)
            }
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(PublishOutcome::Confirmed),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        Ok(consumer
            .map(|result| result.map(delivery_from).map_err(map_error))
            .boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(map_error)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(map_error)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(map_error)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "client shutdown")
            .await
            .map_err(map_error)
    }
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default();

    if let Some(content_type) = &properties.content_type {
        props = props.with_content_type(ShortString::from(content_type.as_str()));
    }
    if let Some(app_id) = &properties.app_id {
        props = props.with_app_id(ShortString::from(app_id.as_str()));
    }
    if let Some(message_id) = &properties.message_id {
        props = props.with_message_id(ShortString::from(message_id.as_str()));
    }
    if let Some(msg_type) = &properties.msg_type {
        props = props.with_type(ShortString::from(msg_type.as_str()));
    }

    if !properties.headers.is_empty() {
        let mut table = BTreeMap::new();
        for (key, value) in &properties.headers {
            table.insert(
                ShortString::from(key.as_str()),
                AMQPValue::LongString(LongString::from(value.as_str())),
            );
        }
        props = props.with_headers(FieldTable::from(table));
    }

    props
}

fn message_properties(props: &AMQPProperties) -> MessageProperties {
    let mut headers = BTreeMap::new();
    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(text) = value {
                if let Ok(text) = std::str::from_utf8(text.as_bytes()) {
                    headers.insert(key.as_str().to_owned(), text.to_owned());
                }
            }
        }
    }

    MessageProperties {
        content_type: props.content_type().as_ref().map(|v| v.as_str().to_owned()),
        app_id: props.app_id().as_ref().map(|v| v.as_str().to_owned()),
        message_id: props.message_id().as_ref().map(|v| v.as_str().to_owned()),
        msg_type: props.kind().as_ref().map(|v| v.as_str().to_owned()),
        headers,
    }
}

fn delivery_from(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        properties: message_properties(&delivery.properties),
        body: delivery.data,
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
    }
}

fn returned_message(returned: lapin::message::BasicReturnMessage) -> ReturnedMessage {
    let delivery = returned.delivery;
    ReturnedMessage {
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        properties: message_properties(&delivery.properties),
        body: delivery.data,
    }
}

fn map_error(err: lapin::Error) -> AmqpError {
    match err {
        lapin::Error::InvalidConnectionState(_) => AmqpError::ConnectionClosed,
        lapin::Error::InvalidChannelState(_) => AmqpError::ChannelClosed,
        lapin::Error::IOError(io) => map_io_error(io.kind()),
        lapin::Error::ProtocolError(protocol) => map_protocol_error(&protocol),
        _ => AmqpError::InternalError,
    }
}

fn map_io_error(kind: std::io::ErrorKind) -> AmqpError {
    match kind {
        std::io::ErrorKind::ConnectionRefused => AmqpError::ConnectionRefused,
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe => AmqpError::ConnectionClosed,
        _ => AmqpError::NetworkUnreachable,
    }
}

fn map_protocol_error(err: &lapin::protocol::AMQPError) -> AmqpError {
    match err.kind() {
        AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
        | AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED) => AmqpError::AuthenticationFailed,
        AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
            AmqpError::TopologyConflict(err.get_message().as_str().to_owned())
        }
        AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED) => AmqpError::ConnectionClosed,
        _ => AmqpError::InternalError,
    }
}
