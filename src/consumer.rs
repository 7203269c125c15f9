// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! Registers a [`MessageHandler`] against a queue and processes deliveries
//! until explicitly stopped. The handler's [`Disposition`] drives
//! acknowledgment; with `auto_ack` the broker settles the delivery at
//! delivery time and the disposition is ignored (at-most-once).
//!
//! Stopping is always a separate, explicit call through the
//! [`ConsumerStopper`]; it is never inferred from handler behavior.
//!
//! Acknowledging within the broker's delivery timeout is the caller's
//! responsibility: a handler that sits on a delivery past that window is
//! outside this client's control.

use crate::{
    channel::Channel,
    errors::AmqpError,
    handler::{Disposition, MessageHandler},
    message::Delivery,
    otel,
};
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tokio::sync::Notify;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Cloneable handle requesting a consumer to stop.
///
/// The request is remembered, so stopping a consumer that is mid-delivery
/// takes effect right after the handler returns.
#[derive(Clone)]
pub struct ConsumerStopper(Arc<Notify>);

impl ConsumerStopper {
    pub fn stop(&self) {
        self.0.notify_one();
    }
}

/// A handler registration against one queue.
pub struct Consumer {
    channel: Arc<Channel>,
    queue: String,
    handler: Arc<dyn MessageHandler>,
    auto_ack: bool,
    tag: String,
    stop: Arc<Notify>,
}

impl Consumer {
    /// Creates a consumer for the given queue and handler.
    pub fn new(
        channel: Arc<Channel>,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        auto_ack: bool,
    ) -> Consumer {
        Consumer {
            channel,
            queue: queue.to_owned(),
            handler,
            auto_ack,
            tag: format!("{}-{}", queue, Uuid::new_v4()),
            stop: Arc::new(Notify::new()),
        }
    }

    /// A handle for stopping this consumer from another thread or task.
    pub fn stopper(&self) -> ConsumerStopper {
        ConsumerStopper(self.stop.clone())
    }

    /// Processes deliveries until the stopper fires or the stream ends.
    ///
    /// Handler and acknowledgment failures are logged per delivery and do
    /// not end the loop; losing the channel or connection does.
    pub async fn run(&self) -> Result<(), AmqpError> {
        self.channel.ensure_open()?;

        let mut deliveries = match self
            .channel
            .link()
            .consume(&self.queue, &self.tag, self.auto_ack)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                return Err(err);
            }
        };
        debug!(queue = self.queue.as_str(), tag = self.tag.as_str(), "consumer registered");

        let tracer = global::tracer("amqp consumer");
        loop {
            tokio::select! {
                _ = self.stop.notified() => {
                    if let Err(err) = self.channel.link().cancel_consumer(&self.tag).await {
                        warn!(error = err.to_string(), "failure while cancelling consumer");
                    }
                    debug!(tag = self.tag.as_str(), "consumer stopped");
                    return Ok(());
                }
                delivery = deliveries.next() => match delivery {
                    None => {
                        debug!(queue = self.queue.as_str(), "delivery stream ended");
                        return Ok(());
                    }
                    Some(Ok(delivery)) => {
                        if let Err(err) = self.dispatch(&tracer, &delivery).await {
                            error!(error = err.to_string(), "error consuming message");
                        }
                    }
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "failure on delivery stream");
                        if matches!(err, AmqpError::ConnectionClosed | AmqpError::ChannelClosed) {
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, tracer: &BoxedTracer, delivery: &Delivery) -> Result<(), AmqpError> {
        let span_name = delivery
            .properties
            .msg_type
            .clone()
            .unwrap_or_else(|| self.queue.clone());
        let (ctx, mut span) = otel::consumer_span(&delivery.properties, tracer, &span_name);

        debug!(
            queue = self.queue.as_str(),
            exchange = delivery.exchange.as_str(),
            "received message"
        );

        let disposition = self.handler.handle(&ctx, delivery).await;

        if self.auto_ack {
            // Settled at delivery time; nothing the handler returns can
            // bring the message back.
            span.set_status(Status::Ok);
            return Ok(());
        }

        let settled = match disposition {
            Disposition::Ack => self.channel.link().ack(delivery.delivery_tag).await,
            Disposition::Nack => self.channel.link().nack(delivery.delivery_tag, false).await,
            Disposition::Requeue => self.channel.link().nack(delivery.delivery_tag, true).await,
        };

        match settled {
            Ok(()) => {
                span.set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to settle message"),
                });
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::Connection,
        handler::MockMessageHandler,
        memory::MemoryBroker,
        message::Message,
        publisher::Publisher,
        queue::QueueDefinition,
        transport::PublishOutcome,
        uri::ConnectionDescriptor,
    };
    use opentelemetry::Context;

    #[tokio::test]
    async fn handler_disposition_acknowledges_deliveries() {
        let broker = MemoryBroker::new();
        let descriptor = ConnectionDescriptor::default();
        let connection = Connection::open_with(&broker, &descriptor).await.unwrap();
        let channel = Arc::new(connection.open_channel().await.unwrap());
        channel
            .declare_queue(&QueueDefinition::new("test_queue"))
            .await
            .unwrap();

        let publisher = Publisher::new(channel.clone());
        for _ in 0..2 {
            let outcome = publisher
                .publish(
                    &Context::current(),
                    "",
                    "test_queue",
                    &Message::new(b"Hello!"),
                )
                .await
                .unwrap();
            assert_eq!(outcome, PublishOutcome::Confirmed);
        }

        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .times(2)
            .returning(|_, _| Disposition::Ack);

        let consumer = Consumer::new(channel.clone(), "test_queue", Arc::new(handler), false);
        let stopper = consumer.stopper();

        // Give the loop time to drain both deliveries, then stop it.
        let stop_after = async {
            while broker.queued("test_queue").unwrap() != 0 || broker.unacked() != 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            stopper.stop();
        };

        let (run_result, ()) = tokio::join!(consumer.run(), stop_after);
        run_result.unwrap();

        assert_eq!(broker.queued("test_queue").unwrap(), 0);
        assert_eq!(broker.unacked(), 0);
    }

    #[tokio::test]
    async fn run_on_closed_channel_fails() {
        let broker = MemoryBroker::new();
        let connection = Connection::open_with(&broker, &ConnectionDescriptor::default())
            .await
            .unwrap();
        let channel = Arc::new(connection.open_channel().await.unwrap());
        channel.close().await.unwrap();

        let mut handler = MockMessageHandler::new();
        handler.expect_handle().never();

        let consumer = Consumer::new(channel, "test_queue", Arc::new(handler), false);
        assert_eq!(consumer.run().await.unwrap_err(), AmqpError::ChannelClosed);
    }
}
