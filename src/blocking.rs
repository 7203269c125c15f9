// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Blocking Facade
//!
//! Synchronous counterparts of the connection and channel APIs for callers
//! without an async runtime. A [`BlockingConnection`] owns a private
//! current-thread runtime; every operation is driven to completion on the
//! calling thread under a deadline, so no call can hang: it resolves to a
//! result or to `NetworkUnreachable` once the deadline elapses.
//!
//! Only one thread drives a blocking connection and its channels; sharing
//! them across threads needs external synchronization.

use crate::{
    channel::Channel,
    connection::Connection,
    consumer::Consumer,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::MessageHandler,
    message::Message,
    publisher::Publisher,
    queue::{QueueBinding, QueueDefinition},
    transport::{PublishOutcome, Transport},
    uri::ConnectionDescriptor,
};
use opentelemetry::Context;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::runtime::Runtime;
use tracing::{error, warn};

/// A broker session driven synchronously on the calling thread.
pub struct BlockingConnection {
    runtime: Arc<Runtime>,
    inner: Connection,
    deadline: Duration,
}

impl BlockingConnection {
    /// Opens a session over the default lapin transport, blocking until the
    /// handshake completes or `deadline` elapses.
    ///
    /// The same deadline bounds every later operation on this connection
    /// and its channels.
    pub fn open(
        descriptor: &ConnectionDescriptor,
        deadline: Duration,
    ) -> Result<BlockingConnection, AmqpError> {
        Self::open_with(&crate::rabbit::RabbitTransport, descriptor, deadline)
    }

    /// Opens a session over the given transport.
    pub fn open_with(
        transport: &dyn Transport,
        descriptor: &ConnectionDescriptor,
        deadline: Duration,
    ) -> Result<BlockingConnection, AmqpError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| {
                error!(error = err.to_string(), "failure to build blocking runtime");
                AmqpError::InternalError
            })?;

        let inner = block_on(&runtime, deadline, Connection::open_with(transport, descriptor))?;

        Ok(BlockingConnection {
            runtime: Arc::new(runtime),
            inner,
            deadline,
        })
    }

    /// Opens a channel, blocking until the broker allocates it.
    pub fn open_channel(&self) -> Result<BlockingChannel, AmqpError> {
        let channel = block_on(&self.runtime, self.deadline, self.inner.open_channel())?;

        Ok(BlockingChannel {
            runtime: self.runtime.clone(),
            inner: Arc::new(channel),
            deadline: self.deadline,
        })
    }

    /// Closes the connection. Idempotent.
    pub fn close(&self) -> Result<(), AmqpError> {
        block_on(&self.runtime, self.deadline, self.inner.close())
    }
}

/// A channel driven synchronously on the calling thread.
pub struct BlockingChannel {
    runtime: Arc<Runtime>,
    inner: Arc<Channel>,
    deadline: Duration,
}

impl BlockingChannel {
    /// Declares an exchange, blocking for the broker acknowledgment.
    pub fn declare_exchange(&self, definition: &ExchangeDefinition<'_>) -> Result<(), AmqpError> {
        block_on(
            &self.runtime,
            self.deadline,
            self.inner.declare_exchange(definition),
        )
    }

    /// Declares a queue, returning its effective name.
    pub fn declare_queue(&self, definition: &QueueDefinition) -> Result<String, AmqpError> {
        block_on(
            &self.runtime,
            self.deadline,
            self.inner.declare_queue(definition),
        )
    }

    /// Binds a queue to an exchange.
    pub fn bind(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        block_on(&self.runtime, self.deadline, self.inner.bind(binding))
    }

    /// Publishes a message, blocking for the broker acknowledgment.
    ///
    /// A returned mandatory message surfaces synchronously as
    /// `MessageUnroutable`; the channel stays usable afterwards.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), AmqpError> {
        let publisher = Publisher::new(self.inner.clone());
        let outcome = block_on(
            &self.runtime,
            self.deadline,
            publisher.publish(&Context::current(), exchange, routing_key, message),
        )?;

        match outcome {
            PublishOutcome::Confirmed => Ok(()),
            PublishOutcome::Returned(_) => Err(AmqpError::MessageUnroutable(
                exchange.to_owned(),
                routing_key.to_owned(),
            )),
        }
    }

    /// Processes deliveries on the calling thread for at most `run_for`.
    ///
    /// The deadline is the blocking mode's stop signal: reaching it ends
    /// consumption normally. A [`crate::consumer::ConsumerStopper`] cloned
    /// from a consumer built with [`BlockingChannel::channel`] can end it
    /// earlier from another thread.
    pub fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        auto_ack: bool,
        run_for: Duration,
    ) -> Result<(), AmqpError> {
        let consumer = Consumer::new(self.inner.clone(), queue, handler, auto_ack);
        self.run_consumer(&consumer, run_for)
    }

    /// Runs an already-built consumer for at most `run_for`.
    pub fn run_consumer(&self, consumer: &Consumer, run_for: Duration) -> Result<(), AmqpError> {
        self.runtime.block_on(async {
            match tokio::time::timeout(run_for, consumer.run()).await {
                Ok(result) => result,
                Err(_elapsed) => Ok(()),
            }
        })
    }

    /// The underlying channel, for building consumers or publishers.
    pub fn channel(&self) -> Arc<Channel> {
        self.inner.clone()
    }

    /// Closes the channel. Idempotent.
    pub fn close(&self) -> Result<(), AmqpError> {
        block_on(&self.runtime, self.deadline, self.inner.close())
    }
}

fn block_on<F, T>(runtime: &Runtime, deadline: Duration, operation: F) -> Result<T, AmqpError>
where
    F: Future<Output = Result<T, AmqpError>>,
{
    runtime.block_on(async {
        match tokio::time::timeout(deadline, operation).await {
            Ok(result) => result,
            Err(_elapsed) => {
                warn!("operation deadline elapsed");
                Err(AmqpError::NetworkUnreachable)
            }
        }
    })
}
