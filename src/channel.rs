// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Management
//!
//! A [`Channel`] is a logical sub-session owned by exactly one
//! [`crate::connection::Connection`]. All topology and messaging operations
//! are issued on a channel, never on a connection, and are ordered only
//! relative to each other within that channel.
//!
//! Every operation first checks the owning connection's lifecycle
//! (`ConnectionClosed` once it is closing) and then the channel's own
//! (`ChannelClosed`). Declarations go through the channel's client-side
//! [`crate::topology::TopologyView`], which makes them idempotent and
//! rejects conflicting redeclarations before any wire traffic.

use crate::{
    connection::{LifecycleState, StateCell},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    topology::TopologyView,
    transport::TransportChannel,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// A logical sub-session carrying topology and messaging operations.
pub struct Channel {
    link: Arc<dyn TransportChannel>,
    conn_state: Arc<StateCell>,
    state: StateCell,
    topology: Mutex<TopologyView>,
}

impl Channel {
    pub(crate) fn new(link: Box<dyn TransportChannel>, conn_state: Arc<StateCell>) -> Channel {
        Channel {
            link: Arc::from(link),
            conn_state,
            state: StateCell::active(),
            topology: Mutex::new(TopologyView::default()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state.load()
    }

    /// Declares an exchange.
    ///
    /// A redeclaration with matching parameters is a no-op; a conflicting
    /// one fails with `TopologyConflict`. The alternate-exchange reference
    /// is part of the parameters being matched.
    pub async fn declare_exchange(
        &self,
        definition: &ExchangeDefinition<'_>,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        if !self.topology().exchange_needs_declare(definition)? {
            debug!(name = definition.name, "exchange already declared");
            return Ok(());
        }

        self.link.declare_exchange(definition).await?;
        self.topology().record_exchange(definition);
        debug!(name = definition.name, "exchange was created");

        Ok(())
    }

    /// Declares a queue and returns its effective name.
    ///
    /// A definition with an empty name gets a broker-generated name; the
    /// returned name is the one to bind and consume with.
    pub async fn declare_queue(&self, definition: &QueueDefinition) -> Result<String, AmqpError> {
        self.ensure_open()?;

        if let Some(name) = self.topology().known_queue(definition)? {
            debug!(name = name.as_str(), "queue already declared");
            return Ok(name);
        }

        let effective_name = self.link.declare_queue(definition).await?;
        self.topology().record_queue(&effective_name, definition);
        debug!(name = effective_name.as_str(), "queue was created");

        Ok(effective_name)
    }

    /// Binds a queue to an exchange; rebinding an identical triple is a
    /// no-op.
    pub async fn bind(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        self.ensure_open()?;

        if !self.topology().record_binding(binding) {
            debug!(
                queue = binding.queue_name,
                exchange = binding.exchange_name,
                "binding already exists"
            );
            return Ok(());
        }

        if let Err(err) = self.link.bind_queue(binding).await {
            // The broker never saw the binding; drop it from the view too.
            self.topology().forget_binding(binding);
            return Err(err);
        }

        Ok(())
    }

    /// Closes the channel and detaches it from its connection. Idempotent;
    /// failures while closing are logged and the channel still ends up
    /// `closed`.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if !self.state.begin_close() {
            return Ok(());
        }

        if let Err(err) = self.link.close().await {
            warn!(error = err.to_string(), "failure while closing channel");
        }
        self.state.finish_close();
        debug!("amqp channel closed");

        Ok(())
    }

    pub(crate) fn ensure_open(&self) -> Result<(), AmqpError> {
        self.conn_state.ensure_active(AmqpError::ConnectionClosed)?;
        self.state.ensure_active(AmqpError::ChannelClosed)
    }

    /// Publishing requires the exchange in this channel's topology view,
    /// except for the default nameless exchange.
    pub(crate) fn ensure_publishable(&self, exchange: &str) -> Result<(), AmqpError> {
        if self.topology().is_publishable(exchange) {
            Ok(())
        } else {
            Err(AmqpError::TopologyConflict(exchange.to_owned()))
        }
    }

    pub(crate) fn link(&self) -> Arc<dyn TransportChannel> {
        self.link.clone()
    }

    fn topology(&self) -> MutexGuard<'_, TopologyView> {
        self.topology
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
