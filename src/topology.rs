// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Every channel keeps a client-side view of the topology declared through
//! it. The view makes declarations idempotent (a matching redeclaration is a
//! no-op that never reaches the broker) and rejects conflicting ones with
//! `TopologyConflict` before any wire traffic happens. Publishing requires
//! the target exchange to be present in the view, except for the default
//! nameless exchange.
//!
//! The [`Topology`] builder installs a whole set of exchanges, queues, and
//! bindings in declaration order: exchanges first, then queues, then
//! bindings, so an alternate exchange is always in place before the primary
//! exchange that references it.

use crate::{
    channel::Channel,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExchangeRecord {
    kind: ExchangeKind,
    alternate_exchange: Option<String>,
    durable: bool,
    delete: bool,
}

impl ExchangeRecord {
    fn from_definition(definition: &ExchangeDefinition<'_>) -> ExchangeRecord {
        ExchangeRecord {
            kind: definition.kind,
            alternate_exchange: definition.alternate_exchange.map(str::to_owned),
            durable: definition.durable,
            delete: definition.delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueRecord {
    durable: bool,
    delete: bool,
    exclusive: bool,
}

impl QueueRecord {
    fn from_definition(definition: &QueueDefinition) -> QueueRecord {
        QueueRecord {
            durable: definition.durable,
            delete: definition.delete,
            exclusive: definition.exclusive,
        }
    }
}

/// Client-side registry of what one channel has declared.
#[derive(Debug, Default)]
pub(crate) struct TopologyView {
    exchanges: HashMap<String, ExchangeRecord>,
    queues: HashMap<String, QueueRecord>,
    bindings: HashSet<(String, String, String)>,
}

impl TopologyView {
    /// Whether declaring this exchange needs a broker round-trip.
    ///
    /// Returns `Ok(false)` for a matching redeclaration and
    /// `TopologyConflict` when the name is taken with different parameters.
    pub(crate) fn exchange_needs_declare(
        &self,
        definition: &ExchangeDefinition<'_>,
    ) -> Result<bool, AmqpError> {
        match self.exchanges.get(definition.name) {
            None => Ok(true),
            Some(existing) if *existing == ExchangeRecord::from_definition(definition) => Ok(false),
            Some(_) => Err(AmqpError::TopologyConflict(definition.name.to_owned())),
        }
    }

    pub(crate) fn record_exchange(&mut self, definition: &ExchangeDefinition<'_>) {
        self.exchanges.insert(
            definition.name.to_owned(),
            ExchangeRecord::from_definition(definition),
        );
    }

    /// The effective name of an already-declared matching queue, if any.
    pub(crate) fn known_queue(
        &self,
        definition: &QueueDefinition,
    ) -> Result<Option<String>, AmqpError> {
        if definition.name.is_empty() {
            // Server-named declarations always allocate a fresh queue.
            return Ok(None);
        }
        match self.queues.get(&definition.name) {
            None => Ok(None),
            Some(existing) if *existing == QueueRecord::from_definition(definition) => {
                Ok(Some(definition.name.clone()))
            }
            Some(_) => Err(AmqpError::TopologyConflict(definition.name.clone())),
        }
    }

    pub(crate) fn record_queue(&mut self, effective_name: &str, definition: &QueueDefinition) {
        self.queues.insert(
            effective_name.to_owned(),
            QueueRecord::from_definition(definition),
        );
    }

    /// Records a binding; returns false when the identical triple exists.
    pub(crate) fn record_binding(&mut self, binding: &QueueBinding<'_>) -> bool {
        self.bindings.insert((
            binding.queue_name.to_owned(),
            binding.exchange_name.to_owned(),
            binding.routing_key.to_owned(),
        ))
    }

    /// Drops a binding whose broker-side creation failed.
    pub(crate) fn forget_binding(&mut self, binding: &QueueBinding<'_>) {
        self.bindings.remove(&(
            binding.queue_name.to_owned(),
            binding.exchange_name.to_owned(),
            binding.routing_key.to_owned(),
        ));
    }

    /// Whether a publish target is known to this channel.
    ///
    /// The default nameless exchange always exists.
    pub(crate) fn is_publishable(&self, exchange: &str) -> bool {
        exchange.is_empty() || self.exchanges.contains_key(exchange)
    }
}

/// A set of exchanges, queues, and bindings installed together.
#[derive(Default)]
pub struct Topology<'tp> {
    exchanges: Vec<&'tp ExchangeDefinition<'tp>>,
    queues: Vec<&'tp QueueDefinition>,
    bindings: Vec<&'tp QueueBinding<'tp>>,
}

impl<'tp> Topology<'tp> {
    pub fn new() -> Topology<'tp> {
        Topology::default()
    }

    /// Adds an exchange definition to the set.
    pub fn exchange(mut self, definition: &'tp ExchangeDefinition<'tp>) -> Self {
        self.exchanges.push(definition);
        self
    }

    /// Adds a queue definition to the set.
    pub fn queue(mut self, definition: &'tp QueueDefinition) -> Self {
        self.queues.push(definition);
        self
    }

    /// Adds a queue-to-exchange binding to the set.
    pub fn queue_binding(mut self, binding: &'tp QueueBinding<'tp>) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Installs the whole set on the given channel.
    ///
    /// Exchanges are created first, then queues, then bindings.
    pub async fn install(&self, channel: &Channel) -> Result<(), AmqpError> {
        for definition in &self.exchanges {
            debug!(name = definition.name, "creating exchange");
            channel.declare_exchange(definition).await?;
        }

        for definition in &self.queues {
            debug!(name = definition.name, "creating queue");
            channel.declare_queue(definition).await?;
        }

        for binding in &self.bindings {
            debug!(
                queue = binding.queue_name,
                exchange = binding.exchange_name,
                key = binding.routing_key,
                "binding queue to exchange"
            );
            channel.bind(binding).await?;
        }

        Ok(())
    }
}
