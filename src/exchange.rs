// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! This module provides types for defining broker exchanges. Exchanges route
//! published messages to queues; this client supports direct and fanout
//! routing, optionally with an alternate exchange that receives messages the
//! primary exchange cannot route.

/// Argument-table key carrying the alternate exchange name at declaration.
pub const AMQP_HEADERS_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

/// Routing behavior of an exchange.
///
/// - Direct: routes messages to queues whose binding key matches exactly
/// - Fanout: broadcasts messages to all bound queues regardless of key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }
}

/// Definition of an exchange with its declaration parameters.
///
/// The alternate exchange is part of the declaration itself: it cannot be
/// attached to an already-declared exchange afterwards, and redeclaring with
/// a different alternate target is a topology conflict.
#[derive(Debug, Clone)]
pub struct ExchangeDefinition<'ex> {
    pub(crate) name: &'ex str,
    pub(crate) kind: ExchangeKind,
    pub(crate) alternate_exchange: Option<&'ex str>,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
}

impl<'ex> ExchangeDefinition<'ex> {
    /// Creates a new direct exchange definition with the given name.
    pub fn new(name: &'ex str) -> ExchangeDefinition<'ex> {
        ExchangeDefinition {
            name,
            kind: ExchangeKind::Direct,
            alternate_exchange: None,
            durable: false,
            delete: false,
        }
    }

    /// Sets the exchange type to Direct.
    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Routes messages this exchange cannot route to `name` instead.
    ///
    /// The broker performs the re-publication; the client's only contract is
    /// declaring the reference together with the exchange.
    pub fn alternate_exchange(mut self, name: &'ex str) -> Self {
        self.alternate_exchange = Some(name);
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// The exchange name.
    pub fn name(&self) -> &str {
        self.name
    }
}
