// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handler Contract
//!
//! A [`MessageHandler`] is invoked once per delivered message; its returned
//! [`Disposition`] decides acknowledgment. When the consumer runs with
//! `auto_ack`, the delivery is already acknowledged and the disposition is
//! ignored.

use crate::message::Delivery;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use opentelemetry::Context;

/// Outcome of handling a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge the delivery.
    Ack,
    /// Reject the delivery without redelivery.
    Nack,
    /// Reject the delivery and put it back on the queue.
    Requeue,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Disposition;
}
