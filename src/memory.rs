// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker Emulation
//!
//! A [`MemoryBroker`] implements the transport seam entirely in memory:
//! direct and fanout routing, alternate-exchange fallback, mandatory
//! returns, and redelivery on requeue. It exists for tests and local
//! development; it performs no IO and acknowledges every operation
//! immediately.
//!
//! The inspection helpers ([`MemoryBroker::queued`],
//! [`MemoryBroker::messages`], [`MemoryBroker::unacked`]) let tests assert
//! on broker state without a consumer.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{Delivery, Message, MessageProperties},
    queue::{QueueBinding, QueueDefinition},
    transport::{
        DeliveryStream, PublishOutcome, ReturnedMessage, Transport, TransportChannel,
        TransportConnection,
    },
    uri::ConnectionDescriptor,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExchangeEntry {
    kind: ExchangeKind,
    alternate_exchange: Option<String>,
    durable: bool,
    delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueFlags {
    durable: bool,
    delete: bool,
    exclusive: bool,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerEntry {
    tag: String,
    channel_id: u64,
    auto_ack: bool,
    sender: UnboundedSender<Result<Delivery, AmqpError>>,
}

struct QueueEntry {
    flags: QueueFlags,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
}

#[derive(Default)]
struct BrokerState {
    credentials: Option<(String, String)>,
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    bindings: Vec<(String, String, String)>,
    unacked: HashMap<u64, (String, StoredMessage)>,
    next_queue_id: u64,
    next_delivery_tag: u64,
    next_channel_id: u64,
}

/// An in-memory broker shared by every connection opened through it.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// A broker that rejects every descriptor not carrying these
    /// credentials with `AuthenticationFailed`.
    pub fn with_credentials(user: &str, password: &str) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.lock().credentials = Some((user.to_owned(), password.to_owned()));
        broker
    }

    /// Number of messages sitting in a queue, if the queue exists.
    pub fn queued(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|entry| entry.messages.len())
    }

    /// Snapshot of the message bodies sitting in a queue.
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|entry| entry.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of deliveries handed out but not yet settled.
    pub fn unacked(&self) -> usize {
        self.lock().unacked.len()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn TransportConnection>, AmqpError> {
        {
            let state = self.lock();
            if let Some((user, password)) = &state.credentials {
                if descriptor.user != *user || descriptor.password != *password {
                    return Err(AmqpError::AuthenticationFailed);
                }
            }
        }

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn TransportChannel>, AmqpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::ConnectionClosed);
        }

        let channel_id = {
            let mut state = self.broker.lock();
            state.next_channel_id += 1;
            state.next_channel_id
        };

        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            conn_closed: self.closed.clone(),
            closed: AtomicBool::new(false),
            channel_id,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    conn_closed: Arc<AtomicBool>,
    closed: AtomicBool,
    channel_id: u64,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.conn_closed.load(Ordering::Acquire) {
            return Err(AmqpError::ConnectionClosed);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::ChannelClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    async fn declare_exchange(
        &self,
        definition: &ExchangeDefinition<'_>,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let entry = ExchangeEntry {
            kind: definition.kind,
            alternate_exchange: definition.alternate_exchange.map(str::to_owned),
            durable: definition.durable,
            delete: definition.delete,
        };

        let mut state = self.broker.lock();
        match state.exchanges.get(definition.name) {
            Some(existing) if *existing != entry => {
                Err(AmqpError::TopologyConflict(definition.name.to_owned()))
            }
            _ => {
                state.exchanges.insert(definition.name.to_owned(), entry);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, definition: &QueueDefinition) -> Result<String, AmqpError> {
        self.ensure_open()?;

        let flags = QueueFlags {
            durable: definition.durable,
            delete: definition.delete,
            exclusive: definition.exclusive,
        };

        let mut state = self.broker.lock();
        let name = if definition.name.is_empty() {
            state.next_queue_id += 1;
            format!("amq.gen-{}", state.next_queue_id)
        } else {
            definition.name.clone()
        };

        match state.queues.get(&name) {
            Some(existing) if existing.flags != flags => Err(AmqpError::TopologyConflict(name)),
            Some(_) => Ok(name),
            None => {
                state.queues.insert(
                    name.clone(),
                    QueueEntry {
                        flags,
                        messages: VecDeque::new(),
                        consumers: Vec::new(),
                    },
                );
                Ok(name)
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let mut state = self.broker.lock();
        if !state.queues.contains_key(binding.queue_name) {
            return Err(AmqpError::TopologyConflict(binding.queue_name.to_owned()));
        }
        if !state.exchanges.contains_key(binding.exchange_name) {
            return Err(AmqpError::TopologyConflict(binding.exchange_name.to_owned()));
        }

        let triple = (
            binding.queue_name.to_owned(),
            binding.exchange_name.to_owned(),
            binding.routing_key.to_owned(),
        );
        if !state.bindings.contains(&triple) {
            state.bindings.push(triple);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<PublishOutcome, AmqpError> {
        self.ensure_open()?;

        let mut state = self.broker.lock();
        let targets = resolve_route(&state, exchange, routing_key)?;

        if targets.is_empty() {
            if message.mandatory {
                return Ok(PublishOutcome::Returned(ReturnedMessage {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    body: message.body.clone(),
                    properties: message.properties.clone(),
                }));
            }
            // No binding, no alternate exchange: silent drop.
            return Ok(PublishOutcome::Confirmed);
        }

        for queue in targets {
            let stored = StoredMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                body: message.body.clone(),
                properties: message.properties.clone(),
                redelivered: false,
            };
            deliver_or_enqueue(&mut state, &queue, stored);
        }

        Ok(PublishOutcome::Confirmed)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;

        let (sender, receiver) = unbounded_channel();

        {
            let mut state = self.broker.lock();
            if !state.queues.contains_key(queue) {
                return Err(AmqpError::TopologyConflict(queue.to_owned()));
            }

            // Hand the backlog to the new consumer before registering it.
            while let Some(stored) = state
                .queues
                .get_mut(queue)
                .and_then(|entry| entry.messages.pop_front())
            {
                let delivery = make_delivery(&mut state, queue, stored, auto_ack);
                let _ = sender.send(Ok(delivery));
            }

            if let Some(entry) = state.queues.get_mut(queue) {
                entry.consumers.push(ConsumerEntry {
                    tag: consumer_tag.to_owned(),
                    channel_id: self.channel_id,
                    auto_ack,
                    sender,
                });
            }
        }

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let mut state = self.broker.lock();
        for entry in state.queues.values_mut() {
            entry.consumers.retain(|consumer| consumer.tag != consumer_tag);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.lock().unacked.remove(&delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let mut state = self.broker.lock();
        let Some((queue, mut stored)) = state.unacked.remove(&delivery_tag) else {
            return Ok(());
        };

        if requeue {
            stored.redelivered = true;
            deliver_or_enqueue(&mut state, &queue, stored);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::Release);

        // Dropping the senders ends this channel's delivery streams.
        let mut state = self.broker.lock();
        let channel_id = self.channel_id;
        for entry in state.queues.values_mut() {
            entry.consumers.retain(|consumer| consumer.channel_id != channel_id);
        }
        Ok(())
    }
}

/// Queues a message routes to, following the broker routing rules: the
/// default exchange routes by queue name, direct exchanges by exact key,
/// fanout to every bound queue, and an unmatched primary falls through to
/// its alternate exchange.
fn resolve_route(
    state: &BrokerState,
    exchange: &str,
    routing_key: &str,
) -> Result<Vec<String>, AmqpError> {
    if exchange.is_empty() {
        if state.queues.contains_key(routing_key) {
            return Ok(vec![routing_key.to_owned()]);
        }
        return Ok(Vec::new());
    }

    let entry = state
        .exchanges
        .get(exchange)
        .ok_or_else(|| AmqpError::TopologyConflict(exchange.to_owned()))?;

    let targets: Vec<String> = state
        .bindings
        .iter()
        .filter(|(_, bound_exchange, bound_key)| {
            bound_exchange == exchange
                && (entry.kind == ExchangeKind::Fanout || bound_key == routing_key)
        })
        .map(|(queue, _, _)| queue.clone())
        .collect();

    if targets.is_empty() {
        if let Some(alternate) = &entry.alternate_exchange {
            if state.exchanges.contains_key(alternate) {
                return resolve_route(state, alternate, routing_key);
            }
        }
    }

    Ok(targets)
}

fn make_delivery(
    state: &mut BrokerState,
    queue: &str,
    stored: StoredMessage,
    auto_ack: bool,
) -> Delivery {
    state.next_delivery_tag += 1;
    let delivery_tag = state.next_delivery_tag;

    if !auto_ack {
        state
            .unacked
            .insert(delivery_tag, (queue.to_owned(), stored.clone()));
    }

    Delivery {
        exchange: stored.exchange,
        routing_key: stored.routing_key,
        body: stored.body,
        properties: stored.properties,
        delivery_tag,
        redelivered: stored.redelivered,
    }
}

fn deliver_or_enqueue(state: &mut BrokerState, queue: &str, stored: StoredMessage) {
    // Dead consumers (dropped receivers) are pruned on the way.
    loop {
        let Some(entry) = state.queues.get_mut(queue) else {
            return;
        };
        let Some(consumer) = entry.consumers.first() else {
            entry.messages.push_back(stored);
            return;
        };

        let auto_ack = consumer.auto_ack;
        let sender = consumer.sender.clone();
        let delivery = make_delivery(state, queue, stored.clone(), auto_ack);

        if sender.send(Ok(delivery)).is_ok() {
            return;
        }

        if !auto_ack {
            let tag = state.next_delivery_tag;
            state.unacked.remove(&tag);
        }
        if let Some(entry) = state.queues.get_mut(queue) {
            entry.consumers.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_channel(broker: &MemoryBroker) -> Box<dyn TransportChannel> {
        let connection = broker
            .connect(&ConnectionDescriptor::default())
            .await
            .unwrap();
        connection.open_channel().await.unwrap()
    }

    #[tokio::test]
    async fn direct_exchange_routes_by_exact_key() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;

        channel
            .declare_exchange(&ExchangeDefinition::new("test_exchange"))
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDefinition::new("test_queue"))
            .await
            .unwrap();
        channel
            .bind_queue(
                &QueueBinding::new("test_queue")
                    .exchange("test_exchange")
                    .routing_key("tests"),
            )
            .await
            .unwrap();

        let outcome = channel
            .publish("test_exchange", "tests", &Message::new(b"Hello!"))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Confirmed);
        assert_eq!(broker.queued("test_queue"), Some(1));

        channel
            .publish("test_exchange", "other", &Message::new(b"dropped"))
            .await
            .unwrap();
        assert_eq!(broker.queued("test_queue"), Some(1));
    }

    #[tokio::test]
    async fn fanout_ignores_routing_key() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;

        channel
            .declare_exchange(&ExchangeDefinition::new("fan").fanout())
            .await
            .unwrap();
        for queue in ["q1", "q2"] {
            channel
                .declare_queue(&QueueDefinition::new(queue))
                .await
                .unwrap();
            channel
                .bind_queue(&QueueBinding::new(queue).exchange("fan"))
                .await
                .unwrap();
        }

        channel
            .publish("fan", "anything", &Message::new(b"Hello!"))
            .await
            .unwrap();
        assert_eq!(broker.queued("q1"), Some(1));
        assert_eq!(broker.queued("q2"), Some(1));
    }

    #[tokio::test]
    async fn mandatory_unroutable_message_is_returned() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;

        channel
            .declare_exchange(&ExchangeDefinition::new("test_exchange"))
            .await
            .unwrap();

        let outcome = channel
            .publish(
                "test_exchange",
                "nowhere",
                &Message::new(b"Hello!").mandatory(),
            )
            .await
            .unwrap();

        match outcome {
            PublishOutcome::Returned(returned) => {
                assert_eq!(returned.routing_key, "nowhere");
                assert_eq!(returned.body, b"Hello!");
            }
            other => panic!("expected a returned message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn server_named_queues_get_unique_names() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;

        let first = channel
            .declare_queue(&QueueDefinition::server_named())
            .await
            .unwrap();
        let second = channel
            .declare_queue(&QueueDefinition::server_named())
            .await
            .unwrap();

        assert!(first.starts_with("amq.gen-"));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn wrong_credentials_fail_authentication() {
        let broker = MemoryBroker::with_credentials("admin", "secret");

        let err = broker
            .connect(&ConnectionDescriptor::default())
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, AmqpError::AuthenticationFailed);
    }
}
