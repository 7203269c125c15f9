// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Alternate-exchange fallback: a primary direct exchange declared with an
//! alternate fanout exchange sends every unroutable message there instead
//! of dropping it.

use amqp_client::{
    blocking::BlockingConnection,
    connection::Connection,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    memory::MemoryBroker,
    message::Message,
    queue::{QueueBinding, QueueDefinition},
    topology::Topology,
    uri::ConnectionDescriptor,
};
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(5);

#[test]
fn unmatched_keys_fall_through_to_the_alternate_queue() {
    let broker = MemoryBroker::new();
    let connection =
        BlockingConnection::open_with(&broker, &ConnectionDescriptor::default(), DEADLINE).unwrap();
    let channel = connection.open_channel().unwrap();

    // The alternate exchange and its queue come first.
    channel
        .declare_exchange(&ExchangeDefinition::new("alt_exchange").fanout())
        .unwrap();
    channel.declare_queue(&QueueDefinition::new("alt_queue")).unwrap();
    channel
        .bind(&QueueBinding::new("alt_queue").exchange("alt_exchange"))
        .unwrap();

    // Then the primary exchange referencing it.
    channel
        .declare_exchange(
            &ExchangeDefinition::new("primary_exchange")
                .direct()
                .alternate_exchange("alt_exchange"),
        )
        .unwrap();
    channel.declare_queue(&QueueDefinition::new("test_queue")).unwrap();
    channel
        .bind(
            &QueueBinding::new("test_queue")
                .exchange("primary_exchange")
                .routing_key("test_key"),
        )
        .unwrap();

    channel
        .publish("primary_exchange", "test_key", &Message::new(b"Hello!"))
        .unwrap();
    channel
        .publish("primary_exchange", "bad_key", &Message::new(b"Fallback!"))
        .unwrap();

    assert_eq!(broker.messages("test_queue"), vec![b"Hello!".to_vec()]);
    assert_eq!(broker.messages("alt_queue"), vec![b"Fallback!".to_vec()]);

    channel.close().unwrap();
    connection.close().unwrap();
}

#[tokio::test]
async fn topology_installer_declares_the_whole_fallback_setup() {
    let broker = MemoryBroker::new();
    let connection = Connection::open_with(&broker, &ConnectionDescriptor::default())
        .await
        .unwrap();
    let channel = connection.open_channel().await.unwrap();

    let alt_exchange = ExchangeDefinition::new("alt_exchange").fanout();
    let alt_queue = QueueDefinition::new("alt_queue");
    let alt_binding = QueueBinding::new("alt_queue").exchange("alt_exchange");
    let primary = ExchangeDefinition::new("primary_exchange")
        .direct()
        .alternate_exchange("alt_exchange");
    let test_queue = QueueDefinition::new("test_queue");
    let test_binding = QueueBinding::new("test_queue")
        .exchange("primary_exchange")
        .routing_key("test_key");

    Topology::new()
        .exchange(&alt_exchange)
        .exchange(&primary)
        .queue(&alt_queue)
        .queue(&test_queue)
        .queue_binding(&alt_binding)
        .queue_binding(&test_binding)
        .install(&channel)
        .await
        .unwrap();

    // Installing the identical set again is a no-op.
    Topology::new()
        .exchange(&alt_exchange)
        .exchange(&primary)
        .queue_binding(&test_binding)
        .install(&channel)
        .await
        .unwrap();

    assert_eq!(broker.queued("test_queue"), Some(0));
    assert_eq!(broker.queued("alt_queue"), Some(0));
}

#[test]
fn unroutable_without_alternate_drops_or_returns() {
    let broker = MemoryBroker::new();
    let connection =
        BlockingConnection::open_with(&broker, &ConnectionDescriptor::default(), DEADLINE).unwrap();
    let channel = connection.open_channel().unwrap();

    channel
        .declare_exchange(&ExchangeDefinition::new("test_exchange"))
        .unwrap();
    channel.declare_queue(&QueueDefinition::new("test_queue")).unwrap();
    channel
        .bind(
            &QueueBinding::new("test_queue")
                .exchange("test_exchange")
                .routing_key("tests"),
        )
        .unwrap();

    // Not mandatory: the broker drops it silently.
    channel
        .publish("test_exchange", "bad_key", &Message::new(b"lost"))
        .unwrap();
    assert_eq!(broker.queued("test_queue"), Some(0));

    // Mandatory: the broker hands it back.
    let err = channel
        .publish("test_exchange", "bad_key", &Message::new(b"lost").mandatory())
        .unwrap_err();
    assert_eq!(
        err,
        AmqpError::MessageUnroutable("test_exchange".to_owned(), "bad_key".to_owned())
    );

    // A returned message is an event, not a failure: publishing goes on.
    channel
        .publish("test_exchange", "tests", &Message::new(b"Hello!"))
        .unwrap();
    assert_eq!(broker.messages("test_queue"), vec![b"Hello!".to_vec()]);
}

#[test]
fn conflicting_redeclarations_are_rejected() {
    let broker = MemoryBroker::new();
    let connection =
        BlockingConnection::open_with(&broker, &ConnectionDescriptor::default(), DEADLINE).unwrap();
    let channel = connection.open_channel().unwrap();

    channel
        .declare_exchange(&ExchangeDefinition::new("primary_exchange").alternate_exchange("alt_a"))
        .unwrap();

    // Same channel: the client-side view rejects the mismatch.
    assert_eq!(
        channel.declare_exchange(
            &ExchangeDefinition::new("primary_exchange").alternate_exchange("alt_b")
        ),
        Err(AmqpError::TopologyConflict("primary_exchange".to_owned()))
    );

    // Fresh channel, so the conflict comes from the broker instead.
    let other = connection.open_channel().unwrap();
    assert_eq!(
        other.declare_exchange(&ExchangeDefinition::new("primary_exchange").fanout()),
        Err(AmqpError::TopologyConflict("primary_exchange".to_owned()))
    );

    // A matching redeclaration stays a no-op.
    channel
        .declare_exchange(&ExchangeDefinition::new("primary_exchange").alternate_exchange("alt_a"))
        .unwrap();
}
