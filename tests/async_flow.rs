// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Asynchronous flows: pipelines submitted to the background event loop,
//! coordinated with the calling thread through the synchronization gate,
//! with loop stop strictly ordered after connection close.

use amqp_client::{
    blocking::BlockingConnection,
    connection::{self, Connection},
    consumer::Consumer,
    errors::AmqpError,
    event_loop::EventLoop,
    exchange::ExchangeDefinition,
    gate::SyncGate,
    handler::{Disposition, MessageHandler},
    memory::MemoryBroker,
    message::{Delivery, Message},
    publisher::Publisher,
    queue::{QueueBinding, QueueDefinition},
    uri::ConnectionDescriptor,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{
    sync::{mpsc::Sender, Arc},
    time::Duration,
};

struct RecordingHandler {
    outcome: Sender<Vec<u8>>,
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, _ctx: &Context, delivery: &Delivery) -> Disposition {
        let _ = self.outcome.send(delivery.body.clone());
        Disposition::Ack
    }
}

#[test]
fn pipeline_publishes_then_gate_releases_then_loop_stops() {
    let broker = MemoryBroker::new();
    let event_loop = EventLoop::start("amqp-io").unwrap();
    let gate = Arc::new(SyncGate::new());
    let (result_tx, result_rx) = std::sync::mpsc::channel();

    let transport = broker.clone();
    let pipeline_gate = gate.clone();
    event_loop
        .submit(async move {
            let outcome: Result<(), AmqpError> = async {
                let connection =
                    Connection::open_with(&transport, &ConnectionDescriptor::default()).await?;
                let channel = Arc::new(connection.open_channel().await?);

                channel
                    .declare_exchange(&ExchangeDefinition::new("test_exchange"))
                    .await?;
                channel
                    .declare_queue(&QueueDefinition::new("test_queue"))
                    .await?;
                channel
                    .bind(
                        &QueueBinding::new("test_queue")
                            .exchange("test_exchange")
                            .routing_key("tests"),
                    )
                    .await?;

                let publisher = Publisher::new(channel.clone());
                let message = Message::json(&serde_json::json!({ "greeting": "Hello!" }))?
                    .app_id("async_flow")
                    .mandatory();
                publisher
                    .publish(&Context::current(), "test_exchange", "tests", &message)
                    .await?;

                // Rendezvous with the main thread, then close in order.
                let _ = pipeline_gate.wait(Duration::from_secs(1));
                channel.close().await?;
                connection.close().await?;
                Ok(())
            }
            .await;
            let _ = result_tx.send(outcome);
        })
        .unwrap();

    gate.wait(Duration::from_secs(30)).unwrap();
    event_loop.stop(Duration::from_secs(5)).unwrap();

    result_rx.try_recv().unwrap().unwrap();
    assert_eq!(broker.queued("test_queue"), Some(1));
}

#[test]
fn open_async_reports_on_the_loop_thread() {
    let broker = MemoryBroker::new();
    let event_loop = EventLoop::start("amqp-open").unwrap();
    let (result_tx, result_rx) = std::sync::mpsc::channel();

    let caller = std::thread::current().id();
    connection::open_async(
        &event_loop,
        Arc::new(broker),
        ConnectionDescriptor::default(),
        move |result| {
            let _ = result_tx.send((std::thread::current().id(), result.map(|_| ())));
        },
    )
    .unwrap();

    let (callback_thread, outcome) = result_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    outcome.unwrap();
    assert_ne!(callback_thread, caller);

    event_loop.stop(Duration::from_secs(5)).unwrap();
}

#[test]
fn unroutable_callback_fires_on_mandatory_returns() {
    let broker = MemoryBroker::new();
    let event_loop = EventLoop::start("amqp-returns").unwrap();
    let (returned_tx, returned_rx) = std::sync::mpsc::channel();

    let transport = broker.clone();
    event_loop
        .submit(async move {
            let connection =
                match Connection::open_with(&transport, &ConnectionDescriptor::default()).await {
                    Ok(connection) => connection,
                    Err(_) => return,
                };
            let Ok(channel) = connection.open_channel().await else {
                return;
            };
            let channel = Arc::new(channel);

            if channel
                .declare_exchange(&ExchangeDefinition::new("test_exchange"))
                .await
                .is_err()
            {
                return;
            }

            let publisher = Publisher::new(channel).on_unroutable(move |returned| {
                let _ = returned_tx.send(returned);
            });
            let _ = publisher
                .publish(
                    &Context::current(),
                    "test_exchange",
                    "nowhere",
                    &Message::new(b"Hello!").mandatory(),
                )
                .await;
        })
        .unwrap();

    let returned = returned_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(returned.exchange, "test_exchange");
    assert_eq!(returned.routing_key, "nowhere");
    assert_eq!(returned.body, b"Hello!".to_vec());

    event_loop.stop(Duration::from_secs(5)).unwrap();
}

#[test]
fn consumer_on_the_loop_stops_explicitly() {
    let broker = MemoryBroker::new();

    // Seed the queue synchronously, then hand the channel to the loop.
    let blocking =
        BlockingConnection::open_with(&broker, &ConnectionDescriptor::default(), Duration::from_secs(5))
            .unwrap();
    let blocking_channel = blocking.open_channel().unwrap();
    blocking_channel
        .declare_queue(&QueueDefinition::new("test_queue"))
        .unwrap();
    blocking_channel
        .publish("", "test_queue", &Message::new(b"Hello!"))
        .unwrap();

    let (body_tx, body_rx) = std::sync::mpsc::channel();
    let consumer = Consumer::new(
        blocking_channel.channel(),
        "test_queue",
        Arc::new(RecordingHandler { outcome: body_tx }),
        false,
    );
    let stopper = consumer.stopper();

    let event_loop = EventLoop::start("amqp-consume").unwrap();
    let (run_tx, run_rx) = std::sync::mpsc::channel();
    event_loop
        .submit(async move {
            let _ = run_tx.send(consumer.run().await);
        })
        .unwrap();

    assert_eq!(
        body_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        b"Hello!".to_vec()
    );

    stopper.stop();
    event_loop.stop(Duration::from_secs(5)).unwrap();
    run_rx.try_recv().unwrap().unwrap();

    assert_eq!(broker.queued("test_queue"), Some(0));
    assert_eq!(broker.unacked(), 0);
}
