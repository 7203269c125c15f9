// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Provider
//!
//! Opens broker sessions from a parsed [`ConnectionDescriptor`] and tracks
//! their lifecycle. [`Connection::open`] is the native async entry point;
//! the blocking facade awaits it on a private runtime, and [`open_async`]
//! schedules it on an [`EventLoop`] with a completion callback invoked on
//! that loop's thread.
//!
//! Lifecycle is `active -> closing -> closed`. Close is idempotent and
//! best-effort: a transport failure while closing is logged and does not
//! keep the connection from reaching `closed`.

use crate::{
    channel::Channel,
    errors::AmqpError,
    event_loop::EventLoop,
    rabbit::RabbitTransport,
    transport::{Transport, TransportConnection},
    uri::ConnectionDescriptor,
};
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use tracing::{debug, warn};

/// Lifecycle of a connection or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    Closing,
    Closed,
}

/// Shared lifecycle flag checked before every operation.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

const STATE_ACTIVE: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

impl StateCell {
    pub(crate) fn active() -> StateCell {
        StateCell(AtomicU8::new(STATE_ACTIVE))
    }

    pub(crate) fn load(&self) -> LifecycleState {
        match self.0.load(Ordering::Acquire) {
            STATE_ACTIVE => LifecycleState::Active,
            STATE_CLOSING => LifecycleState::Closing,
            _ => LifecycleState::Closed,
        }
    }

    /// Moves `active -> closing`; false when a close already happened.
    pub(crate) fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(
                STATE_ACTIVE,
                STATE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn finish_close(&self) {
        self.0.store(STATE_CLOSED, Ordering::Release);
    }

    pub(crate) fn ensure_active(&self, on_closed: AmqpError) -> Result<(), AmqpError> {
        match self.load() {
            LifecycleState::Active => Ok(()),
            _ => Err(on_closed),
        }
    }
}

/// An open broker session owning zero or more channels.
#[derive(Clone)]
pub struct Connection {
    link: Arc<dyn TransportConnection>,
    state: Arc<StateCell>,
}

impl Connection {
    /// Opens a session over the default lapin transport.
    pub async fn open(descriptor: &ConnectionDescriptor) -> Result<Connection, AmqpError> {
        Connection::open_with(&RabbitTransport, descriptor).await
    }

    /// Opens a session over the given transport.
    pub async fn open_with(
        transport: &dyn Transport,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Connection, AmqpError> {
        debug!(endpoint = %descriptor, "creating amqp connection...");
        let link = transport.connect(descriptor).await?;
        debug!("amqp connected");

        Ok(Connection {
            link: Arc::from(link),
            state: Arc::new(StateCell::active()),
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state.load()
    }

    /// Opens a new channel on this connection.
    pub async fn open_channel(&self) -> Result<Channel, AmqpError> {
        self.state.ensure_active(AmqpError::ConnectionClosed)?;

        debug!("creating amqp channel...");
        let link = self.link.open_channel().await?;
        debug!("channel created");

        Ok(Channel::new(link, self.state.clone()))
    }

    /// Closes the connection. Idempotent; failures while closing are logged
    /// and the connection still ends up `closed`.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if !self.state.begin_close() {
            return Ok(());
        }

        if let Err(err) = self.link.close().await {
            warn!(error = err.to_string(), "failure while closing connection");
        }
        self.state.finish_close();
        debug!("amqp connection closed");

        Ok(())
    }
}

/// Schedules a session handshake on the event loop.
///
/// Returns as soon as the handshake is queued; `on_open` runs on the loop's
/// background thread with the opened connection or the connect error. The
/// callback must not be assumed to run on the calling thread.
pub fn open_async<F>(
    event_loop: &EventLoop,
    transport: Arc<dyn Transport>,
    descriptor: ConnectionDescriptor,
    on_open: F,
) -> Result<(), AmqpError>
where
    F: FnOnce(Result<Connection, AmqpError>) + Send + 'static,
{
    event_loop.submit(async move {
        on_open(Connection::open_with(transport.as_ref(), &descriptor).await);
    })
}
