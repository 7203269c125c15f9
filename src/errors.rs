// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Client
//!
//! This module provides the error taxonomy for the client core. The
//! `AmqpError` enum covers descriptor parsing, connection and channel
//! lifecycle, topology declaration, publishing, and the rendezvous gate.
//! Transport-level failures are mapped into these variants exactly once, at
//! the transport seam; the core never retries on the caller's behalf.

use thiserror::Error;

/// Represents errors that can occur during AMQP client operations.
///
/// Lifecycle variants (`ConnectionClosed`, `ChannelClosed`) are raised both
/// by local state checks and by the transport when the peer has already gone
/// away. `MessageUnroutable` is a reported event rather than a fatal
/// condition: the publisher remains usable after returning it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The connection descriptor string could not be parsed
    #[error("invalid connection descriptor `{0}`")]
    InvalidConnectionDescriptor(String),

    /// The broker actively refused the transport session
    #[error("connection refused by broker")]
    ConnectionRefused,

    /// The broker rejected the credentials or vhost access
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The broker endpoint could not be reached in time
    #[error("network unreachable")]
    NetworkUnreachable,

    /// Operation issued against a connection that is closing or closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation issued against a channel that is closing or closed
    #[error("channel closed")]
    ChannelClosed,

    /// A declaration disagreed with existing topology state
    #[error("topology conflict on `{0}`")]
    TopologyConflict(String),

    /// A mandatory message matched no binding and no alternate exchange
    #[error("message unroutable on exchange `{0}` with key `{1}`")]
    MessageUnroutable(String, String),

    /// More parties arrived at a gate than the gate was built for
    #[error("gate misuse: more than two parties")]
    GateMisuse,

    /// A gate wait elapsed before the second party arrived
    #[error("gate timed out")]
    GateTimedOut,

    /// Error encoding or decoding a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,
}
