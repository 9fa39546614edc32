// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Reliability Layer
//!
//! This module provides the error types used across the crate. `AmqpError` names the
//! operation that failed and the resource involved, while `BrokerError` carries a
//! structured classification of the underlying broker failure so callers never have
//! to inspect error text to decide between repairing, retrying or giving up.

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use std::fmt;
use thiserror::Error;

/// Structured classification of a failure reported by the broker or the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// The exchange or queue does not exist.
    NotFound,
    /// The entity exists with arguments that differ from the requested ones.
    IncompatibleArguments,
    /// The channel or the connection underneath it is gone.
    ConnectionUnavailable,
    Other,
}

impl fmt::Display for BrokerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BrokerErrorKind::NotFound => "not found",
            BrokerErrorKind::IncompatibleArguments => "incompatible arguments",
            BrokerErrorKind::ConnectionUnavailable => "connection unavailable",
            BrokerErrorKind::Other => "broker error",
        };

        f.write_str(label)
    }
}

/// A classified broker failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {reason}")]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub reason: String,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, reason: impl Into<String>) -> Self {
        BrokerError {
            kind,
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::NotFound, reason)
    }

    pub fn incompatible_arguments(reason: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::IncompatibleArguments, reason)
    }

    pub fn connection_unavailable(reason: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::ConnectionUnavailable, reason)
    }

    pub fn other(reason: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Other, reason)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == BrokerErrorKind::NotFound
    }

    pub fn is_incompatible_arguments(&self) -> bool {
        self.kind == BrokerErrorKind::IncompatibleArguments
    }

    /// Soft protocol errors close the channel on the broker side but leave the
    /// connection usable.
    pub(crate) fn is_soft(&self) -> bool {
        matches!(
            self.kind,
            BrokerErrorKind::NotFound | BrokerErrorKind::IncompatibleArguments
        )
    }
}

impl From<lapin::Error> for BrokerError {
    /// Classifies a lapin error once, at the boundary with the broker.
    fn from(err: lapin::Error) -> Self {
        let reason = err.to_string();

        let kind = match &err {
            lapin::Error::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BrokerErrorKind::NotFound,
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    BrokerErrorKind::IncompatibleArguments
                }
                AMQPErrorKind::Hard(_) => BrokerErrorKind::ConnectionUnavailable,
                _ => BrokerErrorKind::Other,
            },
            lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::IOError(_)
            | lapin::Error::MissingHeartbeatError => BrokerErrorKind::ConnectionUnavailable,
            _ => BrokerErrorKind::Other,
        };

        BrokerError { kind, reason }
    }
}

/// Represents errors that can occur while declaring topology, publishing or consuming.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The publisher or consumer has no channel to work with
    #[error("not initialized: no amqp channel available")]
    NotInitialized,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(#[source] BrokerError),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(#[source] BrokerError),

    /// Error probing or declaring the dead letter exchange and queue
    #[error("failure to declare dead letter `{0}`: {1}")]
    DeclareDeadLetterError(String, #[source] BrokerError),

    /// Error deleting a queue found with incompatible arguments
    #[error("failure to delete queue `{0}`: {1}")]
    DeleteQueueError(String, #[source] BrokerError),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, #[source] BrokerError),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, #[source] BrokerError),

    /// Error binding a queue to an exchange with a routing key
    #[error("failure to bind queue `{queue}` to exchange `{exchange}`, topic: `{routing_key}`: {source}")]
    BindingExchangeToQueueError {
        exchange: String,
        queue: String,
        routing_key: String,
        #[source]
        source: BrokerError,
    },

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`: {1}")]
    QoSDeclarationError(u16, #[source] BrokerError),

    /// Error enabling publisher confirms on the channel
    #[error("failure to enable publisher confirms: {0}")]
    ConfirmSelectError(#[source] BrokerError),

    /// Error opening a delivery stream on a queue
    #[error("failure to consume from queue `{0}`: {1}")]
    ConsumerDeclarationError(String, #[source] BrokerError),

    /// Error encoding or decoding a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(#[source] BrokerError),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(#[source] BrokerError),

    /// The publishing loop was started twice
    #[error("publisher already started")]
    PublisherAlreadyStarted,

    /// The publishing loop has stopped and no longer accepts messages
    #[error("publisher stopped")]
    PublisherStopped,

    /// The reconnection source reported a terminal failure
    #[error("failure to reconnect to the amqp channel: {0}")]
    ReconnectionError(#[source] BrokerError),

    /// Error loading configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}
