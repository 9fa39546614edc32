// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reliable RabbitMQ messaging
//!
//! A publisher and a consumer on top of one shared AMQP channel:
//! - the topology (topic exchange, quorum queue, dead letter exchange and queue) is
//!   declared idempotently and repaired when the dead letter arguments drift;
//! - publishing is asynchronous, confirmed and retried until the broker accepts the
//!   message; a transport failure pauses the pipeline until the next reconnection;
//! - consuming runs a fixed pool of workers per connection epoch and restarts them
//!   after every reconnection.

mod consumer;
mod otel;

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod manager;
pub mod message;
pub mod metadata;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use config::RabbitMQConfigs;
pub use consumer::{Handler, HandlerError};
pub use dispatcher::RabbitMQConsumer;
pub use errors::{AmqpError, BrokerError, BrokerErrorKind};
pub use manager::ChannelManager;
pub use message::IncomingMessage;
pub use publisher::{Publisher, RabbitMQPublisher};
