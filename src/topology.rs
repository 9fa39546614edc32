// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the topology shared by the publisher and the consumer:
//! - a durable topic exchange and a durable quorum queue dead lettering to `<queue>_dlx`;
//! - the `<queue>_dlx` fanout exchange and its quorum queue, bounded by a message TTL
//!   and a maximum length;
//! - one binding per routing key.
//!
//! The dead letter queue is probed passively first. It is only (re)declared when it is
//! missing, and deleted first when the broker reports incompatible arguments, so a
//! change of the retention policy heals itself on the next declaration.

use crate::{
    config::DEAD_LETTER_SUFFIX,
    errors::{AmqpError, BrokerError},
    exchange::ExchangeDefinition,
    manager::{ChannelManager, SharedChannel},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Dead letter retention: 14 days
pub const DEAD_LETTER_MESSAGE_TTL_MS: i64 = 1000 * 60 * 60 * 24 * 14;
/// Dead letter capacity: 10k messages
pub const DEAD_LETTER_MAX_LENGTH: i32 = 10_000;

/// Names and settings of the topology. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescriptor {
    pub exchange_name: String,
    pub queue_name: String,
    pub dead_letter_name: String,
    pub prefetch_count: u16,
}

impl TopologyDescriptor {
    pub fn new(exchange: &str, queue: &str, prefetch_count: u16) -> TopologyDescriptor {
        TopologyDescriptor {
            exchange_name: exchange.to_owned(),
            queue_name: queue.to_owned(),
            dead_letter_name: format!("{}{}", queue, DEAD_LETTER_SUFFIX),
            prefetch_count,
        }
    }

    pub fn primary_exchange(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.exchange_name).durable()
    }

    pub fn primary_queue(&self) -> QueueDefinition {
        QueueDefinition::new(&self.queue_name)
            .durable()
            .quorum()
            .dead_letter_exchange(&self.dead_letter_name)
    }

    pub fn dead_letter_exchange(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.dead_letter_name)
            .fanout()
            .durable()
    }

    pub fn dead_letter_queue(&self) -> QueueDefinition {
        QueueDefinition::new(&self.dead_letter_name)
            .durable()
            .quorum()
            .ttl(DEAD_LETTER_MESSAGE_TTL_MS)
            .max_length(DEAD_LETTER_MAX_LENGTH)
    }
}

/// Interface for topology declaration.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Declares the whole topology and binds the queue to every routing key.
    /// Safe to call repeatedly.
    async fn declare(&self, routing_keys: &[String]) -> Result<(), AmqpError>;
}

/// Declares the topology through the channel of a [`ChannelManager`].
pub struct AmqpTopology {
    manager: Arc<ChannelManager>,
    descriptor: TopologyDescriptor,
}

impl AmqpTopology {
    pub fn new(manager: Arc<ChannelManager>, descriptor: TopologyDescriptor) -> AmqpTopology {
        AmqpTopology {
            manager,
            descriptor,
        }
    }

    pub fn descriptor(&self) -> &TopologyDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    /// Declares, in order:
    /// 1. the dead letter exchange and queue (probe, then create or repair)
    /// 2. the primary exchange and queue
    /// 3. the bindings of the primary queue
    /// 4. the channel QoS
    ///
    /// The channel slot stays read locked for the whole sequence so the channel
    /// cannot be swapped halfway through.
    async fn declare(&self, routing_keys: &[String]) -> Result<(), AmqpError> {
        let guard = self.manager.read().await;
        let channel = guard.as_ref().ok_or(AmqpError::NotInitialized)?;

        self.declare_dead_letter(channel).await?;
        self.declare_primary(channel).await?;
        self.binding_queues(channel, routing_keys).await?;
        self.declare_qos(channel).await
    }
}

impl AmqpTopology {
    async fn declare_dead_letter(&self, channel: &SharedChannel) -> Result<(), AmqpError> {
        let name = &self.descriptor.dead_letter_name;
        let queue_def = self.descriptor.dead_letter_queue();

        match channel.queue_declare(&queue_def.clone().passive()).await {
            Ok(()) => {
                debug!("dead letter queue: {} already declared", name);
                return Ok(());
            }
            Err(err) if err.is_incompatible_arguments() => {
                warn!(
                    error = err.to_string(),
                    "dead letter queue: {} has incompatible arguments, recreating", name
                );
                channel
                    .queue_delete(name)
                    .await
                    .map_err(|err| self.failure(AmqpError::DeleteQueueError(name.clone(), err)))?;
            }
            Err(err) if err.is_not_found() => {
                debug!("dead letter queue: {} not found, creating", name);
            }
            Err(err) => {
                return Err(self.failure(AmqpError::DeclareDeadLetterError(name.clone(), err)));
            }
        }

        self.declare_exchange(channel, &self.descriptor.dead_letter_exchange())
            .await?;
        self.declare_queue(channel, &queue_def).await?;
        self.bind(channel, &QueueBinding::new(name).exchange(name).routing_key(""))
            .await
    }

    async fn declare_primary(&self, channel: &SharedChannel) -> Result<(), AmqpError> {
        self.declare_exchange(channel, &self.descriptor.primary_exchange())
            .await?;
        self.declare_queue(channel, &self.descriptor.primary_queue())
            .await
    }

    async fn binding_queues(
        &self,
        channel: &SharedChannel,
        routing_keys: &[String],
    ) -> Result<(), AmqpError> {
        for key in routing_keys {
            let binding = QueueBinding::new(&self.descriptor.queue_name)
                .exchange(&self.descriptor.exchange_name)
                .routing_key(key);

            self.bind(channel, &binding).await?;
        }

        debug!("queue was bounded");

        Ok(())
    }

    async fn declare_qos(&self, channel: &SharedChannel) -> Result<(), AmqpError> {
        let prefetch = self.descriptor.prefetch_count;

        channel
            .basic_qos(prefetch)
            .await
            .map_err(|err| self.failure(AmqpError::QoSDeclarationError(prefetch, err)))
    }

    async fn declare_exchange(
        &self,
        channel: &SharedChannel,
        def: &ExchangeDefinition,
    ) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name());

        channel.exchange_declare(def).await.map_err(|err| {
            self.failure(AmqpError::DeclareExchangeError(def.name().to_owned(), err))
        })?;

        debug!("exchange: {} was created", def.name());
        Ok(())
    }

    async fn declare_queue(
        &self,
        channel: &SharedChannel,
        def: &QueueDefinition,
    ) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name());

        channel.queue_declare(def).await.map_err(|err| {
            self.failure(AmqpError::DeclareQueueError(def.name().to_owned(), err))
        })?;

        debug!("queue: {} was created", def.name());
        Ok(())
    }

    async fn bind(&self, channel: &SharedChannel, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name(),
            binding.exchange_name(),
            binding.key()
        );

        channel.queue_bind(binding).await.map_err(|err: BrokerError| {
            self.failure(AmqpError::BindingExchangeToQueueError {
                exchange: binding.exchange_name().to_owned(),
                queue: binding.queue_name().to_owned(),
                routing_key: binding.key().to_owned(),
                source: err,
            })
        })
    }

    fn failure(&self, err: AmqpError) -> AmqpError {
        error!(error = err.to_string(), "failure to declare topology");
        err
    }
}
