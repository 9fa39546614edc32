// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module defines [`AmqpChannel`], the channel operations the reliability layer
//! relies on, and [`LapinChannel`], its implementation on top of a lapin connection.
//! Every lapin error is classified into a [`BrokerError`] before leaving this module.

use crate::{
    config::RabbitMQConfigs,
    errors::{AmqpError, BrokerError},
    exchange::ExchangeDefinition,
    message::IncomingMessage,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Stream of deliveries of one consumer. It ends when the channel is lost.
pub type DeliveryStream = BoxStream<'static, Result<IncomingMessage, BrokerError>>;

/// Resolves to `true` when the broker acknowledged the publish, `false` when it
/// refused it.
pub type PendingConfirm = BoxFuture<'static, Result<bool, BrokerError>>;

/// The channel operations used to declare topology, publish with confirmation
/// and consume.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), BrokerError>;

    /// Declares the queue, or only probes it when the definition is passive.
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), BrokerError>;

    async fn queue_delete(&self, name: &str) -> Result<(), BrokerError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), BrokerError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Enables publisher confirms on the channel.
    async fn confirm_select(&self) -> Result<(), BrokerError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, BrokerError>;

    /// Opens a manually acknowledged delivery stream on the queue.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError>;
}

/// Creates a new AMQP connection and a channel on it.
///
/// # Parameters
/// * `cfg` - Configuration containing RabbitMQ connection details like host, port, credentials, etc.
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
) -> Result<(Arc<Connection>, Channel), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.into()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError(err.into()))
        }
    }
}

/// What to do with the channel after a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    /// Nothing, the connection supervisor takes over.
    Leave,
    /// Open a fresh channel; the caller applies channel settings again.
    Reopen,
    /// Open a fresh channel and start a new epoch for every listener.
    ReopenAndNotify,
}

/// A soft error met while declaring is repaired by the declarer itself. Any other
/// channel closure on a live connection needs a new epoch, since confirm mode, QoS
/// and consumers went away with the old channel.
fn recovery(
    err: &BrokerError,
    channel_closed: bool,
    connection_up: bool,
    declaring: bool,
) -> Recovery {
    if !connection_up || !(err.is_soft() || channel_closed) {
        Recovery::Leave
    } else if declaring && err.is_soft() {
        Recovery::Reopen
    } else {
        Recovery::ReopenAndNotify
    }
}

type ReopenHook = Box<dyn Fn() + Send + Sync>;

/// [`AmqpChannel`] backed by a lapin channel.
///
/// The broker closes a channel after a soft error (a passive declare of a missing
/// queue, an inequivalent redeclare, a publish to a missing exchange). When that
/// happens while the connection is up, a fresh channel is opened on the same
/// connection. During declarations the caller carries on with the repair; anywhere
/// else the hook registered with [`LapinChannel::on_reopen`] runs so that confirm
/// mode, QoS and consumers are set up again.
pub struct LapinChannel {
    connection: Arc<Connection>,
    channel: RwLock<Channel>,
    reopening: Mutex<()>,
    on_reopen: RwLock<Option<ReopenHook>>,
    this: Weak<LapinChannel>,
}

impl LapinChannel {
    pub fn new(connection: Arc<Connection>, channel: Channel) -> Arc<LapinChannel> {
        Arc::new_cyclic(|this| LapinChannel {
            connection,
            channel: RwLock::new(channel),
            reopening: Mutex::new(()),
            on_reopen: RwLock::new(None),
            this: this.clone(),
        })
    }

    /// Connects to the broker and opens a channel.
    pub async fn connect(cfg: &RabbitMQConfigs) -> Result<Arc<LapinChannel>, AmqpError> {
        let (connection, channel) = new_amqp_channel(cfg).await?;
        Ok(LapinChannel::new(connection, channel))
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.connection.clone()
    }

    /// Runs `hook` each time a channel closed outside a declaration is replaced.
    pub fn on_reopen<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_reopen.write().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    fn current(&self) -> Channel {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn classify<T>(
        &self,
        result: Result<T, lapin::Error>,
        declaring: bool,
    ) -> Result<T, BrokerError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => Err(self.recover(err, declaring).await),
        }
    }

    async fn recover(&self, err: lapin::Error, declaring: bool) -> BrokerError {
        let channel_closed = matches!(err, lapin::Error::InvalidChannelState(_));
        let err = BrokerError::from(err);
        let connection_up = self.connection.status().connected();

        match recovery(&err, channel_closed, connection_up, declaring) {
            Recovery::Leave => {}
            Recovery::Reopen => {
                debug!(error = err.to_string(), "soft error, reopening channel");
                self.reopen().await;
            }
            Recovery::ReopenAndNotify => {
                let _reopening = self.reopening.lock().await;
                // Concurrent calls fail on the same closed channel; one reopen is enough.
                if self.current().status().connected() {
                    return err;
                }

                warn!(error = err.to_string(), "amqp channel closed, reopening");
                if self.reopen().await {
                    info!("amqp channel reopened");
                    if let Some(hook) = self
                        .on_reopen
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .as_ref()
                    {
                        hook();
                    }
                }
            }
        }

        err
    }

    async fn reopen(&self) -> bool {
        match self.connection.create_channel().await {
            Ok(channel) => {
                *self.channel.write().unwrap_or_else(PoisonError::into_inner) = channel;
                true
            }
            Err(reopen) => {
                error!(error = reopen.to_string(), "failure to reopen the channel");
                false
            }
        }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), BrokerError> {
        let result = self
            .current()
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await;

        self.classify(result, true).await
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), BrokerError> {
        let result = self
            .current()
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: def.is_passive(),
                    durable: def.is_durable(),
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                def.arguments(),
            )
            .await;

        self.classify(result, true).await.map(|_| ())
    }

    async fn queue_delete(&self, name: &str) -> Result<(), BrokerError> {
        let result = self
            .current()
            .queue_delete(name, QueueDeleteOptions::default())
            .await;

        self.classify(result, true).await.map(|_| ())
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        let result = self
            .current()
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await;

        self.classify(result, true).await
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        let result = self
            .current()
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await;

        self.classify(result, true).await
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        let result = self
            .current()
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await;

        self.classify(result, true).await
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, BrokerError> {
        let result = self
            .current()
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await;

        let confirm = self.classify(result, false).await?;
        let this = self.this.clone();

        Ok(Box::pin(async move {
            match confirm.await {
                Ok(Confirmation::Ack(returned)) => {
                    if returned.is_some() {
                        warn!("message was returned by the broker as unroutable");
                    }
                    Ok(true)
                }
                Ok(Confirmation::Nack(_)) => Ok(false),
                Ok(Confirmation::NotRequested) => {
                    warn!("publisher confirms are not enabled on the channel");
                    Ok(false)
                }
                Err(err) => Err(match this.upgrade() {
                    Some(channel) => channel.recover(err, false).await,
                    None => BrokerError::from(err),
                }),
            }
        }))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let result = self
            .current()
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await;

        let consumer = self.classify(result, false).await?;

        Ok(consumer
            .map(|result| result.map(IncomingMessage::from).map_err(BrokerError::from))
            .boxed())
    }
}
