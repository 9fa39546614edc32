// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Manager
//!
//! The channel manager owns the channel shared by the topology declarer, the publisher
//! and the consumer. It provides:
//! - the current channel, behind a reader/writer lock: declarations hold a read guard
//!   for their whole duration, swapping the channel takes the write guard;
//! - a reconnection source: every listener receives `Ok(())` after a successful
//!   reconnection and an error once reconnection is given up.
//!
//! [`ChannelManager::connect`] wires a lapin connection to a supervisor task that
//! reconnects after connection errors. A channel closed by the broker while the
//! connection stays up is reopened in place and reported as a reconnection.

use crate::{
    channel::{AmqpChannel, LapinChannel},
    config::RabbitMQConfigs,
    errors::{AmqpError, BrokerError},
};
use std::sync::{Arc, Weak};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc, RwLock, RwLockReadGuard,
};
use tracing::{error, info, warn};

const RECONNECTION_CHANNEL_CAPACITY: usize = 16;

pub type SharedChannel = Arc<dyn AmqpChannel>;

pub struct ChannelManager {
    channel: RwLock<Option<SharedChannel>>,
    reconnections: broadcast::Sender<Result<(), BrokerError>>,
}

impl ChannelManager {
    pub fn new(channel: SharedChannel) -> Arc<ChannelManager> {
        Arc::new(Self::with_slot(Some(channel)))
    }

    /// A manager without channel. Publishing fails with [`AmqpError::NotInitialized`]
    /// until a channel is installed with [`ChannelManager::replace_channel`].
    pub fn disconnected() -> Arc<ChannelManager> {
        Arc::new(Self::with_slot(None))
    }

    fn with_slot(channel: Option<SharedChannel>) -> ChannelManager {
        let (reconnections, _) = broadcast::channel(RECONNECTION_CHANNEL_CAPACITY);
        ChannelManager {
            channel: RwLock::new(channel),
            reconnections,
        }
    }

    /// Connects to the broker with lapin and starts the reconnection supervisor.
    pub async fn connect(cfg: &RabbitMQConfigs) -> Result<Arc<ChannelManager>, AmqpError> {
        let channel = LapinChannel::connect(cfg).await?;
        let manager = ChannelManager::new(channel.clone());
        watch_channel(&channel, Arc::downgrade(&manager));

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        watch_connection(&channel, 0, errors_tx.clone());

        tokio::spawn(supervise(
            Arc::downgrade(&manager),
            cfg.clone(),
            errors_rx,
            errors_tx,
        ));

        Ok(manager)
    }

    /// Holds the channel slot for reading. Any channel swap waits until the guard is
    /// dropped.
    pub async fn read(&self) -> RwLockReadGuard<'_, Option<SharedChannel>> {
        self.channel.read().await
    }

    pub async fn channel(&self) -> Result<SharedChannel, AmqpError> {
        self.channel
            .read()
            .await
            .clone()
            .ok_or(AmqpError::NotInitialized)
    }

    pub async fn is_initialized(&self) -> bool {
        self.channel.read().await.is_some()
    }

    /// Installs a new channel under the exclusive lock.
    pub async fn replace_channel(&self, channel: SharedChannel) {
        *self.channel.write().await = Some(channel);
    }

    /// Tells every listener the channel is usable again.
    pub fn notify_reconnected(&self) {
        let _ = self.reconnections.send(Ok(()));
    }

    /// Tells every listener that reconnection was given up.
    pub fn notify_terminal(&self, err: BrokerError) {
        let _ = self.reconnections.send(Err(err));
    }

    /// Registers a listener. Only notifications sent after this call are observed.
    pub fn subscribe(&self) -> ReconnectionListener {
        ReconnectionListener {
            rx: self.reconnections.subscribe(),
        }
    }
}

pub struct ReconnectionListener {
    rx: broadcast::Receiver<Result<(), BrokerError>>,
}

impl ReconnectionListener {
    /// Blocks until the next reconnection. `Ok` means the channel was reconnected,
    /// an error is terminal.
    pub async fn wait(&mut self) -> Result<(), AmqpError> {
        loop {
            match self.rx.recv().await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => return Err(AmqpError::ReconnectionError(err)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "reconnection listener lagged behind");
                }
                Err(RecvError::Closed) => {
                    return Err(AmqpError::ReconnectionError(
                        BrokerError::connection_unavailable("reconnection source closed"),
                    ))
                }
            }
        }
    }
}

type ConnectionError = (u64, BrokerError);

fn watch_connection(
    channel: &LapinChannel,
    generation: u64,
    errors: mpsc::UnboundedSender<ConnectionError>,
) {
    channel.connection().on_error(move |err| {
        let _ = errors.send((generation, BrokerError::from(err)));
    });
}

fn watch_channel(channel: &LapinChannel, manager: Weak<ChannelManager>) {
    channel.on_reopen(move || {
        if let Some(manager) = manager.upgrade() {
            manager.notify_reconnected();
        }
    });
}

async fn supervise(
    weak_manager: Weak<ChannelManager>,
    cfg: RabbitMQConfigs,
    mut errors: mpsc::UnboundedReceiver<ConnectionError>,
    errors_tx: mpsc::UnboundedSender<ConnectionError>,
) {
    let mut generation = 0u64;

    while let Some((failed_generation, err)) = errors.recv().await {
        // Errors raised by connections that were already replaced.
        if failed_generation != generation {
            continue;
        }

        let Some(manager) = weak_manager.upgrade() else {
            return;
        };

        warn!(error = err.to_string(), "amqp connection lost, reconnecting");

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            tokio::time::sleep(cfg.reconnect_delay()).await;

            match LapinChannel::connect(&cfg).await {
                Ok(channel) => {
                    generation += 1;
                    watch_connection(&channel, generation, errors_tx.clone());
                    watch_channel(&channel, weak_manager.clone());
                    manager.replace_channel(channel).await;
                    info!(attempts, "amqp connection re-established");
                    manager.notify_reconnected();
                    break;
                }
                Err(err) => {
                    if cfg.reconnect_max_attempts != 0 && attempts >= cfg.reconnect_max_attempts {
                        error!(attempts, error = err.to_string(), "giving up reconnecting");
                        manager.notify_terminal(BrokerError::connection_unavailable(
                            err.to_string(),
                        ));
                        return;
                    }
                    warn!(attempts, error = err.to_string(), "failure to reconnect");
                }
            }
        }
    }
}
