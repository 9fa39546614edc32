// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! [`RabbitMQConsumer::subscribe`] keeps a subscription alive across reconnections.
//! Every epoch it declares the topology with the handler's routing keys, opens a
//! delivery stream on the queue and fans deliveries out to a fixed pool of workers.
//! When the reconnection source signals, the old workers are drained (their stream
//! ends with the old channel) and a new epoch starts on the new channel.

use crate::{
    channel::DeliveryStream,
    config::RabbitMQConfigs,
    consumer::{consume, Handler},
    errors::AmqpError,
    manager::ChannelManager,
    topology::{AmqpTopology, Topology},
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::{sync::Mutex, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type SharedStream = Arc<Mutex<DeliveryStream>>;

pub struct RabbitMQConsumer {
    cfg: RabbitMQConfigs,
    manager: Arc<ChannelManager>,
    topology: Arc<dyn Topology>,
    active_workers: Arc<AtomicUsize>,
}

impl RabbitMQConsumer {
    /// Creates a consumer declaring the topology described by `cfg`.
    pub fn new(cfg: &RabbitMQConfigs, manager: Arc<ChannelManager>) -> RabbitMQConsumer {
        let topology = Arc::new(AmqpTopology::new(manager.clone(), cfg.topology()));
        Self::with_topology(cfg, manager, topology)
    }

    pub fn with_topology(
        cfg: &RabbitMQConfigs,
        manager: Arc<ChannelManager>,
        topology: Arc<dyn Topology>,
    ) -> RabbitMQConsumer {
        RabbitMQConsumer {
            cfg: cfg.clone(),
            manager,
            topology,
            active_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Workers currently pulling from a delivery stream.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    /// Consumes the queue until the reconnection source reports a terminal error,
    /// which is returned.
    ///
    /// `shutdown` is an extra way out on top of that reconnection-bound lifetime:
    /// cancelling it stops the workers, aborting those that outlive the drain
    /// timeout, and the call returns `Ok`. When the consumer is disabled nothing is
    /// declared or consumed; the call only waits for `shutdown`.
    pub async fn subscribe(
        &self,
        shutdown: CancellationToken,
        handler: Arc<dyn Handler>,
    ) -> Result<(), AmqpError> {
        if self.cfg.disable_consumer {
            info!("consumer disabled, waiting for shutdown");
            shutdown.cancelled().await;
            return Ok(());
        }

        // Subscribed before the first epoch so no reconnection is missed.
        let mut reconnections = self.manager.subscribe();

        loop {
            let workers = match self.start_workers(&handler).await {
                Ok(workers) => Some(workers),
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        "failure to start the consumer, waiting for reconnection"
                    );
                    None
                }
            };

            let reconnected = tokio::select! {
                _ = shutdown.cancelled() => None,
                reconnected = reconnections.wait() => Some(reconnected),
            };

            let Some(reconnected) = reconnected else {
                if let Some(mut workers) = workers {
                    workers.shutdown().await;
                }
                info!("consumer stopped");
                return Ok(());
            };
            reconnected?;

            if let Some(workers) = workers {
                self.drain(workers).await;
            }
            info!("restarting consumer after reconnection");
        }
    }

    async fn start_workers(&self, handler: &Arc<dyn Handler>) -> Result<JoinSet<()>, AmqpError> {
        self.topology.declare(&handler.topics()).await?;

        let channel = self.manager.channel().await?;
        let stream = channel
            .basic_consume(&self.cfg.queue_name, &self.cfg.consumer_name)
            .await
            .map_err(|err| AmqpError::ConsumerDeclarationError(self.cfg.queue_name.clone(), err))?;
        let stream: SharedStream = Arc::new(Mutex::new(stream));

        let concurrency = self.cfg.consumer_concurrency.max(1);
        let mut workers = JoinSet::new();
        for _ in 0..concurrency {
            let registration = WorkerRegistration::register(self.active_workers.clone());
            workers.spawn(worker(stream.clone(), handler.clone(), registration));
        }

        info!(
            queue = self.cfg.queue_name.as_str(),
            workers = concurrency,
            "consuming messages"
        );

        Ok(workers)
    }

    /// Waits for the workers of the previous epoch, aborting those still running
    /// after the drain timeout.
    async fn drain(&self, mut workers: JoinSet<()>) {
        let drained = tokio::time::timeout(self.cfg.worker_drain_timeout(), async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = workers.len(),
                "workers still running after reconnection, aborting"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
    }
}

/// Counts a worker as active for as long as it lives, aborted or not.
struct WorkerRegistration(Arc<AtomicUsize>);

impl WorkerRegistration {
    fn register(active: Arc<AtomicUsize>) -> WorkerRegistration {
        active.fetch_add(1, Ordering::AcqRel);
        WorkerRegistration(active)
    }
}

impl Drop for WorkerRegistration {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn worker(stream: SharedStream, handler: Arc<dyn Handler>, _registration: WorkerRegistration) {
    let tracer = global::tracer("amqp consumer");

    loop {
        // The lock is only held while waiting for the next delivery.
        let next = stream.lock().await.next().await;

        match next {
            Some(Ok(msg)) => consume(&tracer, msg, handler.as_ref()).await,
            Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
            None => break,
        }
    }

    debug!("delivery stream closed, worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockAmqpChannel,
        consumer::HandlerError,
        errors::BrokerError,
        message::IncomingMessage,
    };
    use async_trait::async_trait;
    use opentelemetry::Context;
    use std::{sync::atomic::AtomicU32, time::Duration};

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        fn topics(&self) -> Vec<String> {
            vec!["orders.*".to_owned()]
        }

        async fn handle(&self, _ctx: &Context, _msg: IncomingMessage) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn configs() -> RabbitMQConfigs {
        RabbitMQConfigs {
            exchange_name: "orders".to_owned(),
            queue_name: "orders-service".to_owned(),
            consumer_name: "orders-service-consumer".to_owned(),
            consumer_concurrency: 2,
            ..Default::default()
        }
    }

    fn accept_topology(channel: &mut MockAmqpChannel) {
        channel.expect_queue_declare().returning(|_| Ok(()));
        channel.expect_exchange_declare().returning(|_| Ok(()));
        channel.expect_queue_bind().returning(|_| Ok(()));
        channel.expect_basic_qos().returning(|_| Ok(()));
    }

    #[tokio::test]
    async fn should_stay_idle_when_disabled() {
        let cfg = RabbitMQConfigs {
            disable_consumer: true,
            ..configs()
        };
        // No expectation: any broker call would panic.
        let manager = ChannelManager::new(Arc::new(MockAmqpChannel::new()));
        let consumer = RabbitMQConsumer::new(&cfg, manager);

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            consumer.subscribe(shutdown, Arc::new(NoopHandler)),
        )
        .await
        .expect("disabled consumer must return on shutdown");

        assert_eq!(result, Ok(()));
        assert_eq!(consumer.active_workers(), 0);
    }

    #[tokio::test]
    async fn should_retry_failed_epoch_after_reconnection() {
        let consumes = Arc::new(AtomicU32::new(0));

        let mut channel = MockAmqpChannel::new();
        accept_topology(&mut channel);
        channel.expect_basic_consume().returning({
            let consumes = consumes.clone();
            move |_, _| {
                if consumes.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(BrokerError::other("consumer tag in use"))
                } else {
                    let pending: DeliveryStream = Box::pin(futures_util::stream::pending());
                    Ok(pending)
                }
            }
        });

        let manager = ChannelManager::new(Arc::new(channel));
        let consumer = Arc::new(RabbitMQConsumer::new(&configs(), manager.clone()));

        let running = tokio::spawn({
            let consumer = consumer.clone();
            async move {
                consumer
                    .subscribe(CancellationToken::new(), Arc::new(NoopHandler))
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(consumes.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.active_workers(), 0);

        manager.notify_reconnected();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(consumes.load(Ordering::SeqCst), 2);
        assert_eq!(consumer.active_workers(), 2);

        manager.notify_terminal(BrokerError::connection_unavailable("gave up"));
        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("consumer must stop")
            .expect("consumer must not panic");

        assert!(matches!(result, Err(AmqpError::ReconnectionError(_))));
        // Workers of the last epoch are aborted when the consumer returns.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(consumer.active_workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_abort_workers_that_outlive_the_drain_timeout() {
        let consumes = Arc::new(AtomicU32::new(0));

        let mut channel = MockAmqpChannel::new();
        accept_topology(&mut channel);
        channel.expect_basic_consume().returning({
            let consumes = consumes.clone();
            move |_, _| {
                consumes.fetch_add(1, Ordering::SeqCst);
                // Never ends, as if the old channel were still delivering.
                let pending: DeliveryStream = Box::pin(futures_util::stream::pending());
                Ok(pending)
            }
        });

        let manager = ChannelManager::new(Arc::new(channel));
        let consumer = Arc::new(RabbitMQConsumer::new(&configs(), manager.clone()));
        let shutdown = CancellationToken::new();

        let running = tokio::spawn({
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            async move { consumer.subscribe(shutdown, Arc::new(NoopHandler)).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(consumer.active_workers(), 2);

        manager.notify_reconnected();
        tokio::time::sleep(Duration::from_secs(1)).await;
        // Still draining.
        assert_eq!(consumes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(configs().worker_drain_timeout()).await;
        assert_eq!(consumes.load(Ordering::SeqCst), 2);
        assert_eq!(consumer.active_workers(), 2);

        shutdown.cancel();
        let result = running.await.expect("consumer must not panic");
        assert_eq!(result, Ok(()));
        assert_eq!(consumer.active_workers(), 0);
    }
}
