// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishing is asynchronous: [`RabbitMQPublisher::publish`] encodes the payload,
//! stamps correlation and message ids into the headers and enqueues the message.
//! A dispatcher started by [`RabbitMQPublisher::start_publisher`] pulls messages while
//! the pipeline is active and spawns one send attempt per message. A send attempt
//! publishes and waits for the broker confirmation within the confirm timeout.
//! Every failure re-enqueues the same message, ids included:
//! - the publish call fails: the connection is assumed down and the pipeline pauses
//!   until the next reconnection;
//! - the confirmation times out, fails or is negative: the message is retried
//!   without pausing.
//!
//! Once the publisher has stopped, `publish` fails with [`AmqpError::PublisherStopped`]
//! and messages still queued are dropped, so `flush` returns.

use crate::{
    config::RabbitMQConfigs,
    errors::{AmqpError, BrokerError},
    manager::{ChannelManager, ReconnectionListener},
    message::OutboundMessage,
    metadata::{
        context_with_correlation_id, correlation_id_from_context, metadata_from_context, new_id,
        MESSAGE_ID_METADATA_KEY,
    },
    otel,
    pipeline::{Pipeline, PipelineState},
    topology::{AmqpTopology, Topology},
};
use async_trait::async_trait;
use opentelemetry::{
    global,
    trace::{Status, TraceContextExt},
    Context,
};
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::SystemTime,
};
use tokio::{
    sync::{mpsc, Notify, Semaphore},
    time::{timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Send side of the publisher, for payloads that are already encoded.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Enqueues `body` for delivery to `topic`. Returns once the message is queued;
    /// delivery and retries happen in the background.
    async fn publish_bytes(&self, ctx: &Context, topic: &str, body: Vec<u8>)
        -> Result<(), AmqpError>;
}

enum SendFailure {
    Publish(BrokerError),
    Confirm(BrokerError),
    Timeout,
    Nack,
}

pub struct RabbitMQPublisher {
    cfg: RabbitMQConfigs,
    manager: Arc<ChannelManager>,
    topology: Arc<dyn Topology>,
    pipeline: Pipeline,
    queue: mpsc::UnboundedSender<OutboundMessage>,
    unpublished: Mutex<Option<mpsc::UnboundedReceiver<OutboundMessage>>>,
    capacity: Arc<Semaphore>,
    confirm_slots: Arc<Semaphore>,
    unconfirmed: AtomicUsize,
    flushed: Notify,
    epoch: Mutex<u64>,
    last_published_at: RwLock<Option<SystemTime>>,
    shutdown: CancellationToken,
}

impl RabbitMQPublisher {
    /// Creates a publisher declaring the topology described by `cfg`.
    pub fn new(cfg: &RabbitMQConfigs, manager: Arc<ChannelManager>) -> Arc<RabbitMQPublisher> {
        let topology = Arc::new(AmqpTopology::new(manager.clone(), cfg.topology()));
        Self::with_topology(cfg, manager, topology)
    }

    pub fn with_topology(
        cfg: &RabbitMQConfigs,
        manager: Arc<ChannelManager>,
        topology: Arc<dyn Topology>,
    ) -> Arc<RabbitMQPublisher> {
        let (queue, unpublished) = mpsc::unbounded_channel();

        Arc::new(RabbitMQPublisher {
            cfg: cfg.clone(),
            manager,
            topology,
            pipeline: Pipeline::new(),
            queue,
            unpublished: Mutex::new(Some(unpublished)),
            capacity: Arc::new(Semaphore::new(cfg.max_pending_messages.max(1))),
            confirm_slots: Arc::new(Semaphore::new(cfg.max_in_flight_confirms.max(1))),
            unconfirmed: AtomicUsize::new(0),
            flushed: Notify::new(),
            epoch: Mutex::new(0),
            last_published_at: RwLock::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// JSON-encodes `payload` and enqueues it. Encoding failures are returned and
    /// never retried.
    pub async fn publish<T>(&self, ctx: &Context, topic: &str, payload: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        if !self.manager.is_initialized().await {
            return Err(AmqpError::NotInitialized);
        }

        let body = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failed to encode event");
            AmqpError::ParsePayloadError(err.to_string())
        })?;

        self.publish_bytes(ctx, topic, body).await
    }

    /// Runs the publisher until the reconnection source reports a terminal error.
    ///
    /// Each epoch declares the topology, enables publisher confirms on the current
    /// channel and resumes the pipeline, then waits for the next reconnection.
    pub async fn start_publisher(self: &Arc<Self>) -> Result<(), AmqpError> {
        let unpublished = self
            .unpublished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(AmqpError::PublisherAlreadyStarted)?;

        let mut reconnections = self.manager.subscribe();
        tokio::spawn(self.clone().processing_loop(unpublished));

        let result = self.run(&mut reconnections).await;

        self.pipeline.pause();
        self.shutdown.cancel();
        result
    }

    async fn run(&self, reconnections: &mut ReconnectionListener) -> Result<(), AmqpError> {
        loop {
            let channel = self.manager.channel().await?;

            if let Err(err) = self.topology.declare(&[]).await {
                warn!(
                    error = err.to_string(),
                    "failure to declare topology, publishing anyway"
                );
            }

            channel.confirm_select().await.map_err(|err| {
                error!(error = err.to_string(), "failed to enable publisher confirms");
                AmqpError::ConfirmSelectError(err)
            })?;

            self.begin_epoch();
            info!("publisher ready");

            reconnections.wait().await?;
            info!("restarting publisher after reconnection");
        }
    }

    /// Waits until every enqueued message has been confirmed.
    pub async fn flush(&self) {
        loop {
            let flushed = self.flushed.notified();
            if self.pending() == 0 {
                return;
            }
            flushed.await;
        }
    }

    /// Number of messages enqueued and not yet confirmed.
    pub fn pending(&self) -> usize {
        self.unconfirmed.load(Ordering::Acquire)
    }

    /// Time of the last confirmed publish.
    pub fn last_published_at(&self) -> Option<SystemTime> {
        *self
            .last_published_at
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_state(&self) -> PipelineState {
        self.pipeline.state()
    }

    fn begin_epoch(&self) {
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch += 1;
        self.pipeline.resume();
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pauses the pipeline unless an epoch newer than `epoch` already resumed it.
    fn pause_in(&self, epoch: u64) {
        let current = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == epoch {
            self.pipeline.pause();
        }
    }

    fn enqueue(&self, msg: OutboundMessage) {
        if let Err(err) = self.queue.send(msg) {
            error!(topic = err.0.topic(), "publisher stopped, dropping message");
            self.confirmed();
        }
    }

    fn confirmed(&self) {
        if self.unconfirmed.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.flushed.notify_waiters();
        }
    }

    async fn processing_loop(
        self: Arc<Self>,
        mut unpublished: mpsc::UnboundedReceiver<OutboundMessage>,
    ) {
        self.dispatch(&mut unpublished).await;

        // Later enqueues fail and are dropped by `enqueue`.
        unpublished.close();
        let mut dropped = 0usize;
        while let Ok(msg) = unpublished.try_recv() {
            drop(msg);
            self.confirmed();
            dropped += 1;
        }
        if dropped > 0 {
            error!(dropped, "publisher stopped, dropping queued messages");
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        unpublished: &mut mpsc::UnboundedReceiver<OutboundMessage>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                _ = self.pipeline.wait_active() => {}
            }

            let Ok(slot) = self.confirm_slots.clone().acquire_owned().await else {
                return;
            };

            let msg = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                _ = self.pipeline.wait_paused() => continue,
                msg = unpublished.recv() => match msg {
                    Some(msg) => msg,
                    None => return,
                },
            };

            let publisher = self.clone();
            tokio::spawn(async move {
                publisher.publish_message(msg).await;
                drop(slot);
            });
        }
    }

    async fn publish_message(&self, mut msg: OutboundMessage) {
        let tracer = global::tracer("amqp publisher");
        let span = otel::new_producer_span(&msg.ctx, &tracer, &msg.topic);
        let cx = msg.ctx.with_span(span);
        let epoch = self.current_epoch();

        match self.send(&msg, &cx).await {
            Ok(()) => {
                info!(topic = msg.topic(), "message published");
                cx.span().set_status(Status::Ok);
                drop(msg);
                self.update_published_at();
                self.confirmed();
            }
            Err(failure) => {
                let reason = match &failure {
                    SendFailure::Publish(err) => {
                        error!(error = err.to_string(), topic = msg.topic(), "failed to publish event, retrying");
                        // The connection is down; hold everything until it is back.
                        self.pause_in(epoch);
                        "failed to publish message"
                    }
                    SendFailure::Confirm(err) => {
                        error!(error = err.to_string(), topic = msg.topic(), "error on confirming publish, retrying");
                        "failed to wait publish confirmation"
                    }
                    SendFailure::Timeout => {
                        error!(topic = msg.topic(), "publish confirmation timed out, retrying");
                        "publish confirmation timed out"
                    }
                    SendFailure::Nack => {
                        error!(topic = msg.topic(), "failed to confirm publish, retrying");
                        "failed to confirm publish"
                    }
                };
                cx.span().set_status(Status::error(reason));
                drop(cx);

                let delay = self.cfg.retry_backoff(msg.attempts);
                msg.attempts = msg.attempts.saturating_add(1);
                tokio::time::sleep(delay).await;

                self.enqueue(msg);
            }
        }
    }

    async fn send(&self, msg: &OutboundMessage, cx: &Context) -> Result<(), SendFailure> {
        let deadline = Instant::now() + self.cfg.confirm_timeout();

        // The channel cannot be swapped while the publish call is running.
        let slot = self.manager.read().await;
        let channel = slot.as_ref().ok_or_else(|| {
            SendFailure::Publish(BrokerError::connection_unavailable(
                AmqpError::NotInitialized.to_string(),
            ))
        })?;

        let headers = otel::inject_context(cx, &msg.metadata.to_field_table());

        let confirm = match timeout_at(
            deadline,
            channel.basic_publish(
                &self.cfg.exchange_name,
                &msg.topic,
                &msg.body,
                msg.properties(headers),
            ),
        )
        .await
        {
            Err(_) => {
                return Err(SendFailure::Publish(BrokerError::connection_unavailable(
                    "publish timed out",
                )))
            }
            Ok(Err(err)) => return Err(SendFailure::Publish(err)),
            Ok(Ok(confirm)) => confirm,
        };
        drop(slot);

        match timeout_at(deadline, confirm).await {
            Err(_) => Err(SendFailure::Timeout),
            Ok(Err(err)) => Err(SendFailure::Confirm(err)),
            Ok(Ok(false)) => Err(SendFailure::Nack),
            Ok(Ok(true)) => Ok(()),
        }
    }

    fn update_published_at(&self) {
        *self
            .last_published_at
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(SystemTime::now());
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish_bytes(
        &self,
        ctx: &Context,
        topic: &str,
        body: Vec<u8>,
    ) -> Result<(), AmqpError> {
        if !self.manager.is_initialized().await {
            return Err(AmqpError::NotInitialized);
        }

        // Ensure the correlation is propagated or generated
        let ctx = context_with_correlation_id(ctx, &correlation_id_from_context(ctx));
        let mut metadata = metadata_from_context(&ctx);
        // The message id in the context belongs to the message being handled, if any;
        // every publish gets its own.
        metadata.set(MESSAGE_ID_METADATA_KEY, new_id());

        // The semaphore is never closed.
        let permit = self
            .capacity
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AmqpError::NotInitialized)?;

        let mut msg = OutboundMessage::new(ctx, topic, body, metadata);
        msg.permit = Some(permit);

        self.unconfirmed.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = self.queue.send(msg) {
            warn!(topic = err.0.topic(), "publisher stopped, refusing message");
            self.confirmed();
            return Err(AmqpError::PublisherStopped);
        }

        Ok(())
    }
}
