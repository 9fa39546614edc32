// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use async_trait::async_trait;
use lapin::BasicProperties;
use rabbitmq_reliable::{
    channel::{AmqpChannel, DeliveryStream, PendingConfirm},
    exchange::ExchangeDefinition,
    message::{Acknowledge, IncomingMessage},
    metadata::Metadata,
    queue::{QueueBinding, QueueDefinition},
    BrokerError, RabbitMQConfigs,
};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type DeliverySender = mpsc::UnboundedSender<Result<IncomingMessage, BrokerError>>;

#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

impl Published {
    pub fn metadata(&self) -> Metadata {
        self.properties
            .headers()
            .as_ref()
            .map(Metadata::from_field_table)
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct BrokerState {
    pub exchanges: BTreeMap<String, ExchangeDefinition>,
    pub queues: BTreeMap<String, QueueDefinition>,
    /// (exchange, queue, routing key)
    pub bindings: BTreeSet<(String, String, String)>,
    /// Every call that changed the broker, in order.
    pub mutations: Vec<String>,
    pub deletes: usize,
    pub prefetch_count: Option<u16>,
    pub connected: bool,
    pub confirm_mode: bool,
    pub confirm_selects: usize,
    /// Ids of every publish attempt, failed ones included.
    pub attempts: Vec<String>,
    pub published: Vec<Published>,
    pub publish_failures: VecDeque<BrokerError>,
    pub consumes: usize,
    streams: Vec<DeliverySender>,
}

/// A broker kept in memory, with the declare semantics of RabbitMQ: redeclaring an
/// equivalent entity is a no-op, an inequivalent one fails with incompatible
/// arguments, a passive declare of a missing queue fails with not found.
pub struct FakeBroker {
    state: Mutex<BrokerState>,
    acks: Arc<AtomicUsize>,
    nacks: Arc<AtomicUsize>,
}

impl FakeBroker {
    pub fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker {
            state: Mutex::new(BrokerState {
                connected: true,
                ..Default::default()
            }),
            acks: Arc::new(AtomicUsize::new(0)),
            nacks: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    /// Drops the connection: every call fails and every delivery stream ends.
    pub fn disconnect(&self) {
        let mut state = self.state();
        state.connected = false;
        state.confirm_mode = false;
        state.streams.clear();
    }

    /// A new connection and channel; confirm mode must be enabled again.
    pub fn reconnect(&self) {
        let mut state = self.state();
        state.connected = true;
        state.confirm_mode = false;
    }

    pub fn fail_next_publish(&self, err: BrokerError) {
        self.state().publish_failures.push_back(err);
    }

    /// Ends every open delivery stream, as a lost channel would.
    pub fn close_streams(&self) {
        self.state().streams.clear();
    }

    /// Delivers a message to the most recent consumer.
    pub fn deliver(&self, routing_key: &str, body: &[u8], headers: Metadata) -> bool {
        let state = self.state();
        let Some(stream) = state.streams.last() else {
            return false;
        };

        let acker = FakeAcker {
            acks: self.acks.clone(),
            nacks: self.nacks.clone(),
        };
        let msg = IncomingMessage::new(
            "orders",
            routing_key,
            body.to_vec(),
            headers.to_field_table(),
            Box::new(acker),
        );
        stream.send(Ok(msg)).is_ok()
    }

    pub fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn nacks(&self) -> usize {
        self.nacks.load(Ordering::SeqCst)
    }

    /// Replaces a queue behind the declarer's back, e.g. with another retention.
    pub fn install_queue(&self, def: QueueDefinition) {
        self.state().queues.insert(def.name().to_owned(), def);
    }

    fn ensure_connected(state: &BrokerState) -> Result<(), BrokerError> {
        if state.connected {
            Ok(())
        } else {
            Err(BrokerError::connection_unavailable("connection closed"))
        }
    }
}

fn equivalent_queues(declared: &QueueDefinition, existing: &QueueDefinition) -> bool {
    declared.is_durable() == existing.is_durable()
        && declared.message_ttl() == existing.message_ttl()
        && declared.max_length_limit() == existing.max_length_limit()
        && declared.dead_letter_exchange_name() == existing.dead_letter_exchange_name()
}

#[async_trait]
impl AmqpChannel for FakeBroker {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), BrokerError> {
        let mut state = self.state();
        FakeBroker::ensure_connected(&state)?;

        match state.exchanges.get(def.name()) {
            Some(existing)
                if existing.exchange_kind() == def.exchange_kind()
                    && existing.is_durable() == def.is_durable() =>
            {
                Ok(())
            }
            Some(_) => Err(BrokerError::incompatible_arguments(format!(
                "inequivalent arg for exchange '{}'",
                def.name()
            ))),
            None => {
                state.exchanges.insert(def.name().to_owned(), def.clone());
                state.mutations.push(format!("exchange.declare {}", def.name()));
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), BrokerError> {
        let mut state = self.state();
        FakeBroker::ensure_connected(&state)?;

        match state.queues.get(def.name()) {
            Some(existing) if equivalent_queues(def, existing) => Ok(()),
            Some(_) => Err(BrokerError::incompatible_arguments(format!(
                "inequivalent arg for queue '{}'",
                def.name()
            ))),
            None if def.is_passive() => Err(BrokerError::not_found(format!(
                "no queue '{}'",
                def.name()
            ))),
            None => {
                state.queues.insert(def.name().to_owned(), def.clone());
                state.mutations.push(format!("queue.declare {}", def.name()));
                Ok(())
            }
        }
    }

    async fn queue_delete(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        FakeBroker::ensure_connected(&state)?;

        state.queues.remove(name);
        state.bindings.retain(|(_, queue, _)| queue != name);
        state.deletes += 1;
        state.mutations.push(format!("queue.delete {}", name));
        Ok(())
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        let mut state = self.state();
        FakeBroker::ensure_connected(&state)?;

        if !state.exchanges.contains_key(binding.exchange_name()) {
            return Err(BrokerError::not_found(format!(
                "no exchange '{}'",
                binding.exchange_name()
            )));
        }
        if !state.queues.contains_key(binding.queue_name()) {
            return Err(BrokerError::not_found(format!(
                "no queue '{}'",
                binding.queue_name()
            )));
        }

        let inserted = state.bindings.insert((
            binding.exchange_name().to_owned(),
            binding.queue_name().to_owned(),
            binding.key().to_owned(),
        ));
        if inserted {
            state.mutations.push(format!(
                "queue.bind {} {} {}",
                binding.exchange_name(),
                binding.queue_name(),
                binding.key()
            ));
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        let mut state = self.state();
        FakeBroker::ensure_connected(&state)?;

        state.prefetch_count = Some(prefetch_count);
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        let mut state = self.state();
        FakeBroker::ensure_connected(&state)?;

        state.confirm_mode = true;
        state.confirm_selects += 1;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, BrokerError> {
        let mut state = self.state();

        let id = properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned())
            .unwrap_or_default();
        state.attempts.push(id);

        FakeBroker::ensure_connected(&state)?;
        if let Some(err) = state.publish_failures.pop_front() {
            return Err(err);
        }

        let confirmed = state.confirm_mode;
        if confirmed {
            state.published.push(Published {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                body: payload.to_vec(),
                properties,
            });
        }

        Ok(Box::pin(async move { Ok(confirmed) }))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.state();
        FakeBroker::ensure_connected(&state)?;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::not_found(format!("no queue '{}'", queue)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.streams.push(tx);
        state.consumes += 1;

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

struct FakeAcker {
    acks: Arc<AtomicUsize>,
    nacks: Arc<AtomicUsize>,
}

#[async_trait]
impl Acknowledge for FakeAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), BrokerError> {
        self.nacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn configs() -> RabbitMQConfigs {
    RabbitMQConfigs {
        exchange_name: "orders".to_owned(),
        queue_name: "orders-service".to_owned(),
        consumer_name: "orders-service-consumer".to_owned(),
        ..Default::default()
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    assert!(polled.is_ok(), "condition not met in time");
}
