// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{configs, FakeBroker};
use rabbitmq_reliable::{
    exchange::ExchangeKind,
    queue::QueueDefinition,
    topology::{AmqpTopology, Topology, DEAD_LETTER_MESSAGE_TTL_MS},
    AmqpError, ChannelManager,
};

fn keys(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

fn topology(broker: &std::sync::Arc<FakeBroker>) -> AmqpTopology {
    AmqpTopology::new(ChannelManager::new(broker.clone()), configs().topology())
}

#[tokio::test]
async fn should_declare_the_whole_topology() {
    let broker = FakeBroker::new();

    topology(&broker)
        .declare(&keys(&["orders.created", "orders.updated"]))
        .await
        .expect("declare must succeed");

    let state = broker.state();
    assert_eq!(
        state.exchanges.get("orders").map(|e| e.exchange_kind()),
        Some(ExchangeKind::Topic)
    );
    assert_eq!(
        state
            .exchanges
            .get("orders-service_dlx")
            .map(|e| e.exchange_kind()),
        Some(ExchangeKind::Fanout)
    );

    let primary = state.queues.get("orders-service").expect("primary queue");
    assert_eq!(primary.dead_letter_exchange_name(), Some("orders-service_dlx"));

    let dead_letter = state
        .queues
        .get("orders-service_dlx")
        .expect("dead letter queue");
    assert_eq!(dead_letter.message_ttl(), Some(DEAD_LETTER_MESSAGE_TTL_MS));
    assert_eq!(dead_letter.max_length_limit(), Some(10_000));

    assert!(state.bindings.contains(&(
        "orders-service_dlx".to_owned(),
        "orders-service_dlx".to_owned(),
        String::new()
    )));
    assert!(state.bindings.contains(&(
        "orders".to_owned(),
        "orders-service".to_owned(),
        "orders.updated".to_owned()
    )));
    assert_eq!(state.prefetch_count, Some(configs().prefetch_count));
}

#[tokio::test]
async fn should_not_change_anything_when_declared_twice() {
    let broker = FakeBroker::new();
    let topology = topology(&broker);
    let routing_keys = keys(&["orders.created"]);

    topology.declare(&routing_keys).await.unwrap();
    let mutations = broker.state().mutations.len();

    topology.declare(&routing_keys).await.unwrap();

    let state = broker.state();
    assert_eq!(state.mutations.len(), mutations);
    assert_eq!(state.deletes, 0);
}

#[tokio::test]
async fn should_repair_dead_letter_queue_with_other_retention() {
    let broker = FakeBroker::new();
    broker.install_queue(
        QueueDefinition::new("orders-service_dlx")
            .durable()
            .quorum()
            .ttl(60_000)
            .max_length(10_000),
    );

    let topology = topology(&broker);
    topology.declare(&[]).await.expect("repair must succeed");

    {
        let state = broker.state();
        assert_eq!(state.deletes, 1);
        assert_eq!(
            state
                .queues
                .get("orders-service_dlx")
                .and_then(|q| q.message_ttl()),
            Some(DEAD_LETTER_MESSAGE_TTL_MS)
        );
    }

    // The probe now succeeds, nothing is deleted again.
    topology.declare(&[]).await.unwrap();
    assert_eq!(broker.state().deletes, 1);
}

#[tokio::test]
async fn should_restore_a_queue_deleted_by_an_operator() {
    let broker = FakeBroker::new();
    let topology = topology(&broker);
    let routing_keys = keys(&["b.*"]);
    topology.declare(&routing_keys).await.unwrap();

    {
        let mut state = broker.state();
        state.queues.remove("orders-service");
        state.bindings.retain(|(_, queue, _)| queue != "orders-service");
    }

    topology.declare(&routing_keys).await.unwrap();

    let state = broker.state();
    assert!(state.queues.contains_key("orders-service"));
    assert!(state.bindings.contains(&(
        "orders".to_owned(),
        "orders-service".to_owned(),
        "b.*".to_owned()
    )));
}

#[tokio::test]
async fn should_fail_without_channel() {
    let topology = AmqpTopology::new(ChannelManager::disconnected(), configs().topology());

    assert_eq!(
        topology.declare(&keys(&["orders.created"])).await,
        Err(AmqpError::NotInitialized)
    );
}
