// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! `OutboundMessage` is the envelope owned by the publisher between enqueue and broker
//! confirmation. `IncomingMessage` is what a consumer handler receives; it carries the
//! acknowledgement handle so the handler decides between ack and nack.

use crate::{
    errors::{AmqpError, BrokerError},
    metadata::Metadata,
};
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::fmt;
use tokio::sync::OwnedSemaphorePermit;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode for messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A message waiting to be confirmed by the broker.
pub struct OutboundMessage {
    pub(crate) ctx: Context,
    pub(crate) topic: String,
    pub(crate) body: Vec<u8>,
    pub(crate) metadata: Metadata,
    pub(crate) attempts: u32,
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

impl OutboundMessage {
    pub(crate) fn new(ctx: Context, topic: &str, body: Vec<u8>, metadata: Metadata) -> Self {
        OutboundMessage {
            ctx,
            topic: topic.to_owned(),
            body,
            metadata,
            attempts: 0,
            permit: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Builds the wire properties: JSON content type, persistent delivery and the
    /// flattened metadata as headers.
    pub fn properties(&self, headers: FieldTable) -> BasicProperties {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_headers(headers);

        if let Some(id) = self.metadata.message_id() {
            props = props.with_message_id(ShortString::from(id));
        }

        if let Some(id) = self.metadata.correlation_id() {
            props = props.with_correlation_id(ShortString::from(id));
        }

        props
    }
}

impl fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("topic", &self.topic)
            .field("metadata", &self.metadata)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Acknowledgement handle of a delivery.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

#[async_trait]
impl Acknowledge for Acker {
    async fn ack(&self) -> Result<(), BrokerError> {
        Acker::ack(self, BasicAckOptions { multiple: false })
            .await
            .map_err(BrokerError::from)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(BrokerError::from)
    }
}

/// A delivery handed to a consumer handler.
pub struct IncomingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub headers: FieldTable,
    pub metadata: Metadata,
    acker: Box<dyn Acknowledge>,
}

impl IncomingMessage {
    pub fn new(
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: FieldTable,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        let metadata = Metadata::from_field_table(&headers);

        IncomingMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            body,
            headers,
            metadata,
            acker,
        }
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.correlation_id()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.metadata.message_id()
    }

    /// Decodes the JSON body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.body).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await.map_err(AmqpError::AckMessageError)
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(requeue)
            .await
            .map_err(AmqpError::NackMessageError)
    }
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl From<Delivery> for IncomingMessage {
    fn from(delivery: Delivery) -> Self {
        let headers = delivery.properties.headers().clone().unwrap_or_default();

        IncomingMessage::new(
            delivery.exchange.as_str(),
            delivery.routing_key.as_str(),
            delivery.data,
            headers,
            Box::new(delivery.acker),
        )
        .redelivered(delivery.redelivered)
    }
}
