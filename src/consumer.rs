// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Per-delivery processing: extracts the trace context and the metadata carried in
//! the headers, opens a consumer span and hands the message to the handler. The
//! handler owns acknowledgement; nothing here acks or nacks.

use crate::{message::IncomingMessage, metadata::context_with_metadata, otel};
use async_trait::async_trait;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Status, TraceContextExt},
    Context,
};
use std::borrow::Cow;
use tracing::{debug, error};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Application side of a subscription.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Routing keys the queue must be bound to.
    fn topics(&self) -> Vec<String>;

    /// Processes one delivery. Implementations ack or nack `msg` themselves.
    async fn handle(&self, ctx: &Context, msg: IncomingMessage) -> Result<(), HandlerError>;
}

/// Runs the handler for one delivery inside a consumer span.
pub(crate) async fn consume(tracer: &BoxedTracer, msg: IncomingMessage, handler: &dyn Handler) {
    let (parent, span) = otel::new_span(&msg.headers, tracer, &msg.routing_key);
    let ctx = context_with_metadata(&parent.with_span(span), msg.metadata.clone());

    debug!(
        "received: {} - exchange: {}",
        msg.routing_key, msg.exchange
    );

    match handler.handle(&ctx, msg).await {
        Ok(()) => {
            debug!("message successfully processed");
            ctx.span().set_status(Status::Ok);
        }
        Err(err) => {
            error!(error = err.to_string(), "error handling msg");
            ctx.span().record_error(err.as_ref());
            ctx.span().set_status(Status::Error {
                description: Cow::from("error handling msg"),
            });
        }
    }
}
