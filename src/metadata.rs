// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Metadata and Correlation Propagation
//!
//! Request scoped string metadata carried inside an OpenTelemetry [`Context`] and
//! flattened into AMQP headers on the wire. The correlation id travels under
//! [`CORRELATION_ID_METADATA_KEY`]; every publish stamps a fresh message id under
//! [`MESSAGE_ID_METADATA_KEY`].

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use opentelemetry::Context;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const CORRELATION_ID_METADATA_KEY: &str = "x-thunder-correlation-id";
pub const MESSAGE_ID_METADATA_KEY: &str = "x-thunder-id";

/// Ordered string key/value pairs propagated with a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get(CORRELATION_ID_METADATA_KEY)
            .filter(|value| !value.is_empty())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.get(MESSAGE_ID_METADATA_KEY)
    }

    /// Flattens the metadata into AMQP headers.
    pub fn to_field_table(&self) -> FieldTable {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        for (key, value) in &self.entries {
            btree.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        FieldTable::from(btree)
    }

    /// Rebuilds metadata from AMQP headers, keeping only string valued entries.
    pub fn from_field_table(table: &FieldTable) -> Self {
        let mut md = Metadata::new();
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
                AMQPValue::ShortString(v) => v.as_str().to_owned(),
                _ => continue,
            };
            md.set(key.as_str(), value);
        }

        md
    }
}

/// Generates a new time ordered identifier.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Returns the metadata attached to the context, or an empty set.
pub fn metadata_from_context(ctx: &Context) -> Metadata {
    ctx.get::<Metadata>().cloned().unwrap_or_default()
}

pub fn context_with_metadata(ctx: &Context, metadata: Metadata) -> Context {
    ctx.with_value(metadata)
}

/// Retrieves the correlation id from the context, generating a new one when the
/// context carries none so correlation flows through the system even if the first
/// caller never set it.
pub fn correlation_id_from_context(ctx: &Context) -> String {
    ctx.get::<Metadata>()
        .and_then(|md| md.correlation_id())
        .map(str::to_owned)
        .unwrap_or_else(new_id)
}

/// Returns a context holding the given correlation id on top of any existing metadata.
/// An empty id is replaced by a generated one.
pub fn context_with_correlation_id(ctx: &Context, correlation_id: &str) -> Context {
    let mut md = metadata_from_context(ctx);
    if correlation_id.is_empty() {
        md.set(CORRELATION_ID_METADATA_KEY, new_id());
    } else {
        md.set(CORRELATION_ID_METADATA_KEY, correlation_id);
    }

    context_with_metadata(ctx, md)
}
