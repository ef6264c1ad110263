// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides the exchange types, the options used to declare an
//! exchange, and the [`Exchange`] handle returned by [`Broker::exchange`].
//! Exchanges are the routing mechanism in RabbitMQ that determine how messages
//! are distributed to queues.

use crate::{broker::Broker, errors::AmqpError, message::Message, queue::Queue};
use serde::Deserialize;
use std::fmt;

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        };
        f.write_str(kind)
    }
}

/// Options for declaring an exchange. A non-durable exchange is auto-deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeOptions {
    pub fn new(name: &str) -> ExchangeOptions {
        ExchangeOptions {
            name: name.to_owned(),
            ..ExchangeOptions::default()
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// The nameless default exchange exists on every broker and cannot be
    /// redeclared; it is only usable as a durable direct exchange.
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }

    pub(crate) fn validate(&self) -> Result<(), AmqpError> {
        if self.is_default() && (!self.durable || self.kind != ExchangeKind::Direct) {
            return Err(AmqpError::ConfigurationError(
                "the default exchange must be durable and direct".to_owned(),
            ));
        }

        Ok(())
    }
}

/// A declared exchange.
#[derive(Clone)]
pub struct Exchange {
    broker: Broker,
    name: String,
}

impl Exchange {
    pub(crate) fn new(broker: Broker, name: String) -> Exchange {
        Exchange { broker, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Routes messages published with `routing_key` to `queue`.
    ///
    /// # Parameters
    ///
    /// * `queue` - Queue receiving the routed messages.
    /// * `routing_key` - Binding key. Fanout exchanges ignore it.
    pub async fn bind(&self, queue: &Queue, routing_key: &str) -> Result<(), AmqpError> {
        self.broker
            .bind_queue(queue.name(), &self.name, routing_key)
            .await
    }

    /// Stops routing messages published with `routing_key` to `queue`.
    pub async fn unbind(&self, queue: &Queue, routing_key: &str) -> Result<(), AmqpError> {
        self.broker
            .unbind_queue(queue.name(), &self.name, routing_key)
            .await
    }

    /// Publishes `msg` to this exchange, whatever exchange it names.
    ///
    /// # Returns
    ///
    /// The failure of [`Broker::publish`].
    pub async fn send(&self, mut msg: Message) -> Result<(), AmqpError> {
        msg.exchange = self.name.clone();
        self.broker.publish(msg).await
    }
}
