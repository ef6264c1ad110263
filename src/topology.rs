// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides the declaration forms handed to the transport and a
//! [`Topology`] that installs a set of exchanges, queues and bindings in one go.
//!
//! The main components are:
//! - `ExchangeDeclaration` / `QueueDeclaration`: wire-level declaration arguments
//! - `BindingOptions`: a queue-to-exchange binding
//! - `Topology`: batch installer, exchanges first, then queues, then bindings
//! - Header constants: queue argument names understood by RabbitMQ

use crate::{
    broker::Broker,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeOptions},
    message::HeaderValue,
    queue::QueueOptions,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Exchange declaration as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl From<&ExchangeOptions> for ExchangeDeclaration {
    fn from(options: &ExchangeOptions) -> Self {
        ExchangeDeclaration {
            name: options.name.clone(),
            kind: options.kind,
            durable: options.durable,
            auto_delete: !options.durable,
        }
    }
}

/// Queue declaration as handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub arguments: BTreeMap<String, HeaderValue>,
}

impl From<&QueueOptions> for QueueDeclaration {
    fn from(options: &QueueOptions) -> Self {
        let mut arguments = BTreeMap::new();

        if let Some(ttl) = options.message_ttl {
            arguments.insert(
                AMQP_HEADERS_MESSAGE_TTL.to_owned(),
                HeaderValue::LongUInt(ttl),
            );
        }

        if let Some(max) = options.max_length {
            arguments.insert(
                AMQP_HEADERS_MAX_LENGTH.to_owned(),
                HeaderValue::LongUInt(max),
            );
        }

        if let Some(max_bytes) = options.max_length_bytes {
            arguments.insert(
                AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(),
                HeaderValue::LongUInt(max_bytes),
            );
        }

        if let Some(exchange) = &options.dead_letter_exchange {
            arguments.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                HeaderValue::LongString(exchange.clone()),
            );
        }

        if let Some(key) = &options.dead_letter_routing_key {
            arguments.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                HeaderValue::LongString(key.clone()),
            );
        }

        QueueDeclaration {
            name: options.name.clone(),
            durable: options.durable,
            auto_delete: !options.durable,
            exclusive: options.exclusive,
            arguments,
        }
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BindingOptions {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl BindingOptions {
    pub fn new(queue: &str) -> BindingOptions {
        BindingOptions {
            queue: queue.to_owned(),
            ..BindingOptions::default()
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

/// A set of declarations installed together.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeOptions>,
    pub(crate) queues: Vec<QueueOptions>,
    pub(crate) bindings: Vec<BindingOptions>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    pub fn exchange(mut self, options: ExchangeOptions) -> Self {
        self.exchanges.push(options);
        self
    }

    pub fn queue(mut self, options: QueueOptions) -> Self {
        self.queues.push(options);
        self
    }

    pub fn binding(mut self, options: BindingOptions) -> Self {
        self.bindings.push(options);
        self
    }

    /// Installs the topology through the broker's management channel.
    ///
    /// Exchanges are declared first, then queues, then bindings, each in the
    /// order they were added. The first failure stops the installation.
    pub async fn install(&self, broker: &Broker) -> Result<(), AmqpError> {
        for exchange in &self.exchanges {
            broker.declare_exchange(exchange).await?;
        }

        for queue in &self.queues {
            broker.declare_queue(queue).await?;
        }

        for binding in &self.bindings {
            broker.declare_binding(binding).await?;
        }

        debug!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.bindings.len(),
            "topology installed"
        );

        Ok(())
    }
}
