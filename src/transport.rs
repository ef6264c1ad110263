// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Capability
//!
//! The broker layer never talks to the wire directly. It consumes the traits in
//! this module, which the lapin-backed [`crate::channel::LapinTransport`]
//! implements for production use. A transport value is injected into the
//! [`crate::broker::Broker`] at construction time.

use crate::{
    errors::AmqpError,
    message::HeaderValue,
    publisher::Publishing,
    topology::{ExchangeDeclaration, QueueDeclaration},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::oneshot;

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries handed out by [`AmqpChannel::consume`].
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Why a connection or sub-channel went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The caller closed it.
    Normal,
    /// The broker or the network closed it.
    Abnormal(AmqpError),
}

/// Opens connections to a broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// One transport connection, multiplexing any number of sub-channels.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Resolves once, when the connection closes.
    fn notify_close(&self) -> oneshot::Receiver<CloseReason>;

    /// Closing the connection closes every sub-channel opened on it.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// A sub-channel of a connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> Result<(), AmqpError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError>;

    /// Returns the queue name, which the broker assigns when the declared name is empty.
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<String, AmqpError>;

    /// Returns the number of messages deleted with the queue.
    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), AmqpError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn publish(&self, publishing: &Publishing) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        tag: &str,
        auto_ack: bool,
        exclusive: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Stops the consumer with the given tag. Deliveries already buffered are
    /// still yielded, then its stream ends.
    async fn cancel(&self, tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    /// Resolves once, when the sub-channel closes.
    fn notify_close(&self) -> oneshot::Receiver<CloseReason>;
}

/// Acknowledgment primitives of a single delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError>;
}

/// A delivery as the transport hands it over.
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, HeaderValue>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Seconds since the epoch.
    pub timestamp: Option<u64>,
    pub acker: Arc<dyn Acknowledge>,
}
