// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! [`QueueOptions`] describes a queue to declare, including the RabbitMQ
//! arguments for message TTL, length limits and dead-lettering. A declared
//! queue is handed back as a [`Queue`], a pull-style reader: call
//! [`Queue::next`] in a loop and read [`Queue::message`] after each `true`.
//!
//! When its channel is gone `next` returns false with the failure in
//! [`Queue::error`], and the following call subscribes again on whatever
//! connection is Ready by then. Messages in flight on the lost channel are
//! not redelivered to this reader; use a [`crate::consumer::Consumer`] to be
//! notified of connection changes.

use crate::{
    broker::Broker,
    errors::AmqpError,
    message::Message,
    transport::{AmqpChannel, DeliveryStream},
};
use futures_util::StreamExt;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// An empty name asks the broker to generate one. Non-durable queues are
/// deleted once their last consumer goes away.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub name: String,
    pub durable: bool,
    /// Owned by the declaring connection.
    pub exclusive: bool,
    /// Subscribe as the only consumer when pulling from the queue.
    pub consume_exclusive: bool,
    /// Consumer tag used when pulling; generated when empty.
    pub consumer_name: String,
    /// In milliseconds.
    pub message_ttl: Option<u32>,
    pub max_length: Option<u32>,
    pub max_length_bytes: Option<u32>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

impl QueueOptions {
    pub fn new(name: &str) -> QueueOptions {
        QueueOptions {
            name: name.to_owned(),
            ..QueueOptions::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn consume_exclusive(mut self) -> Self {
        self.consume_exclusive = true;
        self
    }

    pub fn consumer_name(mut self, tag: &str) -> Self {
        self.consumer_name = tag.to_owned();
        self
    }

    /// Messages older than `ttl` milliseconds are dropped, or dead-lettered
    /// when a dead letter exchange is set.
    pub fn message_ttl(mut self, ttl: u32) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    pub fn max_length(mut self, max: u32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn max_length_bytes(mut self, max_bytes: u32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Rejected, expired and overflowing messages are republished to
    /// `exchange` with `routing_key`.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }
}

/// Pull handle over a declared queue.
pub struct Queue {
    broker: Broker,
    name: String,
    consumer_name: String,
    consume_exclusive: bool,
    channel: Option<Arc<dyn AmqpChannel>>,
    deliveries: Option<DeliveryStream>,
    message: Option<Message>,
    error: Option<AmqpError>,
}

impl Queue {
    pub(crate) fn new(broker: Broker, name: String, options: &QueueOptions) -> Queue {
        let consumer_name = if options.consumer_name.is_empty() {
            format!("{}-{}", name, Uuid::new_v4())
        } else {
            options.consumer_name.clone()
        };

        Queue {
            broker,
            name,
            consumer_name,
            consume_exclusive: options.consume_exclusive,
            channel: None,
            deliveries: None,
            message: None,
            error: None,
        }
    }

    /// Queue name, as assigned by the broker for server-named queues.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next message.
    ///
    /// # Returns
    ///
    /// `true` with the message available from [`Queue::message`], or `false`
    /// when the subscription failed or ended; [`Queue::error`] then tells
    /// why. A later call subscribes again on the current connection.
    pub async fn next(&mut self) -> bool {
        self.error = None;

        if self.deliveries.is_none() && !self.subscribe().await {
            return false;
        }

        self.receive().await
    }

    /// Like [`Queue::next`], giving up after `timeout` of waiting for a
    /// delivery. Subscribing is not counted against `timeout`, and a timeout
    /// leaves the subscription in place for the next call.
    pub async fn next_with_timeout(&mut self, timeout: Duration) -> bool {
        self.error = None;

        if self.deliveries.is_none() && !self.subscribe().await {
            return false;
        }

        tokio::time::timeout(timeout, self.receive())
            .await
            .unwrap_or(false)
    }

    /// Last message received by `next`.
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// Failure that ended the subscription, if any.
    pub fn error(&self) -> Option<&AmqpError> {
        self.error.as_ref()
    }

    /// Cancels the subscription and closes its channel. A no-op when `next`
    /// was never called.
    pub async fn close(&mut self) -> Result<(), AmqpError> {
        self.deliveries = None;

        let Some(channel) = self.channel.take() else {
            return Ok(());
        };

        if !channel.is_open() {
            return Ok(());
        }

        let mut errors = vec![];
        if let Err(err) = channel.cancel(&self.consumer_name).await {
            errors.push(err);
        }
        if let Err(err) = channel.close().await {
            errors.push(err);
        }

        debug!(queue = self.name.as_str(), "queue reader closed");

        AmqpError::collect(errors)
    }

    /// Deletes the queue from the broker, returning the number of messages
    /// it held.
    pub async fn delete(&mut self) -> Result<u32, AmqpError> {
        self.close().await?;
        self.broker.delete_queue(&self.name).await
    }

    async fn receive(&mut self) -> bool {
        let Some(deliveries) = self.deliveries.as_mut() else {
            return false;
        };

        let next = deliveries.next().await;

        match next {
            Some(Ok(delivery)) => {
                let Some(channel) = self.channel.clone() else {
                    return false;
                };
                self.message = Some(Message::from_delivery(delivery, channel));
                true
            }
            Some(Err(err)) => {
                error!(error = err.to_string(), queue = self.name.as_str(), "errors consume msg");
                self.release().await;
                self.error = Some(err);
                false
            }
            None => {
                self.release().await;
                self.error = Some(AmqpError::ChannelClosed);
                false
            }
        }
    }

    /// Drops a failed subscription so the next call starts a new one.
    async fn release(&mut self) {
        self.deliveries = None;

        let Some(channel) = self.channel.take() else {
            return;
        };

        if channel.is_open() {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), queue = self.name.as_str(), "error to close the queue channel");
            }
        }
    }

    async fn subscribe(&mut self) -> bool {
        let Some(connection) = self.broker.ready_connection() else {
            self.error = Some(AmqpError::NotConnected);
            return false;
        };

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "error to create the queue channel");
                self.error = Some(err);
                return false;
            }
        };

        match channel
            .consume(&self.name, &self.consumer_name, false, self.consume_exclusive)
            .await
        {
            Ok(deliveries) => {
                self.channel = Some(channel);
                self.deliveries = Some(deliveries);
                true
            }
            Err(err) => {
                error!(error = err.to_string(), queue = self.name.as_str(), "error to consume the queue");
                if let Err(err) = channel.close().await {
                    warn!(error = err.to_string(), queue = self.name.as_str(), "error to close the queue channel");
                }
                self.error = Some(err);
                false
            }
        }
    }
}
