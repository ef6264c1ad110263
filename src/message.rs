// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! A [`Message`] is both what callers publish and what consumers receive. A
//! received message additionally carries the acknowledgment capability of the
//! sub-channel that delivered it.

use crate::{
    errors::AmqpError,
    transport::{Acknowledge, AmqpChannel, Delivery},
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tracing::error;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Header value types supported on messages.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    ShortInt(i16),
    LongInt(i32),
    LongLongInt(i64),
    LongUInt(u32),
    Double(f64),
    ShortString(String),
    LongString(String),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::LongString(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::LongString(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::LongLongInt(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// An AMQP message.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, HeaderValue>,
    /// Application-defined; filled with the publish time when unset and the
    /// broker was configured with `auto_timestamp`.
    pub timestamp: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<Duration>,
    /// Keep the message in memory only on the broker side.
    pub transient: bool,
    pub redelivered: bool,
    acknowledgement: Option<Acknowledgement>,
}

impl Message {
    pub fn new(exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> Message {
        Message {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.into(),
            ..Message::default()
        }
    }

    /// Creates a message whose body is `payload` encoded as JSON.
    pub fn json<T: Serialize>(
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<Message, AmqpError> {
        let body = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to encode payload");
            AmqpError::ParsePayloadError(err.to_string())
        })?;

        Ok(Message::new(exchange, routing_key, body).content_type(JSON_CONTENT_TYPE))
    }

    /// Decodes the JSON body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.body).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError(err.to_string())
        })
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub(crate) fn from_delivery(delivery: Delivery, channel: Arc<dyn AmqpChannel>) -> Message {
        Message {
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            body: delivery.body,
            headers: delivery.headers,
            timestamp: delivery
                .timestamp
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0)),
            content_type: delivery.content_type,
            correlation_id: delivery.correlation_id,
            reply_to: delivery.reply_to,
            expiration: None,
            transient: false,
            redelivered: delivery.redelivered,
            acknowledgement: Some(Acknowledgement {
                delivery_tag: delivery.delivery_tag,
                channel,
                acker: delivery.acker,
            }),
        }
    }

    /// Tag assigned by the delivering sub-channel, if the message was received.
    pub fn delivery_tag(&self) -> Option<u64> {
        self.acknowledgement.as_ref().map(|a| a.delivery_tag)
    }

    /// Acknowledges the message, implying that it was processed correctly
    /// and completely.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acknowledgement()?.acker.ack(false).await
    }

    /// Acknowledges this message and every earlier unacknowledged one
    /// delivered on the same sub-channel.
    pub async fn ack_multiple(&self) -> Result<(), AmqpError> {
        self.acknowledgement()?.acker.ack(true).await
    }

    /// Tells the broker this client cannot handle the message, optionally
    /// requeueing it.
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acknowledgement()?.acker.reject(requeue).await
    }

    /// Tells the broker this client will not handle the message, optionally
    /// requeueing it for other consumers.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acknowledgement()?.acker.nack(false, requeue).await
    }

    pub async fn nack_multiple(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acknowledgement()?.acker.nack(true, requeue).await
    }

    fn acknowledgement(&self) -> Result<&Acknowledgement, AmqpError> {
        let ack = self
            .acknowledgement
            .as_ref()
            .ok_or(AmqpError::NotDelivered)?;

        if !ack.channel.is_open() {
            return Err(AmqpError::ChannelClosed);
        }

        Ok(ack)
    }
}

/// The sub-channel a delivery came from together with its acknowledgment
/// primitives. Valid only while that sub-channel is open.
#[derive(Clone)]
struct Acknowledgement {
    delivery_tag: u64,
    channel: Arc<dyn AmqpChannel>,
    acker: Arc<dyn Acknowledge>,
}

impl fmt::Debug for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledgement")
            .field("delivery_tag", &self.delivery_tag)
            .field("channel_open", &self.channel.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockAcknowledge, MockAmqpChannel};
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: u32,
        item: String,
    }

    fn delivered(open: bool, acker: MockAcknowledge) -> Message {
        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().return_const(open);

        Message::from_delivery(
            Delivery {
                delivery_tag: 7,
                redelivered: false,
                exchange: "orders".to_owned(),
                routing_key: "new".to_owned(),
                body: b"x".to_vec(),
                headers: HashMap::default(),
                content_type: None,
                correlation_id: None,
                reply_to: None,
                timestamp: Some(1_700_000_000),
                acker: Arc::new(acker),
            },
            Arc::new(channel),
        )
    }

    #[test]
    fn json_sets_the_content_type() {
        let order = Order {
            id: 1,
            item: "book".to_owned(),
        };
        let msg = Message::json("orders", "new", &order).unwrap();

        assert_eq!(msg.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(msg.decode::<Order>().unwrap(), order);
    }

    #[test]
    fn decode_reports_malformed_payloads() {
        let msg = Message::new("orders", "new", "not json");
        assert!(matches!(
            msg.decode::<Order>(),
            Err(AmqpError::ParsePayloadError(_))
        ));
    }

    #[tokio::test]
    async fn ack_forwards_to_the_delivering_channel() {
        let mut acker = MockAcknowledge::new();
        acker.expect_ack().withf(|multiple| !*multiple).times(1).returning(|_| Ok(()));

        let msg = delivered(true, acker);

        assert_eq!(msg.delivery_tag(), Some(7));
        assert_eq!(msg.timestamp.unwrap().timestamp(), 1_700_000_000);
        msg.ack().await.unwrap();
    }

    #[tokio::test]
    async fn nack_and_reject_forward_their_flags() {
        let mut acker = MockAcknowledge::new();
        acker
            .expect_nack()
            .withf(|multiple, requeue| !*multiple && *requeue)
            .times(1)
            .returning(|_, _| Ok(()));
        acker
            .expect_reject()
            .withf(|requeue| !*requeue)
            .times(1)
            .returning(|_| Ok(()));

        let msg = delivered(true, acker);

        msg.nack(true).await.unwrap();
        msg.reject(false).await.unwrap();
    }

    #[tokio::test]
    async fn ack_after_channel_closed_fails() {
        let mut acker = MockAcknowledge::new();
        acker.expect_ack().never();

        let msg = delivered(false, acker);

        assert_eq!(msg.ack().await, Err(AmqpError::ChannelClosed));
    }

    #[tokio::test]
    async fn ack_on_an_outgoing_message_fails() {
        let msg = Message::new("orders", "new", "x");
        assert_eq!(msg.ack().await, Err(AmqpError::NotDelivered));
    }
}
