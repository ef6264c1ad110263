// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! The production transport: connections and channels backed by lapin.
//! This is the only module that speaks lapin types; everything above it works
//! through the traits in [`crate::transport`].
//!
//! lapin reports a failed connection through `on_error` and a failed channel
//! through its consumer streams. Both are turned into abnormal closure
//! notifications here.

use crate::{
    errors::AmqpError,
    events::CloseNotifier,
    exchange::ExchangeKind,
    message::HeaderValue,
    publisher::Publishing,
    topology::{ExchangeDeclaration, QueueDeclaration},
    transport::{
        Acknowledge, AmqpChannel, AmqpConnection, CloseReason, Delivery, DeliveryStream,
        Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicRejectOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
        QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
};
use tokio::sync::oneshot;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ through lapin.
#[derive(Debug, Default)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> Arc<LapinTransport> {
        Arc::new(LapinTransport)
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn dial(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let conn = Connection::connect(uri, options)
            .await
            .map_err(|err| AmqpError::DialError(err.to_string()))?;
        debug!("amqp connected");

        let notifier = Arc::new(CloseNotifier::default());
        let channels: Arc<Mutex<Vec<Weak<CloseNotifier>>>> = Arc::new(Mutex::new(vec![]));

        conn.on_error({
            let notifier = notifier.clone();
            let channels = channels.clone();
            move |err| {
                error!(error = err.to_string(), "amqp connection error");
                let reason = CloseReason::Abnormal(AmqpError::TransportClosed(err.to_string()));

                let channels: Vec<_> = channels.lock().drain(..).collect();
                for channel in channels.iter().filter_map(Weak::upgrade) {
                    channel.fire(reason.clone());
                }
                notifier.fire(reason);
            }
        });

        Ok(Arc::new(LapinConnection {
            conn,
            notifier,
            channels,
        }))
    }
}

struct LapinConnection {
    conn: Connection,
    notifier: Arc<CloseNotifier>,
    channels: Arc<Mutex<Vec<Weak<CloseNotifier>>>>,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))?;
        debug!("channel created");

        let notifier = Arc::new(CloseNotifier::default());
        {
            let mut channels = self.channels.lock();
            channels.retain(|n| n.strong_count() > 0);
            channels.push(Arc::downgrade(&notifier));
        }

        Ok(Arc::new(LapinChannel { channel, notifier }))
    }

    fn notify_close(&self) -> oneshot::Receiver<CloseReason> {
        self.notifier.subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let closed = self
            .conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::TransportClosed(err.to_string()));

        let channels: Vec<_> = self.channels.lock().drain(..).collect();
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.fire(CloseReason::Normal);
        }
        self.notifier.fire(CloseReason::Normal);

        closed
    }
}

struct LapinChannel {
    channel: Channel,
    notifier: Arc<CloseNotifier>,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &declaration.name,
                declaration.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: declaration.durable,
                    auto_delete: declaration.auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<String, AmqpError> {
        let mut arguments = BTreeMap::new();
        for (key, value) in &declaration.arguments {
            arguments.insert(ShortString::from(key.clone()), amqp_value(value));
        }

        let queue = self
            .channel
            .queue_declare(
                &declaration.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: declaration.durable,
                    exclusive: declaration.exclusive,
                    auto_delete: declaration.auto_delete,
                    nowait: false,
                },
                FieldTable::from(arguments),
            )
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))?;

        Ok(queue.name().as_str().to_owned())
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn publish(&self, publishing: &Publishing) -> Result<(), AmqpError> {
        let mut properties = BasicProperties::default()
            .with_message_id(ShortString::from(publishing.message_id.clone()))
            .with_delivery_mode(publishing.delivery_mode as u8)
            .with_headers(field_table(&publishing.headers));

        if let Some(content_type) = &publishing.content_type {
            properties = properties.with_content_type(ShortString::from(content_type.clone()));
        }
        if let Some(correlation_id) = &publishing.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
        }
        if let Some(reply_to) = &publishing.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
        }
        if let Some(timestamp) = publishing.timestamp {
            properties = properties.with_timestamp(timestamp);
        }
        if let Some(expiration) = &publishing.expiration {
            properties = properties.with_expiration(ShortString::from(expiration.clone()));
        }

        self.channel
            .basic_publish(
                &publishing.exchange,
                &publishing.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &publishing.body,
                properties,
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::PublishingError(err.to_string()))
    }

    async fn consume(
        &self,
        queue: &str,
        tag: &str,
        auto_ack: bool,
        exclusive: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: auto_ack,
                    exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::ConsumeError(err.to_string()))?;

        let notifier = self.notifier.clone();
        Ok(consumer
            .map(move |delivery| match delivery {
                Ok(delivery) => Ok(from_lapin(delivery)),
                Err(err) => {
                    let err = AmqpError::TransportClosed(err.to_string());
                    notifier.fire(CloseReason::Abnormal(err.clone()));
                    Err(err)
                }
            })
            .boxed())
    }

    async fn cancel(&self, tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let closed = self
            .channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()));
        self.notifier.fire(CloseReason::Normal);

        closed
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn notify_close(&self) -> oneshot::Receiver<CloseReason> {
        self.notifier.subscribe()
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple })
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::RejectMessageError(err.to_string()))
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

fn from_lapin(delivery: lapin::message::Delivery) -> Delivery {
    let lapin::message::Delivery {
        delivery_tag,
        exchange,
        routing_key,
        redelivered,
        properties,
        data,
        acker,
        ..
    } = delivery;

    let headers = properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    header_value(value).map(|value| (key.as_str().to_owned(), value))
                })
                .collect()
        })
        .unwrap_or_default();

    Delivery {
        delivery_tag,
        redelivered,
        exchange: exchange.as_str().to_owned(),
        routing_key: routing_key.as_str().to_owned(),
        body: data,
        headers,
        content_type: properties.content_type().as_ref().map(|v| v.as_str().to_owned()),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|v| v.as_str().to_owned()),
        reply_to: properties.reply_to().as_ref().map(|v| v.as_str().to_owned()),
        timestamp: *properties.timestamp(),
        acker: Arc::new(LapinAcker(acker)),
    }
}

fn field_table(headers: &HashMap<String, HeaderValue>) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        btree.insert(ShortString::from(key.clone()), amqp_value(value));
    }

    FieldTable::from(btree)
}

fn amqp_value(value: &HeaderValue) -> AMQPValue {
    match value.clone() {
        HeaderValue::Bool(v) => AMQPValue::Boolean(v),
        HeaderValue::ShortInt(v) => AMQPValue::ShortInt(v),
        HeaderValue::LongInt(v) => AMQPValue::LongInt(v),
        HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(v),
        HeaderValue::LongUInt(v) => AMQPValue::LongUInt(v),
        HeaderValue::Double(v) => AMQPValue::Double(v),
        HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
        HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
    }
}

/// Header types without a [`HeaderValue`] counterpart, such as nested tables,
/// are left out.
fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
        AMQPValue::ShortInt(v) => Some(HeaderValue::ShortInt(*v)),
        AMQPValue::LongInt(v) => Some(HeaderValue::LongInt(*v)),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::LongLongInt(*v)),
        AMQPValue::LongUInt(v) => Some(HeaderValue::LongUInt(*v)),
        AMQPValue::Double(v) => Some(HeaderValue::Double(*v)),
        AMQPValue::ShortString(v) => Some(HeaderValue::ShortString(v.as_str().to_owned())),
        AMQPValue::LongString(v) => Some(HeaderValue::LongString(
            String::from_utf8_lossy(v.as_bytes()).into_owned(),
        )),
        _ => None,
    }
}
