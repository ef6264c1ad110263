// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Outgoing Messages
//!
//! This module turns a caller's [`Message`] into the wire-ready [`Publishing`]
//! handed to the transport: default timestamp, expiration in milliseconds,
//! delivery mode and a fresh message id.

use crate::message::{HeaderValue, Message};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// AMQP delivery modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient = 1,
    Persistent = 2,
}

/// A message ready to be handed to [`crate::transport::AmqpChannel::publish`].
#[derive(Debug, Clone, PartialEq)]
pub struct Publishing {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, HeaderValue>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: String,
    /// Seconds since the epoch.
    pub timestamp: Option<u64>,
    /// Milliseconds, as the broker expects it.
    pub expiration: Option<String>,
    pub delivery_mode: DeliveryMode,
}

impl Publishing {
    /// Prepares `msg` for the wire.
    ///
    /// # Parameters
    /// * `msg` - The caller's message
    /// * `auto_timestamp` - Whether an unset timestamp is filled with `now`
    /// * `now` - The publish time
    pub fn prepare(msg: &Message, auto_timestamp: bool, now: DateTime<Utc>) -> Publishing {
        let timestamp = match msg.timestamp {
            Some(ts) => Some(ts),
            None if auto_timestamp => Some(now),
            None => None,
        };

        let expiration = msg
            .expiration
            .filter(|exp| !exp.is_zero())
            .map(|exp| exp.as_millis().to_string());

        let delivery_mode = if msg.transient {
            DeliveryMode::Transient
        } else {
            DeliveryMode::Persistent
        };

        Publishing {
            exchange: msg.exchange.clone(),
            routing_key: msg.routing_key.clone(),
            body: msg.body.clone(),
            headers: msg.headers.clone(),
            content_type: msg.content_type.clone(),
            correlation_id: msg.correlation_id.clone(),
            reply_to: msg.reply_to.clone(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: timestamp.map(|ts| ts.timestamp().max(0) as u64),
            expiration,
            delivery_mode,
        }
    }
}
