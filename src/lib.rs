// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod events;
mod observer;

pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod topology;
pub mod transport;

#[cfg(test)]
mod testing;

pub use broker::{Broker, ConnectionState};
pub use config::BrokerOptions;
pub use consumer::{Consumer, ConsumerOptions, ConsumerState};
pub use errors::AmqpError;
pub use events::{on_close, ListenerHandle};
pub use exchange::{Exchange, ExchangeKind, ExchangeOptions};
pub use message::{HeaderValue, Message};
pub use observer::{ConnectionObserver, SubscriptionId};
pub use queue::{Queue, QueueOptions};
pub use topology::{BindingOptions, Topology};
