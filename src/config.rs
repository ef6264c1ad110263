// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! [`BrokerOptions`] holds everything needed to reach a broker and to govern
//! reconnects. It deserializes with serde so it can live in any application
//! config file, and [`BrokerOptions::from_env`] reads the usual `RABBITMQ_*`
//! environment variables.

use crate::errors::AmqpError;
use serde::Deserialize;
use std::{env, str::FromStr, time::Duration};
use tracing::warn;
use url::Url;

/// Options for broker setup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerOptions {
    /// Use `amqps` instead of `amqp`.
    pub encrypted: bool,
    /// `host:port`
    pub address: String,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Reported to the broker, visible in its management UI.
    pub connection_name: String,
    /// Fill `Message::timestamp` on publish when unset.
    pub auto_timestamp: bool,
    /// Base of the linear reconnect backoff.
    pub reconnect_delay_ms: u64,
    /// Upper bound of the reconnect backoff.
    pub max_reconnect_delay_ms: u64,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        BrokerOptions {
            encrypted: false,
            address: "localhost:5672".to_owned(),
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: env!("CARGO_PKG_NAME").to_owned(),
            auto_timestamp: false,
            reconnect_delay_ms: 5_000,
            max_reconnect_delay_ms: 60_000,
        }
    }
}

impl BrokerOptions {
    /// Reads options from the environment, keeping defaults for unset variables.
    pub fn from_env() -> BrokerOptions {
        let mut options = BrokerOptions::default();

        read_var("RABBITMQ_TLS", &mut options.encrypted);
        read_var("RABBITMQ_ADDRESS", &mut options.address);
        read_var("RABBITMQ_USER", &mut options.user);
        read_var("RABBITMQ_PASSWORD", &mut options.password);
        read_var("RABBITMQ_VHOST", &mut options.vhost);
        read_var("APP_NAME", &mut options.connection_name);
        read_var("RABBITMQ_AUTO_TIMESTAMP", &mut options.auto_timestamp);
        read_var("RABBITMQ_RECONNECT_DELAY_MS", &mut options.reconnect_delay_ms);
        read_var(
            "RABBITMQ_MAX_RECONNECT_DELAY_MS",
            &mut options.max_reconnect_delay_ms,
        );

        options
    }

    /// Builds the AMQP URI, percent-encoding credentials and vhost.
    pub fn url(&self) -> Result<String, AmqpError> {
        let scheme = if self.encrypted { "amqps" } else { "amqp" };

        let mut url = Url::parse(&format!("{}://{}/", scheme, self.address))
            .map_err(|err| AmqpError::ConfigurationError(format!("address: {}", err)))?;

        if url.host_str().map_or(true, str::is_empty) {
            return Err(AmqpError::ConfigurationError(
                "address: missing host".to_owned(),
            ));
        }

        url.set_username(&self.user)
            .and_then(|_| url.set_password(Some(&self.password)))
            .map_err(|_| AmqpError::ConfigurationError("credentials".to_owned()))?;

        url.path_segments_mut()
            .map_err(|_| AmqpError::ConfigurationError("vhost".to_owned()))?
            .pop_if_empty()
            .push(&self.vhost);

        Ok(url.to_string())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    /// Delay before reconnect attempt number `attempts`, counting from zero.
    pub fn backoff(&self, attempts: u32) -> Duration {
        self.reconnect_delay()
            .saturating_mul(attempts)
            .min(self.max_reconnect_delay())
    }
}

fn read_var<T: FromStr>(name: &str, target: &mut T) {
    let Ok(raw) = env::var(name) else {
        return;
    };

    match raw.parse() {
        Ok(value) => *target = value,
        Err(_) => warn!(variable = name, "ignoring malformed environment variable"),
    }
}
