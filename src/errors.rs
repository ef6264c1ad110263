// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Layer
//!
//! This module provides the error taxonomy shared by the connection manager,
//! consumers, the pull front-end and the transport implementations. Setup-time
//! errors are returned synchronously; closure errors observed after setup are
//! cloned onto every registered error stream, which is why `AmqpError` is `Clone`.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The broker could not be reached
    #[error("dial: {0}")]
    DialError(String),

    /// A management or consumer sub-channel could not be opened
    #[error("open channel: {0}")]
    ChannelError(String),

    /// The broker refused a consumer, e.g. a consumer tag collision
    #[error("consume: {0}")]
    ConsumeError(String),

    /// A sub-channel or connection was closed asynchronously
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Invalid options, rejected before any network call
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error deleting an exchange with the given name
    #[error("failure to delete exchange `{0}`: {1}")]
    DeleteExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error deleting a queue with the given name
    #[error("failure to delete queue `{0}`: {1}")]
    DeleteQueueError(String, String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error removing a binding between an exchange and a queue
    #[error("failure to unbind exchange `{0}` from queue `{1}`: {2}")]
    UnbindingExchangeFromQueueError(String, String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message: {0}")]
    RejectMessageError(String),

    /// An acknowledgment was attempted after the delivering channel closed
    #[error("channel closed")]
    ChannelClosed,

    /// An acknowledgment was attempted on a message that was never delivered
    #[error("message was not delivered by the broker")]
    NotDelivered,

    /// The operation needs a Ready connection and there is none
    #[error("not connected")]
    NotConnected,

    /// The broker was closed by the caller
    #[error("broker closed")]
    BrokerClosed,

    /// Every failure observed during a multi-step teardown
    #[error("{}", join(.0))]
    Teardown(Vec<AmqpError>),
}

impl AmqpError {
    /// Folds the errors collected during a teardown into one result.
    pub fn collect(mut errors: Vec<AmqpError>) -> Result<(), AmqpError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(AmqpError::Teardown(errors)),
        }
    }
}

fn join(errors: &[AmqpError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_without_errors_is_ok() {
        assert_eq!(AmqpError::collect(vec![]), Ok(()));
    }

    #[test]
    fn collect_keeps_a_single_error_as_is() {
        let err = AmqpError::collect(vec![AmqpError::ChannelClosed]).unwrap_err();
        assert_eq!(err, AmqpError::ChannelClosed);
    }

    #[test]
    fn teardown_displays_every_error() {
        let err = AmqpError::collect(vec![
            AmqpError::ChannelError("close main channel".to_owned()),
            AmqpError::TransportClosed("connection reset".to_owned()),
        ])
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "open channel: close main channel, transport closed: connection reset"
        );
    }
}
