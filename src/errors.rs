// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Supervision Layer
//!
//! `AmqpError` represents every failure the supervisors can observe or return.
//! Errors raised inside a recovery loop are never returned to callers: they are
//! converted into retries or terminal closure and reported through events.
//! Errors raised by caller-invoked operations (`publish`, `ack`, ...) are always
//! returned synchronously.

use thiserror::Error;

/// Represents errors that can occur while supervising AMQP connections and channels.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The transport could not be opened or went away
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a destination to a source
    #[error("failure to bind `{1}` to `{0}`")]
    BindingError(String, String),

    /// The operation requires the channel to be up
    #[error("channel is not ready")]
    NotReady,

    /// The delivery tag belongs to a channel handle superseded by reconnection
    #[error("channel closed: stale handle from generation {0}")]
    StaleHandle(u64),

    /// The underlying channel was closed
    #[error("channel closed")]
    ChannelClosed,

    /// Too many publishes are waiting for a broker confirmation
    #[error("outstanding confirmations bound `{0}` exceeded")]
    ConfirmationBoundExceeded(usize),

    /// The broker violated the confirmation protocol
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The owning cancellation scope was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Error enabling publisher confirmations
    #[error("failure to enable confirm mode")]
    ConfirmModeError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker negatively acknowledged a publish
    #[error("publish `{0}` was nacked")]
    PublishNacked(u64),

    /// The broker returned an unroutable message
    #[error("message returned: {0}")]
    MessageReturned(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error")]
    ConsumerDeclarationError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The secret provider could not supply credentials
    #[error("failure to fetch credentials `{0}`")]
    SecretError(String),

    /// Invalid configuration
    #[error("invalid configuration `{0}`")]
    ConfigError(String),
}

impl AmqpError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            AmqpError::InternalError => "internal",
            AmqpError::TransportUnavailable(_)
            | AmqpError::ConnectionError
            | AmqpError::ChannelError
            | AmqpError::ChannelClosed => "transport_unavailable",
            AmqpError::DeclareExchangeError(_)
            | AmqpError::DeclareQueueError(_)
            | AmqpError::BindingError(_, _) => "topology_declare_failed",
            AmqpError::NotReady => "not_ready",
            AmqpError::StaleHandle(_) => "stale_handle",
            AmqpError::ConfirmationBoundExceeded(_) => "confirmation_bound_exceeded",
            AmqpError::ProtocolViolation(_) => "protocol_violation",
            AmqpError::Cancelled => "cancelled",
            AmqpError::ConfirmModeError => "confirm_mode",
            AmqpError::PublishingError => "publishing",
            AmqpError::PublishNacked(_) => "publish_nacked",
            AmqpError::MessageReturned(_) => "message_returned",
            AmqpError::AckMessageError => "ack",
            AmqpError::NackMessageError => "nack",
            AmqpError::RejectMessageError => "reject",
            AmqpError::QoSDeclarationError(_) => "qos",
            AmqpError::ConsumerDeclarationError => "consumer_declaration",
            AmqpError::ConsumerError(_) => "consumer",
            AmqpError::SecretError(_) => "secret",
            AmqpError::ConfigError(_) => "config",
        }
    }

    /// Indicates whether a supervisor retries after this error.
    ///
    /// Transport and topology failures drive the recovery loop; everything else
    /// is either returned to the caller or terminal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AmqpError::TransportUnavailable(_)
                | AmqpError::ConnectionError
                | AmqpError::ChannelError
                | AmqpError::ChannelClosed
                | AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingError(_, _)
                | AmqpError::ConfirmModeError
                | AmqpError::QoSDeclarationError(_)
                | AmqpError::ConsumerDeclarationError
                | AmqpError::SecretError(_)
        )
    }
}
