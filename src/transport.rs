// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Boundary
//!
//! The supervisors never speak the wire protocol themselves. They drive an
//! implementation of these traits, which performs connection establishment,
//! frame handling and delivery transport. [`crate::amqp::LapinTransport`] is the
//! production implementation.
//!
//! Every notification (close, confirmation, return, delivery) is exposed as an
//! unbounded receiver so a supervisor can `select!` over all of them at once.

use crate::{
    errors::AmqpError,
    topology::{Arguments, Declare},
};
use async_trait::async_trait;
use lapin::BasicProperties;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Credentials fetched from the secret provider for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub password: String,
}

/// Unsolicited notifications about a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// The broker stopped reading from this connection.
    Blocked(String),
    Unblocked,
    /// The connection is gone; `None` for a clean close.
    Closed(Option<String>),
}

/// A message handed to the transport for publishing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Publishing {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub properties: BasicProperties,
    pub payload: Vec<u8>,
}

impl Publishing {
    pub fn new(payload: &[u8]) -> Publishing {
        Publishing {
            payload: payload.to_vec(),
            ..Publishing::default()
        }
    }
}

/// Broker outcome for one published sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub sequence: u64,
    pub ack: bool,
}

/// A mandatory/immediate message the broker could not route.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub payload: Vec<u8>,
}

/// A delivery as received on one channel handle.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub payload: Vec<u8>,
}

/// Parameters of a consumer subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumeParams {
    pub queue: String,
    pub consumer_tag: String,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
    pub arguments: Arguments,
}

/// Opens connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        credentials: Option<Credentials>,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError>;
}

/// A live connection handle.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError>;

    /// Subscribes to signals; every call returns an independent receiver.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionSignal>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A live channel handle.
#[async_trait]
pub trait TransportChannel: Declare {
    async fn confirm_select(&self, no_wait: bool) -> Result<(), AmqpError>;

    /// Publishes and returns the confirmation sequence number of the message.
    async fn publish(&self, message: Publishing) -> Result<u64, AmqpError>;

    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError>;

    /// Starts a subscription; deliveries arrive in broker order.
    async fn consume(
        &self,
        params: &ConsumeParams,
    ) -> Result<mpsc::UnboundedReceiver<RawDelivery>, AmqpError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Yields once when the channel closes, with the reason if it was not clean.
    fn notify_close(&self) -> mpsc::UnboundedReceiver<Option<String>>;

    fn notify_confirm(&self) -> mpsc::UnboundedReceiver<Confirmation>;

    fn notify_return(&self) -> mpsc::UnboundedReceiver<ReturnedMessage>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}
