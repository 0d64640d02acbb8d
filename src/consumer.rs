// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! A [`Consumer`] is a channel supervisor in consumer mode. On every `Up` it applies
//! the configured QoS, subscribes to its queue and buffers deliveries into batches.
//! A batch is handed to the configured [`MessageProcessor`] as soon as it holds
//! `prefetch_count` messages, or once `prefetch_timeout` has elapsed since its first
//! message, whichever comes first.
//!
//! Delivery tags are only meaningful on the channel handle that received them. Each
//! [`DeliveryTag`] records the handle generation, so acknowledging a delivery after a
//! reconnection fails with a stale-handle error instead of acking the wrong message.

use crate::{
    channel::{Channel, ChannelOptions, Usage},
    connection::Connection,
    errors::AmqpError,
    topology::Arguments,
    transport::{ConsumeParams, RawDelivery},
};
use async_trait::async_trait;
use lapin::BasicProperties;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// Default number of deliveries per batch.
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;
/// Default time to wait for a batch to fill up.
pub const DEFAULT_PREFETCH_TIMEOUT: Duration = Duration::from_secs(5);
/// Default consumer name.
pub const DEFAULT_CONSUMER_NAME: &str = "default.consumer";

/// Consumer-mode parameters of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerOptions {
    pub(crate) queue: String,
    pub(crate) consumer_tag: String,
    pub(crate) auto_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) no_local: bool,
    pub(crate) no_wait: bool,
    pub(crate) arguments: Arguments,
    pub(crate) prefetch_count: u16,
    pub(crate) qos_global: bool,
    pub(crate) prefetch_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            queue: String::new(),
            consumer_tag: DEFAULT_CONSUMER_NAME.to_owned(),
            auto_ack: false,
            exclusive: false,
            no_local: false,
            no_wait: false,
            arguments: Arguments::default(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            qos_global: false,
            prefetch_timeout: DEFAULT_PREFETCH_TIMEOUT,
        }
    }
}

impl ConsumerOptions {
    /// Queue to consume from.
    pub fn with_queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_owned();
        self
    }

    /// Consumer tag announced to the broker and passed with every batch.
    pub fn with_consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_owned();
        self
    }

    /// Lets the broker consider deliveries acknowledged as soon as they are sent.
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Requests exclusive access to the queue.
    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    pub fn with_no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    /// Adds a broker-specific subscription argument.
    pub fn with_argument(mut self, key: &str, value: Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }

    /// Batch size and QoS prefetch limit. Zero is treated as one.
    pub fn with_prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count.max(1);
        self
    }

    pub fn with_qos_global(mut self, global: bool) -> Self {
        self.qos_global = global;
        self
    }

    /// Longest time a partial batch waits for more deliveries.
    pub fn with_prefetch_timeout(mut self, timeout: Duration) -> Self {
        self.prefetch_timeout = timeout;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub(crate) fn consume_params(&self) -> ConsumeParams {
        ConsumeParams {
            queue: self.queue.clone(),
            consumer_tag: self.consumer_tag.clone(),
            no_ack: self.auto_ack,
            exclusive: self.exclusive,
            no_local: self.no_local,
            no_wait: self.no_wait,
            arguments: self.arguments.clone(),
        }
    }
}

/// Identifies a delivery on one specific channel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub generation: u64,
    pub value: u64,
}

/// One delivered message.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryData {
    pub tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl DeliveryData {
    pub(crate) fn new(raw: RawDelivery, generation: u64) -> DeliveryData {
        DeliveryData {
            tag: DeliveryTag {
                generation,
                value: raw.delivery_tag,
            },
            exchange: raw.exchange,
            routing_key: raw.routing_key,
            redelivered: raw.redelivered,
            properties: raw.properties,
            body: raw.payload,
        }
    }
}

/// Metadata shared by every message of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveriesProperties {
    pub queue: String,
    pub consumer_tag: String,
    pub generation: u64,
}

/// Application-defined batch processing.
///
/// Invoked from the channel's supervising task, one batch at a time. When
/// `must_ack` is set the processor is expected to ack or nack every message
/// through `channel`.
///
/// The supervisor waits for the processor: while it runs no other event of the
/// channel is handled. Calling [`Channel::close`] from a processor cancels the
/// channel and returns at once; the channel closes after the processor returns.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(
        &self,
        properties: &DeliveriesProperties,
        messages: Vec<DeliveryData>,
        must_ack: bool,
        channel: &Channel,
    );
}

/// Buffers deliveries until the prefetch count or timeout is reached.
pub(crate) struct Batch {
    capacity: usize,
    timeout: Duration,
    messages: Vec<DeliveryData>,
    deadline: Option<Instant>,
}

impl Batch {
    pub(crate) fn new(capacity: usize, timeout: Duration) -> Batch {
        let capacity = capacity.max(1);
        Batch {
            capacity,
            timeout,
            messages: Vec::with_capacity(capacity),
            deadline: None,
        }
    }

    /// Buffers a delivery; returns `true` once the batch is full.
    pub(crate) fn push(&mut self, delivery: DeliveryData) -> bool {
        if self.messages.is_empty() {
            self.deadline = Some(Instant::now() + self.timeout);
        }
        self.messages.push(delivery);
        self.messages.len() >= self.capacity
    }

    /// When the buffered messages must be flushed, if any are buffered.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn take(&mut self) -> Vec<DeliveryData> {
        self.deadline = None;
        std::mem::replace(&mut self.messages, Vec::with_capacity(self.capacity))
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }
}

/// A self-healing consumer.
#[derive(Clone)]
pub struct Consumer {
    channel: Channel,
}

impl Consumer {
    /// Creates a consumer channel on `connection`.
    ///
    /// Messages are handed to the processor set with
    /// [`ChannelOptions::with_processor`]; without one, batches are reported as
    /// `DataExhausted`/`DataPartial` events and dropped.
    pub fn new(
        connection: &Connection,
        options: ConsumerOptions,
        channel_options: ChannelOptions,
    ) -> Consumer {
        let channel = Channel::spawn(
            connection,
            channel_options.with_usage(Usage::Consumer(options)),
            DEFAULT_CONSUMER_NAME,
        );
        Consumer { channel }
    }

    /// The supervised channel underneath.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    /// True unless the consumer channel is currently up.
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// See [`Channel::ack`].
    pub async fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<(), AmqpError> {
        self.channel.ack(tag, multiple).await
    }

    /// See [`Channel::nack`].
    pub async fn nack(
        &self,
        tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel.nack(tag, multiple, requeue).await
    }

    /// See [`Channel::reject`].
    pub async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), AmqpError> {
        self.channel.reject(tag, requeue).await
    }

    /// Stops consuming and closes the channel.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.channel.close().await
    }

    /// Parks until the consumer's scope is cancelled.
    pub async fn wait(&self) {
        self.channel.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(tag: u64) -> DeliveryData {
        DeliveryData::new(
            RawDelivery {
                delivery_tag: tag,
                exchange: String::new(),
                routing_key: "workload".to_owned(),
                redelivered: false,
                properties: BasicProperties::default(),
                payload: format!("message {tag}").into_bytes(),
            },
            1,
        )
    }

    #[tokio::test]
    async fn test_batch_reports_full_at_capacity() {
        let mut batch = Batch::new(3, Duration::from_secs(1));
        assert!(batch.deadline().is_none());

        assert!(!batch.push(delivery(1)));
        assert!(batch.deadline().is_some());
        assert!(!batch.push(delivery(2)));
        assert!(batch.push(delivery(3)));

        let messages = batch.take();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].tag, DeliveryTag { generation: 1, value: 1 });
        assert_eq!(batch.len(), 0);
        assert!(batch.deadline().is_none());
    }

    #[tokio::test]
    async fn test_deadline_starts_at_first_message() {
        let mut batch = Batch::new(10, Duration::from_millis(500));
        let before = Instant::now();
        batch.push(delivery(1));
        let deadline = batch.deadline().unwrap();

        batch.push(delivery(2));
        assert_eq!(batch.deadline(), Some(deadline));
        assert!(deadline >= before + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_zero_capacity_behaves_as_one() {
        let mut batch = Batch::new(0, Duration::from_secs(1));
        assert!(batch.push(delivery(1)));
    }

    #[test]
    fn test_consume_params_follow_options() {
        let options = ConsumerOptions::default()
            .with_queue("workload")
            .with_consumer_tag("consumer.one")
            .with_auto_ack(true)
            .with_prefetch_count(0);
        let params = options.consume_params();

        assert_eq!(params.queue, "workload");
        assert_eq!(params.consumer_tag, "consumer.one");
        assert!(params.no_ack);
        assert_eq!(options.prefetch_count, 1);
    }
}
