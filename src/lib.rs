// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Self-Healing RabbitMQ Connections and Channels
//!
//! Supervised connections and channels that survive transport failures: every
//! unsolicited close is followed by a backoff sleep, a fresh handle and a full
//! topology reconciliation. Publishers track broker confirmations in a bounded
//! ledger; consumers hand deliveries to a processor in prefetch-sized batches.
//!
//! Lifecycle health is observed through [`event::Event`]s sent to a caller-owned
//! sink and through the liveness queries of each entity. Cancellation scopes
//! (`tokio_util` tokens) form a tree rooted at each connection.

mod lifecycle;
mod otel;

pub mod amqp;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod delay;
pub mod errors;
pub mod event;
pub mod exchange;
pub mod publisher;
pub mod secret;
pub mod topology;
pub mod transport;

pub use channel::{Channel, ChannelOptions};
pub use connection::{Connection, ConnectionOptions};
pub use consumer::{Consumer, ConsumerOptions, DeliveryData, DeliveryTag, MessageProcessor};
pub use errors::AmqpError;
pub use event::{Event, EventKind};
pub use lifecycle::LinkState;
pub use otel::new_span;
pub use publisher::{Publisher, PublisherOptions};
