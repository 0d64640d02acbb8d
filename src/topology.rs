// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Reconciliation
//!
//! A channel owns an ordered list of [`TopologyEntry`] values describing the exchanges
//! and queues it relies on. After every successful (re)connect the whole list is
//! re-applied, in list order, against the fresh channel handle. Declarations are
//! idempotent on the broker side, so re-applying an unchanged list is safe.
//!
//! The main components are:
//! - `TopologyEntry`: one exchange or queue, plus an optional implied binding
//! - `Declare` trait: the declare/bind capability of a live channel
//! - `reconcile`: applies a list in order, aborting on the first failure

use crate::{errors::AmqpError, exchange::ExchangeKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Opaque broker arguments, passed through to the transport untouched.
pub type Arguments = BTreeMap<String, Value>;

/// The broker entity an entry describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Queue,
    Exchange(ExchangeKind),
}

/// Position of an entity in the message flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Source,
    #[default]
    Destination,
    Both,
}

impl Role {
    pub fn is_source(&self) -> bool {
        matches!(self, Role::Source | Role::Both)
    }

    pub fn is_destination(&self) -> bool {
        matches!(self, Role::Destination | Role::Both)
    }
}

/// Binding implied by an entry, towards its peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyBind {
    pub peer: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub arguments: Arguments,
}

/// A resolved binding between a source exchange and a destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub source: String,
    pub destination: String,
    pub destination_is_queue: bool,
    pub key: String,
    pub no_wait: bool,
    pub arguments: Arguments,
}

/// One exchange or queue the channel depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyEntry {
    pub name: String,
    pub entity: Entity,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default = "default_declare")]
    pub declare: bool,
    #[serde(default)]
    pub arguments: Arguments,
    #[serde(default)]
    pub bind: Option<TopologyBind>,
}

fn default_declare() -> bool {
    true
}

impl TopologyEntry {
    /// Creates a queue entry, a message destination declared on connect.
    pub fn queue(name: &str) -> TopologyEntry {
        TopologyEntry {
            name: name.to_owned(),
            entity: Entity::Queue,
            role: Role::Destination,
            durable: false,
            auto_delete: false,
            exclusive: false,
            internal: false,
            passive: false,
            no_wait: false,
            declare: true,
            arguments: Arguments::default(),
            bind: None,
        }
    }

    /// Creates an exchange entry, a message source declared on connect.
    pub fn exchange(name: &str, kind: ExchangeKind) -> TopologyEntry {
        TopologyEntry {
            entity: Entity::Exchange(kind),
            role: Role::Source,
            ..TopologyEntry::queue(name)
        }
    }

    /// Creates a delayed exchange routing as `kind` once the delay elapses.
    ///
    /// This requires the x-delayed-message plugin on the RabbitMQ server.
    pub fn delayed_exchange(name: &str, kind: ExchangeKind) -> TopologyEntry {
        TopologyEntry::exchange(name, ExchangeKind::XMessageDelayed).argument(
            crate::exchange::AMQP_HEADERS_DELAYED_EXCHANGE_TYPE,
            Value::from(kind.as_str()),
        )
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Keeps the entry for binding purposes without declaring it.
    pub fn skip_declare(mut self) -> Self {
        self.declare = false;
        self
    }

    pub fn argument(mut self, key: &str, value: Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }

    /// Message TTL in milliseconds.
    pub fn message_ttl(self, ttl: i64) -> Self {
        self.argument(AMQP_HEADERS_MESSAGE_TTL, Value::from(ttl))
    }

    pub fn max_length(self, max: i64) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH, Value::from(max))
    }

    pub fn max_length_bytes(self, max_bytes: i64) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH_BYTES, Value::from(max_bytes))
    }

    /// Routes dead-lettered messages to `exchange` with `routing_key`.
    pub fn dead_letter(self, exchange: &str, routing_key: &str) -> Self {
        self.argument(AMQP_HEADERS_DEAD_LETTER_EXCHANGE, Value::from(exchange))
            .argument(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, Value::from(routing_key))
    }

    pub fn bind(mut self, peer: &str, key: &str) -> Self {
        self.bind = Some(TopologyBind {
            peer: peer.to_owned(),
            key: key.to_owned(),
            no_wait: false,
            arguments: Arguments::default(),
        });
        self
    }

    pub fn is_queue(&self) -> bool {
        self.entity == Entity::Queue
    }

    /// Resolves the binding implied by this entry.
    ///
    /// A destination is bound to its peer source; a pure source binds its peer
    /// queue to itself.
    pub fn binding(&self) -> Option<Binding> {
        let bind = self.bind.as_ref()?;

        let (source, destination, destination_is_queue) = if self.role.is_destination() {
            (bind.peer.clone(), self.name.clone(), self.is_queue())
        } else {
            (self.name.clone(), bind.peer.clone(), true)
        };

        Some(Binding {
            source,
            destination,
            destination_is_queue,
            key: bind.key.clone(),
            no_wait: bind.no_wait,
            arguments: bind.arguments.clone(),
        })
    }
}

/// Parses an ordered topology list from a JSON array.
pub fn from_json(json: &str) -> Result<Vec<TopologyEntry>, AmqpError> {
    serde_json::from_str(json).map_err(|err| {
        error!(error = err.to_string(), "failure to parse topology");
        AmqpError::ConfigError(err.to_string())
    })
}

/// The declare capability of a live channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Declare: Send + Sync {
    /// Asserts the entity described by `entry` exists.
    async fn declare(&self, entry: &TopologyEntry) -> Result<(), AmqpError>;

    /// Binds a destination to a source exchange.
    async fn bind(&self, binding: &Binding) -> Result<(), AmqpError>;
}

/// Applies `entries` against `channel`, strictly in list order.
///
/// The first failing declaration or binding aborts the reconciliation; no later
/// entry is touched in the same pass.
pub async fn reconcile<D>(channel: &D, entries: &[TopologyEntry]) -> Result<(), AmqpError>
where
    D: Declare + ?Sized,
{
    for entry in entries {
        if entry.declare {
            debug!("declaring: {}", entry.name);

            if let Err(err) = channel.declare(entry).await {
                error!(
                    error = err.to_string(),
                    name = entry.name,
                    "failure to declare topology entry"
                );
                return Err(err);
            }
        }

        if let Some(binding) = entry.binding() {
            debug!(
                "binding: {} to the exchange: {} with the key: {}",
                binding.destination, binding.source, binding.key
            );

            if let Err(err) = channel.bind(&binding).await {
                error!(
                    error = err.to_string(),
                    source = binding.source,
                    destination = binding.destination,
                    "failure to bind topology entry"
                );
                return Err(err);
            }
        }
    }

    debug!("topology reconciled");

    Ok(())
}
