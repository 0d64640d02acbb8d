// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! Production implementation of the [`crate::transport`] traits on top of lapin.
//!
//! lapin reports connection failures through an error callback and exposes the
//! blocked/closed state through status flags; both are turned into
//! [`ConnectionSignal`]s here. Publisher confirmations are forwarded in publish
//! order by a single task per channel, and the sequence numbers are assigned
//! locally from the moment confirmation mode is enabled.

use crate::{
    config::AmqpConfigs,
    errors::AmqpError,
    topology::{Arguments, Binding, Declare, Entity, TopologyEntry},
    transport::{
        Confirmation, ConnectionSignal, ConsumeParams, Credentials, Publishing, RawDelivery,
        ReturnedMessage, Transport, TransportChannel, TransportConnection,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::BasicReturnMessage,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeBindOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::{Confirmation as LapinConfirmation, PublisherConfirm},
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    uri::AMQPUri,
    ConnectionProperties,
};
use serde_json::Value;
use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time};
use tracing::{debug, error, warn};

/// How often lapin's status flags are sampled.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

const CLOSE_REPLY_CODE: u16 = 200;
const CLOSE_REPLY_TEXT: &str = "closed by client";

/// Fan-out of one notification stream to every subscriber.
struct Watchers<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Watchers<T> {
    fn new() -> Watchers<T> {
        Watchers {
            senders: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn broadcast(&self, value: T) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(value.clone()).is_ok());
    }
}

/// Opens lapin connections.
pub struct LapinTransport {
    properties: ConnectionProperties,
}

impl LapinTransport {
    pub fn new(properties: ConnectionProperties) -> LapinTransport {
        LapinTransport { properties }
    }

    pub fn from_configs(cfg: &AmqpConfigs) -> LapinTransport {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));
        LapinTransport::new(properties)
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(
        &self,
        address: &str,
        credentials: Option<Credentials>,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        let mut uri = AMQPUri::from_str(address).map_err(|err| {
            error!(error = err, "invalid amqp uri");
            AmqpError::ConfigError(err)
        })?;
        if let Some(credentials) = credentials {
            uri.authority.userinfo.password = credentials.password;
        }

        let conn = lapin::Connection::connect_uri(uri, self.properties.clone())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                AmqpError::TransportUnavailable(err.to_string())
            })?;

        Ok(LapinConnection::watch(conn))
    }
}

struct LapinConnection {
    conn: Arc<lapin::Connection>,
    signals: Arc<Watchers<ConnectionSignal>>,
}

impl LapinConnection {
    fn watch(conn: lapin::Connection) -> Arc<LapinConnection> {
        let signals = Arc::new(Watchers::new());
        let closed = Arc::new(AtomicBool::new(false));

        conn.on_error({
            let signals = Arc::downgrade(&signals);
            let closed = closed.clone();
            move |err| {
                warn!(error = err.to_string(), "amqp connection error");
                if closed.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(signals) = signals.upgrade() {
                    signals.broadcast(ConnectionSignal::Closed(Some(err.to_string())));
                }
            }
        });

        let conn = Arc::new(conn);
        tokio::spawn(poll_connection(
            Arc::downgrade(&conn),
            Arc::downgrade(&signals),
            closed,
        ));

        Arc::new(LapinConnection { conn, signals })
    }
}

/// Turns lapin's status flags into signals until the connection goes away.
async fn poll_connection(
    conn: Weak<lapin::Connection>,
    signals: Weak<Watchers<ConnectionSignal>>,
    closed: Arc<AtomicBool>,
) {
    let mut blocked = false;
    let mut ticker = time::interval(STATUS_POLL_INTERVAL);

    loop {
        ticker.tick().await;

        let (Some(conn), Some(signals)) = (conn.upgrade(), signals.upgrade()) else {
            return;
        };
        let status = conn.status();

        if !status.connected() {
            if !closed.swap(true, Ordering::SeqCst) {
                signals.broadcast(ConnectionSignal::Closed(None));
            }
            return;
        }

        if status.blocked() != blocked {
            blocked = status.blocked();
            signals.broadcast(if blocked {
                ConnectionSignal::Blocked("broker resource alarm".to_owned())
            } else {
                ConnectionSignal::Unblocked
            });
        }
    }
}

#[async_trait]
impl TransportConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        let channel = self.conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError
        })?;
        Ok(LapinChannel::watch(channel))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionSignal> {
        self.signals.subscribe()
    }

    fn is_closed(&self) -> bool {
        !self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT)
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "failure to close connection");
                AmqpError::ConnectionError
            })
    }
}

struct LapinChannel {
    channel: lapin::Channel,
    sequence: AtomicU64,
    pending: mpsc::UnboundedSender<(u64, PublisherConfirm)>,
    closes: Arc<Watchers<Option<String>>>,
    confirms: Arc<Watchers<Confirmation>>,
    returns: Arc<Watchers<ReturnedMessage>>,
}

impl LapinChannel {
    fn watch(channel: lapin::Channel) -> Arc<LapinChannel> {
        let (pending, pending_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(Watchers::new());
        let confirms = Arc::new(Watchers::new());
        let returns = Arc::new(Watchers::new());

        tokio::spawn(forward_confirms(
            pending_rx,
            confirms.clone(),
            returns.clone(),
        ));
        tokio::spawn(poll_channel(channel.clone(), Arc::downgrade(&closes)));

        Arc::new(LapinChannel {
            channel,
            sequence: AtomicU64::new(0),
            pending,
            closes,
            confirms,
            returns,
        })
    }
}

/// Resolves publisher confirms in publish order.
async fn forward_confirms(
    mut pending: mpsc::UnboundedReceiver<(u64, PublisherConfirm)>,
    confirms: Arc<Watchers<Confirmation>>,
    returns: Arc<Watchers<ReturnedMessage>>,
) {
    while let Some((sequence, confirm)) = pending.recv().await {
        let (ack, returned) = match confirm.await {
            Ok(LapinConfirmation::Ack(returned)) => (true, returned),
            Ok(LapinConfirmation::Nack(returned)) => (false, returned),
            Ok(LapinConfirmation::NotRequested) => continue,
            Err(err) => {
                debug!(sequence, error = err.to_string(), "confirmation lost");
                continue;
            }
        };

        if let Some(returned) = returned {
            returns.broadcast(returned_message(*returned));
        }
        confirms.broadcast(Confirmation { sequence, ack });
    }
}

async fn poll_channel(channel: lapin::Channel, closes: Weak<Watchers<Option<String>>>) {
    let mut ticker = time::interval(STATUS_POLL_INTERVAL);

    loop {
        ticker.tick().await;

        let Some(closes) = closes.upgrade() else {
            return;
        };
        if !channel.status().connected() {
            closes.broadcast(None);
            return;
        }
    }
}

fn returned_message(message: BasicReturnMessage) -> ReturnedMessage {
    ReturnedMessage {
        reply_code: message.reply_code,
        reply_text: message.reply_text.as_str().to_owned(),
        exchange: message.delivery.exchange.as_str().to_owned(),
        routing_key: message.delivery.routing_key.as_str().to_owned(),
        properties: message.delivery.properties,
        payload: message.delivery.data,
    }
}

fn field_table(arguments: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    table
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(value) => AMQPValue::Boolean(*value),
        Value::Number(number) => match number.as_i64() {
            Some(value) => AMQPValue::LongLongInt(value),
            None => AMQPValue::Double(number.as_f64().unwrap_or_default()),
        },
        Value::String(value) => AMQPValue::LongString(LongString::from(value.clone())),
        Value::Array(values) => AMQPValue::FieldArray(FieldArray::from(
            values.iter().map(amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(ShortString::from(key.clone()), amqp_value(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

#[async_trait]
impl Declare for LapinChannel {
    async fn declare(&self, entry: &TopologyEntry) -> Result<(), AmqpError> {
        match &entry.entity {
            Entity::Exchange(kind) => {
                debug!("creating exchange: {}", entry.name);
                self.channel
                    .exchange_declare(
                        &entry.name,
                        kind.into(),
                        ExchangeDeclareOptions {
                            passive: entry.passive,
                            durable: entry.durable,
                            auto_delete: entry.auto_delete,
                            internal: entry.internal,
                            nowait: entry.no_wait,
                        },
                        field_table(&entry.arguments),
                    )
                    .await
                    .map_err(|err| {
                        error!(
                            error = err.to_string(),
                            name = entry.name,
                            "error to declare the exchange"
                        );
                        AmqpError::DeclareExchangeError(entry.name.clone())
                    })
            }
            Entity::Queue => {
                debug!("creating queue: {}", entry.name);
                self.channel
                    .queue_declare(
                        &entry.name,
                        QueueDeclareOptions {
                            passive: entry.passive,
                            durable: entry.durable,
                            exclusive: entry.exclusive,
                            auto_delete: entry.auto_delete,
                            nowait: entry.no_wait,
                        },
                        field_table(&entry.arguments),
                    )
                    .await
                    .map(|_| ())
                    .map_err(|err| {
                        error!(
                            error = err.to_string(),
                            name = entry.name,
                            "error to declare the queue"
                        );
                        AmqpError::DeclareQueueError(entry.name.clone())
                    })
            }
        }
    }

    async fn bind(&self, binding: &Binding) -> Result<(), AmqpError> {
        let arguments = field_table(&binding.arguments);

        let bound = if binding.destination_is_queue {
            self.channel
                .queue_bind(
                    &binding.destination,
                    &binding.source,
                    &binding.key,
                    QueueBindOptions {
                        nowait: binding.no_wait,
                    },
                    arguments,
                )
                .await
        } else {
            self.channel
                .exchange_bind(
                    &binding.destination,
                    &binding.source,
                    &binding.key,
                    ExchangeBindOptions {
                        nowait: binding.no_wait,
                    },
                    arguments,
                )
                .await
        };

        bound.map_err(|err| {
            error!(
                error = err.to_string(),
                source = binding.source,
                destination = binding.destination,
                "error to bind"
            );
            AmqpError::BindingError(binding.source.clone(), binding.destination.clone())
        })
    }
}

#[async_trait]
impl TransportChannel for LapinChannel {
    async fn confirm_select(&self, no_wait: bool) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: no_wait })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable confirm mode");
                AmqpError::ConfirmModeError
            })?;
        self.sequence.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, message: Publishing) -> Result<u64, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    mandatory: message.mandatory,
                    immediate: message.immediate,
                },
                &message.payload,
                message.properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError
            })?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        if self.pending.send((sequence, confirm)).is_err() {
            warn!(sequence, "confirmation forwarder is gone");
        }
        Ok(sequence)
    }

    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(
        &self,
        params: &ConsumeParams,
    ) -> Result<mpsc::UnboundedReceiver<RawDelivery>, AmqpError> {
        let mut consumer = self
            .channel
            .basic_consume(
                &params.queue,
                &params.consumer_tag,
                BasicConsumeOptions {
                    no_local: params.no_local,
                    no_ack: params.no_ack,
                    exclusive: params.exclusive,
                    nowait: params.no_wait,
                },
                field_table(&params.arguments),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let raw = RawDelivery {
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.as_str().to_owned(),
                            routing_key: delivery.routing_key.as_str().to_owned(),
                            redelivered: delivery.redelivered,
                            properties: delivery.properties,
                            payload: delivery.data,
                        };
                        if tx.send(raw).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to ack");
                AmqpError::AckMessageError
            })
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to nack");
                AmqpError::NackMessageError
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to reject");
                AmqpError::RejectMessageError
            })
    }

    fn notify_close(&self) -> mpsc::UnboundedReceiver<Option<String>> {
        self.closes.subscribe()
    }

    fn notify_confirm(&self) -> mpsc::UnboundedReceiver<Confirmation> {
        self.confirms.subscribe()
    }

    fn notify_return(&self) -> mpsc::UnboundedReceiver<ReturnedMessage> {
        self.returns.subscribe()
    }

    fn is_closed(&self) -> bool {
        !self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT)
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "failure to close channel");
                AmqpError::ChannelError
            })
    }
}
