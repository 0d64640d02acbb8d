// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! A [`Publisher`] is a channel supervisor in publisher mode: on every `Up` the
//! channel is put into confirmation mode and the confirmation ledger starts empty.
//!
//! Every accepted publish is recorded in the ledger under the sequence number the
//! transport assigned to it and stays there until the broker confirms it. The
//! ledger is bounded by the configured confirmation count; a publish that would
//! exceed the bound fails fast with [`AmqpError::ConfirmationBoundExceeded`]
//! and leaves the ledger untouched. Messages carry the current OpenTelemetry
//! context in their headers.

use crate::{
    channel::{Channel, ChannelOptions, Usage},
    connection::Connection,
    errors::AmqpError,
    event::EventKind,
    otel,
    transport::{Confirmation, Publishing},
};
use lapin::{types::ShortString, BasicProperties};
use std::{collections::BTreeMap, time::Duration};
use tokio::{
    select,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default bound of the confirmation ledger.
pub const DEFAULT_CONFIRMATION_COUNT: usize = 10;
/// Default publisher name.
pub const DEFAULT_PUBLISHER_NAME: &str = "default.publisher";

/// Publisher-mode parameters of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherOptions {
    pub(crate) exchange: String,
    pub(crate) key: String,
    pub(crate) mandatory: bool,
    pub(crate) immediate: bool,
    pub(crate) confirmation_count: usize,
    pub(crate) confirmation_no_wait: bool,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        PublisherOptions {
            exchange: String::new(),
            key: String::new(),
            mandatory: false,
            immediate: false,
            confirmation_count: DEFAULT_CONFIRMATION_COUNT,
            confirmation_no_wait: false,
        }
    }
}

impl PublisherOptions {
    /// Exchange used by [`Publisher::publish`].
    pub fn with_exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    /// Routing key used by [`Publisher::publish`].
    pub fn with_key(mut self, key: &str) -> Self {
        self.key = key.to_owned();
        self
    }

    /// Asks the broker to return messages no queue is bound for.
    pub fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Maximum number of publishes awaiting confirmation. Zero is treated as one.
    pub fn with_confirmation_count(mut self, count: usize) -> Self {
        self.confirmation_count = count.max(1);
        self
    }

    /// Enables confirmation mode without waiting for the broker's reply.
    pub fn with_confirmation_no_wait(mut self, no_wait: bool) -> Self {
        self.confirmation_no_wait = no_wait;
        self
    }

    pub fn confirmation_count(&self) -> usize {
        self.confirmation_count
    }

    fn publishing(&self, payload: &[u8]) -> Publishing {
        Publishing {
            exchange: self.exchange.clone(),
            routing_key: self.key.clone(),
            mandatory: self.mandatory,
            immediate: self.immediate,
            properties: BasicProperties::default(),
            payload: payload.to_vec(),
        }
    }
}

/// Result of matching a broker confirmation against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfirmOutcome {
    /// The oldest pending entry was confirmed.
    Matched,
    /// A pending entry was confirmed ahead of the oldest one.
    OutOfOrder { expected: u64 },
    /// No entry yet, but a publish is in flight; held until it is recorded.
    Parked,
    /// No pending entry carries this sequence number.
    Unmatched,
}

/// A slot taken in the ledger for one in-flight publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reservation {
    epoch: u64,
}

impl Reservation {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Pending publishes keyed by confirmation sequence number.
///
/// A publish first reserves a slot, then records its sequence number once the
/// transport accepted it; the lock is never held while the transport works.
/// Confirmations that overtake their own record are parked until it lands.
/// Draining the ledger starts a new epoch, which voids older reservations.
#[derive(Debug)]
pub(crate) struct ConfirmLedger {
    bound: usize,
    epoch: u64,
    reserved: usize,
    pending: BTreeMap<u64, Instant>,
    parked: BTreeMap<u64, Confirmation>,
}

impl ConfirmLedger {
    pub(crate) fn new(bound: usize) -> ConfirmLedger {
        ConfirmLedger {
            bound: bound.max(1),
            epoch: 0,
            reserved: 0,
            pending: BTreeMap::new(),
            parked: BTreeMap::new(),
        }
    }

    pub(crate) fn bound(&self) -> usize {
        self.bound
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Publishes awaiting a broker confirmation.
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when pending and in-flight publishes reach the bound.
    pub(crate) fn is_full(&self) -> bool {
        self.pending.len() + self.reserved >= self.bound
    }

    /// Takes a slot for a publish about to be handed to the transport.
    pub(crate) fn reserve(&mut self) -> Option<Reservation> {
        if self.is_full() {
            return None;
        }
        self.reserved += 1;
        Some(Reservation { epoch: self.epoch })
    }

    /// Turns a reservation into a pending entry.
    ///
    /// Returns the parked confirmations that can now be matched, or `None` when
    /// the ledger was drained after the reservation was taken.
    pub(crate) fn record(
        &mut self,
        reservation: Reservation,
        sequence: u64,
    ) -> Option<Vec<Confirmation>> {
        if !self.settle(reservation) {
            return None;
        }
        self.pending.insert(sequence, Instant::now());
        Some(self.unpark())
    }

    /// Gives back the slot of a publish the transport refused.
    pub(crate) fn release(&mut self, reservation: Reservation) -> Vec<Confirmation> {
        if !self.settle(reservation) {
            return Vec::new();
        }
        self.unpark()
    }

    pub(crate) fn confirm(&mut self, confirmation: Confirmation) -> ConfirmOutcome {
        let sequence = confirmation.sequence;
        if let Some(&expected) = self.pending.keys().next() {
            if self.pending.remove(&sequence).is_some() {
                return if sequence == expected {
                    ConfirmOutcome::Matched
                } else {
                    ConfirmOutcome::OutOfOrder { expected }
                };
            }
        }
        if self.reserved > 0 {
            self.parked.insert(sequence, confirmation);
            return ConfirmOutcome::Parked;
        }
        ConfirmOutcome::Unmatched
    }

    /// Empties the ledger, returning the sequence numbers still unconfirmed.
    pub(crate) fn drain(&mut self) -> Vec<u64> {
        self.epoch += 1;
        self.reserved = 0;
        self.parked.clear();
        std::mem::take(&mut self.pending).into_keys().collect()
    }

    fn settle(&mut self, reservation: Reservation) -> bool {
        if reservation.epoch != self.epoch {
            return false;
        }
        self.reserved = self.reserved.saturating_sub(1);
        true
    }

    /// Parked confirmations that have an entry now, or all of them once nothing
    /// is in flight anymore.
    fn unpark(&mut self) -> Vec<Confirmation> {
        if self.reserved == 0 {
            return std::mem::take(&mut self.parked).into_values().collect();
        }
        let ready: Vec<u64> = self
            .parked
            .keys()
            .filter(|sequence| self.pending.contains_key(sequence))
            .copied()
            .collect();
        ready
            .into_iter()
            .filter_map(|sequence| self.parked.remove(&sequence))
            .collect()
    }
}

/// A self-healing publisher with confirmation tracking.
#[derive(Clone)]
pub struct Publisher {
    channel: Channel,
    options: PublisherOptions,
}

impl Publisher {
    /// Creates a publisher channel on `connection`.
    pub fn new(
        connection: &Connection,
        options: PublisherOptions,
        channel_options: ChannelOptions,
    ) -> Publisher {
        let channel = Channel::spawn(
            connection,
            channel_options.with_usage(Usage::Publisher(options.clone())),
            DEFAULT_PUBLISHER_NAME,
        );
        Publisher { channel, options }
    }

    /// The supervised channel underneath.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    /// True unless the publisher channel is currently up.
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// True when the channel is up with confirmation mode active.
    pub fn is_available(&self) -> bool {
        !self.channel.is_closed() && self.channel.is_confirming()
    }

    /// Number of publishes still awaiting a broker confirmation.
    pub fn pending_confirmations(&self) -> usize {
        self.channel.ledger().len()
    }

    /// Publishes `payload` with the exchange, key and flags of the options.
    ///
    /// Fails with [`AmqpError::NotReady`] while the channel is down,
    /// [`AmqpError::ConfirmationBoundExceeded`] when too many publishes await a
    /// confirmation and [`AmqpError::Cancelled`] once the publisher is closed.
    pub async fn publish(&self, payload: &[u8]) -> Result<u64, AmqpError> {
        self.send(self.options.publishing(payload)).await
    }

    /// Publishes a fully specified message.
    pub async fn publish_with(&self, message: Publishing) -> Result<u64, AmqpError> {
        self.send(message).await
    }

    async fn send(&self, mut message: Publishing) -> Result<u64, AmqpError> {
        let scope = self.channel.scope();
        if scope.is_cancelled() {
            return Err(AmqpError::Cancelled);
        }
        if !self.is_available() {
            return Err(AmqpError::NotReady);
        }
        let Some((handle, _)) = self.channel.current() else {
            return Err(AmqpError::NotReady);
        };

        let reservation = {
            let mut ledger = self.channel.ledger();
            match ledger.reserve() {
                Some(reservation) => reservation,
                None => {
                    warn!(
                        name = self.channel.name(),
                        bound = ledger.bound(),
                        "too many unconfirmed publishes"
                    );
                    return Err(AmqpError::ConfirmationBoundExceeded(ledger.bound()));
                }
            }
        };

        if message.properties.message_id().is_none() {
            message.properties = message
                .properties
                .with_message_id(ShortString::from(Uuid::new_v4().to_string()));
        }
        message.properties = otel::inject(message.properties);

        let published = select! {
            biased;
            _ = scope.cancelled() => Err(AmqpError::Cancelled),
            published = handle.publish(message) => published,
        };

        let sequence = match published {
            Ok(sequence) => sequence,
            Err(err) => {
                let unparked = self.channel.ledger().release(reservation);
                self.channel.unpark(reservation.epoch(), unparked);
                error!(
                    name = self.channel.name(),
                    error = err.to_string(),
                    "error publishing message"
                );
                return Err(err);
            }
        };

        let recorded = self.channel.ledger().record(reservation, sequence);
        match recorded {
            Some(unparked) => self.channel.unpark(reservation.epoch(), unparked),
            None => {
                warn!(
                    name = self.channel.name(),
                    sequence,
                    "publish unconfirmed at disconnect"
                );
                self.channel.notifier().notify(
                    EventKind::Confirm,
                    Some(AmqpError::ProtocolViolation(format!(
                        "publish {sequence} unconfirmed at disconnect"
                    ))),
                );
                return Ok(sequence);
            }
        }

        debug!(name = self.channel.name(), sequence, "message published");
        self.channel
            .notifier()
            .notify(EventKind::MessagePublished, None);

        Ok(sequence)
    }

    /// Polls every `poll` until the publisher is available or `timeout` elapses.
    ///
    /// Returns `false` on timeout or when the publisher's scope is cancelled.
    pub async fn await_available(&self, timeout: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ticker = time::interval(poll.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let scope = self.channel.scope();

        loop {
            select! {
                biased;
                _ = scope.cancelled() => return false,
                _ = time::sleep_until(deadline) => return false,
                _ = ticker.tick() => {
                    if self.is_available() {
                        return true;
                    }
                }
            }
        }
    }

    /// Closes the publisher channel.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.channel.close().await
    }

    /// Parks until the publisher's scope is cancelled.
    pub async fn wait(&self) {
        self.channel.wait().await
    }
}
