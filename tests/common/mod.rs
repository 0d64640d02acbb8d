// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker standing in for the lapin transport.

#![allow(dead_code)]

use async_trait::async_trait;
use lapin::BasicProperties;
use rabbitmq_resilient::{
    errors::AmqpError,
    event::{Event, EventKind},
    topology::{Binding, Declare, TopologyEntry},
    transport::{
        Confirmation, ConnectionSignal, ConsumeParams, Credentials, Publishing, RawDelivery,
        ReturnedMessage, Transport, TransportChannel, TransportConnection,
    },
};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Notify},
    time,
};

pub const EVENTUALLY: Duration = Duration::from_secs(5);

#[derive(Default)]
struct BrokerState {
    failing_connects: u32,
    failing_declares: u32,
    connect_error: Option<AmqpError>,
    publish_gate: Option<Arc<Notify>>,
    connects: u32,
    passwords: Vec<Option<String>>,
    connections: Vec<Arc<FakeConnection>>,
    channels: Vec<Arc<FakeChannel>>,
    declared: Vec<TopologyEntry>,
    bound: Vec<Binding>,
}

/// Shared state of the fake broker; clones observe the same broker.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> FakeBroker {
        FakeBroker::default()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(FakeTransport {
            broker: self.clone(),
        })
    }

    /// The next `count` connection attempts fail.
    pub fn fail_connects(&self, count: u32) {
        self.state.lock().unwrap().failing_connects = count;
    }

    /// The next `count` declarations fail.
    pub fn fail_declares(&self, count: u32) {
        self.state.lock().unwrap().failing_declares = count;
    }

    /// Every connection attempt fails with `err`.
    pub fn refuse_connects_with(&self, err: AmqpError) {
        self.state.lock().unwrap().connect_error = Some(err);
    }

    /// Accepted publishes wait for a permit on the returned gate before the
    /// transport reports them sent.
    pub fn hold_publishes(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().unwrap().publish_gate = Some(gate.clone());
        gate
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    pub fn passwords(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().passwords.clone()
    }

    pub fn declared(&self) -> Vec<TopologyEntry> {
        self.state.lock().unwrap().declared.clone()
    }

    pub fn declared_names(&self) -> Vec<String> {
        self.declared().into_iter().map(|entry| entry.name).collect()
    }

    pub fn bound(&self) -> Vec<Binding> {
        self.state.lock().unwrap().bound.clone()
    }

    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.state.lock().unwrap().channels.clone()
    }

    pub fn open_channels(&self) -> usize {
        self.channels()
            .iter()
            .filter(|channel| !channel.is_closed())
            .count()
    }

    pub fn last_channel(&self) -> Arc<FakeChannel> {
        self.channels()
            .last()
            .cloned()
            .expect("no channel was opened")
    }

    pub fn last_connection(&self) -> Arc<FakeConnection> {
        self.state
            .lock()
            .unwrap()
            .connections
            .last()
            .cloned()
            .expect("no connection was opened")
    }

    pub fn last_connection_closed(&self) -> bool {
        self.last_connection().closed.load(Ordering::SeqCst)
    }

    /// Drops the most recent connection as a network failure would.
    pub fn kill_connection(&self) {
        self.last_connection().kill("connection reset by peer");
    }
}

struct FakeTransport {
    broker: FakeBroker,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        _address: &str,
        credentials: Option<Credentials>,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        let mut state = self.broker.state.lock().unwrap();
        state.connects += 1;
        state
            .passwords
            .push(credentials.map(|credentials| credentials.password));

        if let Some(err) = &state.connect_error {
            return Err(err.clone());
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(AmqpError::TransportUnavailable("connection refused".to_owned()));
        }

        let connection = Arc::new(FakeConnection {
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
            signals: Subscribers::default(),
        });
        state.connections.push(connection.clone());
        Ok(connection)
    }
}

struct Subscribers<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Subscribers {
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Subscribers<T> {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        rx
    }

    fn send(&self, value: T) {
        self.senders
            .lock()
            .unwrap()
            .retain(|tx| tx.send(value.clone()).is_ok());
    }
}

pub struct FakeConnection {
    broker: FakeBroker,
    closed: AtomicBool,
    signals: Subscribers<ConnectionSignal>,
}

impl FakeConnection {
    pub fn kill(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        self.signals
            .send(ConnectionSignal::Closed(Some(reason.to_owned())));
    }

    pub fn block(&self, reason: &str) {
        self.signals.send(ConnectionSignal::Blocked(reason.to_owned()));
    }

    pub fn unblock(&self) {
        self.signals.send(ConnectionSignal::Unblocked);
    }
}

#[async_trait]
impl TransportConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError);
        }

        let channel = Arc::new(FakeChannel {
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            next_tag: AtomicU64::new(0),
            published: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            nacks: Mutex::new(Vec::new()),
            deliveries: Mutex::new(None),
            closes: Subscribers::default(),
            confirms: Subscribers::default(),
            returns: Subscribers::default(),
        });
        self.broker
            .state
            .lock()
            .unwrap()
            .channels
            .push(channel.clone());
        Ok(channel)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionSignal> {
        self.signals.subscribe()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeChannel {
    broker: FakeBroker,
    closed: AtomicBool,
    sequence: AtomicU64,
    next_tag: AtomicU64,
    published: Mutex<Vec<Publishing>>,
    acks: Mutex<Vec<u64>>,
    nacks: Mutex<Vec<(u64, bool)>>,
    deliveries: Mutex<Option<mpsc::UnboundedSender<RawDelivery>>>,
    closes: Subscribers<Option<String>>,
    confirms: Subscribers<Confirmation>,
    returns: Subscribers<ReturnedMessage>,
}

impl FakeChannel {
    /// Closes the channel from the broker side.
    pub fn kill(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.send(Some(reason.to_owned()));
    }

    pub fn confirm(&self, sequence: u64, ack: bool) {
        self.confirms.send(Confirmation { sequence, ack });
    }

    pub fn return_message(&self, reply_text: &str) {
        self.returns.send(ReturnedMessage {
            reply_code: 312,
            reply_text: reply_text.to_owned(),
            exchange: "orders".to_owned(),
            routing_key: "nowhere".to_owned(),
            properties: BasicProperties::default(),
            payload: b"lost".to_vec(),
        });
    }

    /// Pushes a message to the subscribed consumer; returns its delivery tag.
    pub fn deliver(&self, payload: &[u8]) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let deliveries = self.deliveries.lock().unwrap();
        let sender = deliveries.as_ref().expect("no consumer subscribed");
        sender
            .send(RawDelivery {
                delivery_tag: tag,
                exchange: String::new(),
                routing_key: "workload".to_owned(),
                redelivered: false,
                properties: BasicProperties::default(),
                payload: payload.to_vec(),
            })
            .expect("consumer is gone");
        tag
    }

    pub fn is_consuming(&self) -> bool {
        self.deliveries.lock().unwrap().is_some()
    }

    pub fn published(&self) -> Vec<Publishing> {
        self.published.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.acks.lock().unwrap().clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.nacks.lock().unwrap().clone()
    }
}

#[async_trait]
impl Declare for FakeChannel {
    async fn declare(&self, entry: &TopologyEntry) -> Result<(), AmqpError> {
        let mut state = self.broker.state.lock().unwrap();
        state.declared.push(entry.clone());
        if state.failing_declares > 0 {
            state.failing_declares -= 1;
            return Err(AmqpError::DeclareQueueError(entry.name.clone()));
        }
        Ok(())
    }

    async fn bind(&self, binding: &Binding) -> Result<(), AmqpError> {
        self.broker.state.lock().unwrap().bound.push(binding.clone());
        Ok(())
    }
}

#[async_trait]
impl TransportChannel for FakeChannel {
    async fn confirm_select(&self, _no_wait: bool) -> Result<(), AmqpError> {
        self.sequence.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, message: Publishing) -> Result<u64, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::PublishingError);
        }
        self.published.lock().unwrap().push(message);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let gate = self.broker.state.lock().unwrap().publish_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(sequence)
    }

    async fn qos(&self, _prefetch_count: u16, _global: bool) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn consume(
        &self,
        _params: &ConsumeParams,
    ) -> Result<mpsc::UnboundedReceiver<RawDelivery>, AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.deliveries.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64, _multiple: bool) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::AckMessageError);
        }
        self.acks.lock().unwrap().push(delivery_tag);
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        _multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::NackMessageError);
        }
        self.nacks.lock().unwrap().push((delivery_tag, requeue));
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.nack(delivery_tag, false, requeue).await
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
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        self.deliveries.lock().unwrap().take();
        Ok(())
    }
}

/// Polls `condition` until it holds, failing the test after [`EVENTUALLY`].
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let started = time::Instant::now();
    while !condition() {
        if started.elapsed() > EVENTUALLY {
            panic!("timed out waiting for {what}");
        }
        time::sleep(Duration::from_millis(5)).await;
    }
}

/// Receives events until one of `kind` arrives, returning every event seen.
pub async fn until_event(events: &mut mpsc::Receiver<Event>, kind: EventKind) -> Vec<Event> {
    let mut seen = Vec::new();
    let wait = async {
        while let Some(event) = events.recv().await {
            let found = event.kind == kind;
            seen.push(event);
            if found {
                return;
            }
        }
    };
    within(wait).await;
    seen
}

/// Fails the test if `future` takes longer than [`EVENTUALLY`].
pub async fn within<F: Future>(future: F) -> F::Output {
    time::timeout(EVENTUALLY, future)
        .await
        .expect("operation timed out")
}
