// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Supervisor
//!
//! A [`Channel`] keeps one transport channel alive on top of a [`Connection`].
//! Whenever the connection is up, the supervisor opens a fresh channel, reconciles
//! the configured topology in list order and applies the usage-specific setup:
//! confirmation mode for publishers, QoS and the subscription for consumers. Only
//! then is the channel reported `Up`.
//!
//! The channel goes `Down` when its own handle closes or when the connection
//! underneath is replaced. Either way the old handle is discarded and a new one is
//! opened after the backoff sleep.
//!
//! The channel's scope is always a descendant of its connection's scope. Closing a
//! channel never affects the connection or sibling channels; closing the connection
//! closes every channel derived from it.

use crate::{
    connection::Connection,
    consumer::{
        Batch, ConsumerOptions, DeliveriesProperties, DeliveryData, DeliveryTag, MessageProcessor,
    },
    delay::{DelayProvider, FixedDelay},
    errors::AmqpError,
    event::{Event, EventKind, EventObserver, EventSink, Notifier, SourceType},
    lifecycle::{
        discard, wait_state, CallbackWhenDown, CallbackWhenRecovering, CallbackWhenUp,
        Callbacks, Link, LinkState, Recovery,
    },
    otel,
    publisher::{ConfirmLedger, ConfirmOutcome, PublisherOptions, DEFAULT_CONFIRMATION_COUNT},
    topology::{self, TopologyEntry},
    transport::{
        Confirmation, RawDelivery, ReturnedMessage, TransportChannel, TransportConnection,
    },
};
use opentelemetry::{global, trace::Span};
use std::{
    future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::{
    select,
    sync::{mpsc, watch},
    task_local,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

task_local! {
    /// Identity of the channel whose processor runs on the current task.
    static DISPATCHING: usize;
}

/// Default channel name.
pub const DEFAULT_CHANNEL_NAME: &str = "default.channel";

/// Invoked for every broker confirmation of a publish.
pub type CallbackNotifyPublish = Arc<dyn Fn(Confirmation, &Channel) + Send + Sync>;

/// Invoked for every message the broker returned as unroutable.
pub type CallbackNotifyReturn = Arc<dyn Fn(&ReturnedMessage, &Channel) + Send + Sync>;

/// What the channel is set up for after every `Up`.
#[derive(Debug, Clone, Default)]
pub enum Usage {
    #[default]
    Plain,
    Publisher(PublisherOptions),
    Consumer(ConsumerOptions),
}

/// Configuration options of a [`Channel`].
#[derive(Clone)]
pub struct ChannelOptions {
    pub(crate) name: Option<String>,
    pub(crate) delayer: Arc<dyn DelayProvider>,
    pub(crate) callbacks: Callbacks,
    pub(crate) on_notify_publish: Option<CallbackNotifyPublish>,
    pub(crate) on_notify_return: Option<CallbackNotifyReturn>,
    pub(crate) processor: Option<Arc<dyn MessageProcessor>>,
    pub(crate) topology: Vec<TopologyEntry>,
    pub(crate) usage: Usage,
    pub(crate) scope: Option<CancellationToken>,
    pub(crate) sink: Option<EventSink>,
    pub(crate) observer: Option<EventObserver>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            name: None,
            delayer: Arc::new(FixedDelay::default()),
            callbacks: Callbacks::default(),
            on_notify_publish: None,
            on_notify_return: None,
            processor: None,
            topology: Vec::new(),
            usage: Usage::Plain,
            scope: None,
            sink: None,
            observer: None,
        }
    }
}

impl ChannelOptions {
    /// Assigns a tag to this channel, used in events and logs.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Wait policy between reopening attempts.
    pub fn with_delay(mut self, delayer: impl DelayProvider + 'static) -> Self {
        self.delayer = Arc::new(delayer);
        self
    }

    /// Replaces the topology reconciled after every (re)connect.
    pub fn with_topology(mut self, entries: Vec<TopologyEntry>) -> Self {
        self.topology = entries;
        self
    }

    /// Appends one entry to the topology.
    pub fn with_entry(mut self, entry: TopologyEntry) -> Self {
        self.topology.push(entry);
        self
    }

    /// Parent scope of the channel. The channel still closes with its connection.
    pub fn with_scope(mut self, scope: CancellationToken) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Bounded sink receiving channel events; full sinks drop events.
    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Batch processor of consumer channels.
    pub fn with_processor(mut self, processor: impl MessageProcessor + 'static) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    /// Synchronous observer called with every event, before the sink.
    pub fn on_event(mut self, observer: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Called when the channel goes down or cannot be opened; `false` closes it.
    pub fn on_down(
        mut self,
        down: impl Fn(&str, Option<&AmqpError>) -> bool + Send + Sync + 'static,
    ) -> Self {
        let down: CallbackWhenDown = Arc::new(down);
        self.callbacks.on_down = Some(down);
        self
    }

    /// Called after every successful (re)open.
    pub fn on_up(mut self, up: impl Fn(&str) + Send + Sync + 'static) -> Self {
        let up: CallbackWhenUp = Arc::new(up);
        self.callbacks.on_up = Some(up);
        self
    }

    /// Called after each backoff sleep with the retry counter; `false` closes it.
    pub fn on_recovering(
        mut self,
        recovering: impl Fn(&str, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        let recovering: CallbackWhenRecovering = Arc::new(recovering);
        self.callbacks.on_recovering = Some(recovering);
        self
    }

    /// Called with every broker confirmation of a publish.
    pub fn on_notify_publish(
        mut self,
        notify: impl Fn(Confirmation, &Channel) + Send + Sync + 'static,
    ) -> Self {
        self.on_notify_publish = Some(Arc::new(notify));
        self
    }

    /// Called with every message the broker returned as unroutable.
    pub fn on_notify_return(
        mut self,
        notify: impl Fn(&ReturnedMessage, &Channel) + Send + Sync + 'static,
    ) -> Self {
        self.on_notify_return = Some(Arc::new(notify));
        self
    }

    pub(crate) fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

struct ChannelInner {
    name: String,
    scope: CancellationToken,
    link: watch::Sender<Link<dyn TransportChannel>>,
    confirming: AtomicBool,
    ledger: Mutex<ConfirmLedger>,
    unparked: mpsc::UnboundedSender<(u64, Confirmation)>,
    notifier: Notifier,
}

/// A self-healing AMQP channel.
///
/// Cloning is cheap; every clone refers to the same supervised channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Creates a plain channel on `connection` and starts its supervising task.
    pub fn new(connection: &Connection, options: ChannelOptions) -> Channel {
        Channel::spawn(connection, options.with_usage(Usage::Plain), DEFAULT_CHANNEL_NAME)
    }

    pub(crate) fn spawn(
        connection: &Connection,
        options: ChannelOptions,
        default_name: &str,
    ) -> Channel {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| default_name.to_owned());
        let scope = derive_scope(connection, options.scope.as_ref());

        let bound = match &options.usage {
            Usage::Publisher(publisher) => publisher.confirmation_count(),
            _ => DEFAULT_CONFIRMATION_COUNT,
        };
        let notifier = Notifier::new(
            SourceType::Channel,
            &name,
            options.sink.clone(),
            options.observer.clone(),
        );
        let (link, _) = watch::channel(Link::new());
        let (unparked, unparked_rx) = mpsc::unbounded_channel();

        let channel = Channel {
            inner: Arc::new(ChannelInner {
                name: name.clone(),
                scope,
                link,
                confirming: AtomicBool::new(false),
                ledger: Mutex::new(ConfirmLedger::new(bound)),
                unparked,
                notifier: notifier.clone(),
            }),
        };

        let supervisor = Supervisor {
            channel: channel.clone(),
            connection: connection.clone(),
            recovery: Recovery::new(&name, options.delayer, options.callbacks, notifier),
            topology: options.topology,
            usage: options.usage,
            processor: options.processor,
            on_notify_publish: options.on_notify_publish,
            on_notify_return: options.on_notify_return,
        };
        tokio::spawn(supervisor.run(unparked_rx));

        channel
    }

    /// The channel's tag.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current supervisor state.
    pub fn state(&self) -> LinkState {
        self.inner.link.borrow().state
    }

    /// True unless the channel is currently up.
    pub fn is_closed(&self) -> bool {
        !self.inner.link.borrow().is_up()
    }

    /// Number of handles opened so far; deliveries carry it in their tags.
    pub fn generation(&self) -> u64 {
        self.inner.link.borrow().generation
    }

    /// The channel's own scope, a descendant of its connection's scope.
    pub fn scope(&self) -> CancellationToken {
        self.inner.scope.clone()
    }

    /// Closes the channel for good and waits for the supervisor to finish.
    ///
    /// Closing an already closed channel is not an error. Called from the
    /// channel's own [`MessageProcessor`], it only cancels the scope: the
    /// supervisor closes the channel once the processor returns.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner.scope.cancel();

        let identity = self.identity();
        if DISPATCHING
            .try_with(|dispatching| *dispatching == identity)
            .unwrap_or(false)
        {
            return Ok(());
        }

        let mut link = self.inner.link.subscribe();
        if !wait_state(&mut link, |link| link.state == LinkState::Closed).await {
            error!(name = self.inner.name, "channel supervisor vanished");
            return Err(AmqpError::InternalError);
        }
        Ok(())
    }

    /// Parks until the channel's scope is cancelled.
    pub async fn wait(&self) {
        self.inner.scope.cancelled().await
    }

    /// Acknowledges a delivery received on this channel.
    ///
    /// Fails with [`AmqpError::StaleHandle`] when the tag was delivered on a
    /// handle replaced since, [`AmqpError::ChannelClosed`] while the channel is
    /// down and [`AmqpError::Cancelled`] once the channel is closed.
    pub async fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<(), AmqpError> {
        let handle = self.handle_for(tag)?;
        handle.ack(tag.value, multiple).await.map_err(|err| {
            error!(
                name = self.inner.name,
                tag = tag.value,
                error = err.to_string(),
                "error to ack"
            );
            err
        })
    }

    /// Negatively acknowledges a delivery, optionally requeueing it.
    pub async fn nack(
        &self,
        tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        let handle = self.handle_for(tag)?;
        handle
            .nack(tag.value, multiple, requeue)
            .await
            .map_err(|err| {
                error!(
                    name = self.inner.name,
                    tag = tag.value,
                    error = err.to_string(),
                    "error to nack"
                );
                err
            })
    }

    /// Rejects a single delivery, optionally requeueing it.
    pub async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), AmqpError> {
        let handle = self.handle_for(tag)?;
        handle.reject(tag.value, requeue).await.map_err(|err| {
            error!(
                name = self.inner.name,
                tag = tag.value,
                error = err.to_string(),
                "error to reject"
            );
            err
        })
    }

    /// The live handle, provided `tag` was delivered on it.
    fn handle_for(&self, tag: DeliveryTag) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        if self.inner.scope.is_cancelled() {
            return Err(AmqpError::Cancelled);
        }
        let link = self.inner.link.borrow();
        if link.generation != tag.generation {
            return Err(AmqpError::StaleHandle(tag.generation));
        }
        link.current().ok_or(AmqpError::ChannelClosed)
    }

    pub(crate) fn current(&self) -> Option<(Arc<dyn TransportChannel>, u64)> {
        let link = self.inner.link.borrow();
        link.current().map(|handle| (handle, link.generation))
    }

    pub(crate) fn is_confirming(&self) -> bool {
        self.inner.confirming.load(Ordering::SeqCst)
    }

    pub(crate) fn ledger(&self) -> MutexGuard<'_, ConfirmLedger> {
        self.inner
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands parked confirmations back to the supervisor for matching.
    pub(crate) fn unpark(&self, epoch: u64, confirmations: Vec<Confirmation>) {
        for confirmation in confirmations {
            if self.inner.unparked.send((epoch, confirmation)).is_err() {
                debug!(name = self.inner.name, "channel supervisor is gone");
            }
        }
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }
}

/// Child of the connection scope, or of `external` while still following the connection.
fn derive_scope(
    connection: &Connection,
    external: Option<&CancellationToken>,
) -> CancellationToken {
    let Some(external) = external else {
        return connection.scope().child_token();
    };

    let own = external.child_token();
    let connection_scope = connection.scope();
    let follower = own.clone();
    tokio::spawn(async move {
        select! {
            _ = connection_scope.cancelled() => follower.cancel(),
            _ = follower.cancelled() => {}
        }
    });
    own
}

/// A freshly prepared handle.
struct Session {
    handle: Arc<dyn TransportChannel>,
    parent_generation: u64,
    deliveries: Option<mpsc::UnboundedReceiver<RawDelivery>>,
}

struct Supervisor {
    channel: Channel,
    connection: Connection,
    recovery: Recovery,
    topology: Vec<TopologyEntry>,
    usage: Usage,
    processor: Option<Arc<dyn MessageProcessor>>,
    on_notify_publish: Option<CallbackNotifyPublish>,
    on_notify_return: Option<CallbackNotifyReturn>,
}

impl Supervisor {
    async fn run(mut self, mut unparked: mpsc::UnboundedReceiver<(u64, Confirmation)>) {
        let scope = self.channel.scope();
        let mut parent = self.connection.watch();

        'supervise: loop {
            self.set_state(LinkState::Connecting);

            let attached = select! {
                biased;
                _ = scope.cancelled() => break 'supervise,
                attached = wait_state(&mut parent, |link| link.is_up()) => attached,
            };
            if !attached {
                break 'supervise;
            }

            let opened = select! {
                biased;
                _ = scope.cancelled() => break 'supervise,
                opened = self.open() => opened,
            };

            match opened {
                Err((kind, err)) => {
                    if !self.recovery.down(kind, err) {
                        break 'supervise;
                    }
                }
                Ok(session) => {
                    let Session {
                        handle,
                        parent_generation,
                        mut deliveries,
                    } = session;
                    let mut closes = handle.notify_close();
                    let mut confirms = handle.notify_confirm();
                    let mut returns = handle.notify_return();

                    self.report_lost();
                    self.channel.inner.link.send_modify(|link| link.install(handle));
                    let generation = self.channel.generation();
                    if matches!(self.usage, Usage::Publisher(_)) {
                        self.channel.inner.confirming.store(true, Ordering::SeqCst);
                    }
                    self.recovery.up();

                    let mut batch = self.batch();
                    let err = loop {
                        let deadline = batch.deadline();
                        select! {
                            biased;
                            _ = scope.cancelled() => break 'supervise,
                            changed = parent.changed() => {
                                if changed.is_err() || !attached_to(&parent, parent_generation) {
                                    break AmqpError::TransportUnavailable(
                                        "connection went down".to_owned(),
                                    );
                                }
                            }
                            reason = closes.recv() => {
                                break match reason {
                                    Some(Some(reason)) => AmqpError::TransportUnavailable(reason),
                                    _ => AmqpError::ChannelClosed,
                                };
                            }
                            Some(confirmation) = confirms.recv() => self.on_confirm(confirmation),
                            Some((epoch, confirmation)) = unparked.recv() => {
                                let current = self.channel.ledger().epoch();
                                if epoch == current {
                                    self.on_confirm(confirmation);
                                }
                            }
                            Some(returned) = returns.recv() => self.on_return(&returned),
                            delivery = next_delivery(&mut deliveries) => match delivery {
                                Some(raw) => {
                                    self.channel
                                        .notifier()
                                        .notify(EventKind::MessageReceived, None);
                                    if batch.push(DeliveryData::new(raw, generation)) {
                                        self.dispatch(&mut batch, EventKind::DataExhausted).await;
                                    }
                                }
                                None => {
                                    break AmqpError::TransportUnavailable(
                                        "delivery stream ended".to_owned(),
                                    );
                                }
                            },
                            _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                                if deadline.is_some() =>
                            {
                                self.dispatch(&mut batch, EventKind::DataPartial).await;
                            }
                        }
                    };

                    if batch.len() > 0 {
                        debug!(
                            name = self.channel.name(),
                            count = batch.len(),
                            "dropping deliveries of a discarded handle"
                        );
                        batch.take();
                    }

                    self.channel.inner.confirming.store(false, Ordering::SeqCst);
                    let stale = discard(&self.channel.inner.link, LinkState::Down);
                    self.report_lost();
                    if let Some(stale) = stale {
                        self.close_handle(stale).await;
                    }

                    if !self.recovery.down(EventKind::Down, err) {
                        break 'supervise;
                    }
                }
            }

            self.set_state(LinkState::Recovering);
            if !self.recovery.recover(&scope).await {
                break 'supervise;
            }
        }

        self.shutdown().await;
    }

    async fn open(&self) -> Result<Session, (EventKind, AmqpError)> {
        let Some((connection, parent_generation)) = self.connection.current() else {
            return Err((
                EventKind::CannotEstablish,
                AmqpError::TransportUnavailable("connection is not up".to_owned()),
            ));
        };

        debug!(name = self.channel.name(), "creating amqp channel...");
        let handle = connection
            .open_channel()
            .await
            .map_err(|err| (EventKind::CannotEstablish, err))?;

        match self.prepare(&handle).await {
            Ok(deliveries) => {
                debug!(name = self.channel.name(), "channel created");
                Ok(Session {
                    handle,
                    parent_generation,
                    deliveries,
                })
            }
            Err(failure) => {
                self.close_handle(handle).await;
                Err(failure)
            }
        }
    }

    /// Reconciles the topology then applies the usage-specific setup.
    async fn prepare(
        &self,
        handle: &Arc<dyn TransportChannel>,
    ) -> Result<Option<mpsc::UnboundedReceiver<RawDelivery>>, (EventKind, AmqpError)> {
        topology::reconcile(&**handle, &self.topology)
            .await
            .map_err(|err| (EventKind::DefineTopology, err))?;

        match &self.usage {
            Usage::Plain => Ok(None),
            Usage::Publisher(options) => {
                handle
                    .confirm_select(options.confirmation_no_wait)
                    .await
                    .map_err(|err| (EventKind::Confirm, err))?;
                Ok(None)
            }
            Usage::Consumer(options) => {
                handle
                    .qos(options.prefetch_count, options.qos_global)
                    .await
                    .map_err(|err| (EventKind::Qos, err))?;
                let deliveries = handle
                    .consume(&options.consume_params())
                    .await
                    .map_err(|err| (EventKind::Consume, err))?;
                self.channel.notifier().notify(EventKind::Consume, None);
                Ok(Some(deliveries))
            }
        }
    }

    fn batch(&self) -> Batch {
        match &self.usage {
            Usage::Consumer(options) => {
                Batch::new(options.prefetch_count as usize, options.prefetch_timeout)
            }
            _ => Batch::new(1, Default::default()),
        }
    }

    /// Reports every publish still awaiting confirmation as lost and resets the ledger.
    fn report_lost(&self) {
        let lost = self.channel.ledger().drain();
        for sequence in lost {
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
        }
    }

    fn on_confirm(&self, confirmation: Confirmation) {
        let sequence = confirmation.sequence;
        let outcome = self.channel.ledger().confirm(confirmation);
        let notifier = self.channel.notifier();

        match outcome {
            ConfirmOutcome::Matched => {}
            ConfirmOutcome::OutOfOrder { expected } => {
                warn!(
                    name = self.channel.name(),
                    sequence,
                    expected,
                    "confirmation out of order"
                );
                notifier.notify(
                    EventKind::Confirm,
                    Some(AmqpError::ProtocolViolation(format!(
                        "confirmation {sequence} arrived before {expected}"
                    ))),
                );
            }
            ConfirmOutcome::Parked => {
                debug!(
                    name = self.channel.name(),
                    sequence,
                    "confirmation ahead of its publish"
                );
                return;
            }
            ConfirmOutcome::Unmatched => {
                warn!(name = self.channel.name(), sequence, "unmatched confirmation");
                notifier.notify(
                    EventKind::Confirm,
                    Some(AmqpError::ProtocolViolation(format!(
                        "confirmation {sequence} matches no pending publish"
                    ))),
                );
                return;
            }
        }

        if confirmation.ack {
            notifier.notify(EventKind::Confirm, None);
        } else {
            notifier.notify(
                EventKind::MessageReturned,
                Some(AmqpError::PublishNacked(sequence)),
            );
        }

        if let Some(notify) = &self.on_notify_publish {
            notify(confirmation, &self.channel);
        }
    }

    fn on_return(&self, returned: &ReturnedMessage) {
        warn!(
            name = self.channel.name(),
            exchange = returned.exchange,
            routing_key = returned.routing_key,
            reply_code = returned.reply_code,
            "message returned"
        );
        self.channel.notifier().notify(
            EventKind::MessageReturned,
            Some(AmqpError::MessageReturned(returned.reply_text.clone())),
        );

        if let Some(notify) = &self.on_notify_return {
            notify(returned, &self.channel);
        }
    }

    /// Hands the buffered deliveries to the processor.
    async fn dispatch(&self, batch: &mut Batch, kind: EventKind) {
        let messages = batch.take();
        let Usage::Consumer(options) = &self.usage else {
            return;
        };
        let Some(first) = messages.first() else {
            return;
        };
        let notifier = self.channel.notifier();

        let Some(processor) = &self.processor else {
            warn!(
                name = self.channel.name(),
                count = messages.len(),
                "no message processor configured, dropping deliveries"
            );
            notifier.notify(
                kind,
                Some(AmqpError::ConsumerError(
                    "no message processor configured".to_owned(),
                )),
            );
            return;
        };
        notifier.notify(kind, None);

        let properties = DeliveriesProperties {
            queue: options.queue.clone(),
            consumer_tag: options.consumer_tag.clone(),
            generation: first.tag.generation,
        };
        let tracer = global::tracer("amqp consumer");
        let (_ctx, mut span) =
            otel::new_span(&first.properties, &tracer, &options.consumer_tag);

        DISPATCHING
            .scope(
                self.channel.identity(),
                processor.process(&properties, messages, !options.auto_ack, &self.channel),
            )
            .await;

        span.end();
    }

    async fn close_handle(&self, handle: Arc<dyn TransportChannel>) {
        if handle.is_closed() {
            return;
        }
        if let Err(err) = handle.close().await {
            debug!(
                name = self.channel.name(),
                error = err.to_string(),
                "failure to close channel"
            );
        }
    }

    fn set_state(&self, state: LinkState) {
        self.channel.inner.link.send_modify(|link| link.state = state);
    }

    async fn shutdown(&mut self) {
        self.channel.inner.confirming.store(false, Ordering::SeqCst);
        let handle = discard(&self.channel.inner.link, LinkState::Down);
        self.report_lost();
        self.channel.inner.scope.cancel();

        if let Some(handle) = handle {
            self.close_handle(handle).await;
        }

        self.recovery.notifier().notify(EventKind::Closed, None);
        self.set_state(LinkState::Closed);
    }
}

/// True while the connection is up on the handle the channel was opened from.
fn attached_to(
    parent: &watch::Receiver<Link<dyn TransportConnection>>,
    generation: u64,
) -> bool {
    let link = parent.borrow();
    link.is_up() && link.generation == generation
}

async fn next_delivery(
    deliveries: &mut Option<mpsc::UnboundedReceiver<RawDelivery>>,
) -> Option<RawDelivery> {
    match deliveries {
        Some(deliveries) => deliveries.recv().await,
        None => future::pending().await,
    }
}
