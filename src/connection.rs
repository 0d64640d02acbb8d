// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! A [`Connection`] owns one transport connection at a time and keeps it alive:
//! every unsolicited close is followed by a backoff sleep and a fresh connection
//! attempt, with credentials fetched anew from the secret provider. The old handle
//! is discarded entirely and never reused.
//!
//! The connection's cancellation scope is the root for every channel derived from
//! it. Cancelling it (or calling [`Connection::close`]) closes the transport and,
//! through the scope tree, every dependent channel.

use crate::{
    amqp::LapinTransport,
    config::AmqpConfigs,
    delay::{DelayProvider, FixedDelay},
    errors::AmqpError,
    event::{Event, EventKind, EventObserver, EventSink, Notifier, SourceType},
    lifecycle::{
        discard, wait_state, CallbackWhenDown, CallbackWhenRecovering, CallbackWhenUp,
        Callbacks, Link, LinkState, Recovery,
    },
    secret::SecretProvider,
    transport::{ConnectionSignal, Credentials, Transport, TransportConnection},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{select, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Default connection name.
pub const DEFAULT_CONNECTION_NAME: &str = "default.connection";

/// Configuration options of a [`Connection`].
#[derive(Clone)]
pub struct ConnectionOptions {
    pub(crate) name: String,
    pub(crate) secret: Option<Arc<dyn SecretProvider>>,
    pub(crate) delayer: Arc<dyn DelayProvider>,
    pub(crate) callbacks: Callbacks,
    pub(crate) scope: Option<CancellationToken>,
    pub(crate) sink: Option<EventSink>,
    pub(crate) observer: Option<EventObserver>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            name: DEFAULT_CONNECTION_NAME.to_owned(),
            secret: None,
            delayer: Arc::new(FixedDelay::default()),
            callbacks: Callbacks::default(),
            scope: None,
            sink: None,
            observer: None,
        }
    }
}

impl ConnectionOptions {
    /// Assigns a tag to this connection.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    /// Provides password refresh capabilities; queried before every attempt.
    pub fn with_secret(mut self, secret: impl SecretProvider + 'static) -> Self {
        self.secret = Some(Arc::new(secret));
        self
    }

    /// Wait policy between reconnection attempts.
    pub fn with_delay(mut self, delayer: impl DelayProvider + 'static) -> Self {
        self.delayer = Arc::new(delayer);
        self
    }

    /// Parent scope. Cancelling it closes the connection and its channels;
    /// closing the connection never cancels the parent.
    pub fn with_scope(mut self, scope: CancellationToken) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Bounded sink receiving connection events; full sinks drop events.
    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Synchronous observer called with every event, before the sink.
    pub fn on_event(mut self, observer: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Called when the connection goes down or cannot be established; `false`
    /// closes it.
    pub fn on_down(
        mut self,
        down: impl Fn(&str, Option<&AmqpError>) -> bool + Send + Sync + 'static,
    ) -> Self {
        let down: CallbackWhenDown = Arc::new(down);
        self.callbacks.on_down = Some(down);
        self
    }

    /// Called after every successful (re)connect.
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
}

struct ConnectionInner {
    name: String,
    scope: CancellationToken,
    link: watch::Sender<Link<dyn TransportConnection>>,
    blocked: AtomicBool,
}

/// A self-healing AMQP connection.
///
/// Cloning is cheap; every clone refers to the same supervised connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Creates the connection and starts its supervising task.
    ///
    /// Must be called from within a tokio runtime. The first connection attempt
    /// happens in the background; use the event sink or [`Connection::is_closed`]
    /// to observe its outcome.
    pub fn new(
        transport: Arc<dyn Transport>,
        address: &str,
        options: ConnectionOptions,
    ) -> Connection {
        let scope = match &options.scope {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let (link, _) = watch::channel(Link::new());

        let inner = Arc::new(ConnectionInner {
            name: options.name.clone(),
            scope,
            link,
            blocked: AtomicBool::new(false),
        });

        let notifier = Notifier::new(
            SourceType::Connection,
            &options.name,
            options.sink.clone(),
            options.observer.clone(),
        );
        let recovery = Recovery::new(
            &options.name,
            options.delayer.clone(),
            options.callbacks.clone(),
            notifier,
        );

        let supervisor = Supervisor {
            inner: inner.clone(),
            transport,
            address: address.to_owned(),
            secret: options.secret,
            recovery,
        };
        tokio::spawn(supervisor.run());

        Connection { inner }
    }

    /// Creates a connection backed by lapin, from the crate configuration.
    pub fn from_configs(cfg: &AmqpConfigs, options: ConnectionOptions) -> Connection {
        let transport = Arc::new(LapinTransport::from_configs(cfg));
        Connection::new(transport, &cfg.uri(), options)
    }

    /// The connection's tag.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current supervisor state.
    pub fn state(&self) -> LinkState {
        self.inner.link.borrow().state
    }

    /// True unless the connection is currently up.
    pub fn is_closed(&self) -> bool {
        !self.inner.link.borrow().is_up()
    }

    /// True while the broker has blocked this connection.
    pub fn is_blocked(&self) -> bool {
        self.inner.blocked.load(Ordering::SeqCst)
    }

    /// The scope channels derive their own scopes from.
    pub fn scope(&self) -> CancellationToken {
        self.inner.scope.clone()
    }

    /// Closes the connection for good and waits for the supervisor to finish.
    ///
    /// Closing an already closed connection is not an error.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner.scope.cancel();

        let mut link = self.inner.link.subscribe();
        if !wait_state(&mut link, |link| link.state == LinkState::Closed).await {
            error!(name = self.inner.name, "connection supervisor vanished");
            return Err(AmqpError::InternalError);
        }
        Ok(())
    }

    /// Parks until the connection's scope is cancelled.
    pub async fn wait(&self) {
        self.inner.scope.cancelled().await
    }

    /// The live transport handle and its generation, when up.
    pub(crate) fn current(&self) -> Option<(Arc<dyn TransportConnection>, u64)> {
        let link = self.inner.link.borrow();
        link.current().map(|handle| (handle, link.generation))
    }

    pub(crate) fn watch(&self) -> watch::Receiver<Link<dyn TransportConnection>> {
        self.inner.link.subscribe()
    }
}

struct Supervisor {
    inner: Arc<ConnectionInner>,
    transport: Arc<dyn Transport>,
    address: String,
    secret: Option<Arc<dyn SecretProvider>>,
    recovery: Recovery,
}

impl Supervisor {
    async fn run(mut self) {
        let scope = self.inner.scope.clone();

        'supervise: loop {
            self.set_state(LinkState::Connecting);

            let opened = select! {
                biased;
                _ = scope.cancelled() => break 'supervise,
                opened = self.open() => opened,
            };

            match opened {
                Err(err) => {
                    if !self.recovery.down(EventKind::CannotEstablish, err) {
                        break 'supervise;
                    }
                }
                Ok(handle) => {
                    let mut signals = handle.subscribe();
                    self.inner.link.send_modify(|link| link.install(handle));
                    self.recovery.up();

                    let err = loop {
                        select! {
                            biased;
                            _ = scope.cancelled() => break 'supervise,
                            signal = signals.recv() => match signal {
                                Some(ConnectionSignal::Blocked(reason)) => {
                                    warn!(name = self.inner.name, reason, "connection blocked");
                                    self.inner.blocked.store(true, Ordering::SeqCst);
                                    self.recovery.notifier().notify(EventKind::Blocked, None);
                                }
                                Some(ConnectionSignal::Unblocked) => {
                                    self.inner.blocked.store(false, Ordering::SeqCst);
                                    self.recovery.notifier().notify(EventKind::Unblocked, None);
                                }
                                Some(ConnectionSignal::Closed(reason)) => {
                                    break AmqpError::TransportUnavailable(
                                        reason.unwrap_or_else(|| "closed by the broker".to_owned()),
                                    );
                                }
                                None => {
                                    break AmqpError::TransportUnavailable(
                                        "close notification stream ended".to_owned(),
                                    );
                                }
                            },
                        }
                    };

                    self.inner.blocked.store(false, Ordering::SeqCst);
                    discard(&self.inner.link, LinkState::Down);

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

    async fn open(&self) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        let credentials = match &self.secret {
            Some(secret) => Some(Credentials {
                password: secret.password()?,
            }),
            None => None,
        };

        debug!(name = self.inner.name, "creating amqp connection...");
        let handle = self.transport.connect(&self.address, credentials).await?;
        debug!(name = self.inner.name, "amqp connected");

        Ok(handle)
    }

    fn set_state(&self, state: LinkState) {
        self.inner.link.send_modify(|link| link.state = state);
    }

    async fn shutdown(&mut self) {
        let handle = discard(&self.inner.link, LinkState::Down);
        self.inner.scope.cancel();

        if let Some(handle) = handle {
            if !handle.is_closed() {
                if let Err(err) = handle.close().await {
                    debug!(
                        name = self.inner.name,
                        error = err.to_string(),
                        "failure to close connection"
                    );
                }
            }
        }

        self.recovery.notifier().notify(EventKind::Closed, None);
        self.set_state(LinkState::Closed);
    }
}
