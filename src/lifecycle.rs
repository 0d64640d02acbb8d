// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recovery State Machine
//!
//! Connections and channels share the same lifecycle:
//!
//! ```text
//! Connecting ──ok──► Up ──close──► Down ──► Recovering ──► Connecting
//!     │                              ▲            │
//!     └──fail (CannotEstablish)──────┘            └──stop──► Closed
//! ```
//!
//! `Closed` is terminal and reached on scope cancellation, on an error that no
//! retry can fix, or when a callback asks to stop. Within one supervisor, transitions and callback invocations are strictly
//! sequential.

use crate::{
    delay::DelayProvider,
    errors::AmqpError,
    event::{EventKind, Notifier},
};
use std::sync::Arc;
use tokio::{select, sync::watch, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Invoked when the entity goes down or cannot be established; `false` stops recovery.
pub type CallbackWhenDown = Arc<dyn Fn(&str, Option<&AmqpError>) -> bool + Send + Sync>;

/// Invoked after every successful (re)connect.
pub type CallbackWhenUp = Arc<dyn Fn(&str) + Send + Sync>;

/// Invoked after each backoff sleep with the retry counter; `false` stops recovery.
pub type CallbackWhenRecovering = Arc<dyn Fn(&str, u32) -> bool + Send + Sync>;

/// Current state of a supervised connection or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Up,
    Down,
    Recovering,
    Closed,
}

/// Published state of a supervisor: the state, the live handle and its generation.
///
/// The generation increases each time a fresh handle is installed, so a handle
/// reference taken earlier can be recognised as superseded.
pub(crate) struct Link<H: ?Sized> {
    pub(crate) state: LinkState,
    pub(crate) generation: u64,
    pub(crate) handle: Option<Arc<H>>,
}

impl<H: ?Sized> Link<H> {
    pub(crate) fn new() -> Link<H> {
        Link {
            state: LinkState::Connecting,
            generation: 0,
            handle: None,
        }
    }

    pub(crate) fn is_up(&self) -> bool {
        self.state == LinkState::Up && self.handle.is_some()
    }

    /// The live handle, when up.
    pub(crate) fn current(&self) -> Option<Arc<H>> {
        if self.state == LinkState::Up {
            self.handle.clone()
        } else {
            None
        }
    }

    pub(crate) fn install(&mut self, handle: Arc<H>) {
        self.generation += 1;
        self.handle = Some(handle);
        self.state = LinkState::Up;
    }

    /// Drops the handle and moves to `state`, returning the discarded handle.
    pub(crate) fn discard(&mut self, state: LinkState) -> Option<Arc<H>> {
        self.state = state;
        self.handle.take()
    }
}

/// Drops the published handle and moves to `state`, returning the old handle.
pub(crate) fn discard<H: ?Sized>(
    link: &watch::Sender<Link<H>>,
    state: LinkState,
) -> Option<Arc<H>> {
    let mut discarded = None;
    link.send_modify(|link| discarded = link.discard(state));
    discarded
}

/// Waits until the published link satisfies `accept`; `false` if the sender is gone.
pub(crate) async fn wait_state<H, F>(link: &mut watch::Receiver<Link<H>>, accept: F) -> bool
where
    H: ?Sized,
    F: Fn(&Link<H>) -> bool,
{
    loop {
        if accept(&link.borrow_and_update()) {
            return true;
        }
        if link.changed().await.is_err() {
            return false;
        }
    }
}

/// Caller hooks shared by connections and channels.
#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub(crate) on_down: Option<CallbackWhenDown>,
    pub(crate) on_up: Option<CallbackWhenUp>,
    pub(crate) on_recovering: Option<CallbackWhenRecovering>,
}

/// Retry bookkeeping and callback dispatch for one supervisor task.
pub(crate) struct Recovery {
    name: String,
    delayer: Arc<dyn DelayProvider>,
    callbacks: Callbacks,
    notifier: Notifier,
    retry: u32,
}

impl Recovery {
    pub(crate) fn new(
        name: &str,
        delayer: Arc<dyn DelayProvider>,
        callbacks: Callbacks,
        notifier: Notifier,
    ) -> Recovery {
        Recovery {
            name: name.to_owned(),
            delayer,
            callbacks,
            notifier,
            retry: 0,
        }
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Records a fresh `Up`: resets the retry counter and notifies.
    pub(crate) fn up(&mut self) {
        self.retry = 0;
        self.notifier.notify(EventKind::Up, None);
        if let Some(on_up) = &self.callbacks.on_up {
            on_up(&self.name);
        }
    }

    /// Records a failure; returns `false` when the caller asked to stop or the
    /// failure cannot be cured by retrying.
    pub(crate) fn down(&mut self, kind: EventKind, err: AmqpError) -> bool {
        debug!(
            name = self.name,
            error = err.to_string(),
            label = err.as_label(),
            "{kind}"
        );

        self.notifier.notify(kind, Some(err.clone()));

        let proceed = match &self.callbacks.on_down {
            Some(on_down) => on_down(&self.name, Some(&err)),
            None => true,
        };
        if !err.is_recoverable() {
            error!(
                name = self.name,
                error = err.to_string(),
                label = err.as_label(),
                "unrecoverable failure, giving up"
            );
            return false;
        }
        proceed
    }

    /// Sleeps for the backoff interval then consults the recovering callback.
    ///
    /// Returns `false` on cancellation or when the caller asked to stop.
    pub(crate) async fn recover(&mut self, scope: &CancellationToken) -> bool {
        let delay = self.delayer.delay(self.retry);
        debug!(name = self.name, retry = self.retry, "recovering in {:?}", delay);

        select! {
            biased;
            _ = scope.cancelled() => return false,
            _ = time::sleep(delay) => {}
        }

        let proceed = match &self.callbacks.on_recovering {
            Some(on_recovering) => on_recovering(&self.name, self.retry),
            None => true,
        };
        if !proceed {
            return false;
        }

        self.retry += 1;
        true
    }
}
