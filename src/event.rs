// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle and Delivery Events
//!
//! Supervisors report every state transition, and publishers/consumers report every
//! delivery-related outcome, as an [`Event`] sent to an optional caller-owned sink.
//!
//! The sink is a bounded [`tokio::sync::mpsc`] channel and delivery is best-effort:
//! events are sent with `try_send`, so a full sink drops the event instead of
//! stalling the recovery loop. Callers that need every event must size the sink
//! generously or drain it promptly. The sink is never closed by this crate.

use crate::errors::AmqpError;
use std::{
    fmt,
    sync::Arc,
    time::SystemTime,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Classification of emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Up,
    Down,
    CannotEstablish,
    Blocked,
    Unblocked,
    Closed,
    MessageReceived,
    MessagePublished,
    MessageReturned,
    Confirm,
    Qos,
    Consume,
    DefineTopology,
    DataExhausted,
    DataPartial,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Up => "Up",
            EventKind::Down => "Down",
            EventKind::CannotEstablish => "CannotEstablish",
            EventKind::Blocked => "Blocked",
            EventKind::Unblocked => "Unblocked",
            EventKind::Closed => "Closed",
            EventKind::MessageReceived => "MessageReceived",
            EventKind::MessagePublished => "MessagePublished",
            EventKind::MessageReturned => "MessageReturned",
            EventKind::Confirm => "Confirm",
            EventKind::Qos => "Qos",
            EventKind::Consume => "Consume",
            EventKind::DefineTopology => "DefineTopology",
            EventKind::DataExhausted => "DataExhausted",
            EventKind::DataPartial => "DataPartial",
        };
        f.write_str(name)
    }
}

/// The kind of entity that emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Connection,
    Channel,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Connection => f.write_str("connection"),
            SourceType::Channel => f.write_str("channel"),
        }
    }
}

/// An immutable event record. Ownership moves to the sink on send.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub at: SystemTime,
    pub source: SourceType,
    pub name: String,
    pub kind: EventKind,
    pub error: Option<AmqpError>,
}

impl Event {
    pub fn new(source: SourceType, name: &str, kind: EventKind) -> Event {
        Event {
            at: SystemTime::now(),
            source,
            name: name.to_owned(),
            kind,
            error: None,
        }
    }

    pub fn with_error(mut self, error: AmqpError) -> Self {
        self.error = Some(error);
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(err) => write!(f, "{}[{}]: {} ({err})", self.source, self.name, self.kind),
            None => write!(f, "{}[{}]: {}", self.source, self.name, self.kind),
        }
    }
}

/// Caller-owned bounded receiver of events.
pub type EventSink = mpsc::Sender<Event>;

/// Synchronous observer invoked for every event before it reaches the sink.
pub type EventObserver = Arc<dyn Fn(&Event) + Send + Sync>;

/// Fans events out to the optional observer and sink of one entity.
#[derive(Clone)]
pub(crate) struct Notifier {
    source: SourceType,
    name: String,
    sink: Option<EventSink>,
    observer: Option<EventObserver>,
}

impl Notifier {
    pub(crate) fn new(
        source: SourceType,
        name: &str,
        sink: Option<EventSink>,
        observer: Option<EventObserver>,
    ) -> Notifier {
        Notifier {
            source,
            name: name.to_owned(),
            sink,
            observer,
        }
    }

    pub(crate) fn notify(&self, kind: EventKind, error: Option<AmqpError>) {
        let mut event = Event::new(self.source, &self.name, kind);
        event.error = error;

        debug!(name = self.name, source = %self.source, kind = %kind, "{}", event);

        if let Some(observer) = &self.observer {
            observer(&event);
        }

        let Some(sink) = &self.sink else {
            return;
        };

        match sink.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(name = self.name, kind = %event.kind, "event sink is full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(name = self.name, "event sink is closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_kind_display_is_stable() {
        assert_eq!(EventKind::CannotEstablish.to_string(), "CannotEstablish");
        assert_eq!(EventKind::DataPartial.to_string(), "DataPartial");
        assert_eq!(EventKind::Unblocked.to_string(), "Unblocked");
    }

    #[test]
    fn test_event_display_includes_error() {
        let event = Event::new(SourceType::Channel, "chan.main", EventKind::Down)
            .with_error(AmqpError::ChannelClosed);
        assert_eq!(event.to_string(), "channel[chan.main]: Down (channel closed)");
    }

    #[tokio::test]
    async fn test_full_sink_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let notifier = Notifier::new(SourceType::Connection, "conn", Some(tx), None);

        notifier.notify(EventKind::Up, None);
        notifier.notify(EventKind::Down, Some(AmqpError::ConnectionError));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Up);
        assert_eq!(first.name, "conn");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_observer_sees_every_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer: EventObserver = {
            let seen = seen.clone();
            Arc::new(move |event: &Event| seen.lock().unwrap().push(event.kind))
        };
        let notifier = Notifier::new(SourceType::Channel, "chan", None, Some(observer));

        notifier.notify(EventKind::Up, None);
        notifier.notify(EventKind::Closed, None);

        assert_eq!(*seen.lock().unwrap(), vec![EventKind::Up, EventKind::Closed]);
    }

    #[test]
    fn test_closed_sink_is_ignored() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let notifier = Notifier::new(SourceType::Channel, "chan", Some(tx), None);
        notifier.notify(EventKind::Up, None);
    }
}
