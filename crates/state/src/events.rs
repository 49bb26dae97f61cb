//! Event bus
//!
//! Single-process publish/subscribe used to push state changes to control
//! stream subscribers and the admin seam. Publishing never blocks: events
//! go through an unbounded queue into one dispatcher task, and a slow
//! subscriber with a full queue simply misses the event. That is
//! acceptable because every subscriber periodically reconciles through
//! `SyncClient`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

/// Per-subscriber queue depth.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 10;

/// Subscribing to this topic delivers every event.
pub const TOPIC_WILDCARD: &str = "*";

pub mod topics {
    pub const CLIENTS_CHANGED: &str = "clients/changed";
    pub const RADIOS_CHANGED: &str = "clients/radio/changed";
    pub const BANNED_CHANGED: &str = "clients/banned/changed";
    pub const SETTINGS_CHANGED: &str = "settings/changed";
    pub const COALITIONS_CHANGED: &str = "settings/coalitions/changed";
    pub const ADMIN_CHANGED: &str = "admin/changed";
    pub const NOTIFICATION: &str = "notification";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// A state-change notification. Events carry no snapshots; subscribers
/// read the current state when they handle one, so a dropped event can
/// never leave them with stale data longer than the next event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ClientsChanged,
    RadiosChanged,
    BannedChanged,
    SettingsChanged,
    CoalitionsChanged,
    AdminChanged,
    Notification {
        title: String,
        message: String,
        severity: Severity,
    },
}

impl Event {
    pub fn notification(title: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Event::Notification {
            title: title.into(),
            message: message.into(),
            severity,
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            Event::ClientsChanged => topics::CLIENTS_CHANGED,
            Event::RadiosChanged => topics::RADIOS_CHANGED,
            Event::BannedChanged => topics::BANNED_CHANGED,
            Event::SettingsChanged => topics::SETTINGS_CHANGED,
            Event::CoalitionsChanged => topics::COALITIONS_CHANGED,
            Event::AdminChanged => topics::ADMIN_CHANGED,
            Event::Notification { .. } => topics::NOTIFICATION,
        }
    }
}

struct Subscribers {
    by_topic: HashMap<String, Vec<mpsc::Sender<Event>>>,
}

/// The bus. Construct once with [`EventBus::new`] and share the `Arc`.
pub struct EventBus {
    subscribers: Mutex<Subscribers>,
    queue: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    /// Create the bus and spawn its dispatcher task. Must run inside a
    /// tokio runtime.
    pub fn new() -> Arc<Self> {
        let (queue, mut rx) = mpsc::unbounded_channel::<Event>();
        let bus = Arc::new(Self {
            subscribers: Mutex::new(Subscribers { by_topic: HashMap::new() }),
            queue,
        });

        let dispatcher = Arc::clone(&bus);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatcher.dispatch(event);
            }
        });

        bus
    }

    /// Subscribe to one topic (or [`TOPIC_WILDCARD`]). The returned queue
    /// holds at most [`SUBSCRIBER_QUEUE_CAPACITY`] events; overflow is
    /// dropped for this subscriber only.
    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.subscribers
            .lock()
            .unwrap()
            .by_topic
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Enqueue an event for dispatch. Never blocks.
    pub fn publish(&self, event: Event) {
        // Send only fails when the dispatcher is gone, i.e. at shutdown.
        let _ = self.queue.send(event);
    }

    fn dispatch(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap();
        let topic = event.topic();

        for key in [topic, TOPIC_WILDCARD] {
            if let Some(subs) = subscribers.by_topic.get_mut(key) {
                subs.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(topic, "subscriber queue full, dropping event");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
    }
}
