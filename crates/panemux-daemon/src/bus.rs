//! In-process pub/sub fanning state events out to connected panels.
//!
//! Subscribers hand the bus a bounded channel. Delivery is non-blocking and
//! happens outside the bus mutex; a full channel costs that subscriber the
//! event, never the publisher its progress.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use panemux_core::event::SYSTEM_SOURCE;
use panemux_core::{PanelConnectionPayload, StateEvent, StateEventType};

/// Metadata the bus keeps per subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberInfo {
    pub panel_id: String,
    pub panel_type: String,
    pub connected_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub event_count: u64,
}

struct Subscriber {
    sender: mpsc::Sender<StateEvent>,
    info: SubscriberInfo,
}

struct BusInner {
    subscribers: HashMap<String, Subscriber>,
    history: VecDeque<StateEvent>,
}

/// Event distribution hub. One per daemon.
pub struct EventBus {
    inner: Mutex<BusInner>,
    history_depth: usize,
}

impl EventBus {
    pub fn new(history_depth: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                subscribers: HashMap::new(),
                history: VecDeque::with_capacity(history_depth),
            }),
            history_depth,
        }
    }

    /// Register a panel. Synthesizes a `panel_connected` event for everyone
    /// else, with source `"system"`.
    pub fn subscribe(
        &self,
        panel_id: &str,
        panel_type: &str,
        sender: mpsc::Sender<StateEvent>,
    ) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.subscribers.insert(
                panel_id.to_string(),
                Subscriber {
                    sender,
                    info: SubscriberInfo {
                        panel_id: panel_id.to_string(),
                        panel_type: panel_type.to_string(),
                        connected_at: Utc::now(),
                        last_event_at: None,
                        event_count: 0,
                    },
                },
            );
        }
        info!(panel_id, panel_type, "panel subscribed to events");

        let payload = PanelConnectionPayload {
            panel_id: panel_id.to_string(),
            panel_type: panel_type.to_string(),
        };
        let event = StateEvent::new(
            StateEventType::PanelConnected,
            serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null),
            0,
            SYSTEM_SOURCE,
        );
        self.deliver(event, Some(panel_id), None);
    }

    /// Remove a panel. Synthesizes a `panel_disconnected` event for the rest.
    pub fn unsubscribe(&self, panel_id: &str) {
        let removed = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.subscribers.remove(panel_id)
        };
        let Some(subscriber) = removed else { return };
        info!(
            panel_id,
            panel_type = %subscriber.info.panel_type,
            "panel unsubscribed from events"
        );

        let payload = PanelConnectionPayload {
            panel_id: panel_id.to_string(),
            panel_type: subscriber.info.panel_type.clone(),
        };
        let event = StateEvent::new(
            StateEventType::PanelDisconnected,
            serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null),
            0,
            SYSTEM_SOURCE,
        );
        self.deliver(event, Some(panel_id), None);
    }

    /// Send an event to every subscriber except its source panel.
    pub fn broadcast(&self, event: StateEvent) {
        let exclude = event.source_panel.clone();
        self.deliver(event, Some(&exclude), None);
    }

    /// Send an event to exactly one subscriber.
    pub fn broadcast_to_panel(&self, event: StateEvent, target: &str) {
        self.deliver(event, None, Some(target));
    }

    /// Current subscriber metadata.
    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.values().map(|s| s.info.clone()).collect()
    }

    /// The most recent `max_events` events, oldest first.
    pub fn history(&self, max_events: usize) -> Vec<StateEvent> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let len = inner.history.len();
        let take = if max_events == 0 || max_events > len {
            len
        } else {
            max_events
        };
        inner.history.iter().skip(len - take).cloned().collect()
    }

    /// Record the event, pick the recipients under the mutex, then deliver
    /// with `try_send` outside it.
    fn deliver(&self, event: StateEvent, exclude: Option<&str>, only: Option<&str>) {
        let recipients: Vec<(String, mpsc::Sender<StateEvent>)> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            inner.history.push_back(event.clone());
            while inner.history.len() > self.history_depth {
                inner.history.pop_front();
            }

            let now = Utc::now();
            inner
                .subscribers
                .iter_mut()
                .filter(|(id, _)| match (exclude, only) {
                    (_, Some(target)) => id.as_str() == target,
                    (Some(source), None) => id.as_str() != source,
                    (None, None) => true,
                })
                .map(|(id, sub)| {
                    sub.info.last_event_at = Some(now);
                    sub.info.event_count += 1;
                    (id.clone(), sub.sender.clone())
                })
                .collect()
        };

        for (panel_id, sender) in recipients {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        panel_id,
                        event_type = ?event.event_type,
                        "subscriber channel full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(panel_id, "subscriber channel closed");
                }
            }
        }
    }
}
