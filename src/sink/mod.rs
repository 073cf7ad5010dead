//! Notification sink: where change events leave the core.
//!
//! The core hands over `(kind, payload)` and does not care what happens next;
//! formatting for humans belongs to whoever drains the sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LongTermLeaderChanged,
    ShortTermLeaderChanged,
    NewListingItem,
    CitizenCacheRefreshed,
    ScoreSweepCompleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,
    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: Event) -> Result<(), SinkError>;
}

/// Production sink: forwards into an unbounded channel drained by the main loop.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn notify(&self, event: Event) -> Result<(), SinkError> {
        self.tx.send(event).map_err(|_| SinkError::Closed)
    }
}

/// Collects events in memory. `failing()` builds one that rejects every
/// event, for exercising delivery-failure paths.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
    fail: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }

    pub fn take(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn notify(&self, event: Event) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Delivery(format!("{:?} rejected", event.kind)));
        }
        self.events
            .lock()
            .map_err(|_| SinkError::Delivery("poisoned".to_string()))?
            .push(event);
        Ok(())
    }
}
