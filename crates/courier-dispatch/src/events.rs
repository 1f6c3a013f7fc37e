//! Lifecycle event fan-out.
//!
//! Each owner gets a broadcast topic. Publishing never blocks: a subscriber
//! that falls more than `subscriber_buffer` events behind loses the oldest
//! ones and is told how many it missed.

use std::fmt;

use chrono::{DateTime, Utc};
use courier_store::{OwnerId, Platform, PostId, PostState};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Scheduled,
    Dispatching,
    AttemptSucceeded,
    AttemptFailed,
    AttemptExhausted,
    PostPosted,
    PostPartiallyFailed,
    PostFailed,
    PostCancelled,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::Scheduled => "scheduled",
            EventKind::Dispatching => "dispatching",
            EventKind::AttemptSucceeded => "attempt_succeeded",
            EventKind::AttemptFailed => "attempt_failed",
            EventKind::AttemptExhausted => "attempt_exhausted",
            EventKind::PostPosted => "post_posted",
            EventKind::PostPartiallyFailed => "post_partially_failed",
            EventKind::PostFailed => "post_failed",
            EventKind::PostCancelled => "post_cancelled",
        }
    }

    /// Whether this event ends the post's lifecycle.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::PostPosted
                | EventKind::PostPartiallyFailed
                | EventKind::PostFailed
                | EventKind::PostCancelled
        )
    }

    pub const fn is_attempt(self) -> bool {
        matches!(
            self,
            EventKind::AttemptSucceeded | EventKind::AttemptFailed | EventKind::AttemptExhausted
        )
    }

    /// The event announcing a terminal post state.
    pub const fn for_post_state(state: PostState) -> Option<EventKind> {
        match state {
            PostState::Posted => Some(EventKind::PostPosted),
            PostState::PartiallyFailed => Some(EventKind::PostPartiallyFailed),
            PostState::Failed => Some(EventKind::PostFailed),
            PostState::Cancelled => Some(EventKind::PostCancelled),
            PostState::Scheduled | PostState::Dispatching => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change in a post's lifecycle, delivered to the post owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub owner_id: OwnerId,
    pub post_id: PostId,
    /// Set on attempt-level events.
    pub platform: Option<Platform>,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn post(
        kind: EventKind,
        owner_id: OwnerId,
        post_id: PostId,
        payload: serde_json::Value,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            owner_id,
            post_id,
            platform: None,
            payload,
            ts,
        }
    }

    pub fn attempt(
        kind: EventKind,
        owner_id: OwnerId,
        post_id: PostId,
        platform: Platform,
        payload: serde_json::Value,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            owner_id,
            post_id,
            platform: Some(platform),
            payload,
            ts,
        }
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(LifecycleEvent),
    /// This many events were dropped because the subscriber fell behind.
    Lagged(u64),
}

/// Per-owner broadcast topics.
pub struct EventHub {
    topics: DashMap<OwnerId, broadcast::Sender<LifecycleEvent>>,
    buffer: usize,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            topics: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Deliver to every current subscriber of the event's owner. Never blocks.
    pub fn publish(&self, event: LifecycleEvent) {
        let owner_id = event.owner_id;
        let Some(sender) = self.topics.get(&owner_id).map(|s| s.clone()) else {
            trace!(owner_id = %owner_id, kind = %event.kind, "no subscribers");
            return;
        };
        if sender.send(event).is_err() {
            // Every subscriber went away.
            self.topics
                .remove_if(&owner_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    pub fn subscribe(&self, owner_id: OwnerId) -> Subscription {
        let rx = self
            .topics
            .entry(owner_id)
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .subscribe();
        Subscription { owner_id, rx }
    }

    /// Owners with at least one live topic.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

/// A live event feed for one owner. Dropping it unsubscribes.
pub struct Subscription {
    owner_id: OwnerId,
    rx: broadcast::Receiver<LifecycleEvent>,
}

impl Subscription {
    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    /// Wait for the next delivery. `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        match self.rx.recv().await {
            Ok(event) => Some(Delivery::Event(event)),
            Err(RecvError::Lagged(n)) => Some(Delivery::Lagged(n)),
            Err(RecvError::Closed) => None,
        }
    }

    /// Next delivery if one is buffered.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        match self.rx.try_recv() {
            Ok(event) => Some(Delivery::Event(event)),
            Err(TryRecvError::Lagged(n)) => Some(Delivery::Lagged(n)),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }

    /// Drain everything buffered right now.
    pub fn drain(&mut self) -> Vec<Delivery> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn into_stream(self) -> impl Stream<Item = Delivery> {
        BroadcastStream::new(self.rx).map(|result| match result {
            Ok(event) => Delivery::Event(event),
            Err(BroadcastStreamRecvError::Lagged(n)) => Delivery::Lagged(n),
        })
    }
}
