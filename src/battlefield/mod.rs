//! Battlefield broadcast layer
//!
//! Observers connect with an outbox, subscribe to encounters and receive
//! each delta serialized once and pushed without blocking. Subscriber and
//! encounter membership are mirrored maps guarded by one mutex together
//! with the outboxes.

mod messages;
mod snapshot;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::combat::{DeltaSink, StateDelta};

pub use messages::{ClientMessage, ServerMessage};
pub use snapshot::{BattlefieldState, EntitySnapshot, SnapshotSource};

/// Outbox capacity used by [`Battlefield::default`]
pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;

/// Pre-serialized frames queued for one observer
pub type Outbox = mpsc::Sender<Arc<str>>;

/// Opaque handle for a connected observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BattlefieldError {
    #[error("encounter not found: {0}")]
    EncounterNotFound(String),

    #[error("subscriber not connected: {0}")]
    UnknownSubscriber(SubscriberId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BattlefieldStats {
    /// Encounters with at least one subscriber
    pub watched_encounters: usize,
    /// Connected observers
    pub subscribers: usize,
    pub subscriptions: usize,
    pub frames_serialized: u64,
    pub frames_dropped: u64,
}

#[derive(Default)]
struct Subscriptions {
    by_encounter: HashMap<String, HashSet<SubscriberId>>,
    by_subscriber: HashMap<SubscriberId, HashSet<String>>,
    outboxes: HashMap<SubscriberId, Outbox>,
}

impl Subscriptions {
    fn unlink(&mut self, subscriber: SubscriberId, encounter_id: &str) -> bool {
        let removed = self
            .by_subscriber
            .get_mut(&subscriber)
            .is_some_and(|set| set.remove(encounter_id));
        if let Some(set) = self.by_encounter.get_mut(encounter_id) {
            set.remove(&subscriber);
            if set.is_empty() {
                self.by_encounter.remove(encounter_id);
            }
        }
        removed
    }

    fn drop_subscriber(&mut self, subscriber: SubscriberId) -> usize {
        self.outboxes.remove(&subscriber);
        let encounters = self.by_subscriber.remove(&subscriber).unwrap_or_default();
        for encounter_id in &encounters {
            if let Some(set) = self.by_encounter.get_mut(encounter_id) {
                set.remove(&subscriber);
                if set.is_empty() {
                    self.by_encounter.remove(encounter_id);
                }
            }
        }
        encounters.len()
    }
}

/// Subscriber registry and delta fan-out
pub struct Battlefield {
    inner: Mutex<Subscriptions>,
    outbox_capacity: usize,
    frames_serialized: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Default for Battlefield {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}

impl Battlefield {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Subscriptions::default()),
            outbox_capacity: outbox_capacity.max(1),
            frames_serialized: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Register an observer's outbox
    pub fn connect(&self, outbox: Outbox) -> SubscriberId {
        let id = SubscriberId::new();
        let mut inner = self.inner.lock();
        inner.outboxes.insert(id, outbox);
        inner.by_subscriber.insert(id, HashSet::new());
        debug!("Observer {} connected", id);
        id
    }

    /// Create an outbox of the configured capacity and register it
    pub fn open(&self) -> (SubscriberId, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        (self.connect(tx), rx)
    }

    /// Watch an encounter and queue a fresh snapshot
    ///
    /// Subscribing twice keeps a single membership but still sends a new
    /// snapshot. Unknown encounters leave no trace. Membership is recorded
    /// while the source holds the encounter, so the snapshot is followed by
    /// exactly the deltas applied after it.
    pub fn subscribe(
        &self,
        subscriber: SubscriberId,
        encounter_id: &str,
        source: &dyn SnapshotSource,
    ) -> Result<BattlefieldState, BattlefieldError> {
        if !self.inner.lock().outboxes.contains_key(&subscriber) {
            return Err(BattlefieldError::UnknownSubscriber(subscriber));
        }

        // Encounter lock first, then ours: the order deltas are published in
        let mut attached = None;
        let found = source.attach_snapshot(encounter_id, &mut |state: BattlefieldState| {
            let mut inner = self.inner.lock();
            if !inner.outboxes.contains_key(&subscriber) {
                return;
            }
            inner
                .by_encounter
                .entry(encounter_id.to_string())
                .or_default()
                .insert(subscriber);
            inner
                .by_subscriber
                .entry(subscriber)
                .or_default()
                .insert(encounter_id.to_string());

            let message = ServerMessage::Subscribed {
                encounter_id: encounter_id.to_string(),
                state: state.clone(),
            };
            self.enqueue(&inner, subscriber, &message);
            attached = Some(state);
        });
        if !found {
            return Err(BattlefieldError::EncounterNotFound(encounter_id.to_string()));
        }
        let state = attached.ok_or(BattlefieldError::UnknownSubscriber(subscriber))?;

        debug!("Observer {} subscribed to {}", subscriber, encounter_id);
        Ok(state)
    }

    /// Stop watching one encounter; returns whether a membership existed
    pub fn unsubscribe(&self, subscriber: SubscriberId, encounter_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.unlink(subscriber, encounter_id);
        let message = ServerMessage::Unsubscribed {
            encounter_id: encounter_id.to_string(),
        };
        self.enqueue(&inner, subscriber, &message);
        removed
    }

    /// Forget an observer entirely; returns the memberships removed
    pub fn unsubscribe_all(&self, subscriber: SubscriberId) -> usize {
        let removed = self.inner.lock().drop_subscriber(subscriber);
        debug!(
            "Observer {} disconnected ({} subscriptions dropped)",
            subscriber, removed
        );
        removed
    }

    /// Queue a message for one observer
    pub fn send_to(&self, subscriber: SubscriberId, message: &ServerMessage) -> bool {
        let inner = self.inner.lock();
        self.enqueue(&inner, subscriber, message)
    }

    fn enqueue(
        &self,
        inner: &Subscriptions,
        subscriber: SubscriberId,
        message: &ServerMessage,
    ) -> bool {
        let Some(outbox) = inner.outboxes.get(&subscriber) else {
            return false;
        };
        match serde_json::to_string(message) {
            Ok(json) => {
                self.frames_serialized.fetch_add(1, Ordering::Relaxed);
                self.deliver(outbox, subscriber, json.into())
            }
            Err(e) => {
                warn!("Failed to serialize message for {}: {}", subscriber, e);
                false
            }
        }
    }

    fn deliver(&self, outbox: &Outbox, subscriber: SubscriberId, frame: Arc<str>) -> bool {
        match outbox.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Outbox full for observer {}, frame dropped", subscriber);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Push a delta to every subscriber of an encounter
    ///
    /// Serializes at most once. Full or closed outboxes are skipped.
    /// Returns the number of outboxes that accepted the frame.
    pub fn broadcast(&self, encounter_id: &str, delta: &StateDelta) -> usize {
        let inner = self.inner.lock();
        let Some(subscribers) = inner.by_encounter.get(encounter_id) else {
            return 0;
        };
        if subscribers.is_empty() {
            return 0;
        }

        let message = ServerMessage::Delta {
            encounter_id: encounter_id.to_string(),
            delta: delta.clone(),
        };
        let frame: Arc<str> = match serde_json::to_string(&message) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!("Failed to serialize delta for {}: {}", encounter_id, e);
                return 0;
            }
        };
        self.frames_serialized.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        for subscriber in subscribers {
            if let Some(outbox) = inner.outboxes.get(subscriber) {
                if self.deliver(outbox, *subscriber, frame.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn is_subscribed(&self, subscriber: SubscriberId, encounter_id: &str) -> bool {
        self.inner
            .lock()
            .by_encounter
            .get(encounter_id)
            .is_some_and(|set| set.contains(&subscriber))
    }

    pub fn stats(&self) -> BattlefieldStats {
        let inner = self.inner.lock();
        BattlefieldStats {
            watched_encounters: inner.by_encounter.len(),
            subscribers: inner.outboxes.len(),
            subscriptions: inner.by_subscriber.values().map(|s| s.len()).sum(),
            frames_serialized: self.frames_serialized.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl DeltaSink for Battlefield {
    fn publish(&self, encounter_id: &str, delta: &StateDelta) {
        self.broadcast(encounter_id, delta);
    }
}
