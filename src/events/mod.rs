//! Change-notification fan-out.
//!
//! Every committed phase transition produces a [`PhaseChange`] pushed to two
//! sinks: the in-process change queue consumed by the coordinator's event
//! loop, and the broadcast channel serving subscribed clients. Notifications
//! carry only `{phase_id, status}` — subscribers re-read authoritative state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{Notify, broadcast};

use crate::store::models::{Feature, Phase, PhaseStatus, QueueCounts};

/// Queue length at which same-phase coalescing starts.
const SOFT_CAP: usize = 256;
/// Queue length past which producers block until the consumer drains.
const HARD_CAP: usize = 4096;
/// Broadcast buffer for client fan-out; slow clients lag and resync.
pub const UI_CHANNEL_CAPACITY: usize = 256;

/// Minimal notification: `{phase_id, status}` only, never payloads, so
/// consumers re-read authoritative state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseChange {
    pub phase_id: String,
    pub status: PhaseStatus,
}

impl PhaseChange {
    pub fn of(phase: &Phase) -> Self {
        Self {
            phase_id: phase.phase_id.clone(),
            status: phase.status,
        }
    }
}

// ── Internal change queue ─────────────────────────────────────────────

/// Bounded, order-preserving queue feeding the coordinator.
///
/// Past the soft cap, a new event for a phase already enqueued replaces the
/// older entry in place (latest wins); events for distinct phases are never
/// dropped. Past the hard cap the producer awaits the consumer, applying
/// backpressure to store commits.
pub struct ChangeQueue {
    inner: Mutex<VecDeque<PhaseChange>>,
    items: Notify,
    space: Notify,
}

impl Default for ChangeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    pub async fn push(&self, change: PhaseChange) {
        loop {
            {
                let mut queue = self.inner.lock().expect("change queue poisoned");
                if queue.len() < SOFT_CAP {
                    queue.push_back(change);
                    self.items.notify_one();
                    return;
                }
                if let Some(existing) =
                    queue.iter_mut().find(|c| c.phase_id == change.phase_id)
                {
                    *existing = change;
                    self.items.notify_one();
                    return;
                }
                if queue.len() < HARD_CAP {
                    queue.push_back(change);
                    self.items.notify_one();
                    return;
                }
            }
            self.space.notified().await;
        }
    }

    pub async fn recv(&self) -> PhaseChange {
        loop {
            let notified = self.items.notified();
            let popped = {
                let mut queue = self.inner.lock().expect("change queue poisoned");
                queue.pop_front()
            };
            if let Some(change) = popped {
                self.space.notify_one();
                return change;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("change queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Client-facing events ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum UiEvent {
    PhaseUpdate { phase: Phase },
    FeatureUpdate { feature: Feature },
    QueueUpdate { counts: QueueCounts, active: Vec<Phase> },
    SystemStatus {
        paused: bool,
        max_concurrent: i64,
        counts: QueueCounts,
    },
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    event: &'a UiEvent,
    timestamp: String,
}

/// Serialize an event into the `{type, data, timestamp}` envelope.
pub fn envelope_json(event: &UiEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope {
        event,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

// ── Bus ───────────────────────────────────────────────────────────────

/// Owns both sinks. Cheap to clone; all clones share the same channels.
#[derive(Clone)]
pub struct EventBus {
    changes: Arc<ChangeQueue>,
    ui_tx: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (ui_tx, _) = broadcast::channel(UI_CHANNEL_CAPACITY);
        Self {
            changes: Arc::new(ChangeQueue::new()),
            ui_tx,
        }
    }

    pub fn changes(&self) -> &ChangeQueue {
        &self.changes
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.ui_tx.subscribe()
    }

    /// Notify both sinks of a committed phase transition.
    pub async fn phase_changed(&self, phase: &Phase) {
        self.changes.push(PhaseChange::of(phase)).await;
        self.broadcast(&UiEvent::PhaseUpdate {
            phase: phase.clone(),
        });
    }

    /// Client-only update for a non-transition change (e.g. launch refs
    /// attached, cancel requested).
    pub fn phase_touched(&self, phase: &Phase) {
        self.broadcast(&UiEvent::PhaseUpdate {
            phase: phase.clone(),
        });
    }

    pub fn feature_changed(&self, feature: &Feature) {
        self.broadcast(&UiEvent::FeatureUpdate {
            feature: feature.clone(),
        });
    }

    pub fn system_status(&self, paused: bool, max_concurrent: i64, counts: QueueCounts) {
        self.broadcast(&UiEvent::SystemStatus {
            paused,
            max_concurrent,
            counts,
        });
    }

    /// Fan a serialized envelope out to subscribed clients. With zero
    /// subscribers this is a no-op and the payload is never serialized.
    fn broadcast(&self, event: &UiEvent) {
        if self.ui_tx.receiver_count() == 0 {
            return;
        }
        match envelope_json(event) {
            Ok(json) => {
                let _ = self.ui_tx.send(json);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize client event");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
