//! Per-tag rate limiting of outgoing observations.
//!
//! Every tag id gets a slot on first use. The first observation in a quiet
//! period arms a timer for one interval; observations arriving while the timer
//! runs replace the pending one. When the timer fires the newest observation
//! is dispatched, so a burst of advertisements yields one event carrying the
//! freshest reading.
//!
//! Slots are kept for the lifetime of the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::tag::DistanceEvent;

#[derive(Debug, Default)]
struct Slot {
    /// Newest observation not yet dispatched.
    pending: Option<DistanceEvent>,
    /// Running window timer, if any.
    timer: Option<JoinHandle<()>>,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

/// Throttles [`DistanceEvent`]s per tag and forwards them to a channel.
#[derive(Debug)]
pub struct ThrottledDispatcher {
    interval: Duration,
    output: mpsc::UnboundedSender<DistanceEvent>,
    slots: Slots,
}

impl ThrottledDispatcher {
    /// Create a dispatcher forwarding at most one event per tag per `interval`.
    #[must_use]
    pub fn new(interval: Duration, output: mpsc::UnboundedSender<DistanceEvent>) -> Self {
        Self {
            interval,
            output,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue `event`, replacing any observation of the same tag still waiting.
    pub fn submit(&self, event: DistanceEvent) {
        let tag_id = event.tag_id.clone();
        let mut slots = lock(&self.slots);
        let slot = slots.entry(tag_id.clone()).or_default();
        slot.pending = Some(event);
        if slot.timer.is_some() {
            trace!(tag_id = %tag_id, "Coalesced observation into pending window");
            return;
        }

        let registry = Arc::clone(&self.slots);
        let output = self.output.clone();
        let deadline = Instant::now() + self.interval;
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let event = {
                let mut slots = lock(&registry);
                slots.get_mut(&tag_id).and_then(|slot| {
                    slot.timer = None;
                    slot.pending.take()
                })
            };
            if let Some(event) = event {
                if output.send(event).is_err() {
                    debug!(tag_id = %tag_id, "Dispatch receiver dropped");
                }
            }
        }));
    }

    /// Number of tags that have a throttle slot.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Whether no tag has been throttled yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<String, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}
