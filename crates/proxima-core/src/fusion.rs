//! Cluster-wide presence fusion.
//!
//! Every node that observes a tag contributes one slot per origin: the latest
//! distance it reported and when that report arrived. The canonical distance
//! is the smallest distance among fresh, in-range slots. When no such slot
//! exists the device is out of range.
//!
//! Slots age out after the configured timeout. A per-device timer re-checks
//! the device once the newest report would have expired, and a periodic sweep
//! catches anything the timers missed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::entity::{
    distance_entity_id, EntityDescriptor, EntityKind, EntitySink, EntityState, MeasurementHandler,
    TrackedSensor,
};
use crate::tag::DistanceEvent;

/// Whether a device is currently seen by any node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// At least one node sees the device in range.
    Present,
    /// No node sees the device in range.
    OutOfRange,
}

/// Canonical, cluster-wide state of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "device_id": "aabbccddeeff",
    "name": "Keys",
    "distance": 1.8,
    "status": "present",
    "battery_level": 87,
    "updated_at": "2026-01-01T12:00:00Z"
}))]
pub struct PresenceState {
    /// Logical device id.
    pub device_id: String,

    /// Display name.
    pub name: String,

    /// Fused distance in meters; absent when out of range.
    pub distance: Option<f64>,

    /// Presence status.
    pub status: PresenceStatus,

    /// Latest battery level reported by any node.
    pub battery_level: Option<u8>,

    /// When the canonical state last changed.
    pub updated_at: DateTime<Utc>,
}

impl PresenceState {
    fn initial(device_id: &str, name: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            name: name.to_string(),
            distance: None,
            status: PresenceStatus::OutOfRange,
            battery_level: None,
            updated_at: Utc::now(),
        }
    }
}

/// Latest report of one origin node.
#[derive(Debug, Clone)]
struct OriginSlot {
    distance: f64,
    out_of_range: bool,
    arrived_at: Instant,
}

/// Distance sensor entity; fuses per-origin slots into a canonical state.
pub struct DistanceSensor {
    entity_id: String,
    timeout: Duration,
    slots: BTreeMap<String, OriginSlot>,
    nearest_origin: Option<String>,
    state: PresenceState,
    published: bool,
    sink: Arc<dyn EntitySink>,
}

impl DistanceSensor {
    /// Create the sensor and register its entity.
    pub async fn create(
        device_id: &str,
        name: &str,
        timeout: Duration,
        sink: Arc<dyn EntitySink>,
    ) -> Self {
        let entity_id = distance_entity_id(device_id);
        sink.register(EntityDescriptor {
            id: entity_id.clone(),
            name: format!("{name} Distance"),
            kind: EntityKind::DistanceSensor,
            device_id: device_id.to_string(),
        })
        .await;

        Self {
            entity_id,
            timeout,
            slots: BTreeMap::new(),
            nearest_origin: None,
            state: PresenceState::initial(device_id, name),
            published: false,
            sink,
        }
    }

    /// Recompute the canonical state; returns whether it changed.
    fn evaluate(&mut self, now: Instant) -> bool {
        let timeout = self.timeout;
        self.slots
            .retain(|_, slot| now.saturating_duration_since(slot.arrived_at) < timeout);

        let nearest = self
            .slots
            .iter()
            .filter(|(_, slot)| !slot.out_of_range)
            .min_by(|(a_origin, a), (b_origin, b)| {
                a.distance
                    .total_cmp(&b.distance)
                    .then_with(|| a_origin.cmp(b_origin))
            });

        let (status, distance) = match nearest {
            Some((origin, slot)) => {
                self.nearest_origin = Some(origin.clone());
                (PresenceStatus::Present, Some(slot.distance))
            }
            None => {
                self.nearest_origin = None;
                (PresenceStatus::OutOfRange, None)
            }
        };

        let changed = status != self.state.status || distance != self.state.distance;
        self.state.status = status;
        self.state.distance = distance;
        if changed {
            self.state.updated_at = Utc::now();
        }
        changed
    }

    /// Origin whose slot supplies the canonical distance. Equal distances
    /// resolve to the lexicographically smallest origin name.
    #[must_use]
    pub fn nearest_origin(&self) -> Option<&str> {
        self.nearest_origin.as_deref()
    }

    async fn publish(&mut self, changed: bool) {
        if !changed && self.published {
            return;
        }
        self.published = true;
        debug!(
            device_id = %self.state.device_id,
            distance = ?self.state.distance,
            status = ?self.state.status,
            origin = ?self.nearest_origin,
            "Canonical presence changed"
        );
        self.sink
            .update(
                &self.entity_id,
                EntityState::Distance {
                    distance: self.state.distance,
                    out_of_range: self.state.status == PresenceStatus::OutOfRange,
                },
            )
            .await;
    }
}

#[async_trait]
impl MeasurementHandler for DistanceSensor {
    async fn handle_new_measurement(
        &mut self,
        event: &DistanceEvent,
        now: Instant,
    ) -> PresenceState {
        self.slots.insert(
            event.instance_name.clone(),
            OriginSlot {
                distance: event.distance,
                out_of_range: event.out_of_range,
                arrived_at: now,
            },
        );
        let mut changed = self.evaluate(now);
        if event.battery_level.is_some() && event.battery_level != self.state.battery_level {
            self.state.battery_level = event.battery_level;
            changed = true;
        }
        self.publish(changed).await;
        self.state.clone()
    }

    async fn check_timeout(&mut self, now: Instant) -> PresenceState {
        let changed = self.evaluate(now);
        self.publish(changed).await;
        self.state.clone()
    }

    fn state(&self) -> &PresenceState {
        &self.state
    }
}

type Sensor = TrackedSensor<DistanceSensor>;

/// Per-device entry; the sensor is built by whoever locks it first.
#[derive(Default)]
struct Device {
    sensor: tokio::sync::Mutex<Option<Sensor>>,
    expiry: Mutex<Option<JoinHandle<()>>>,
}

/// Folds distance events from every node into canonical presence states.
pub struct PresenceAggregator {
    instance_name: String,
    timeout: Duration,
    sink: Arc<dyn EntitySink>,
    devices: RwLock<HashMap<String, Arc<Device>>>,
}

impl std::fmt::Debug for PresenceAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceAggregator")
            .field("instance_name", &self.instance_name)
            .field("timeout", &self.timeout)
            .field("devices", &self.len())
            .finish_non_exhaustive()
    }
}

impl PresenceAggregator {
    /// Create an aggregator pushing entity updates to `sink`.
    #[must_use]
    pub fn new(instance_name: impl Into<String>, timeout: Duration, sink: Arc<dyn EntitySink>) -> Self {
        Self {
            instance_name: instance_name.into(),
            timeout,
            sink,
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Name of the local node.
    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Apply one distance event, local or remote, and return the canonical state.
    pub async fn handle_event(self: &Arc<Self>, event: DistanceEvent) -> PresenceState {
        let device = self.device(&event.tag_id);
        let mut guard = device.sensor.lock().await;
        let sensor = match guard.take() {
            Some(sensor) => sensor,
            None => self.create_sensor(&event).await,
        };
        let sensor = guard.insert(sensor);
        let state = sensor.handle_new_measurement(&event, Instant::now()).await;
        self.arm_expiry(&event.tag_id, &device);
        state
    }

    /// Re-evaluate every device, dropping expired origin slots.
    pub async fn check_timeouts(&self) {
        let now = Instant::now();
        for device in self.snapshot() {
            if let Some(sensor) = device.sensor.lock().await.as_mut() {
                sensor.check_timeout(now).await;
            }
        }
    }

    /// Periodically call [`check_timeouts`](Self::check_timeouts) until the
    /// aggregator is dropped.
    pub fn run_expiry_sweep(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(aggregator) = weak.upgrade() else {
                    break;
                };
                aggregator.check_timeouts().await;
            }
        })
    }

    /// Canonical state of one device.
    pub async fn state(&self, device_id: &str) -> Option<PresenceState> {
        let device = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()?;
        let guard = device.sensor.lock().await;
        guard.as_ref().map(|sensor| sensor.state().clone())
    }

    /// Canonical states of all devices, ordered by id.
    pub async fn states(&self) -> Vec<PresenceState> {
        let mut states = Vec::new();
        for device in self.snapshot() {
            if let Some(sensor) = device.sensor.lock().await.as_ref() {
                states.push(sensor.state().clone());
            }
        }
        states.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        states
    }

    /// Number of known devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no device has been seen yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn create_sensor(&self, event: &DistanceEvent) -> Sensor {
        info!(
            device_id = %event.tag_id,
            name = %event.tag_name,
            origin = %event.instance_name,
            "Tracking new device"
        );
        let inner = DistanceSensor::create(
            &event.tag_id,
            &event.tag_name,
            self.timeout,
            Arc::clone(&self.sink),
        )
        .await;
        TrackedSensor::create(inner, Arc::clone(&self.sink), event.battery_level.is_some()).await
    }

    fn device(&self, device_id: &str) -> Arc<Device> {
        if let Some(device) = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
        {
            return Arc::clone(device);
        }
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(devices.entry(device_id.to_string()).or_default())
    }

    fn snapshot(&self) -> Vec<Arc<Device>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    async fn expire(&self, device_id: &str) {
        let device = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned();
        if let Some(device) = device {
            if let Some(sensor) = device.sensor.lock().await.as_mut() {
                sensor.check_timeout(Instant::now()).await;
            }
        }
    }

    fn arm_expiry(self: &Arc<Self>, device_id: &str, device: &Device) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let device_id = device_id.to_string();
        let deadline = Instant::now() + self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(aggregator) = weak.upgrade() {
                aggregator.expire(&device_id).await;
            }
        });

        let mut expiry = device.expiry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = expiry.replace(timer) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{battery_entity_id, tracker_entity_id, EntityRegistry};

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn event(origin: &str, distance: f64, out_of_range: bool) -> DistanceEvent {
        DistanceEvent {
            instance_name: origin.into(),
            tag_id: "aabbcc".into(),
            tag_name: "Keys".into(),
            peripheral_id: "aabbcc".into(),
            is_app: false,
            rssi: -70.0,
            measured_power: -59,
            distance,
            out_of_range,
            battery_level: None,
            observed_at: Utc::now(),
        }
    }

    fn aggregator() -> (Arc<PresenceAggregator>, Arc<EntityRegistry>) {
        let registry = Arc::new(EntityRegistry::new());
        let aggregator = Arc::new(PresenceAggregator::new(
            "node-a",
            TIMEOUT,
            registry.clone(),
        ));
        (aggregator, registry)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_nearest_in_range_node_wins() {
        let (aggregator, _) = aggregator();
        aggregator.handle_event(event("node-a", 2.0, false)).await;
        let state = aggregator.handle_event(event("node-b", 5.0, false)).await;

        assert_eq!(state.status, PresenceStatus::Present);
        assert_eq!(state.distance, Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_distances_pick_smallest_origin() {
        let orders = [
            ["node-c", "node-a", "node-d", "node-b"],
            ["node-d", "node-c", "node-b", "node-a"],
            ["node-b", "node-d", "node-a", "node-c"],
        ];
        for order in orders {
            let registry = Arc::new(EntityRegistry::new());
            let mut sensor = DistanceSensor::create("aabbcc", "Keys", TIMEOUT, registry).await;
            for origin in order {
                sensor
                    .handle_new_measurement(&event(origin, 2.0, false), Instant::now())
                    .await;
            }
            assert_eq!(sensor.nearest_origin(), Some("node-a"));
            assert_eq!(sensor.state().distance, Some(2.0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_nearest_origin_cleared_when_out_of_range() {
        let registry = Arc::new(EntityRegistry::new());
        let mut sensor = DistanceSensor::create("aabbcc", "Keys", TIMEOUT, registry).await;
        let now = Instant::now();
        sensor.handle_new_measurement(&event("node-b", 3.0, false), now).await;
        assert_eq!(sensor.nearest_origin(), Some("node-b"));

        sensor.handle_new_measurement(&event("node-b", 3.0, true), now).await;
        assert_eq!(sensor.nearest_origin(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_slots_are_ignored() {
        let (aggregator, _) = aggregator();
        aggregator.handle_event(event("node-a", 1.0, true)).await;
        let state = aggregator.handle_event(event("node-b", 5.0, false)).await;
        assert_eq!(state.distance, Some(5.0));

        let state = aggregator.handle_event(event("node-b", 5.0, true)).await;
        assert_eq!(state.status, PresenceStatus::OutOfRange);
        assert_eq!(state.distance, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_slot_no_longer_counts() {
        let (aggregator, _) = aggregator();
        aggregator.handle_event(event("node-a", 2.0, false)).await;
        aggregator.handle_event(event("node-b", 5.0, false)).await;

        tokio::time::advance(Duration::from_secs(40)).await;
        let state = aggregator.handle_event(event("node-b", 5.0, true)).await;
        assert_eq!(state.distance, Some(2.0));

        tokio::time::advance(Duration::from_secs(21)).await;
        aggregator.check_timeouts().await;

        let state = aggregator.state("aabbcc").await.unwrap();
        assert_eq!(state.status, PresenceStatus::OutOfRange);
        assert_eq!(state.distance, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_timer_marks_device_out_of_range() {
        let (aggregator, registry) = aggregator();
        aggregator.handle_event(event("node-a", 2.0, false)).await;

        tokio::time::advance(TIMEOUT + Duration::from_secs(1)).await;
        settle().await;

        let state = aggregator.state("aabbcc").await.unwrap();
        assert_eq!(state.status, PresenceStatus::OutOfRange);
        let tracker = registry.get(&tracker_entity_id("aabbcc")).unwrap();
        assert_eq!(tracker.state, Some(EntityState::Tracker { present: false }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_event_resets_expiry_timer() {
        let (aggregator, _) = aggregator();
        aggregator.handle_event(event("node-a", 2.0, false)).await;
        tokio::time::advance(Duration::from_secs(50)).await;
        aggregator.handle_event(event("node-a", 3.0, false)).await;

        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;

        let state = aggregator.state("aabbcc").await.unwrap();
        assert_eq!(state.status, PresenceStatus::Present);
        assert_eq!(state.distance, Some(3.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_devices() {
        let (aggregator, _) = aggregator();
        aggregator.handle_event(event("node-a", 2.0, false)).await;
        let sweep = aggregator.run_expiry_sweep(Duration::from_secs(5));

        tokio::time::sleep(TIMEOUT + Duration::from_secs(6)).await;
        settle().await;

        let state = aggregator.state("aabbcc").await.unwrap();
        assert_eq!(state.status, PresenceStatus::OutOfRange);
        sweep.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_reordered_events_converge() {
        let (first, _) = aggregator();
        let (second, _) = aggregator();

        let a = event("node-a", 2.0, false);
        let b = event("node-b", 4.0, false);

        first.handle_event(a.clone()).await;
        first.handle_event(b.clone()).await;
        first.handle_event(a.clone()).await;

        second.handle_event(b).await;
        second.handle_event(a).await;

        let left = first.state("aabbcc").await.unwrap();
        let right = second.state("aabbcc").await.unwrap();
        assert_eq!(left.distance, right.distance);
        assert_eq!(left.status, right.status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_event_creates_entities() {
        let (aggregator, registry) = aggregator();
        let mut with_battery = event("node-a", 2.0, false);
        with_battery.battery_level = Some(64);
        aggregator.handle_event(with_battery).await;

        assert!(registry.get(&distance_entity_id("aabbcc")).is_some());
        assert!(registry.get(&tracker_entity_id("aabbcc")).is_some());
        let battery = registry.get(&battery_entity_id("aabbcc")).unwrap();
        assert_eq!(battery.state, Some(EntityState::Battery { level: 64 }));
        assert_eq!(aggregator.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_out_of_range_is_published() {
        let (aggregator, registry) = aggregator();
        aggregator.handle_event(event("node-a", 12.0, true)).await;

        let distance = registry.get(&distance_entity_id("aabbcc")).unwrap();
        assert_eq!(
            distance.state,
            Some(EntityState::Distance {
                distance: None,
                out_of_range: true
            })
        );
    }
}
