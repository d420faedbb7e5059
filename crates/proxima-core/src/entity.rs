//! Downstream entities fed by the presence aggregator.
//!
//! The aggregator never formats topics or payloads itself; it registers
//! entities once and pushes state changes to an [`EntitySink`]. Each tracked
//! device owns three kinds of entity:
//!
//! - a distance sensor (fused distance, in/out of range)
//! - a device tracker (home/away)
//! - a battery sensor, once the device reports a battery level
//!
//! The distance sensor is the measurement handler; [`TrackedSensor`] decorates
//! it and keeps the tracker and battery entities in step with every
//! measurement it forwards.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;
use utoipa::ToSchema;

use crate::fusion::{PresenceState, PresenceStatus};
use crate::tag::DistanceEvent;

/// Kind of downstream entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Fused distance of a device.
    DistanceSensor,
    /// Presence of a device.
    DeviceTracker,
    /// Battery level of a device.
    BatterySensor,
}

/// Static description of an entity, sent once on registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EntityDescriptor {
    /// Unique entity id.
    #[schema(example = "ble-aabbccddeeff-tracker")]
    pub id: String,

    /// Display name.
    #[schema(example = "Keys Tracker")]
    pub name: String,

    /// What the entity represents.
    pub kind: EntityKind,

    /// Logical device the entity belongs to.
    #[schema(example = "aabbccddeeff")]
    pub device_id: String,
}

/// State pushed to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityState {
    /// Distance sensor state.
    Distance {
        /// Fused distance in meters; absent when out of range.
        distance: Option<f64>,
        /// No node currently sees the device in range.
        out_of_range: bool,
    },
    /// Device tracker state.
    Tracker {
        /// Whether the device is present.
        present: bool,
    },
    /// Battery sensor state.
    Battery {
        /// Battery level as reported by the device.
        level: u8,
    },
}

/// Consumer of entity registrations and state changes.
#[async_trait]
pub trait EntitySink: Send + Sync {
    /// Announce a new entity. Called once per entity.
    async fn register(&self, entity: EntityDescriptor);

    /// Push a new state for a registered entity.
    async fn update(&self, entity_id: &str, state: EntityState);
}

/// Something that turns distance measurements into canonical presence.
#[async_trait]
pub trait MeasurementHandler: Send {
    /// Apply a measurement received at `now` and return the canonical state.
    async fn handle_new_measurement(&mut self, event: &DistanceEvent, now: Instant)
        -> PresenceState;

    /// Drop measurements that are too old at `now` and return the canonical state.
    async fn check_timeout(&mut self, now: Instant) -> PresenceState;

    /// Current canonical state.
    fn state(&self) -> &PresenceState;
}

/// Entity id of a device's distance sensor.
#[must_use]
pub fn distance_entity_id(device_id: &str) -> String {
    format!("ble-{device_id}")
}

/// Entity id of a device's tracker.
#[must_use]
pub fn tracker_entity_id(device_id: &str) -> String {
    format!("ble-{device_id}-tracker")
}

/// Entity id of a device's battery sensor.
#[must_use]
pub fn battery_entity_id(device_id: &str) -> String {
    format!("ble-{device_id}-battery")
}

/// Decorates a [`MeasurementHandler`] with tracker and battery entities.
pub struct TrackedSensor<S> {
    inner: S,
    sink: Arc<dyn EntitySink>,
    tracker: Option<String>,
    battery: Option<String>,
    last_present: Option<bool>,
    last_battery: Option<u8>,
}

impl<S: MeasurementHandler> TrackedSensor<S> {
    /// Wrap `inner`, registering its tracker and, when `with_battery` is set,
    /// its battery sensor.
    pub async fn create(inner: S, sink: Arc<dyn EntitySink>, with_battery: bool) -> Self {
        let mut sensor = Self {
            inner,
            sink,
            tracker: None,
            battery: None,
            last_present: None,
            last_battery: None,
        };
        let state = sensor.inner.state();
        let (device_id, name) = (state.device_id.clone(), state.name.clone());

        let tracker = EntityDescriptor {
            id: tracker_entity_id(&device_id),
            name: format!("{name} Tracker"),
            kind: EntityKind::DeviceTracker,
            device_id: device_id.clone(),
        };
        sensor.tracker = Some(tracker.id.clone());
        sensor.sink.register(tracker).await;

        if with_battery {
            sensor.register_battery(&device_id, &name).await;
        }
        sensor
    }

    async fn register_battery(&mut self, device_id: &str, name: &str) {
        let battery = EntityDescriptor {
            id: battery_entity_id(device_id),
            name: format!("{name} Battery"),
            kind: EntityKind::BatterySensor,
            device_id: device_id.to_string(),
        };
        self.battery = Some(battery.id.clone());
        self.sink.register(battery).await;
    }

    async fn sync_collaborators(&mut self, state: &PresenceState) {
        let present = state.status == PresenceStatus::Present;
        if let Some(tracker) = &self.tracker {
            if self.last_present != Some(present) {
                self.last_present = Some(present);
                self.sink
                    .update(tracker, EntityState::Tracker { present })
                    .await;
            }
        }

        if let (Some(battery), Some(level)) = (&self.battery, state.battery_level) {
            if self.last_battery != Some(level) {
                self.last_battery = Some(level);
                self.sink
                    .update(battery, EntityState::Battery { level })
                    .await;
            }
        }
    }
}

#[async_trait]
impl<S: MeasurementHandler> MeasurementHandler for TrackedSensor<S> {
    async fn handle_new_measurement(
        &mut self,
        event: &DistanceEvent,
        now: Instant,
    ) -> PresenceState {
        let state = self.inner.handle_new_measurement(event, now).await;
        if self.battery.is_none() && event.battery_level.is_some() {
            self.register_battery(&state.device_id, &state.name).await;
        }
        self.sync_collaborators(&state).await;
        state
    }

    async fn check_timeout(&mut self, now: Instant) -> PresenceState {
        let state = self.inner.check_timeout(now).await;
        self.sync_collaborators(&state).await;
        state
    }

    fn state(&self) -> &PresenceState {
        self.inner.state()
    }
}

/// A registered entity with its latest state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EntityRecord {
    /// Registration data.
    pub entity: EntityDescriptor,

    /// Latest state, absent until the first update.
    pub state: Option<EntityState>,

    /// When the state last changed.
    pub updated_at: Option<DateTime<Utc>>,
}

/// In-memory entity sink, backing the node's status API.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: RwLock<HashMap<String, EntityRecord>>,
}

impl EntityRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up one entity.
    #[must_use]
    pub fn get(&self, entity_id: &str) -> Option<EntityRecord> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned()
    }

    /// All entities, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<EntityRecord> {
        let mut records: Vec<EntityRecord> = self
            .entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.entity.id.cmp(&b.entity.id));
        records
    }
}

#[async_trait]
impl EntitySink for EntityRegistry {
    async fn register(&self, entity: EntityDescriptor) {
        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        if entities.contains_key(&entity.id) {
            return;
        }
        info!(entity_id = %entity.id, kind = ?entity.kind, "Registered entity");
        entities.insert(
            entity.id.clone(),
            EntityRecord {
                entity,
                state: None,
                updated_at: None,
            },
        );
    }

    async fn update(&self, entity_id: &str, state: EntityState) {
        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = entities.get_mut(entity_id) {
            record.state = Some(state);
            record.updated_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::DistanceSensor;
    use std::time::Duration;

    fn event(battery_level: Option<u8>, out_of_range: bool) -> DistanceEvent {
        DistanceEvent {
            instance_name: "hall".into(),
            tag_id: "aabbcc".into(),
            tag_name: "Keys".into(),
            peripheral_id: "aabbcc".into(),
            is_app: false,
            rssi: -65.0,
            measured_power: -59,
            distance: 1.8,
            out_of_range,
            battery_level,
            observed_at: Utc::now(),
        }
    }

    async fn tracked(registry: &Arc<EntityRegistry>, with_battery: bool) -> TrackedSensor<DistanceSensor> {
        let sink: Arc<dyn EntitySink> = registry.clone();
        let inner = DistanceSensor::create("aabbcc", "Keys", Duration::from_secs(60), Arc::clone(&sink)).await;
        TrackedSensor::create(inner, sink, with_battery).await
    }

    #[tokio::test]
    async fn test_registry_ignores_duplicate_registration() {
        let registry = EntityRegistry::new();
        let descriptor = EntityDescriptor {
            id: "ble-aabbcc".into(),
            name: "Keys".into(),
            kind: EntityKind::DistanceSensor,
            device_id: "aabbcc".into(),
        };
        registry.register(descriptor.clone()).await;
        registry
            .update("ble-aabbcc", EntityState::Tracker { present: true })
            .await;
        registry.register(descriptor).await;

        assert_eq!(registry.list().len(), 1);
        assert!(registry.get("ble-aabbcc").unwrap().state.is_some());
    }

    #[tokio::test]
    async fn test_update_of_unknown_entity_is_ignored() {
        let registry = EntityRegistry::new();
        registry
            .update("ble-missing", EntityState::Battery { level: 10 })
            .await;
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_decorator_registers_tracker_and_forwards() {
        let registry = Arc::new(EntityRegistry::new());
        let mut sensor = tracked(&registry, false).await;
        assert!(registry.get(&tracker_entity_id("aabbcc")).is_some());
        assert!(registry.get(&battery_entity_id("aabbcc")).is_none());

        let state = sensor
            .handle_new_measurement(&event(None, false), Instant::now())
            .await;
        assert_eq!(state.status, PresenceStatus::Present);

        let tracker = registry.get(&tracker_entity_id("aabbcc")).unwrap();
        assert_eq!(tracker.state, Some(EntityState::Tracker { present: true }));
        let distance = registry.get(&distance_entity_id("aabbcc")).unwrap();
        assert_eq!(
            distance.state,
            Some(EntityState::Distance {
                distance: Some(1.8),
                out_of_range: false
            })
        );
    }

    #[tokio::test]
    async fn test_decorator_registers_battery_on_first_report() {
        let registry = Arc::new(EntityRegistry::new());
        let mut sensor = tracked(&registry, false).await;

        sensor
            .handle_new_measurement(&event(Some(77), false), Instant::now())
            .await;

        let battery = registry.get(&battery_entity_id("aabbcc")).unwrap();
        assert_eq!(battery.entity.kind, EntityKind::BatterySensor);
        assert_eq!(battery.state, Some(EntityState::Battery { level: 77 }));
    }

    #[tokio::test]
    async fn test_decorator_marks_tracker_away() {
        let registry = Arc::new(EntityRegistry::new());
        let mut sensor = tracked(&registry, true).await;

        sensor
            .handle_new_measurement(&event(None, true), Instant::now())
            .await;

        let tracker = registry.get(&tracker_entity_id("aabbcc")).unwrap();
        assert_eq!(tracker.state, Some(EntityState::Tracker { present: false }));
        assert!(registry.get(&battery_entity_id("aabbcc")).is_some());
    }
}
