//! # proxima-core
//!
//! Distributed beacon presence engine.
//!
//! Every node scans for Bluetooth Low Energy advertisements, estimates the
//! distance to each tracked tag, and shares its observations with the rest of
//! the cluster. Each node folds all observations into one canonical presence
//! state per device.
//!
//! ## Architecture
//!
//! - [`radio`] - Peripheral abstraction, BlueZ scanner and scripted mocks
//! - [`classifier`] - Beacon decoding and the RSSI distance model
//! - [`resolver`] - Companion app identity handshake, cache and denylist
//! - [`filter`] - Per-device Kalman smoothing of RSSI
//! - [`access`] - Allow/deny lists
//! - [`throttle`] - Per-tag rate limiting of outgoing observations
//! - [`fusion`] - Cross-node aggregation into canonical presence
//! - [`entity`] - Downstream entities fed by the aggregator
//! - [`bus`] - Cluster bus adapter
//! - [`pipeline`] - Wires the components of one node together
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Unified error type

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod access;
pub mod bus;
pub mod classifier;
pub mod config;
pub mod entity;
pub mod error;
pub mod filter;
pub mod fusion;
pub mod pipeline;
pub mod radio;
pub mod resolver;
pub mod tag;
pub mod throttle;

pub use access::AccessFilter;
pub use bus::{
    BusError, BusHandler, BusSubscription, ClusterBus, ClusterMessage, InMemoryClusterBus,
    NEW_DISTANCE_CHANNEL,
};
pub use classifier::{calculate_distance, classify, is_ibeacon};
pub use config::{
    ApiConfig, BeaconConfig, BleConfig, Config, ConfigError, ConfigResult, TagOverride,
};
pub use entity::{
    EntityDescriptor, EntityKind, EntityRecord, EntityRegistry, EntitySink, EntityState,
    MeasurementHandler, TrackedSensor,
};
pub use error::{ProximaError, Result};
pub use filter::{KalmanFilter, SignalFilter};
pub use fusion::{DistanceSensor, PresenceAggregator, PresenceState, PresenceStatus};
pub use pipeline::PresencePipeline;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub use radio::mock::{MockPeripheral, ReadBehavior};
pub use radio::{normalize_id, Advertisement, Peripheral, TransportError};
pub use resolver::{CompanionResolver, Resolution, ResolveError};
pub use tag::{BeaconData, DistanceEvent, Tag, TagKind};
pub use throttle::ThrottledDispatcher;
