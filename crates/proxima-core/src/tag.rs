//! Tags, beacons and the distance observations nodes exchange.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Measured power assumed for tags that do not advertise one, in dBm.
pub const DEFAULT_MEASURED_POWER: i16 = -59;

/// A discovered device, valid for one discovery cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    /// Transport id, beacon id, or resolved companion id.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Signal strength in dBm; smoothed once it passes the signal filter.
    pub rssi: f64,

    /// Transport identity of the peripheral that sent the advertisement.
    pub peripheral_id: String,

    /// Expected RSSI at one meter, in dBm.
    pub measured_power: i16,

    /// `true` once `id` is a companion identity rather than a hardware one.
    pub is_app: bool,

    /// Estimated distance in meters.
    pub distance: f64,

    /// Generic tag or structured beacon.
    pub kind: TagKind,
}

/// What the classifier recognized the advertisement as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagKind {
    /// Any advertisement without a recognized layout.
    Generic,
    /// An iBeacon-layout advertisement.
    Beacon(BeaconData),
}

/// Fields decoded from an iBeacon-layout advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconData {
    /// Proximity UUID as lowercase hex without dashes.
    pub uuid: String,

    /// Major value after masking.
    pub major: u16,

    /// Minor value after masking.
    pub minor: u16,

    /// Calibrated RSSI at one meter, as advertised.
    pub tx_power: i8,

    /// Battery level decoded through the tag's battery mask, if configured.
    pub battery_level: Option<u8>,
}

impl Tag {
    /// Battery level, if this tag is a beacon that reports one.
    #[must_use]
    pub const fn battery_level(&self) -> Option<u8> {
        match &self.kind {
            TagKind::Beacon(beacon) => beacon.battery_level,
            TagKind::Generic => None,
        }
    }

    /// Whether this tag was decoded as a beacon.
    #[must_use]
    pub const fn is_beacon(&self) -> bool {
        matches!(self.kind, TagKind::Beacon(_))
    }
}

/// One node's observation of one device at one point in time.
///
/// Published on the cluster bus and fed to the local aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DistanceEvent {
    /// Node that made the observation.
    pub instance_name: String,

    /// Logical device id.
    pub tag_id: String,

    /// Display name of the device.
    pub tag_name: String,

    /// Transport identity of the peripheral.
    pub peripheral_id: String,

    /// Whether `tag_id` is a resolved companion identity.
    pub is_app: bool,

    /// Smoothed signal strength in dBm.
    pub rssi: f64,

    /// Measured power used for the distance estimate.
    pub measured_power: i16,

    /// Estimated distance in meters.
    pub distance: f64,

    /// The observing node considers the device out of range.
    pub out_of_range: bool,

    /// Battery level reported by the device, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,

    /// When the observation was made.
    pub observed_at: DateTime<Utc>,
}

impl DistanceEvent {
    /// Build the event describing `tag` as seen by `instance_name`.
    #[must_use]
    pub fn from_tag(instance_name: &str, tag: &Tag, out_of_range: bool) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            tag_id: tag.id.clone(),
            tag_name: tag.name.clone(),
            peripheral_id: tag.peripheral_id.clone(),
            is_app: tag.is_app,
            rssi: tag.rssi,
            measured_power: tag.measured_power,
            distance: tag.distance,
            out_of_range,
            battery_level: tag.battery_level(),
            observed_at: Utc::now(),
        }
    }
}
