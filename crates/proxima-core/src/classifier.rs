//! Advertisement classification.
//!
//! Turns a raw [`Advertisement`] into a [`Tag`]: a structured beacon when the
//! manufacturer data follows the iBeacon layout, a generic tag otherwise.
//! Everything here is a pure function of its inputs.

use std::collections::HashMap;

use crate::config::{BeaconConfig, TagOverride};
use crate::radio::Advertisement;
use crate::tag::{BeaconData, Tag, TagKind, DEFAULT_MEASURED_POWER};

/// Apple's Bluetooth SIG company identifier, little-endian as broadcast.
pub const APPLE_COMPANY_ID: [u8; 2] = [0x4c, 0x00];

/// iBeacon type tag following the company identifier.
const IBEACON_TYPE: u8 = 0x02;

/// iBeacon payload length tag.
const IBEACON_LENGTH: u8 = 0x15;

/// Company id (2) + type (1) + length (1) + uuid (16) + major (2) + minor (2) + tx power (1).
const IBEACON_MIN_LEN: usize = 25;

/// Whether `data` follows the iBeacon manufacturer data layout.
#[must_use]
pub fn is_ibeacon(data: &[u8]) -> bool {
    data.len() >= IBEACON_MIN_LEN
        && data[0..2] == APPLE_COMPANY_ID
        && data[2] == IBEACON_TYPE
        && data[3] == IBEACON_LENGTH
}

/// Classify an advertisement.
///
/// Beacon decoding only happens when it is enabled in `beacon`; the battery
/// mask is looked up in `overrides` under the decoded beacon id.
#[must_use]
pub fn classify(
    advertisement: &Advertisement,
    beacon: &BeaconConfig,
    overrides: &HashMap<String, TagOverride>,
) -> Tag {
    let data = &advertisement.manufacturer_data;
    if beacon.enabled && is_ibeacon(data) {
        return decode_beacon(advertisement, beacon, overrides);
    }

    Tag {
        id: advertisement.id.clone(),
        name: advertisement
            .local_name
            .clone()
            .unwrap_or_else(|| advertisement.id.clone()),
        rssi: f64::from(advertisement.rssi),
        peripheral_id: advertisement.id.clone(),
        measured_power: DEFAULT_MEASURED_POWER,
        is_app: false,
        distance: 0.0,
        kind: TagKind::Generic,
    }
}

fn decode_beacon(
    advertisement: &Advertisement,
    config: &BeaconConfig,
    overrides: &HashMap<String, TagOverride>,
) -> Tag {
    let data = &advertisement.manufacturer_data;
    let uuid: String = data[4..20].iter().map(|b| format!("{b:02x}")).collect();
    let major = u16::from_be_bytes([data[20], data[21]]) & config.major_mask;
    let minor = u16::from_be_bytes([data[22], data[23]]) & config.minor_mask;
    let tx_power = i8::from_be_bytes([data[24]]);
    let id = format!("{uuid}-{major}-{minor}");

    let battery_mask = find_override(overrides, &id)
        .and_then(|o| o.battery_mask)
        .unwrap_or(0);
    let word = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);

    Tag {
        name: id.clone(),
        id,
        rssi: f64::from(advertisement.rssi),
        peripheral_id: advertisement.id.clone(),
        measured_power: advertised_power(tx_power),
        is_app: false,
        distance: 0.0,
        kind: TagKind::Beacon(BeaconData {
            uuid,
            major,
            minor,
            tx_power,
            battery_level: battery_level(word, battery_mask),
        }),
    }
}

/// A beacon calibrated at 0 dBm or above has no usable reference power.
fn advertised_power(tx_power: i8) -> i16 {
    if tx_power < 0 {
        i16::from(tx_power)
    } else {
        DEFAULT_MEASURED_POWER
    }
}

/// Extract the bits selected by `mask` from `word`, shifted down.
fn battery_level(word: u32, mask: u32) -> Option<u8> {
    if mask == 0 {
        return None;
    }
    u8::try_from((word & mask) >> mask.trailing_zeros()).ok()
}

/// Look up the override for `id`. Keys loaded from a file are lowercase, so
/// a miss retries with the lowercased id.
#[must_use]
pub fn find_override<'a>(
    overrides: &'a HashMap<String, TagOverride>,
    id: &str,
) -> Option<&'a TagOverride> {
    overrides
        .get(id)
        .or_else(|| overrides.get(&id.to_lowercase()))
}

/// Apply name and measured power overrides configured for the tag's id.
pub fn apply_overrides(tag: &mut Tag, overrides: &HashMap<String, TagOverride>) {
    let Some(tag_override) = find_override(overrides, &tag.id) else {
        return;
    };
    if let Some(name) = &tag_override.name {
        tag.name.clone_from(name);
    }
    if let Some(power) = tag_override.measured_power {
        tag.measured_power = power;
    }
}

/// Estimate distance in meters from RSSI and the power measured at one meter.
///
/// Uses the log-distance fit common to BLE beacons, rounded to decimeters.
/// A non-negative `measured_power` is replaced by [`DEFAULT_MEASURED_POWER`].
/// The result is always finite; an unusable RSSI yields [`f64::MAX`].
#[must_use]
pub fn calculate_distance(rssi: f64, measured_power: i16) -> f64 {
    let measured_power = if measured_power < 0 {
        measured_power
    } else {
        DEFAULT_MEASURED_POWER
    };
    let ratio = rssi / f64::from(measured_power);
    let distance = if ratio < 1.0 {
        ratio.powi(10)
    } else {
        0.89976f64.mul_add(ratio.powf(7.7095), 0.111)
    };
    let rounded = (distance * 10.0).round() / 10.0;
    if rounded.is_finite() {
        rounded
    } else {
        f64::MAX
    }
}
