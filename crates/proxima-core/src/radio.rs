//! Radio discovery contract.
//!
//! The pipeline consumes [`Advertisement`] records and talks to peripherals
//! through the [`Peripheral`] trait, so it is independent of the Bluetooth
//! stack underneath:
//!
//! - [`bluez`] - BlueZ implementation via `bluer` (feature `bluetooth`)
//! - [`mock`] - scripted peripherals for tests (feature `mock-bluetooth`)

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[cfg(feature = "bluetooth")]
pub mod bluez;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;

/// Errors reported by the radio transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No Bluetooth adapter is available.
    #[error("no Bluetooth adapter available")]
    AdapterNotFound,

    /// Discovery could not be started.
    #[error("discovery failed: {message}")]
    DiscoveryFailed {
        /// Error reported by the stack.
        message: String,
    },

    /// Connecting to the peripheral failed.
    #[error("connect to {peripheral_id} failed: {message}")]
    ConnectFailed {
        /// Transport identity of the peripheral.
        peripheral_id: String,
        /// Error reported by the stack.
        message: String,
    },

    /// Reading a characteristic failed.
    #[error("read from {peripheral_id} failed: {message}")]
    ReadFailed {
        /// Transport identity of the peripheral.
        peripheral_id: String,
        /// Error reported by the stack.
        message: String,
    },

    /// Disconnecting from the peripheral failed.
    #[error("disconnect from {peripheral_id} failed: {message}")]
    DisconnectFailed {
        /// Transport identity of the peripheral.
        peripheral_id: String,
        /// Error reported by the stack.
        message: String,
    },
}

/// Operations the core needs against a discovered peripheral.
///
/// Every operation may fail or hang; callers race them against timeouts.
#[async_trait]
pub trait Peripheral: Send + Sync + fmt::Debug {
    /// Transport-level identity of the peripheral.
    fn id(&self) -> &str;

    /// Open a connection.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Discover `service` and read `characteristic` from it.
    ///
    /// Returns `Ok(None)` if the peripheral does not expose the characteristic.
    async fn read_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    /// Resolves once the peripheral drops the connection.
    async fn disconnected(&self);

    /// Close the connection.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// One raw advertisement as delivered by the discovery source.
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// Transport identity (lowercase hex address without separators).
    pub id: String,

    /// Human-readable address as reported by the stack.
    pub address: String,

    /// Advertised local name.
    pub local_name: Option<String>,

    /// Received signal strength in dBm.
    pub rssi: i16,

    /// Manufacturer specific data: little-endian company id followed by payload.
    pub manufacturer_data: Vec<u8>,

    /// Whether the peripheral accepts connections.
    pub connectable: bool,

    /// Handle for connecting to the peripheral.
    pub peripheral: Arc<dyn Peripheral>,
}

/// Normalize a transport address into a tag id: lowercase, separators removed.
#[must_use]
pub fn normalize_id(address: &str) -> String {
    address
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_id() {
        assert_eq!(normalize_id("AA:BB:CC:DD:EE:FF"), "aabbccddeeff");
        assert_eq!(normalize_id("aa-bb-cc"), "aabbcc");
        assert_eq!(normalize_id("abc123"), "abc123");
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::ConnectFailed {
            peripheral_id: "aabbcc".into(),
            message: "le-connection-abort-by-local".into(),
        };
        assert!(err.to_string().contains("aabbcc"));
        assert!(err.to_string().contains("le-connection-abort-by-local"));
    }
}
