//! Unified error types for the proxima core library.
//!
//! This module provides a unified error type [`ProximaError`] that covers all
//! failure modes across the presence pipeline. Each module also has its own
//! specific error type ([`ConfigError`](crate::config::ConfigError),
//! [`TransportError`](crate::radio::TransportError),
//! [`ResolveError`](crate::resolver::ResolveError),
//! [`BusError`](crate::bus::BusError)) for internal use.
//!
//! None of the runtime errors are fatal to a node. Transport failures and
//! handshake timeouts are recovered inside the resolver, bus failures are
//! logged by the pipeline. Only configuration errors abort startup.
//!
//! # Example
//!
//! ```rust
//! use proxima_core::error::{ProximaError, Result};
//! use std::path::PathBuf;
//!
//! fn load_config(path: &PathBuf) -> Result<()> {
//!     if !path.exists() {
//!         return Err(ProximaError::ConfigNotFound(path.clone()));
//!     }
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all proxima operations.
#[derive(Debug, Error)]
pub enum ProximaError {
    // =========================================================================
    // RADIO ERRORS
    // =========================================================================
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and drivers are loaded."
    )]
    BluetoothAdapterNotFound,

    /// BLE discovery could not be started or was interrupted.
    #[error("Bluetooth discovery failed: {0}")]
    DiscoveryFailed(String),

    /// A connect/read/disconnect operation against a peripheral failed.
    #[error("Peripheral transport error: {0}")]
    Transport(String),

    /// The companion handshake did not complete in time.
    #[error("Companion handshake with {peripheral_id} timed out after {secs} seconds")]
    HandshakeTimeout {
        /// Transport identity of the peripheral.
        peripheral_id: String,
        /// Timeout that elapsed.
        secs: u64,
    },

    // =========================================================================
    // CLUSTER ERRORS
    // =========================================================================
    /// An event could not be published on the cluster bus.
    #[error("Cluster bus publish failed on '{channel}': {message}")]
    PublishFailed {
        /// Channel the event was published to.
        channel: String,
        /// Underlying failure.
        message: String,
    },

    /// A cluster message could not be encoded or decoded.
    #[error("Malformed cluster message: {0}")]
    MalformedMessage(String),

    // =========================================================================
    // PRESENCE ERRORS
    // =========================================================================
    /// No presence state exists for the requested device.
    #[error("Device not tracked: '{0}'. It has not been observed by any node yet.")]
    DeviceNotTracked(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // I/O ERRORS
    // =========================================================================
    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for proxima operations.
pub type Result<T> = std::result::Result<T, ProximaError>;

impl ProximaError {
    /// Returns `true` if this error originates from the radio transport.
    #[inline]
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::BluetoothAdapterNotFound
                | Self::DiscoveryFailed(_)
                | Self::Transport(_)
                | Self::HandshakeTimeout { .. }
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error comes from the cluster bus.
    #[inline]
    #[must_use]
    pub const fn is_cluster_error(&self) -> bool {
        matches!(self, Self::PublishFailed { .. } | Self::MalformedMessage(_))
    }

    /// Returns `true` if the pipeline recovers from this error on its own,
    /// typically on the device's next advertisement.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::HandshakeTimeout { .. }
                | Self::PublishFailed { .. }
                | Self::MalformedMessage(_)
                | Self::DeviceNotTracked(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::ConfigNotFound(_) | Self::DeviceNotTracked(_) => 404,

            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            Self::MalformedMessage(_) | Self::IoError(_) => 500,

            Self::PublishFailed { .. } | Self::Transport(_) | Self::HandshakeTimeout { .. } => {
                502
            }

            Self::BluetoothAdapterNotFound | Self::DiscoveryFailed(_) => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BluetoothAdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::DiscoveryFailed(_) => "DISCOVERY_FAILED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::HandshakeTimeout { .. } => "HANDSHAKE_TIMEOUT",
            Self::PublishFailed { .. } => "PUBLISH_FAILED",
            Self::MalformedMessage(_) => "MALFORMED_MESSAGE",
            Self::DeviceNotTracked(_) => "DEVICE_NOT_TRACKED",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for ProximaError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::ReadError { path, source } => {
                Self::ConfigParseError(format!("Failed to read {}: {}", path.display(), source))
            }
            ConfigError::WriteError { path, source } => Self::IoError(std::io::Error::new(
                source.kind(),
                format!("Failed to write {}: {}", path.display(), source),
            )),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::InvalidRegex { field, pattern, source } => Self::ConfigValidationError(
                format!("{field}: invalid pattern '{pattern}': {source}"),
            ),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::radio::TransportError> for ProximaError {
    fn from(err: crate::radio::TransportError) -> Self {
        use crate::radio::TransportError;
        match err {
            TransportError::AdapterNotFound => Self::BluetoothAdapterNotFound,
            TransportError::DiscoveryFailed { message } => Self::DiscoveryFailed(message),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<crate::resolver::ResolveError> for ProximaError {
    fn from(err: crate::resolver::ResolveError) -> Self {
        use crate::resolver::ResolveError;
        match err {
            ResolveError::Timeout { peripheral_id, secs } => {
                Self::HandshakeTimeout { peripheral_id, secs }
            }
            ResolveError::Transport(e) => Self::from(e),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<crate::bus::BusError> for ProximaError {
    fn from(err: crate::bus::BusError) -> Self {
        use crate::bus::BusError;
        match err {
            BusError::Encode(e) | BusError::Decode(e) => Self::MalformedMessage(e.to_string()),
            BusError::Closed { channel } => Self::PublishFailed {
                channel,
                message: "bus closed".into(),
            },
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
