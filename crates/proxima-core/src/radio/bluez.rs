//! BlueZ discovery source and peripheral handle (Linux, via `bluer`).
//!
//! BlueZ reports manufacturer data as a map of company id to payload; the
//! advertisement buffer is rebuilt as `company_id (LE) ++ payload` so the
//! classifier sees the same layout the radio broadcast. BlueZ does not expose
//! whether an advertisement was connectable, so every device is reported as
//! connectable and the handshake simply fails for those that are not.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::{pin_mut, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{normalize_id, Advertisement, Peripheral, TransportError};

/// Scans the default BlueZ adapter and forwards advertisements.
pub struct BluezScanner {
    _session: Session,
    adapter: Adapter,
}

impl BluezScanner {
    /// Open a session on the default adapter and power it on.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AdapterNotFound`] if no adapter is present, or
    /// [`TransportError::DiscoveryFailed`] if BlueZ is unreachable.
    pub async fn new() -> Result<Self, TransportError> {
        let session = Session::new().await.map_err(discovery_failed)?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| TransportError::AdapterNotFound)?;
        adapter.set_powered(true).await.map_err(discovery_failed)?;
        info!(adapter = adapter.name(), "Bluetooth adapter ready");

        Ok(Self {
            _session: session,
            adapter,
        })
    }

    /// Run discovery until the receiving side of `tx` is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::DiscoveryFailed`] if discovery cannot start.
    pub async fn run(self, tx: mpsc::Sender<Advertisement>) -> Result<(), TransportError> {
        let events = self
            .adapter
            .discover_devices_with_changes()
            .await
            .map_err(discovery_failed)?;
        pin_mut!(events);

        while let Some(event) = events.next().await {
            let AdapterEvent::DeviceAdded(address) = event else {
                continue;
            };
            match self.advertisement(address).await {
                Ok(Some(advertisement)) => {
                    if tx.send(advertisement).await.is_err() {
                        debug!("Advertisement receiver dropped, stopping discovery");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(%address, error = %e, "Failed to read device properties"),
            }
        }

        warn!("Bluetooth discovery stream ended");
        Ok(())
    }

    async fn advertisement(&self, address: Address) -> bluer::Result<Option<Advertisement>> {
        let device = self.adapter.device(address)?;
        // Cached devices without a fresh RSSI were not actually heard.
        let Some(rssi) = device.rssi().await? else {
            return Ok(None);
        };
        let local_name = device.name().await?;
        let manufacturer_data = device
            .manufacturer_data()
            .await?
            .and_then(|data| {
                data.into_iter()
                    .min_by_key(|(company, _)| *company)
                    .map(|(company, payload)| {
                        let mut buffer = company.to_le_bytes().to_vec();
                        buffer.extend_from_slice(&payload);
                        buffer
                    })
            })
            .unwrap_or_default();

        let id = normalize_id(&address.to_string());
        Ok(Some(Advertisement {
            id: id.clone(),
            address: address.to_string(),
            local_name,
            rssi,
            manufacturer_data,
            connectable: true,
            peripheral: Arc::new(BluezPeripheral { id, device }),
        }))
    }
}

/// A BlueZ device used for the companion handshake.
pub struct BluezPeripheral {
    id: String,
    device: Device,
}

impl fmt::Debug for BluezPeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BluezPeripheral")
            .field("id", &self.id)
            .field("address", &self.device.address())
            .finish()
    }
}

#[async_trait]
impl Peripheral for BluezPeripheral {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.device
            .connect()
            .await
            .map_err(|e| TransportError::ConnectFailed {
                peripheral_id: self.id.clone(),
                message: e.to_string(),
            })
    }

    async fn read_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let read_failed = |e: bluer::Error| TransportError::ReadFailed {
            peripheral_id: self.id.clone(),
            message: e.to_string(),
        };

        for candidate in self.device.services().await.map_err(read_failed)? {
            if candidate.uuid().await.map_err(read_failed)? != service {
                continue;
            }
            for entry in candidate.characteristics().await.map_err(read_failed)? {
                if entry.uuid().await.map_err(read_failed)? == characteristic {
                    return entry.read().await.map(Some).map_err(read_failed);
                }
            }
        }
        Ok(None)
    }

    async fn disconnected(&self) {
        let Ok(events) = self.device.events().await else {
            return;
        };
        pin_mut!(events);
        while let Some(event) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                return;
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.device
            .disconnect()
            .await
            .map_err(|e| TransportError::DisconnectFailed {
                peripheral_id: self.id.clone(),
                message: e.to_string(),
            })
    }
}

fn discovery_failed(e: bluer::Error) -> TransportError {
    TransportError::DiscoveryFailed {
        message: e.to_string(),
    }
}
