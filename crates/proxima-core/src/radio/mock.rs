//! Scripted peripherals for exercising the pipeline without hardware.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{normalize_id, Advertisement, Peripheral, TransportError};

/// How a [`MockPeripheral`] answers characteristic reads.
#[derive(Debug, Clone)]
pub enum ReadBehavior {
    /// Return this value.
    Value(Vec<u8>),
    /// The characteristic does not exist.
    Missing,
    /// The read fails with a transport error.
    Fail,
    /// The read never completes.
    Hang,
}

/// A peripheral whose behavior is fixed at construction.
#[derive(Debug)]
pub struct MockPeripheral {
    id: String,
    connect_fails: bool,
    read: ReadBehavior,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    dropped: Notify,
}

impl MockPeripheral {
    /// A peripheral that connects fine and has no companion characteristic.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: normalize_id(id),
            connect_fails: false,
            read: ReadBehavior::Missing,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            dropped: Notify::new(),
        }
    }

    /// Answer reads with the given companion id.
    #[must_use]
    pub fn with_companion_id(mut self, value: &str) -> Self {
        self.read = ReadBehavior::Value(value.as_bytes().to_vec());
        self
    }

    /// Answer reads with `behavior`.
    #[must_use]
    pub fn with_read(mut self, behavior: ReadBehavior) -> Self {
        self.read = behavior;
        self
    }

    /// Fail every connection attempt.
    #[must_use]
    pub const fn failing_connect(mut self) -> Self {
        self.connect_fails = true;
        self
    }

    /// Simulate the peripheral dropping the connection.
    pub fn drop_connection(&self) {
        self.dropped.notify_one();
    }

    /// Number of `connect` calls so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of `disconnect` calls so far.
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Build an advertisement originating from this peripheral.
    #[must_use]
    pub fn advertisement(self: &Arc<Self>, rssi: i16, manufacturer_data: Vec<u8>) -> Advertisement {
        Advertisement {
            id: self.id.clone(),
            address: self.id.clone(),
            local_name: None,
            rssi,
            manufacturer_data,
            connectable: true,
            peripheral: Arc::clone(self) as Arc<dyn Peripheral>,
        }
    }
}

#[async_trait]
impl Peripheral for MockPeripheral {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_fails {
            return Err(TransportError::ConnectFailed {
                peripheral_id: self.id.clone(),
                message: "mock connect failure".into(),
            });
        }
        Ok(())
    }

    async fn read_characteristic(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        match &self.read {
            ReadBehavior::Value(value) => Ok(Some(value.clone())),
            ReadBehavior::Missing => Ok(None),
            ReadBehavior::Fail => Err(TransportError::ReadFailed {
                peripheral_id: self.id.clone(),
                message: "mock read failure".into(),
            }),
            ReadBehavior::Hang => std::future::pending().await,
        }
    }

    async fn disconnected(&self) {
        self.dropped.notified().await;
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
