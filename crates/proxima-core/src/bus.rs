//! Cluster bus adapter.
//!
//! Nodes share [`DistanceEvent`]s over named channels. Messages travel as
//! JSON-encoded [`ClusterMessage`] frames so that any transport carrying text
//! can back the bus; [`InMemoryClusterBus`] is the single-process transport
//! used by a standalone node and by tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ProximaError;
use crate::tag::DistanceEvent;

/// Channel carrying every node's distance observations.
pub const NEW_DISTANCE_CHANNEL: &str = "ble.new-distance";

/// Default number of frames buffered per subscriber.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Errors raised by the cluster bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// An event could not be serialized.
    #[error("failed to encode cluster message: {0}")]
    Encode(#[source] serde_json::Error),

    /// A frame could not be deserialized.
    #[error("failed to decode cluster message: {0}")]
    Decode(#[source] serde_json::Error),

    /// Nobody is listening on the bus.
    #[error("no open subscription for channel '{channel}'")]
    Closed {
        /// Channel the message was published on.
        channel: String,
    },
}

/// Envelope of every frame on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMessage {
    /// Unique message id.
    pub id: Uuid,
    /// Channel name.
    pub channel: String,
    /// Instance name of the publishing node.
    pub sender: String,
    /// Channel-specific payload.
    pub payload: serde_json::Value,
}

impl ClusterMessage {
    /// Wrap `event` for `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Encode`] if the event cannot be serialized.
    pub fn new(channel: &str, sender: &str, event: &DistanceEvent) -> Result<Self, BusError> {
        Ok(Self {
            id: Uuid::new_v4(),
            channel: channel.to_string(),
            sender: sender.to_string(),
            payload: serde_json::to_value(event).map_err(BusError::Encode)?,
        })
    }

    /// Parse a wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Decode`] if the frame is not a valid message.
    pub fn decode(frame: &str) -> Result<Self, BusError> {
        serde_json::from_str(frame).map_err(BusError::Decode)
    }

    /// Serialize to a wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<String, BusError> {
        serde_json::to_string(self).map_err(BusError::Encode)
    }

    /// Extract the distance event carried by this message.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Decode`] if the payload is not a distance event.
    pub fn event(&self) -> Result<DistanceEvent, BusError> {
        DistanceEvent::deserialize(&self.payload).map_err(BusError::Decode)
    }
}

/// Receiver of events delivered through [`ClusterBus::on`].
#[async_trait]
pub trait BusHandler: Send + Sync {
    /// Handle one event.
    async fn handle(&self, event: DistanceEvent);
}

/// Transport shared by all nodes of a cluster.
#[async_trait]
pub trait ClusterBus: Send + Sync + std::fmt::Debug {
    /// Publish `event` on `channel`, returning the number of receivers.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the event cannot be encoded or nobody listens.
    async fn publish(&self, channel: &str, event: &DistanceEvent) -> Result<usize, BusError>;

    /// Subscribe to `channel`.
    fn subscribe(&self, channel: &str) -> BusSubscription;

    /// Deliver every event on `channel` to `handler` from a background task.
    fn on(&self, channel: &str, handler: Arc<dyn BusHandler>) -> JoinHandle<()> {
        let mut subscription = self.subscribe(channel);
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                handler.handle(event).await;
            }
            debug!(channel = %subscription.channel, "Cluster subscription closed");
        })
    }
}

/// Subscription to one channel.
#[derive(Debug)]
pub struct BusSubscription {
    channel: String,
    receiver: broadcast::Receiver<Arc<str>>,
}

impl BusSubscription {
    /// Channel this subscription listens on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next event on this channel.
    ///
    /// Frames for other channels are skipped, as are undecodable frames and
    /// frames dropped while the subscriber lagged. Returns `None` once the bus
    /// is gone.
    pub async fn recv(&mut self) -> Option<DistanceEvent> {
        loop {
            let frame = match self.receiver.recv().await {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(channel = %self.channel, lagged = count, "Subscriber lagged, frames dropped");
                    continue;
                }
            };

            let message = match ClusterMessage::decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    let error = ProximaError::from(e);
                    warn!(
                        channel = %self.channel,
                        code = error.error_code(),
                        error = %error,
                        "Skipping malformed frame"
                    );
                    continue;
                }
            };
            if message.channel != self.channel {
                continue;
            }
            match message.event() {
                Ok(event) => return Some(event),
                Err(e) => {
                    let error = ProximaError::from(e);
                    warn!(
                        channel = %self.channel,
                        message_id = %message.id,
                        sender = %message.sender,
                        code = error.error_code(),
                        error = %error,
                        "Skipping message with malformed payload"
                    );
                }
            }
        }
    }
}

/// Bus confined to one process, backed by `tokio::sync::broadcast`.
#[derive(Debug)]
pub struct InMemoryClusterBus {
    node_name: String,
    sender: broadcast::Sender<Arc<str>>,
    published: AtomicU64,
}

impl InMemoryClusterBus {
    /// Create a bus for the node `node_name`.
    #[must_use]
    pub fn new(node_name: impl Into<String>) -> Self {
        Self::with_capacity(node_name, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus buffering `capacity` frames per subscriber.
    #[must_use]
    pub fn with_capacity(node_name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            node_name: node_name.into(),
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Inject a raw frame as if it had arrived from another node.
    ///
    /// Returns the number of receivers; frames with no receiver are dropped.
    pub fn deliver(&self, frame: &str) -> usize {
        self.sender.send(Arc::from(frame)).unwrap_or(0)
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Number of messages published by this node.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ClusterBus for InMemoryClusterBus {
    async fn publish(&self, channel: &str, event: &DistanceEvent) -> Result<usize, BusError> {
        let frame = ClusterMessage::new(channel, &self.node_name, event)?.encode()?;
        self.published.fetch_add(1, Ordering::Relaxed);

        let receivers = self
            .sender
            .send(Arc::from(frame))
            .map_err(|_| BusError::Closed {
                channel: channel.to_string(),
            })?;
        debug!(channel, tag_id = %event.tag_id, receivers, "Published cluster message");
        Ok(receivers)
    }

    fn subscribe(&self, channel: &str) -> BusSubscription {
        BusSubscription {
            channel: channel.to_string(),
            receiver: self.sender.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    fn event(origin: &str) -> DistanceEvent {
        DistanceEvent {
            instance_name: origin.into(),
            tag_id: "aabbcc".into(),
            tag_name: "Keys".into(),
            peripheral_id: "aabbcc".into(),
            is_app: false,
            rssi: -70.0,
            measured_power: -59,
            distance: 3.2,
            out_of_range: false,
            battery_level: Some(90),
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_fails() {
        let bus = InMemoryClusterBus::new("node-a");
        let result = bus.publish(NEW_DISTANCE_CHANNEL, &event("node-a")).await;
        assert!(matches!(assert_err!(result), BusError::Closed { .. }));
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = InMemoryClusterBus::new("node-a");
        let mut subscription = bus.subscribe(NEW_DISTANCE_CHANNEL);

        let sent = event("node-a");
        let receivers = assert_ok!(bus.publish(NEW_DISTANCE_CHANNEL, &sent).await);
        assert_eq!(receivers, 1);

        assert_eq!(subscription.recv().await.unwrap(), sent);
    }

    #[tokio::test]
    async fn test_other_channels_are_skipped() {
        let bus = InMemoryClusterBus::new("node-a");
        let mut subscription = bus.subscribe(NEW_DISTANCE_CHANNEL);

        assert_ok!(bus.publish("ble.other", &event("node-a")).await);
        assert_ok!(bus.publish(NEW_DISTANCE_CHANNEL, &event("node-b")).await);

        let received = subscription.recv().await.unwrap();
        assert_eq!(received.instance_name, "node-b");
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let bus = InMemoryClusterBus::new("node-a");
        let mut subscription = bus.subscribe(NEW_DISTANCE_CHANNEL);

        bus.deliver("not json");
        bus.deliver(
            &serde_json::json!({
                "id": Uuid::new_v4(),
                "channel": NEW_DISTANCE_CHANNEL,
                "sender": "node-c",
                "payload": {"tagId": "aabbcc"}
            })
            .to_string(),
        );
        let valid = ClusterMessage::new(NEW_DISTANCE_CHANNEL, "node-b", &event("node-b"))
            .unwrap()
            .encode()
            .unwrap();
        bus.deliver(&valid);

        let received = subscription.recv().await.unwrap();
        assert_eq!(received.instance_name, "node-b");
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_dropped_frames() {
        let bus = InMemoryClusterBus::with_capacity("node-a", 2);
        let mut subscription = bus.subscribe(NEW_DISTANCE_CHANNEL);

        for origin in ["node-1", "node-2", "node-3", "node-4"] {
            assert_ok!(bus.publish(NEW_DISTANCE_CHANNEL, &event(origin)).await);
        }

        let received = subscription.recv().await.unwrap();
        assert_eq!(received.instance_name, "node-3");
    }

    #[test]
    fn test_message_envelope_shape() {
        let message = ClusterMessage::new(NEW_DISTANCE_CHANNEL, "node-a", &event("node-a")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&message.encode().unwrap()).unwrap();

        assert_eq!(json["channel"], NEW_DISTANCE_CHANNEL);
        assert_eq!(json["sender"], "node-a");
        assert_eq!(json["payload"]["instanceName"], "node-a");
        assert_eq!(json["payload"]["tagId"], "aabbcc");
    }

    struct Collector(Mutex<Vec<DistanceEvent>>);

    #[async_trait]
    impl BusHandler for Collector {
        async fn handle(&self, event: DistanceEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_on_delivers_to_handler() {
        let bus = InMemoryClusterBus::new("node-a");
        let collector = Arc::new(Collector(Mutex::new(Vec::new())));
        let task = bus.on(NEW_DISTANCE_CHANNEL, collector.clone());

        assert_ok!(bus.publish(NEW_DISTANCE_CHANNEL, &event("node-b")).await);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(collector.0.lock().unwrap().len(), 1);
        task.abort();
    }
}
