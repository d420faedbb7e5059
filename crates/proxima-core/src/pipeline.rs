//! Node data flow from radio advertisements to canonical presence.
//!
//! ```text
//! advertisement -> classify -> resolve companion -> overrides -> allow/deny
//!               -> smooth RSSI -> distance -> throttle
//!               -> { local aggregation, cluster bus }
//! cluster bus (other nodes) -> aggregation
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::access::AccessFilter;
use crate::bus::{BusHandler, ClusterBus, NEW_DISTANCE_CHANNEL};
use crate::classifier::{apply_overrides, calculate_distance, classify};
use crate::config::{Config, ConfigResult};
use crate::entity::EntitySink;
use crate::error::ProximaError;
use crate::filter::SignalFilter;
use crate::fusion::PresenceAggregator;
use crate::radio::Advertisement;
use crate::resolver::{CompanionResolver, Resolution};
use crate::tag::{DistanceEvent, TagKind};
use crate::throttle::ThrottledDispatcher;

/// Period of the aggregator's background expiry sweep.
pub const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Wires every component of a node together.
#[derive(Debug)]
pub struct PresencePipeline {
    config: Config,
    resolver: Arc<CompanionResolver>,
    access: AccessFilter,
    signal: SignalFilter,
    dispatcher: ThrottledDispatcher,
    dispatched: Mutex<Option<mpsc::UnboundedReceiver<DistanceEvent>>>,
    aggregator: Arc<PresenceAggregator>,
    bus: Arc<dyn ClusterBus>,
}

impl PresencePipeline {
    /// Build the pipeline for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRegex`](crate::config::ConfigError::InvalidRegex)
    /// if an allow/deny pattern does not compile.
    pub fn new(
        config: Config,
        bus: Arc<dyn ClusterBus>,
        sink: Arc<dyn EntitySink>,
    ) -> ConfigResult<Self> {
        let ble = &config.ble;
        let access = AccessFilter::from_config(ble)?;
        let signal = SignalFilter::new(ble.process_noise, ble.measurement_noise);
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = ThrottledDispatcher::new(ble.update_frequency(), tx);
        let resolver = Arc::new(CompanionResolver::new(ble.companion_app_detection));
        let aggregator = Arc::new(PresenceAggregator::new(
            config.instance_name.clone(),
            ble.timeout(),
            sink,
        ));

        Ok(Self {
            config,
            resolver,
            access,
            signal,
            dispatcher,
            dispatched: Mutex::new(Some(rx)),
            aggregator,
            bus,
        })
    }

    /// Name of this node.
    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.config.instance_name
    }

    /// The cluster-wide presence aggregator.
    #[must_use]
    pub const fn aggregator(&self) -> &Arc<PresenceAggregator> {
        &self.aggregator
    }

    /// The companion identity resolver.
    #[must_use]
    pub const fn resolver(&self) -> &Arc<CompanionResolver> {
        &self.resolver
    }

    /// Run one advertisement through the pipeline.
    ///
    /// Returns the observation handed to the dispatcher, or `None` when the
    /// tag was filtered out.
    pub fn handle_advertisement(&self, advertisement: &Advertisement) -> Option<DistanceEvent> {
        let ble = &self.config.ble;
        let mut tag = classify(advertisement, &ble.beacon, &ble.tag_overrides);

        if tag.kind == TagKind::Generic && self.resolver.is_candidate(advertisement) {
            match self.resolver.resolve(&mut tag, advertisement) {
                Resolution::Resolved(companion) => {
                    trace!(peripheral_id = %advertisement.id, companion_id = %companion, "Using companion identity");
                }
                Resolution::Started(_) | Resolution::Pending | Resolution::Denylisted => {}
            }
        }
        apply_overrides(&mut tag, &ble.tag_overrides);

        if !self.access.check(&tag.id, &tag.name) {
            trace!(tag_id = %tag.id, "Tag filtered out");
            return None;
        }

        tag.rssi = self.signal.filter(&tag.id, tag.rssi);
        tag.distance = calculate_distance(tag.rssi, tag.measured_power);
        let out_of_range = ble.max_distance.is_some_and(|max| tag.distance > max);

        let event = DistanceEvent::from_tag(&self.config.instance_name, &tag, out_of_range);
        self.dispatcher.submit(event.clone());
        Some(event)
    }

    /// Feed advertisements from a scanner until its channel closes.
    pub async fn run(self: Arc<Self>, mut advertisements: mpsc::Receiver<Advertisement>) {
        while let Some(advertisement) = advertisements.recv().await {
            self.handle_advertisement(&advertisement);
        }
        debug!("Advertisement stream ended");
    }

    /// Spawn the dispatch loop, the cluster subscription and the expiry sweep.
    ///
    /// Only the first call starts anything; later calls return no tasks.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let Some(mut dispatched) = self
            .dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            warn!("Presence pipeline already started");
            return Vec::new();
        };

        let aggregator = Arc::clone(&self.aggregator);
        let bus = Arc::clone(&self.bus);
        let dispatch = tokio::spawn(async move {
            while let Some(event) = dispatched.recv().await {
                debug!(
                    tag_id = %event.tag_id,
                    distance = event.distance,
                    out_of_range = event.out_of_range,
                    "Dispatching observation"
                );
                aggregator.handle_event(event.clone()).await;
                if let Err(e) = bus.publish(NEW_DISTANCE_CHANNEL, &event).await {
                    let error = ProximaError::from(e);
                    warn!(
                        tag_id = %event.tag_id,
                        code = error.error_code(),
                        recoverable = error.is_recoverable(),
                        error = %error,
                        "Failed to publish observation"
                    );
                }
            }
        });

        let remote = self.bus.on(
            NEW_DISTANCE_CHANNEL,
            Arc::new(RemoteObservations {
                instance_name: self.config.instance_name.clone(),
                aggregator: Arc::clone(&self.aggregator),
            }),
        );
        let sweep = self.aggregator.run_expiry_sweep(EXPIRY_SWEEP_INTERVAL);

        vec![dispatch, remote, sweep]
    }
}

/// Applies observations published by other nodes.
struct RemoteObservations {
    instance_name: String,
    aggregator: Arc<PresenceAggregator>,
}

#[async_trait]
impl BusHandler for RemoteObservations {
    async fn handle(&self, event: DistanceEvent) {
        if event.instance_name == self.instance_name {
            return;
        }
        trace!(tag_id = %event.tag_id, origin = %event.instance_name, "Received remote observation");
        self.aggregator.handle_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ClusterMessage, InMemoryClusterBus};
    use crate::entity::{tracker_entity_id, EntityRegistry, EntityState};
    use crate::fusion::PresenceStatus;
    use crate::radio::mock::MockPeripheral;
    use chrono::Utc;

    const GENERIC_APPLE: [u8; 5] = [0x4c, 0x00, 0x10, 0x05, 0x01];

    struct Node {
        pipeline: Arc<PresencePipeline>,
        bus: Arc<InMemoryClusterBus>,
        registry: Arc<EntityRegistry>,
        tasks: Vec<JoinHandle<()>>,
    }

    impl Drop for Node {
        fn drop(&mut self) {
            for task in &self.tasks {
                task.abort();
            }
        }
    }

    fn config(allowlist: &[&str]) -> Config {
        let mut config = Config {
            instance_name: "node-a".into(),
            ..Config::default()
        };
        config.ble.allowlist = allowlist.iter().map(ToString::to_string).collect();
        config.ble.update_frequency_secs = 2;
        config
    }

    fn node(config: Config) -> Node {
        let bus = Arc::new(InMemoryClusterBus::new(config.instance_name.clone()));
        let registry = Arc::new(EntityRegistry::new());
        let pipeline = Arc::new(
            PresencePipeline::new(config, bus.clone(), registry.clone()).unwrap(),
        );
        let tasks = pipeline.start();
        Node {
            pipeline,
            bus,
            registry,
            tasks,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_produces_one_dispatch() {
        let node = node(config(&["aabbcc"]));
        let peripheral = Arc::new(MockPeripheral::new("AA:BB:CC"));

        for _ in 0..3 {
            let event = node
                .pipeline
                .handle_advertisement(&peripheral.advertisement(-70, Vec::new()))
                .unwrap();
            assert_eq!(event.tag_id, "aabbcc");
            tokio::time::advance(Duration::from_millis(500)).await;
        }
        assert!(node.pipeline.aggregator().is_empty());

        tokio::time::advance(Duration::from_millis(600)).await;
        settle().await;

        let state = node.pipeline.aggregator().state("aabbcc").await.unwrap();
        assert_eq!(state.status, PresenceStatus::Present);
        assert_eq!(state.distance, Some(3.5));
        assert_eq!(node.bus.published(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlisted_tag_is_dropped() {
        let node = node(config(&["ddeeff"]));
        let peripheral = Arc::new(MockPeripheral::new("aa:bb:cc"));

        assert!(node
            .pipeline
            .handle_advertisement(&peripheral.advertisement(-70, Vec::new()))
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_beyond_max_distance_is_out_of_range() {
        let mut config = config(&["aabbcc"]);
        config.ble.max_distance = Some(10.0);
        let node = node(config);
        let peripheral = Arc::new(MockPeripheral::new("aa:bb:cc"));

        let event = node
            .pipeline
            .handle_advertisement(&peripheral.advertisement(-90, Vec::new()))
            .unwrap();
        assert!(event.out_of_range);

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;

        let state = node.pipeline.aggregator().state("aabbcc").await.unwrap();
        assert_eq!(state.status, PresenceStatus::OutOfRange);
        let tracker = node.registry.get(&tracker_entity_id("aabbcc")).unwrap();
        assert_eq!(tracker.state, Some(EntityState::Tracker { present: false }));
    }

    fn remote_event(origin: &str, distance: f64) -> DistanceEvent {
        DistanceEvent {
            instance_name: origin.into(),
            tag_id: "aabbcc".into(),
            tag_name: "Keys".into(),
            peripheral_id: "aabbcc".into(),
            is_app: false,
            rssi: -60.0,
            measured_power: -59,
            distance,
            out_of_range: false,
            battery_level: None,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_observations_are_aggregated() {
        let node = node(config(&["aabbcc"]));

        node.bus
            .publish(NEW_DISTANCE_CHANNEL, &remote_event("node-b", 1.2))
            .await
            .unwrap();
        settle().await;

        let state = node.pipeline.aggregator().state("aabbcc").await.unwrap();
        assert_eq!(state.distance, Some(1.2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_echo_is_ignored() {
        let node = node(config(&["aabbcc"]));

        node.bus
            .publish(NEW_DISTANCE_CHANNEL, &remote_event("node-a", 1.2))
            .await
            .unwrap();
        settle().await;

        assert!(node.pipeline.aggregator().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_companion_identity_replaces_hardware_id() {
        let node = node(config(&["app-7f3a"]));
        let peripheral = Arc::new(MockPeripheral::new("aa:bb:cc").with_companion_id("app-7f3a"));
        let advertisement = peripheral.advertisement(-60, GENERIC_APPLE.to_vec());

        // The handshake runs in the background; the hardware id is not allowlisted.
        assert!(node.pipeline.handle_advertisement(&advertisement).is_none());
        settle().await;
        assert_eq!(
            node.pipeline.resolver().companion_id("aabbcc").as_deref(),
            Some("app-7f3a")
        );

        let event = node.pipeline.handle_advertisement(&advertisement).unwrap();
        assert_eq!(event.tag_id, "app-7f3a");
        assert_eq!(event.peripheral_id, "aabbcc");
        assert!(event.is_app);
        assert_eq!(peripheral.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_beacon_without_reference_power_reaches_other_nodes() {
        let node = node(config(&["e2c56db5dffb48d2b060d0f5a71096e0-1-2"]));
        let mut data = vec![0x4c, 0x00, 0x02, 0x15];
        data.extend_from_slice(&[
            0xe2, 0xc5, 0x6d, 0xb5, 0xdf, 0xfb, 0x48, 0xd2, 0xb0, 0x60, 0xd0, 0xf5, 0xa7, 0x10,
            0x96, 0xe0,
        ]);
        data.extend_from_slice(&[0x00, 0x01, 0x00, 0x02, 0x00]);
        let peripheral = Arc::new(MockPeripheral::new("aa:bb:cc"));

        let event = node
            .pipeline
            .handle_advertisement(&peripheral.advertisement(-70, data))
            .unwrap();
        assert_eq!(event.measured_power, crate::tag::DEFAULT_MEASURED_POWER);
        assert!(event.distance.is_finite());

        let message = ClusterMessage::new(NEW_DISTANCE_CHANNEL, "node-a", &event).unwrap();
        let decoded = ClusterMessage::decode(&message.encode().unwrap())
            .unwrap()
            .event()
            .unwrap();
        assert_eq!(decoded.distance, event.distance);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_returns_no_tasks() {
        let node = node(config(&["aabbcc"]));
        assert!(node.pipeline.start().is_empty());
    }
}
