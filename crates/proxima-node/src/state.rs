//! Application state shared across handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use proxima_core::{
    Config, ConfigResult, EntityRegistry, InMemoryClusterBus, PresenceAggregator,
    PresencePipeline,
};

/// Shared application state, cloned into every handler.
pub type SharedState = Arc<AppState>;

/// Everything a running node owns.
#[derive(Debug)]
pub struct AppState {
    /// Effective configuration.
    pub config: Config,
    /// The presence pipeline of this node.
    pub pipeline: Arc<PresencePipeline>,
    /// Downstream entities fed by the aggregator.
    pub registry: Arc<EntityRegistry>,
    /// Cluster bus the pipeline publishes to.
    pub bus: Arc<InMemoryClusterBus>,
    started_at: Instant,
    radio_available: AtomicBool,
}

impl AppState {
    /// Build the node's components for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the allow/deny patterns do not compile.
    pub fn new(config: Config) -> ConfigResult<Self> {
        let bus = Arc::new(InMemoryClusterBus::new(config.instance_name.clone()));
        let registry = Arc::new(EntityRegistry::new());
        let pipeline = Arc::new(PresencePipeline::new(
            config.clone(),
            bus.clone(),
            registry.clone(),
        )?);

        Ok(Self {
            config,
            pipeline,
            registry,
            bus,
            started_at: Instant::now(),
            radio_available: AtomicBool::new(false),
        })
    }

    /// Wrap into [`SharedState`].
    #[must_use]
    pub fn shared(self) -> SharedState {
        Arc::new(self)
    }

    /// The presence aggregator.
    #[must_use]
    pub fn aggregator(&self) -> &Arc<PresenceAggregator> {
        self.pipeline.aggregator()
    }

    /// Record whether the BLE scanner is running.
    pub fn set_radio_available(&self, available: bool) {
        self.radio_available.store(available, Ordering::Relaxed);
    }

    /// Whether the BLE scanner is running.
    #[must_use]
    pub fn is_radio_available(&self) -> bool {
        self.radio_available.load(Ordering::Relaxed)
    }

    /// Seconds since the state was built.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
