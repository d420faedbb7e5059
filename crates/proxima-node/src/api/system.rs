//! System API endpoints.
//!
//! Provides node status: uptime, radio availability and pipeline counters.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Creates the system router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new().route("/status", get(get_status))
}

/// System status response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "version": "0.1.0",
    "instance_name": "living-room",
    "uptime_secs": 3600,
    "radio_available": true,
    "tracked_devices": 3,
    "entities": 8,
    "bus_subscribers": 1,
    "published_messages": 1250
}))]
pub struct SystemStatusResponse {
    /// Server version.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Name of this node.
    #[schema(example = "living-room")]
    pub instance_name: String,

    /// Server uptime in seconds.
    #[schema(example = 3600)]
    pub uptime_secs: u64,

    /// Whether the BLE scanner is running.
    #[schema(example = true)]
    pub radio_available: bool,

    /// Devices known to the aggregator.
    #[schema(example = 3)]
    pub tracked_devices: usize,

    /// Registered downstream entities.
    #[schema(example = 8)]
    pub entities: usize,

    /// Open cluster bus subscriptions.
    #[schema(example = 1)]
    pub bus_subscribers: usize,

    /// Observations this node published to the cluster.
    #[schema(example = 1250)]
    pub published_messages: u64,
}

/// Get system status.
#[utoipa::path(
    get,
    path = "/api/system/status",
    tag = "system",
    operation_id = "getSystemStatus",
    summary = "Get system status",
    description = "Returns the current node status including version, uptime, \
        radio availability and pipeline counters.",
    responses(
        (status = 200, description = "System status retrieved", body = SystemStatusResponse)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> Json<SystemStatusResponse> {
    Json(SystemStatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance_name: state.config.instance_name.clone(),
        uptime_secs: state.uptime_secs(),
        radio_available: state.is_radio_available(),
        tracked_devices: state.aggregator().len(),
        entities: state.registry.list().len(),
        bus_subscribers: state.bus.subscriber_count(),
        published_messages: state.bus.published(),
    })
}
