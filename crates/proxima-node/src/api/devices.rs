//! Presence API endpoints.
//!
//! Read-only views of the canonical, cluster-wide presence state and of the
//! entities derived from it.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use proxima_core::{EntityRecord, PresenceState};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// All devices known to this node.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "instance_name": "living-room",
    "devices": [
        {
            "device_id": "aabbccddeeff",
            "name": "Keys",
            "distance": 1.8,
            "status": "present",
            "battery_level": 87,
            "updated_at": "2026-01-01T12:00:00Z"
        }
    ],
    "count": 1,
    "generated_at_utc": "2026-01-01T12:00:05Z"
}))]
pub struct DevicesResponse {
    /// Node answering the request.
    #[schema(example = "living-room")]
    pub instance_name: String,

    /// Canonical presence state of every device, ordered by id.
    pub devices: Vec<PresenceState>,

    /// Number of devices.
    #[schema(example = 1)]
    pub count: usize,

    /// When this snapshot was taken.
    pub generated_at_utc: DateTime<Utc>,
}

/// One device with its downstream entities.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeviceResponse {
    /// Canonical presence state.
    pub presence: PresenceState,

    /// Entities registered for the device.
    pub entities: Vec<EntityRecord>,
}

/// Creates the devices router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_devices))
        .route("/{device_id}", get(get_device))
}

// ============================================================================
// Handlers
// ============================================================================

/// List the canonical presence of every known device.
#[utoipa::path(
    get,
    path = "/api/devices",
    tag = "presence",
    operation_id = "listDevices",
    summary = "List tracked devices",
    description = "Returns the fused presence state of every device observed by any \
        node in the cluster. A device is `present` while at least one node reports it \
        in range; its distance is the smallest fresh in-range distance.",
    responses(
        (status = 200, description = "Presence snapshot", body = DevicesResponse)
    )
)]
pub async fn list_devices(State(state): State<SharedState>) -> Json<DevicesResponse> {
    let devices = state.aggregator().states().await;
    Json(DevicesResponse {
        instance_name: state.config.instance_name.clone(),
        count: devices.len(),
        devices,
        generated_at_utc: Utc::now(),
    })
}

/// Get one device.
#[utoipa::path(
    get,
    path = "/api/devices/{device_id}",
    tag = "presence",
    operation_id = "getDevice",
    summary = "Get one tracked device",
    description = "Returns the fused presence state of a device together with its \
        distance sensor, tracker and battery entities.",
    params(
        ("device_id" = String, Path, description = "Tag id, beacon id or companion id")
    ),
    responses(
        (status = 200, description = "Device found", body = DeviceResponse),
        (status = 404, description = "Device has not been observed", body = super::error::ErrorResponse)
    )
)]
pub async fn get_device(
    State(state): State<SharedState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<DeviceResponse>> {
    let presence = state
        .aggregator()
        .state(&device_id)
        .await
        .ok_or_else(|| ApiError::device_not_found(&device_id))?;

    let entities = state
        .registry
        .list()
        .into_iter()
        .filter(|record| record.entity.device_id == device_id)
        .collect();

    Ok(Json(DeviceResponse { presence, entities }))
}
