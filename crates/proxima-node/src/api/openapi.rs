//! OpenAPI specification generation for the proxima node API.
//!
//! The document is served at `/api/openapi.json`, rendered by Swagger UI at
//! `/swagger-ui`, and written to disk by the `gen-openapi` binary.

use proxima_core::{
    EntityDescriptor, EntityKind, EntityRecord, EntityState, PresenceState, PresenceStatus,
};
use utoipa::OpenApi;

use super::devices::{DeviceResponse, DevicesResponse};
use super::error::ErrorResponse;
use super::health::{HealthResponse, HealthStatus};
use super::system::SystemStatusResponse;

/// Render the OpenAPI specification as pretty JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for proxima.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "proxima API",
        version = "0.1.0",
        description = r#"
# proxima API

proxima tracks Bluetooth Low Energy tags and phones across a cluster of nodes.

## Overview

Every node scans for advertisements, estimates the distance to each tracked
tag and shares the observation with the other nodes. Each node fuses all
observations into one canonical state per device:

1. **Present** while at least one node reports the device in range; the
   distance is the smallest fresh in-range distance.
2. **Out of range** once every node's report is out of range or older than
   the configured timeout.

This API is read-only. Configuration lives in the node's TOML file.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local proxima node")
    ),
    tags(
        (
            name = "system",
            description = "Health checks and node status"
        ),
        (
            name = "presence",
            description = "Fused, cluster-wide device presence"
        )
    ),
    paths(
        super::health::health_check,
        super::system::get_status,
        super::devices::list_devices,
        super::devices::get_device,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            HealthStatus,
            SystemStatusResponse,
            DevicesResponse,
            DeviceResponse,
            PresenceState,
            PresenceStatus,
            EntityRecord,
            EntityDescriptor,
            EntityKind,
            EntityState,
        )
    )
)]
pub struct ApiDoc;
