//! Liveness endpoint.
//!
//! A node without a radio still aggregates remote observations, so it answers
//! `degraded` instead of failing the check.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Node health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Scanning and aggregating.
    Ok,
    /// Aggregating remote observations only.
    Degraded,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "ok",
    "version": "0.1.0",
    "instance_name": "living-room",
    "radio_available": true
}))]
pub struct HealthResponse {
    /// Overall node health.
    pub status: HealthStatus,

    /// Service version from Cargo.toml.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Name of this node within the cluster.
    #[schema(example = "living-room")]
    pub instance_name: String,

    /// Whether the BLE scanner is running.
    pub radio_available: bool,
}

/// Creates the health router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(health_check))
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    operation_id = "healthCheck",
    summary = "Check node health",
    description = "Always answers 200 while the process serves requests. The status \
        is `degraded` when the node has no working radio and only fuses observations \
        received from other nodes.",
    responses(
        (status = 200, description = "Node is serving", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let radio_available = state.is_radio_available();
    Json(HealthResponse {
        status: if radio_available {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance_name: state.config.instance_name.clone(),
        radio_available,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::create_router;
    use crate::state::AppState;
    use axum_test::TestServer;
    use proxima_core::Config;

    fn server() -> (TestServer, SharedState) {
        let state = AppState::new(Config::default()).unwrap().shared();
        let server = TestServer::new(create_router(state.clone())).unwrap();
        (server, state)
    }

    #[tokio::test]
    async fn test_health_without_radio_is_degraded() {
        let (server, _) = server();
        let response = server.get("/health").await;
        response.assert_status_ok();

        let body: HealthResponse = response.json();
        assert_eq!(body.status, HealthStatus::Degraded);
        assert!(!body.radio_available);
    }

    #[tokio::test]
    async fn test_health_with_radio_is_ok() {
        let (server, state) = server();
        state.set_radio_available(true);

        let body: serde_json::Value = server.get("/health").await.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["radio_available"], true);
    }
}
