use serde::Serialize;
use utoipa::ToSchema;

/// Whether hold operations can currently reach storage.
#[derive(Debug, Clone, Copy, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    /// Storage is unreachable; hold operations answer 503.
    Degraded,
}

/// Body of `/healthcheck`.
#[derive(Debug, Serialize, ToSchema, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: HealthStatus,
    /// Holds currently tracked by the sweeper.
    pub active_holds: usize,
}
