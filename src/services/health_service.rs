use tracing::warn;

use crate::{
    dto::health::{HealthResponse, HealthStatus},
    state::SharedState,
};

/// Probe the store and summarise degraded mode and the hold index.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    let status = match state.require_store().await {
        Ok(store) => match store.health_check().await {
            Ok(()) => HealthStatus::Ok,
            Err(err) => {
                warn!(error = %err, "storage health probe failed");
                HealthStatus::Degraded
            }
        },
        Err(_) => HealthStatus::Degraded,
    };

    HealthResponse {
        status,
        active_holds: state.holds().len(),
    }
}
