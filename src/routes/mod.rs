use axum::Router;

use crate::state::SharedState;

/// Hold timer and QR registry administration.
pub mod admin;
/// Scans, bag management and early release.
pub mod discs;
/// OpenAPI document and Swagger UI.
pub mod docs;
/// Liveness and storage health.
pub mod health;
/// Store intake and inventory.
pub mod holds;
pub mod identity;
/// Mailboxes and their live stream.
pub mod notifications;

/// Every route of the service, with the shared state attached.
pub fn router(state: SharedState) -> Router<()> {
    health::router()
        .merge(holds::router())
        .merge(discs::router())
        .merge(notifications::router())
        .merge(admin::router(state.clone()))
        .merge(docs::router())
        .with_state(state)
}
