use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::post,
};
use axum_valid::Valid;

use crate::{
    dto::{
        disc::{CodesRegisteredResponse, RegisterCodesRequest},
        hold::{RecoveryResponse, TickResponse, TickResult},
    },
    error::AppError,
    routes::identity::path_id,
    services::{
        hold_timer::{self, TickOutcome},
        scan_service,
    },
    state::{SharedState, registry::HoldKey},
};

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Operator endpoints driving the hold timer and the QR registry.
pub fn router(state: SharedState) -> Router<SharedState> {
    Router::new()
        .route("/admin/holds/recover", post(recover_holds))
        .route("/admin/holds/{store_id}/{disc_uid}/tick", post(tick_hold))
        .route("/admin/qr-codes", post(register_codes))
        .route_layer(middleware::from_fn_with_state(state, require_admin_token))
}

/// Re-derive the hold index from storage.
#[utoipa::path(
    post,
    path = "/admin/holds/recover",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token")),
    responses((status = 200, description = "Recovery summary", body = RecoveryResponse))
)]
pub async fn recover_holds(
    State(state): State<SharedState>,
) -> Result<Json<RecoveryResponse>, AppError> {
    let report = hold_timer::recover(&state).await?;
    Ok(Json(RecoveryResponse {
        found: report.found,
        registered: report.registered,
    }))
}

/// Evaluate a single hold now instead of waiting for the sweeper.
#[utoipa::path(
    post,
    path = "/admin/holds/{store_id}/{disc_uid}/tick",
    tag = "admin",
    params(
        ("store_id" = String, Path, description = "Store holding the disc"),
        ("disc_uid" = String, Path, description = "Held disc"),
        ("X-Admin-Token" = String, Header, description = "Configured admin token"),
    ),
    responses((status = 200, description = "Evaluation result", body = TickResponse))
)]
pub async fn tick_hold(
    State(state): State<SharedState>,
    Path((store_id, disc_uid)): Path<(String, String)>,
) -> Result<Json<TickResponse>, AppError> {
    let key = HoldKey::new(
        path_id("store id", &store_id)?,
        path_id("disc uid", &disc_uid)?,
    );

    let outcome = hold_timer::tick_hold(&state, &key).await?;
    let (result, status) = match outcome {
        TickOutcome::Unchanged(status) => (TickResult::Unchanged, Some(status)),
        TickOutcome::Escalated { to, .. } => (TickResult::Escalated, Some(to)),
        TickOutcome::Released => (TickResult::Released, None),
        TickOutcome::Finished => (TickResult::Finished, None),
        TickOutcome::Busy => (TickResult::Busy, None),
    };
    Ok(Json(TickResponse { result, status }))
}

/// Add printed codes to the QR registry.
#[utoipa::path(
    post,
    path = "/admin/qr-codes",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token")),
    request_body = RegisterCodesRequest,
    responses((status = 200, description = "Codes imported", body = CodesRegisteredResponse))
)]
pub async fn register_codes(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<RegisterCodesRequest>>,
) -> Result<Json<CodesRegisteredResponse>, AppError> {
    let inserted = scan_service::register_codes(&state, &payload.codes).await?;
    Ok(Json(CodesRegisteredResponse { inserted }))
}

async fn require_admin_token(
    State(state): State<SharedState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let provided = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_owned())
        .ok_or_else(|| {
            AppError::Unauthorized("missing admin token header `X-Admin-Token`".into())
        })?;

    match state.config().admin_token.as_deref() {
        Some(token) if token == provided => Ok(next.run(req).await),
        Some(_) => Err(AppError::Unauthorized("invalid admin token".into())),
        None => Err(AppError::Unauthorized(
            "admin routes are disabled: no admin token configured".into(),
        )),
    }
}
