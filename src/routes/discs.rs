use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, post, put},
};
use axum_valid::Valid;

use crate::{
    dto::disc::{
        DiscResponse, PushTokenRequest, RegisterDiscRequest, ReleaseResponse, ScanRequest,
        ScanResponse,
    },
    error::AppError,
    routes::identity::{CallerId, path_id},
    services::{hold_service, notification_service, scan_service},
    state::SharedState,
};

/// Player-side endpoints: scanning, bag management and early release.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/scans", post(resolve_scan))
        .route("/discs", post(register_disc))
        .route("/discs/{disc_uid}", delete(remove_disc))
        .route("/discs/{disc_uid}/release", post(release_disc))
        .route("/players/push-token", put(save_push_token))
}

/// Tell the caller what a scanned code refers to.
#[utoipa::path(
    post,
    path = "/scans",
    tag = "discs",
    params(("X-User-Id" = String, Header, description = "Scanning user")),
    request_body = ScanRequest,
    responses((status = 200, description = "Scan outcome", body = ScanResponse))
)]
pub async fn resolve_scan(
    State(state): State<SharedState>,
    caller: CallerId,
    Valid(Json(payload)): Valid<Json<ScanRequest>>,
) -> Result<Json<ScanResponse>, AppError> {
    let outcome = scan_service::resolve_scan(&state, &payload.code, caller.as_str()).await?;
    Ok(Json(outcome.into()))
}

/// Claim a known, unregistered code as a disc in the caller's bag.
#[utoipa::path(
    post,
    path = "/discs",
    tag = "discs",
    params(("X-User-Id" = String, Header, description = "Player registering the disc")),
    request_body = RegisterDiscRequest,
    responses(
        (status = 201, description = "Disc registered", body = DiscResponse),
        (status = 404, description = "Unknown code"),
        (status = 409, description = "Code already registered"),
    )
)]
pub async fn register_disc(
    State(state): State<SharedState>,
    caller: CallerId,
    Valid(Json(payload)): Valid<Json<RegisterDiscRequest>>,
) -> Result<(StatusCode, Json<DiscResponse>), AppError> {
    let entity = scan_service::register_disc(
        &state,
        caller.as_str(),
        &payload.code,
        payload.attributes(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(entity.into())))
}

/// Take a disc out of the caller's bag.
#[utoipa::path(
    delete,
    path = "/discs/{disc_uid}",
    tag = "discs",
    params(
        ("disc_uid" = String, Path, description = "Disc to remove"),
        ("X-User-Id" = String, Header, description = "Owner of the disc"),
    ),
    responses(
        (status = 204, description = "Disc removed"),
        (status = 403, description = "Disc belongs to someone else"),
        (status = 404, description = "No ownership record"),
        (status = 409, description = "Disc is held by a store"),
    )
)]
pub async fn remove_disc(
    State(state): State<SharedState>,
    caller: CallerId,
    Path(disc_uid): Path<String>,
) -> Result<StatusCode, AppError> {
    let disc_uid = path_id("disc uid", &disc_uid)?;
    scan_service::remove_disc(&state, caller.as_str(), disc_uid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Give up a disc a store is holding, ending its hold immediately.
#[utoipa::path(
    post,
    path = "/discs/{disc_uid}/release",
    tag = "discs",
    params(
        ("disc_uid" = String, Path, description = "Disc to release"),
        ("X-User-Id" = String, Header, description = "Owner of the disc"),
    ),
    responses(
        (status = 200, description = "Release outcome; `released` is false when nothing was left to release", body = ReleaseResponse),
        (status = 403, description = "Disc belongs to someone else"),
    )
)]
pub async fn release_disc(
    State(state): State<SharedState>,
    caller: CallerId,
    Path(disc_uid): Path<String>,
) -> Result<Json<ReleaseResponse>, AppError> {
    let disc_uid = path_id("disc uid", &disc_uid)?;
    let released = hold_service::release_disc(&state, disc_uid, caller.as_str()).await?;
    Ok(Json(ReleaseResponse {
        disc_uid: disc_uid.to_owned(),
        released,
    }))
}

/// Register or clear the caller's push token.
#[utoipa::path(
    put,
    path = "/players/push-token",
    tag = "discs",
    params(("X-User-Id" = String, Header, description = "Device owner")),
    request_body = PushTokenRequest,
    responses((status = 204, description = "Token saved"))
)]
pub async fn save_push_token(
    State(state): State<SharedState>,
    caller: CallerId,
    Valid(Json(payload)): Valid<Json<PushTokenRequest>>,
) -> Result<StatusCode, AppError> {
    notification_service::save_push_token(&state, caller.as_str(), payload.push_token).await?;
    Ok(StatusCode::NO_CONTENT)
}
