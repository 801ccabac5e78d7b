use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, post},
};
use axum_valid::Valid;

use crate::{
    dto::hold::{BeginHoldRequest, HoldSummary, InventoryResponse},
    error::AppError,
    routes::identity::{CallerId, path_id},
    services::hold_service,
    state::SharedState,
};

/// Store-side hold endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route(
            "/stores/{store_id}/holds",
            post(begin_hold).get(list_inventory),
        )
        .route(
            "/stores/{store_id}/holds/{disc_uid}",
            delete(dismiss_released),
        )
}

/// Start holding a scanned disc and notify its owner.
#[utoipa::path(
    post,
    path = "/stores/{store_id}/holds",
    tag = "holds",
    params(
        ("store_id" = String, Path, description = "Store holding the disc"),
        ("X-User-Id" = String, Header, description = "Must match the store id"),
    ),
    request_body = BeginHoldRequest,
    responses(
        (status = 201, description = "Hold started, or the existing hold of this store", body = HoldSummary),
        (status = 404, description = "Disc is not registered"),
        (status = 409, description = "Disc is already held by another store"),
        (status = 503, description = "Storage unavailable"),
    )
)]
pub async fn begin_hold(
    State(state): State<SharedState>,
    caller: CallerId,
    Path(store_id): Path<String>,
    Valid(Json(payload)): Valid<Json<BeginHoldRequest>>,
) -> Result<(StatusCode, Json<HoldSummary>), AppError> {
    let store_id = path_id("store id", &store_id)?;
    caller.ensure_store(store_id)?;

    let record = hold_service::begin_hold(&state, store_id, &payload.disc_uid).await?;
    Ok((
        StatusCode::CREATED,
        Json(HoldSummary::from_entity(record, state.now())),
    ))
}

/// List the store's running holds and released log.
#[utoipa::path(
    get,
    path = "/stores/{store_id}/holds",
    tag = "holds",
    params(
        ("store_id" = String, Path, description = "Store whose inventory is listed"),
        ("X-User-Id" = String, Header, description = "Must match the store id"),
    ),
    responses((status = 200, description = "Store inventory", body = InventoryResponse))
)]
pub async fn list_inventory(
    State(state): State<SharedState>,
    caller: CallerId,
    Path(store_id): Path<String>,
) -> Result<Json<InventoryResponse>, AppError> {
    let store_id = path_id("store id", &store_id)?;
    caller.ensure_store(store_id)?;

    let inventory = hold_service::list_inventory(&state, store_id).await?;
    let as_of = inventory.as_of;
    Ok(Json(InventoryResponse {
        store_id: store_id.to_owned(),
        active: inventory
            .active
            .into_iter()
            .map(|record| HoldSummary::from_entity(record, as_of))
            .collect(),
        released: inventory
            .released
            .into_iter()
            .map(|record| HoldSummary::from_entity(record, as_of))
            .collect(),
    }))
}

/// Remove a released disc from the store's log.
#[utoipa::path(
    delete,
    path = "/stores/{store_id}/holds/{disc_uid}",
    tag = "holds",
    params(
        ("store_id" = String, Path, description = "Store owning the record"),
        ("disc_uid" = String, Path, description = "Released disc"),
        ("X-User-Id" = String, Header, description = "Must match the store id"),
    ),
    responses(
        (status = 204, description = "Record removed"),
        (status = 404, description = "No such record"),
        (status = 409, description = "Hold is still running"),
    )
)]
pub async fn dismiss_released(
    State(state): State<SharedState>,
    caller: CallerId,
    Path((store_id, disc_uid)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let store_id = path_id("store id", &store_id)?;
    let disc_uid = path_id("disc uid", &disc_uid)?;
    caller.ensure_store(store_id)?;

    hold_service::dismiss_released(&state, store_id, disc_uid).await?;
    Ok(StatusCode::NO_CONTENT)
}
