use std::convert::Infallible;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::sse::{Event, Sse},
    routing::{delete, get},
};
use futures::Stream;
use tracing::info;
use uuid::Uuid;

use crate::{
    dto::notification::MailboxResponse,
    error::AppError,
    routes::identity::CallerId,
    services::notification_service,
    state::SharedState,
};

/// Mailbox endpoints for players and stores.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/notifications", get(list_notifications))
        .route("/notifications/stream", get(notification_stream))
        .route("/notifications/{id}", delete(dismiss_notification))
}

/// Unread notifications of the caller, oldest first.
#[utoipa::path(
    get,
    path = "/notifications",
    tag = "notifications",
    params(("X-User-Id" = String, Header, description = "Mailbox owner")),
    responses((status = 200, description = "Caller's mailbox", body = MailboxResponse))
)]
pub async fn list_notifications(
    State(state): State<SharedState>,
    caller: CallerId,
) -> Result<Json<MailboxResponse>, AppError> {
    let mailbox = notification_service::list(&state, caller.as_str()).await?;
    Ok(Json(mailbox.into()))
}

/// Dismiss one notification.
#[utoipa::path(
    delete,
    path = "/notifications/{id}",
    tag = "notifications",
    params(
        ("id" = Uuid, Path, description = "Notification to dismiss"),
        ("X-User-Id" = String, Header, description = "Mailbox owner"),
    ),
    responses(
        (status = 200, description = "Mailbox after removal", body = MailboxResponse),
        (status = 404, description = "No such notification"),
    )
)]
pub async fn dismiss_notification(
    State(state): State<SharedState>,
    caller: CallerId,
    Path(id): Path<Uuid>,
) -> Result<Json<MailboxResponse>, AppError> {
    let mailbox = notification_service::dismiss(&state, caller.as_str(), id).await?;
    Ok(Json(mailbox.into()))
}

/// Stream the caller's mailbox as it changes.
#[utoipa::path(
    get,
    path = "/notifications/stream",
    tag = "notifications",
    params(("X-User-Id" = String, Header, description = "Mailbox owner")),
    responses((status = 200, description = "Mailbox SSE stream", content_type = "text/event-stream", body = String))
)]
pub async fn notification_stream(
    State(state): State<SharedState>,
    caller: CallerId,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let stream = notification_service::watch(&state, caller.as_str()).await?;
    info!(user_id = %caller.as_str(), "new notification stream");
    Ok(stream)
}
