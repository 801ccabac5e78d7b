use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI document for the disc hold backend.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::holds::begin_hold,
        crate::routes::holds::list_inventory,
        crate::routes::holds::dismiss_released,
        crate::routes::discs::resolve_scan,
        crate::routes::discs::register_disc,
        crate::routes::discs::remove_disc,
        crate::routes::discs::release_disc,
        crate::routes::discs::save_push_token,
        crate::routes::notifications::list_notifications,
        crate::routes::notifications::dismiss_notification,
        crate::routes::notifications::notification_stream,
        crate::routes::admin::recover_holds,
        crate::routes::admin::tick_hold,
        crate::routes::admin::register_codes,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::health::HealthStatus,
            crate::dto::hold::BeginHoldRequest,
            crate::dto::hold::HoldSummary,
            crate::dto::hold::InventoryResponse,
            crate::dto::hold::TickResult,
            crate::dto::hold::TickResponse,
            crate::dto::hold::RecoveryResponse,
            crate::dto::disc::DiscDto,
            crate::dto::disc::ScanRequest,
            crate::dto::disc::ScanResponse,
            crate::dto::disc::RegisterDiscRequest,
            crate::dto::disc::DiscResponse,
            crate::dto::disc::ReleaseResponse,
            crate::dto::disc::PushTokenRequest,
            crate::dto::disc::RegisterCodesRequest,
            crate::dto::disc::CodesRegisteredResponse,
            crate::dto::notification::NotificationDto,
            crate::dto::notification::MailboxResponse,
            crate::dao::models::NotificationKind,
            crate::dao::models::ReleaseReason,
            crate::state::hold::HoldStatus,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "holds", description = "Store intake and hold inventory"),
        (name = "discs", description = "Scanning, bag management and early release"),
        (name = "notifications", description = "Player and store mailboxes"),
        (name = "admin", description = "Hold timer and QR registry operations"),
    )
)]
pub struct ApiDoc;
