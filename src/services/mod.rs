/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Hold lifecycle: intake, release and store inventory.
pub mod hold_service;
/// Periodic escalation and release of active holds.
pub mod hold_timer;
/// Mailbox reads, dismissals and live streams.
pub mod notification_service;
/// Best-effort device push delivery.
pub mod notifier;
/// Scan resolution and disc registration.
pub mod scan_service;
/// Storage connection supervisor with reconnect backoff.
pub mod storage_supervisor;
