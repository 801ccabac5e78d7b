//! DTOs for store holds and the hold timer.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    dao::models::{ReleaseReason, StoreIntakeEntity},
    dto::{disc::DiscDto, format_system_time, validation::validate_record_id},
    state::hold::HoldStatus,
};

/// Store request to start holding a scanned disc.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct BeginHoldRequest {
    #[validate(custom(function = "validate_record_id"))]
    pub disc_uid: String,
}

/// A hold as seen by the store.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HoldSummary {
    pub store_id: String,
    pub disc_uid: String,
    pub owner_id: String,
    pub disc: DiscDto,
    pub status: HoldStatus,
    pub timer_started_at: String,
    pub timeout_duration_ms: u64,
    /// Time left before the timer releases the disc; zero once released.
    pub remaining_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_reason: Option<ReleaseReason>,
}

impl HoldSummary {
    pub fn from_entity(entity: StoreIntakeEntity, now: SystemTime) -> Self {
        let remaining_ms = if entity.status.is_terminal() {
            0
        } else {
            entity.remaining(now).as_millis() as u64
        };

        Self {
            store_id: entity.store_id,
            disc_uid: entity.disc_uid,
            owner_id: entity.owner_id,
            disc: entity.disc.into(),
            status: entity.status,
            timer_started_at: format_system_time(entity.timer_started_at),
            timeout_duration_ms: entity.timeout_duration_ms,
            remaining_ms,
            released_at: entity.released_at.map(format_system_time),
            release_reason: entity.release_reason,
        }
    }
}

/// Store inventory split between running holds and the released log.
#[derive(Debug, Serialize, ToSchema)]
pub struct InventoryResponse {
    pub store_id: String,
    /// Running holds, most urgent first.
    pub active: Vec<HoldSummary>,
    /// Released holds, most recent first.
    pub released: Vec<HoldSummary>,
}

/// Result of a single forced evaluation of a hold.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TickResult {
    /// No threshold crossed since the last write.
    Unchanged,
    /// Status moved forward.
    Escalated,
    /// This evaluation released the disc.
    Released,
    /// The hold was already terminal or gone and is no longer tracked.
    Finished,
    /// Another evaluation of the same hold was in progress.
    Busy,
}

/// Response of the administrative tick endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct TickResponse {
    pub result: TickResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<HoldStatus>,
}

/// Response of the administrative recovery endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct RecoveryResponse {
    /// Non-terminal holds found in storage.
    pub found: usize,
    /// Holds that were not tracked before this recovery.
    pub registered: usize,
}
