//! DTOs for disc registration, removal and scan resolution.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use crate::{
    dao::models::{DiscAttributes, DiscOwnershipEntity},
    dto::{format_system_time, validation::validate_record_id},
    services::scan_service::ScanOutcome,
};

/// Most codes accepted by one registry import.
pub const MAX_CODES_PER_IMPORT: usize = 500;

/// Descriptive attributes of a disc.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct DiscDto {
    pub name: String,
    pub manufacturer: String,
    pub color: String,
}

impl From<DiscAttributes> for DiscDto {
    fn from(disc: DiscAttributes) -> Self {
        Self {
            name: disc.name,
            manufacturer: disc.manufacturer,
            color: disc.color,
        }
    }
}

/// Scanned code submitted by a player or a store.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct ScanRequest {
    #[validate(custom(function = "validate_record_id"))]
    pub code: String,
}

/// What a scanned code refers to, from the scanning user's point of view.
#[derive(Debug, Serialize, ToSchema, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScanResponse {
    /// The disc is already in the scanner's bag.
    OwnedBySelf { disc_uid: String, disc: DiscDto },
    /// The disc belongs to another player.
    OwnedByOther {
        disc_uid: String,
        owner_id: String,
        disc: DiscDto,
    },
    /// The code is printed but nobody registered it yet.
    UnregisteredButKnownCode { code: String },
    /// The code is not recognised.
    Unknown { code: String },
}

impl From<ScanOutcome> for ScanResponse {
    fn from(outcome: ScanOutcome) -> Self {
        match outcome {
            ScanOutcome::OwnedBySelf { disc_uid, disc } => ScanResponse::OwnedBySelf {
                disc_uid,
                disc: disc.into(),
            },
            ScanOutcome::OwnedByOther {
                disc_uid,
                owner_id,
                disc,
            } => ScanResponse::OwnedByOther {
                disc_uid,
                owner_id,
                disc: disc.into(),
            },
            ScanOutcome::UnregisteredButKnownCode { code } => {
                ScanResponse::UnregisteredButKnownCode { code }
            }
            ScanOutcome::Unknown { code } => ScanResponse::Unknown { code },
        }
    }
}

/// Claim a known code as a new disc in the caller's bag.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct RegisterDiscRequest {
    #[validate(custom(function = "validate_record_id"))]
    pub code: String,
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    #[validate(length(max = 120))]
    #[serde(default)]
    pub manufacturer: String,
    #[validate(length(max = 60))]
    #[serde(default)]
    pub color: String,
}

impl RegisterDiscRequest {
    pub fn attributes(&self) -> DiscAttributes {
        DiscAttributes {
            name: self.name.trim().to_owned(),
            manufacturer: self.manufacturer.trim().to_owned(),
            color: self.color.trim().to_owned(),
        }
    }
}

/// Ownership record as exposed by the API.
#[derive(Debug, Serialize, ToSchema)]
pub struct DiscResponse {
    pub disc_uid: String,
    pub owner_id: String,
    pub disc: DiscDto,
    /// RFC 3339 timestamp of the registration.
    pub registered_at: String,
}

impl From<DiscOwnershipEntity> for DiscResponse {
    fn from(entity: DiscOwnershipEntity) -> Self {
        Self {
            disc_uid: entity.disc_uid,
            owner_id: entity.owner_id,
            disc: entity.disc.into(),
            registered_at: format_system_time(entity.registered_at),
        }
    }
}

/// Outcome of an owner-initiated release.
#[derive(Debug, Serialize, ToSchema)]
pub struct ReleaseResponse {
    pub disc_uid: String,
    /// `false` when there was nothing left to release.
    pub released: bool,
}

/// Register or clear the device token used for push notifications.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct PushTokenRequest {
    #[validate(length(min = 1, max = 256))]
    pub push_token: Option<String>,
}

/// Printed codes to add to the QR registry.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterCodesRequest {
    pub codes: Vec<String>,
}

impl Validate for RegisterCodesRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.codes.is_empty() || self.codes.len() > MAX_CODES_PER_IMPORT {
            let mut err = validator::ValidationError::new("codes_count");
            err.message = Some(
                format!("Between 1 and {MAX_CODES_PER_IMPORT} codes must be supplied").into(),
            );
            errors.add("codes", err);
        }

        for code in &self.codes {
            if let Err(e) = validate_record_id(code) {
                errors.add("codes", e);
                break;
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Number of codes that were new to the registry.
#[derive(Debug, Serialize, ToSchema)]
pub struct CodesRegisteredResponse {
    pub inserted: usize,
}
