//! DTOs exposing notification mailboxes.

use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dao::models::{MailboxEntity, NotificationEntity, NotificationKind},
    dto::{disc::DiscDto, format_system_time},
};

/// A single unread notification.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct NotificationDto {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub disc_uid: String,
    pub disc: DiscDto,
    pub store_id: String,
    pub from_user_id: String,
    pub created_at: String,
}

impl From<NotificationEntity> for NotificationDto {
    fn from(entity: NotificationEntity) -> Self {
        Self {
            id: entity.id,
            kind: entity.kind,
            disc_uid: entity.disc_uid,
            disc: entity.disc.into(),
            store_id: entity.store_id,
            from_user_id: entity.from_user_id,
            created_at: format_system_time(entity.created_at),
        }
    }
}

/// Unread notifications of a user, oldest first.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MailboxResponse {
    pub user_id: String,
    pub version: u64,
    pub items: Vec<NotificationDto>,
}

impl From<MailboxEntity> for MailboxResponse {
    fn from(entity: MailboxEntity) -> Self {
        Self {
            user_id: entity.user_id,
            version: entity.version,
            items: entity.items.into_values().map(Into::into).collect(),
        }
    }
}
