use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::state::{hold::HoldStatus, registry::HoldKey};

/// Descriptive attributes of a physical disc, opaque to the hold logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscAttributes {
    /// Mold name.
    pub name: String,
    /// Brand.
    pub manufacturer: String,
    /// Plastic color.
    pub color: String,
}

/// Durable fact that a disc currently sits in a player's bag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscOwnershipEntity {
    /// Physical identifier printed on the disc (its QR code).
    pub disc_uid: String,
    /// Player currently owning the disc.
    pub owner_id: String,
    /// Attributes entered at registration.
    pub disc: DiscAttributes,
    /// When the disc entered the owner's bag.
    pub registered_at: SystemTime,
    /// Distinguishes successive registrations of the same disc.
    #[serde(default = "Uuid::new_v4")]
    pub registration_id: Uuid,
}

/// Entry of the master QR registry: a printed code that may be claimed by a player.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QrCodeEntity {
    /// The printed code.
    pub code: String,
    /// When the code was imported.
    pub created_at: SystemTime,
}

/// Why a hold ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// The hold period elapsed.
    Timer,
    /// The owner gave the disc up before the timer ran out.
    Owner,
}

/// A disc a store scanned and holds while waiting on its owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreIntakeEntity {
    /// Store holding the disc.
    pub store_id: String,
    /// Held disc.
    pub disc_uid: String,
    /// Owner of the disc when the store scanned it.
    pub owner_id: String,
    /// Attributes copied from the ownership record.
    pub disc: DiscAttributes,
    /// Escalation stage.
    pub status: HoldStatus,
    /// Start of the hold period.
    pub timer_started_at: SystemTime,
    /// Total length of the hold in milliseconds.
    pub timeout_duration_ms: u64,
    /// Set once the hold is released.
    #[serde(default)]
    pub released_at: Option<SystemTime>,
    /// Set once the hold is released.
    #[serde(default)]
    pub release_reason: Option<ReleaseReason>,
    /// Claim on the disc this hold was started under.
    #[serde(default)]
    pub claim_id: Option<Uuid>,
}

impl StoreIntakeEntity {
    /// Key of the hold this record backs.
    pub fn key(&self) -> HoldKey {
        HoldKey::new(self.store_id.clone(), self.disc_uid.clone())
    }

    /// Total length of the hold.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_duration_ms)
    }

    /// Wall-clock time since the timer started; zero if the clock went backwards.
    pub fn elapsed(&self, now: SystemTime) -> Duration {
        now.duration_since(self.timer_started_at)
            .unwrap_or(Duration::ZERO)
    }

    /// Time left before release; zero once elapsed reaches the timeout.
    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.timeout().saturating_sub(self.elapsed(now))
    }
}

/// Right of a single store to hold a disc, keyed by the disc uid.
///
/// Created before the intake record and dropped when the hold is released, so
/// at most one store can run a hold on a disc at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HoldClaimEntity {
    /// Claimed disc.
    pub disc_uid: String,
    /// Store allowed to hold the disc.
    pub store_id: String,
    /// Identifies this claim among successive ones.
    pub claim_id: Uuid,
    /// When the claim was taken.
    pub claimed_at: SystemTime,
}

/// Kind of message sitting in a mailbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    /// A store scanned the recipient's disc.
    DiscFound,
    /// The owner released a disc the recipient store was holding.
    DiscReleased,
}

/// Single message addressed to a player or a store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationEntity {
    /// Notification id.
    pub id: Uuid,
    /// What happened.
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Disc the notification is about.
    pub disc_uid: String,
    /// Attributes of that disc.
    pub disc: DiscAttributes,
    /// Store involved.
    pub store_id: String,
    /// User whose action produced the message.
    pub from_user_id: String,
    /// When the notification was queued.
    pub created_at: SystemTime,
}

/// Ordered per-user queue of unread notifications; the head is what the user sees first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailboxEntity {
    /// Mailbox owner.
    pub user_id: String,
    /// Incremented on every write, used as the optimistic concurrency token.
    pub version: u64,
    /// Stored as a sequence so the queue order survives any JSON backend.
    #[serde(with = "indexmap::map::serde_seq")]
    pub items: IndexMap<Uuid, NotificationEntity>,
}

impl MailboxEntity {
    /// Mailbox with nothing in it.
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            version: 0,
            items: IndexMap::new(),
        }
    }

    /// Oldest unread notification.
    pub fn head(&self) -> Option<&NotificationEntity> {
        self.items.values().next()
    }

    /// Find the outstanding notification of `kind` about `disc_uid`.
    pub fn find_disc(&self, kind: NotificationKind, disc_uid: &str) -> Option<&NotificationEntity> {
        self.items
            .values()
            .find(|item| item.kind == kind && item.disc_uid == disc_uid)
    }

    /// Queue `notification`, replacing in place any previous one of the same kind
    /// about the same disc from the same store.
    pub fn push(&mut self, notification: NotificationEntity) {
        let existing = self
            .items
            .iter()
            .find(|(_, item)| {
                item.kind == notification.kind
                    && item.disc_uid == notification.disc_uid
                    && item.store_id == notification.store_id
            })
            .map(|(id, _)| *id);

        match existing {
            Some(id) => {
                if let Some(slot) = self.items.get_mut(&id) {
                    *slot = notification;
                }
            }
            None => {
                self.items.insert(notification.id, notification);
            }
        }
    }

    /// Drop every notification of `kind` about `disc_uid`; returns how many were removed.
    pub fn clear_disc(&mut self, kind: NotificationKind, disc_uid: &str) -> usize {
        let before = self.items.len();
        self.items
            .retain(|_, item| !(item.kind == kind && item.disc_uid == disc_uid));
        before - self.items.len()
    }

    /// Remove a notification by id, keeping the order of the rest.
    pub fn remove(&mut self, id: Uuid) -> Option<NotificationEntity> {
        self.items.shift_remove(&id)
    }
}

/// Device registration of a user, read when delivering push notifications.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerProfileEntity {
    /// Player or store id.
    pub user_id: String,
    /// Expo push token of the user's device.
    #[serde(default)]
    pub push_token: Option<String>,
}
