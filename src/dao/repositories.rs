use std::{sync::Arc, time::SystemTime};

use futures::{StreamExt, stream::BoxStream};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    dao::{
        document_store::{DocumentStore, FieldEquals, UpdateOutcome, WriteMode, collections},
        models::{
            DiscOwnershipEntity, HoldClaimEntity, MailboxEntity, PlayerProfileEntity, QrCodeEntity, ReleaseReason,
            StoreIntakeEntity,
        },
        storage::{StorageError, StorageResult},
    },
    state::{hold::HoldStatus, registry::HoldKey},
};

/// Attempts made by an optimistic mailbox write before giving up.
const MAILBOX_WRITE_ATTEMPTS: usize = 8;

fn decode<T: DeserializeOwned>(collection: &'static str, key: &str, value: Value) -> StorageResult<T> {
    serde_json::from_value(value).map_err(|source| StorageError::malformed(collection, key, source))
}

fn encode<T: Serialize>(collection: &'static str, key: &str, entity: &T) -> StorageResult<Value> {
    serde_json::to_value(entity).map_err(|source| StorageError::malformed(collection, key, source))
}

fn decode_all<T: DeserializeOwned>(
    collection: &'static str,
    documents: Vec<Value>,
) -> StorageResult<Vec<T>> {
    documents
        .into_iter()
        .map(|document| decode(collection, "<list>", document))
        .collect()
}

/// Ownership records: which player has which disc in their bag.
#[derive(Clone)]
pub struct DiscRepository {
    store: Arc<dyn DocumentStore>,
}

impl DiscRepository {
    /// Repository over `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Ownership record of a disc.
    pub async fn find(&self, disc_uid: &str) -> StorageResult<Option<DiscOwnershipEntity>> {
        self.store
            .get(collections::DISCS, disc_uid)
            .await?
            .map(|value| decode(collections::DISCS, disc_uid, value))
            .transpose()
    }

    /// Record ownership unless someone already owns the disc.
    pub async fn register(&self, entity: &DiscOwnershipEntity) -> StorageResult<bool> {
        let body = encode(collections::DISCS, &entity.disc_uid, entity)?;
        self.store
            .create(collections::DISCS, &entity.disc_uid, body)
            .await
    }

    /// Delete the ownership record only while `owner_id` still owns it.
    ///
    /// Exactly one of several concurrent callers gets `true`.
    pub async fn remove_owned(&self, disc_uid: &str, owner_id: &str) -> StorageResult<bool> {
        self.store
            .delete(
                collections::DISCS,
                disc_uid,
                Some(FieldEquals::text("owner_id", owner_id)),
            )
            .await
    }

    /// Delete the ownership record only while it is still the registration `registration_id`.
    pub async fn remove_registration(
        &self,
        disc_uid: &str,
        registration_id: Uuid,
    ) -> StorageResult<bool> {
        self.store
            .delete(
                collections::DISCS,
                disc_uid,
                Some(FieldEquals::text("registration_id", registration_id.to_string())),
            )
            .await
    }
}

/// Per-disc claims naming the one store allowed to hold it.
#[derive(Clone)]
pub struct ClaimRepository {
    store: Arc<dyn DocumentStore>,
}

impl ClaimRepository {
    /// Repository over `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Current claim on a disc.
    pub async fn find(&self, disc_uid: &str) -> StorageResult<Option<HoldClaimEntity>> {
        self.store
            .get(collections::DISC_HOLDS, disc_uid)
            .await?
            .map(|value| decode(collections::DISC_HOLDS, disc_uid, value))
            .transpose()
    }

    /// Take the claim on a disc; `false` when any store already has it.
    pub async fn acquire(&self, claim: &HoldClaimEntity) -> StorageResult<bool> {
        let body = encode(collections::DISC_HOLDS, &claim.disc_uid, claim)?;
        self.store
            .create(collections::DISC_HOLDS, &claim.disc_uid, body)
            .await
    }

    /// Drop the claim on `disc_uid` if it is still `claim_id`.
    pub async fn release(&self, disc_uid: &str, claim_id: Uuid) -> StorageResult<bool> {
        self.store
            .delete(
                collections::DISC_HOLDS,
                disc_uid,
                Some(FieldEquals::text("claim_id", claim_id.to_string())),
            )
            .await
    }

    /// Drop whatever claim `store_id` has on `disc_uid`.
    pub async fn release_for_store(&self, disc_uid: &str, store_id: &str) -> StorageResult<bool> {
        self.store
            .delete(
                collections::DISC_HOLDS,
                disc_uid,
                Some(FieldEquals::text("store_id", store_id)),
            )
            .await
    }
}

/// Master registry of printed QR codes.
#[derive(Clone)]
pub struct QrCodeRepository {
    store: Arc<dyn DocumentStore>,
}

impl QrCodeRepository {
    /// Repository over `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Registry entry of a code.
    pub async fn find(&self, code: &str) -> StorageResult<Option<QrCodeEntity>> {
        self.store
            .get(collections::QR_CODES, code)
            .await?
            .map(|value| decode(collections::QR_CODES, code, value))
            .transpose()
    }

    /// Add a code to the registry; returns `false` if it was already known.
    pub async fn insert(&self, entity: &QrCodeEntity) -> StorageResult<bool> {
        let body = encode(collections::QR_CODES, &entity.code, entity)?;
        self.store
            .create(collections::QR_CODES, &entity.code, body)
            .await
    }
}

/// Store intake records backing each hold.
#[derive(Clone)]
pub struct IntakeRepository {
    store: Arc<dyn DocumentStore>,
}

impl IntakeRepository {
    /// Repository over `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Record backing a hold.
    pub async fn find(&self, key: &HoldKey) -> StorageResult<Option<StoreIntakeEntity>> {
        let document_key = key.document_key();
        self.store
            .get(collections::STORE_INTAKE, &document_key)
            .await?
            .map(|value| decode(collections::STORE_INTAKE, &document_key, value))
            .transpose()
    }

    /// Insert a fresh intake record; returns `false` if one already exists for the key.
    pub async fn create(&self, entity: &StoreIntakeEntity) -> StorageResult<bool> {
        let document_key = entity.key().document_key();
        let body = encode(collections::STORE_INTAKE, &document_key, entity)?;
        self.store
            .create(collections::STORE_INTAKE, &document_key, body)
            .await
    }

    /// Replace a terminal record with a fresh hold.
    ///
    /// Succeeds only while the stored record is still `released`.
    pub async fn restart(&self, entity: &StoreIntakeEntity) -> StorageResult<UpdateOutcome> {
        let document_key = entity.key().document_key();
        let body = encode(collections::STORE_INTAKE, &document_key, entity)?;
        self.store
            .update(
                collections::STORE_INTAKE,
                &document_key,
                body,
                Some(FieldEquals::text("status", HoldStatus::Released.as_str())),
            )
            .await
    }

    /// Move a hold from `from` to a non-terminal `to`, only if it is still at `from`.
    pub async fn advance(
        &self,
        key: &HoldKey,
        from: HoldStatus,
        to: HoldStatus,
    ) -> StorageResult<UpdateOutcome> {
        self.store
            .update(
                collections::STORE_INTAKE,
                &key.document_key(),
                json!({ "status": to }),
                Some(FieldEquals::text("status", from.as_str())),
            )
            .await
    }

    /// Move a hold from `from` to `released`, recording when and why.
    pub async fn mark_released(
        &self,
        key: &HoldKey,
        from: HoldStatus,
        released_at: SystemTime,
        reason: ReleaseReason,
    ) -> StorageResult<UpdateOutcome> {
        let partial = json!({
            "status": HoldStatus::Released,
            "released_at": released_at,
            "release_reason": reason,
        });
        self.store
            .update(
                collections::STORE_INTAKE,
                &key.document_key(),
                partial,
                Some(FieldEquals::text("status", from.as_str())),
            )
            .await
    }

    /// Delete the record if it is still in `status`.
    pub async fn delete_in_status(&self, key: &HoldKey, status: HoldStatus) -> StorageResult<bool> {
        self.store
            .delete(
                collections::STORE_INTAKE,
                &key.document_key(),
                Some(FieldEquals::text("status", status.as_str())),
            )
            .await
    }

    /// Every record of a store, active or released.
    pub async fn list_for_store(&self, store_id: &str) -> StorageResult<Vec<StoreIntakeEntity>> {
        let documents = self
            .store
            .list(
                collections::STORE_INTAKE,
                Some(FieldEquals::text("store_id", store_id)),
            )
            .await?;
        decode_all(collections::STORE_INTAKE, documents)
    }

    /// Every record of a disc, across stores.
    pub async fn list_for_disc(&self, disc_uid: &str) -> StorageResult<Vec<StoreIntakeEntity>> {
        let documents = self
            .store
            .list(
                collections::STORE_INTAKE,
                Some(FieldEquals::text("disc_uid", disc_uid)),
            )
            .await?;
        decode_all(collections::STORE_INTAKE, documents)
    }

    /// Every intake record.
    pub async fn list_all(&self) -> StorageResult<Vec<StoreIntakeEntity>> {
        let documents = self.store.list(collections::STORE_INTAKE, None).await?;
        decode_all(collections::STORE_INTAKE, documents)
    }
}

/// Per-user notification queues, written with optimistic versioning.
#[derive(Clone)]
pub struct MailboxRepository {
    store: Arc<dyn DocumentStore>,
}

impl MailboxRepository {
    /// Repository over `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Current mailbox of `user_id`; an absent document reads as an empty mailbox.
    pub async fn find(&self, user_id: &str) -> StorageResult<MailboxEntity> {
        match self.store.get(collections::NOTIFICATIONS, user_id).await? {
            Some(value) => decode(collections::NOTIFICATIONS, user_id, value),
            None => Ok(MailboxEntity::empty(user_id)),
        }
    }

    /// Apply `change` to the mailbox and write it back if the closure reports a change.
    ///
    /// The write only lands if no one else wrote the mailbox since it was read;
    /// otherwise the closure runs again on the fresh value. Returns the stored
    /// mailbox when a write happened, `None` when `change` left it untouched.
    pub async fn modify<F>(&self, user_id: &str, mut change: F) -> StorageResult<Option<MailboxEntity>>
    where
        F: FnMut(&mut MailboxEntity) -> bool,
    {
        for _ in 0..MAILBOX_WRITE_ATTEMPTS {
            let stored = self.store.get(collections::NOTIFICATIONS, user_id).await?;
            let exists = stored.is_some();
            let mut mailbox = match stored {
                Some(value) => decode::<MailboxEntity>(collections::NOTIFICATIONS, user_id, value)?,
                None => MailboxEntity::empty(user_id),
            };

            if !change(&mut mailbox) {
                return Ok(None);
            }

            let read_version = mailbox.version;
            mailbox.version = read_version + 1;
            let body = encode(collections::NOTIFICATIONS, user_id, &mailbox)?;

            let written = if exists {
                let version = i64::try_from(read_version).unwrap_or(i64::MAX);
                self.store
                    .update(
                        collections::NOTIFICATIONS,
                        user_id,
                        body,
                        Some(FieldEquals::integer("version", version)),
                    )
                    .await?
                    == UpdateOutcome::Applied
            } else {
                self.store
                    .create(collections::NOTIFICATIONS, user_id, body)
                    .await?
            };

            if written {
                return Ok(Some(mailbox));
            }
            tracing::debug!(user_id, "mailbox write lost a race, retrying");
        }

        Err(StorageError::Contention {
            collection: collections::NOTIFICATIONS,
            key: user_id.to_owned(),
        })
    }

    /// Current mailbox followed by every later version of it.
    pub fn watch(&self, user_id: &str) -> BoxStream<'static, StorageResult<MailboxEntity>> {
        let owner = user_id.to_owned();
        self.store
            .watch(collections::NOTIFICATIONS, user_id)
            .map(move |change| match change? {
                Some(value) => decode(collections::NOTIFICATIONS, &owner, value),
                None => Ok(MailboxEntity::empty(owner.clone())),
            })
            .boxed()
    }
}

/// Device registrations used for push delivery.
#[derive(Clone)]
pub struct ProfileRepository {
    store: Arc<dyn DocumentStore>,
}

impl ProfileRepository {
    /// Repository over `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Profile of a user.
    pub async fn find(&self, user_id: &str) -> StorageResult<Option<PlayerProfileEntity>> {
        self.store
            .get(collections::PLAYERS, user_id)
            .await?
            .map(|value| decode(collections::PLAYERS, user_id, value))
            .transpose()
    }

    /// Store or replace the push token of a user, keeping other profile fields.
    pub async fn save_push_token(&self, user_id: &str, push_token: Option<String>) -> StorageResult<()> {
        let profile = PlayerProfileEntity {
            user_id: user_id.to_owned(),
            push_token,
        };
        let body = encode(collections::PLAYERS, user_id, &profile)?;
        self.store
            .set(collections::PLAYERS, user_id, body, WriteMode::Merge)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dao::{
        document_store::memory::MemoryDocumentStore,
        models::{DiscAttributes, NotificationEntity, NotificationKind},
    };

    fn memory() -> Arc<dyn DocumentStore> {
        Arc::new(MemoryDocumentStore::new())
    }

    fn intake(status: HoldStatus) -> StoreIntakeEntity {
        StoreIntakeEntity {
            store_id: "storeA".into(),
            disc_uid: "disc123".into(),
            owner_id: "player1".into(),
            disc: DiscAttributes::default(),
            status,
            timer_started_at: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000),
            timeout_duration_ms: 180_000,
            released_at: None,
            release_reason: None,
            claim_id: None,
        }
    }

    fn found(disc_uid: &str) -> NotificationEntity {
        NotificationEntity {
            id: Uuid::new_v4(),
            kind: NotificationKind::DiscFound,
            disc_uid: disc_uid.into(),
            disc: DiscAttributes::default(),
            store_id: "storeA".into(),
            from_user_id: "storeA".into(),
            created_at: SystemTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn intake_status_moves_only_from_expected_value() {
        let repo = IntakeRepository::new(memory());
        let record = intake(HoldStatus::Notified);
        assert!(repo.create(&record).await.unwrap());
        assert!(!repo.create(&record).await.unwrap());

        let key = record.key();
        assert_eq!(
            repo.advance(&key, HoldStatus::Notified, HoldStatus::Warning)
                .await
                .unwrap(),
            UpdateOutcome::Applied
        );
        assert_eq!(
            repo.advance(&key, HoldStatus::Notified, HoldStatus::Critical)
                .await
                .unwrap(),
            UpdateOutcome::PreconditionFailed
        );

        let released_at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_200);
        repo.mark_released(&key, HoldStatus::Warning, released_at, ReleaseReason::Owner)
            .await
            .unwrap();

        let stored = repo.find(&key).await.unwrap().unwrap();
        assert_eq!(stored.status, HoldStatus::Released);
        assert_eq!(stored.released_at, Some(released_at));
        assert_eq!(stored.release_reason, Some(ReleaseReason::Owner));
        assert_eq!(repo.list_for_store("storeA").await.unwrap().len(), 1);
        assert!(repo.list_for_store("storeB").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restart_only_replaces_released_records() {
        let repo = IntakeRepository::new(memory());
        repo.create(&intake(HoldStatus::Critical)).await.unwrap();

        assert_eq!(
            repo.restart(&intake(HoldStatus::Notified)).await.unwrap(),
            UpdateOutcome::PreconditionFailed
        );

        let key = intake(HoldStatus::Critical).key();
        repo.mark_released(&key, HoldStatus::Critical, SystemTime::UNIX_EPOCH, ReleaseReason::Timer)
            .await
            .unwrap();
        assert_eq!(
            repo.restart(&intake(HoldStatus::Notified)).await.unwrap(),
            UpdateOutcome::Applied
        );
        assert_eq!(
            repo.find(&key).await.unwrap().unwrap().status,
            HoldStatus::Notified
        );
    }

    #[tokio::test]
    async fn mailbox_modify_bumps_version_and_keeps_order() {
        let repo = MailboxRepository::new(memory());
        let first = found("disc1");
        let first_id = first.id;

        let mut pending = Some(first);
        repo.modify("player1", |mailbox| match pending.take() {
            Some(item) => {
                mailbox.push(item);
                true
            }
            None => false,
        })
        .await
        .unwrap();
        repo.modify("player1", |mailbox| {
            mailbox.push(found("disc2"));
            true
        })
        .await
        .unwrap();

        let mailbox = repo.find("player1").await.unwrap();
        assert_eq!(mailbox.version, 2);
        assert_eq!(mailbox.items.len(), 2);
        assert_eq!(mailbox.head().map(|n| n.id), Some(first_id));

        let untouched = repo.modify("player1", |_| false).await.unwrap();
        assert!(untouched.is_none());
        assert_eq!(repo.find("player1").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn concurrent_mailbox_writers_do_not_lose_entries() {
        let repo = MailboxRepository::new(memory());
        let mut tasks = Vec::new();
        for index in 0..4 {
            let repo = repo.clone();
            tasks.push(tokio::spawn(async move {
                repo.modify("player1", |mailbox| {
                    mailbox.push(found(&format!("disc{index}")));
                    true
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mailbox = repo.find("player1").await.unwrap();
        assert_eq!(mailbox.items.len(), 4);
        assert_eq!(mailbox.version, 4);
    }

    #[tokio::test]
    async fn ownership_removal_requires_current_owner() {
        let repo = DiscRepository::new(memory());
        let entity = DiscOwnershipEntity {
            disc_uid: "disc123".into(),
            owner_id: "player1".into(),
            disc: DiscAttributes::default(),
            registered_at: SystemTime::UNIX_EPOCH,
            registration_id: Uuid::new_v4(),
        };
        assert!(repo.register(&entity).await.unwrap());
        assert!(!repo.register(&entity).await.unwrap());

        assert!(!repo.remove_owned("disc123", "player2").await.unwrap());
        assert!(repo.remove_owned("disc123", "player1").await.unwrap());
        assert!(repo.find("disc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn registration_removal_spares_a_newer_registration() {
        let repo = DiscRepository::new(memory());
        let old_registration = Uuid::new_v4();
        let entity = DiscOwnershipEntity {
            disc_uid: "disc123".into(),
            owner_id: "player1".into(),
            disc: DiscAttributes::default(),
            registered_at: SystemTime::UNIX_EPOCH,
            registration_id: Uuid::new_v4(),
        };
        repo.register(&entity).await.unwrap();

        assert!(!repo.remove_registration("disc123", old_registration).await.unwrap());
        assert!(repo.find("disc123").await.unwrap().is_some());
        assert!(repo.remove_registration("disc123", entity.registration_id).await.unwrap());
        assert!(repo.find("disc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn a_disc_claim_has_one_holder_at_a_time() {
        let repo = ClaimRepository::new(memory());
        let claim = |store_id: &str| HoldClaimEntity {
            disc_uid: "disc123".into(),
            store_id: store_id.into(),
            claim_id: Uuid::new_v4(),
            claimed_at: SystemTime::UNIX_EPOCH,
        };
        let first = claim("storeA");

        assert!(repo.acquire(&first).await.unwrap());
        assert!(!repo.acquire(&claim("storeB")).await.unwrap());
        assert!(!repo.release(&first.disc_uid, Uuid::new_v4()).await.unwrap());
        assert!(!repo.release_for_store("disc123", "storeB").await.unwrap());
        assert_eq!(repo.find("disc123").await.unwrap(), Some(first.clone()));

        assert!(repo.release(&first.disc_uid, first.claim_id).await.unwrap());
        assert!(repo.acquire(&claim("storeB")).await.unwrap());
        assert!(repo.release_for_store("disc123", "storeB").await.unwrap());
        assert!(repo.find("disc123").await.unwrap().is_none());
    }
}
