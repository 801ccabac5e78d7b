use std::time::{Duration, SystemTime};

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        document_store::{UpdateOutcome, collections},
        models::{
            HoldClaimEntity, NotificationEntity, NotificationKind, ReleaseReason,
            StoreIntakeEntity,
        },
        repositories::{ClaimRepository, DiscRepository, IntakeRepository, MailboxRepository},
        storage::StorageError,
    },
    error::ServiceError,
    services::notifier::{PushMessage, push_to_user},
    state::{
        SharedState,
        hold::{HoldStatus, ensure_forward},
        registry::HoldKey,
    },
};

/// Holds of one store, split for display.
#[derive(Debug, Clone)]
pub struct Inventory {
    /// Running holds, closest deadline first.
    pub active: Vec<StoreIntakeEntity>,
    /// Released log, most recent first.
    pub released: Vec<StoreIntakeEntity>,
    /// Instant the remaining times should be computed against.
    pub as_of: SystemTime,
}

/// Attempts at claiming a disc whose previous claim turns out to be stale.
const CLAIM_ATTEMPTS: usize = 3;

/// Start holding `disc_uid` at `store_id` and tell the owner.
///
/// Returns the existing record unchanged when this store already holds the disc.
pub async fn begin_hold(
    state: &SharedState,
    store_id: &str,
    disc_uid: &str,
) -> Result<StoreIntakeEntity, ServiceError> {
    let store = state.require_store().await?;
    let discs = DiscRepository::new(store.clone());
    let intake = IntakeRepository::new(store.clone());
    let claims = ClaimRepository::new(store.clone());
    let key = HoldKey::new(store_id, disc_uid);

    let Some(ownership) = discs.find(disc_uid).await? else {
        return Err(ServiceError::DiscNotFound(disc_uid.to_owned()));
    };

    let holders = intake.list_for_disc(disc_uid).await?;
    if let Some(other) = holders
        .iter()
        .find(|record| !record.status.is_terminal() && record.store_id != store_id)
    {
        return Err(ServiceError::AlreadyHeldElsewhere {
            disc_uid: disc_uid.to_owned(),
            holder_store_id: other.store_id.clone(),
        });
    }
    if let Some(existing) = holders
        .into_iter()
        .find(|record| !record.status.is_terminal())
    {
        if state.holds().register(key.clone()) {
            debug!(hold = %key, "re-tracking existing hold");
        }
        return Ok(existing);
    }

    let (claim, fresh_claim) = claim_disc(state, &claims, &intake, store_id, disc_uid).await?;

    let now = state.now();
    let record = StoreIntakeEntity {
        store_id: store_id.to_owned(),
        disc_uid: disc_uid.to_owned(),
        owner_id: ownership.owner_id.clone(),
        disc: ownership.disc.clone(),
        status: HoldStatus::Notified,
        timer_started_at: now,
        timeout_duration_ms: state.config().hold.timeout.as_millis() as u64,
        released_at: None,
        release_reason: None,
        claim_id: Some(claim.claim_id),
    };

    match claim_intake_slot(&intake, &record).await {
        Ok(None) => {}
        Ok(Some(current)) => {
            state.holds().register(key);
            return Ok(current);
        }
        Err(err) => {
            if fresh_claim {
                if let Err(release_err) = claims.release(disc_uid, claim.claim_id).await {
                    warn!(hold = %key, error = %release_err, "could not drop claim of a failed hold");
                }
            }
            return Err(err);
        }
    }

    state.holds().register(key.clone());

    let notification = NotificationEntity {
        id: Uuid::new_v4(),
        kind: NotificationKind::DiscFound,
        disc_uid: disc_uid.to_owned(),
        disc: record.disc.clone(),
        store_id: store_id.to_owned(),
        from_user_id: store_id.to_owned(),
        created_at: now,
    };
    MailboxRepository::new(store)
        .modify(&record.owner_id, |mailbox| {
            mailbox.push(notification.clone());
            true
        })
        .await?;

    push_to_user(
        state,
        &record.owner_id,
        PushMessage {
            title: "Your disc was found".into(),
            body: format!(
                "{store_id} is holding your {}. Release it or collect it before the hold ends.",
                display_name(&record)
            ),
            data: json!({
                "type": NotificationKind::DiscFound,
                "disc_uid": disc_uid,
                "store_id": store_id,
            }),
        },
    );

    info!(
        hold = %key,
        owner_id = %record.owner_id,
        timeout_ms = record.timeout_duration_ms,
        "hold started"
    );
    Ok(record)
}

/// Take the claim on `disc_uid` for `store_id`.
///
/// Returns the claim to hold under and whether this call created it; a live
/// claim of the same store is shared with the concurrent request that made it.
async fn claim_disc(
    state: &SharedState,
    claims: &ClaimRepository,
    intake: &IntakeRepository,
    store_id: &str,
    disc_uid: &str,
) -> Result<(HoldClaimEntity, bool), ServiceError> {
    for _ in 0..CLAIM_ATTEMPTS {
        let claim = HoldClaimEntity {
            disc_uid: disc_uid.to_owned(),
            store_id: store_id.to_owned(),
            claim_id: Uuid::new_v4(),
            claimed_at: state.now(),
        };
        if claims.acquire(&claim).await? {
            return Ok((claim, true));
        }

        let Some(current) = claims.find(disc_uid).await? else {
            continue;
        };
        if !claim_is_stale(state, intake, &current).await? {
            if current.store_id == store_id {
                return Ok((current, false));
            }
            return Err(ServiceError::AlreadyHeldElsewhere {
                disc_uid: disc_uid.to_owned(),
                holder_store_id: current.store_id,
            });
        }

        if claims.release(disc_uid, current.claim_id).await? {
            debug!(disc_uid, holder_store_id = %current.store_id, "stale hold claim dropped");
        }
    }

    Err(StorageError::Contention {
        collection: collections::DISC_HOLDS,
        key: disc_uid.to_owned(),
    }
    .into())
}

/// A claim outlives its hold when the hold was released after the claim was
/// taken, or when no hold showed up for a whole hold period.
async fn claim_is_stale(
    state: &SharedState,
    intake: &IntakeRepository,
    claim: &HoldClaimEntity,
) -> Result<bool, ServiceError> {
    let key = HoldKey::new(claim.store_id.clone(), claim.disc_uid.clone());
    let record = intake.find(&key).await?;
    if let Some(record) = &record {
        if !record.status.is_terminal() {
            return Ok(false);
        }
        if record
            .released_at
            .is_some_and(|released_at| released_at >= claim.claimed_at)
        {
            return Ok(true);
        }
    }

    let age = state
        .now()
        .duration_since(claim.claimed_at)
        .unwrap_or(Duration::ZERO);
    Ok(age > state.config().hold.timeout)
}

/// Write `record` under its key, reusing a released log entry if one is there.
///
/// Returns the active record of a concurrent caller that got there first.
async fn claim_intake_slot(
    intake: &IntakeRepository,
    record: &StoreIntakeEntity,
) -> Result<Option<StoreIntakeEntity>, ServiceError> {
    if intake.create(record).await? {
        return Ok(None);
    }
    if intake.restart(record).await? == UpdateOutcome::Applied {
        return Ok(None);
    }

    let key = record.key();
    match intake.find(&key).await? {
        Some(current) if !current.status.is_terminal() => Ok(Some(current)),
        _ => Err(ServiceError::StoreRecordMissing(key.to_string())),
    }
}

/// Owner gives up a disc a store is holding.
///
/// Returns `false` when there was nothing left to release; the caller's
/// notification about the disc is cleared either way.
pub async fn release_disc(
    state: &SharedState,
    disc_uid: &str,
    player_id: &str,
) -> Result<bool, ServiceError> {
    let store = state.require_store().await?;
    let intake = IntakeRepository::new(store.clone());
    let mailboxes = MailboxRepository::new(store);

    let mailbox = mailboxes.find(player_id).await?;
    let store_id = match mailbox.find_disc(NotificationKind::DiscFound, disc_uid) {
        Some(notification) => Some(notification.store_id.clone()),
        None => holding_store_of(&intake, disc_uid, player_id).await?,
    };

    let released = match store_id {
        Some(store_id) => {
            let key = HoldKey::new(store_id, disc_uid);
            match intake.find(&key).await? {
                Some(record) if !record.status.is_terminal() => {
                    if record.owner_id != player_id {
                        return Err(ServiceError::Unauthorized(format!(
                            "disc `{disc_uid}` is not yours to release"
                        )));
                    }
                    finalize_release(state, record, ReleaseReason::Owner).await?
                }
                _ => {
                    debug!(hold = %key, "no active hold left to release");
                    false
                }
            }
        }
        None => false,
    };

    mailboxes
        .modify(player_id, |mailbox| {
            mailbox.clear_disc(NotificationKind::DiscFound, disc_uid) > 0
        })
        .await?;

    Ok(released)
}

/// Store holding `disc_uid` on behalf of `player_id`, found from the intake records.
async fn holding_store_of(
    intake: &IntakeRepository,
    disc_uid: &str,
    player_id: &str,
) -> Result<Option<String>, ServiceError> {
    let active: Vec<_> = intake
        .list_for_disc(disc_uid)
        .await?
        .into_iter()
        .filter(|record| !record.status.is_terminal())
        .collect();

    if let Some(own) = active.iter().find(|record| record.owner_id == player_id) {
        return Ok(Some(own.store_id.clone()));
    }
    if !active.is_empty() {
        return Err(ServiceError::Unauthorized(format!(
            "disc `{disc_uid}` is not yours to release"
        )));
    }
    Ok(None)
}

/// Perform the release transition of an active hold.
///
/// The ownership record is removed first, then the intake record is moved to
/// `released` with a compare-and-set on its current status and the disc claim
/// is dropped. Returns `true` only for the caller whose write landed.
pub async fn finalize_release(
    state: &SharedState,
    record: StoreIntakeEntity,
    reason: ReleaseReason,
) -> Result<bool, ServiceError> {
    let store = state.require_store().await?;
    let discs = DiscRepository::new(store.clone());
    let intake = IntakeRepository::new(store.clone());
    let claims = ClaimRepository::new(store.clone());
    let mailboxes = MailboxRepository::new(store);
    let key = record.key();

    ensure_forward(record.status, HoldStatus::Released)?;

    remove_held_ownership(&discs, &record).await?;

    let released_at = state.now();
    let mut expected = record.status;
    loop {
        match intake
            .mark_released(&key, expected, released_at, reason)
            .await?
        {
            UpdateOutcome::Applied => break,
            UpdateOutcome::Missing => {
                state.holds().unregister(&key);
                return Ok(false);
            }
            UpdateOutcome::PreconditionFailed => match intake.find(&key).await? {
                Some(current) if !current.status.is_terminal() => expected = current.status,
                _ => {
                    state.holds().unregister(&key);
                    return Ok(false);
                }
            },
        }
    }

    state.holds().unregister(&key);
    info!(hold = %key, owner_id = %record.owner_id, ?reason, "disc released");

    let dropped = match record.claim_id {
        Some(claim_id) => claims.release(&record.disc_uid, claim_id).await,
        None => claims.release_for_store(&record.disc_uid, &record.store_id).await,
    };
    if let Err(err) = dropped {
        warn!(hold = %key, error = %err, "release committed but the disc claim was not dropped");
    }

    if let Err(err) = mailboxes
        .modify(&record.owner_id, |mailbox| {
            mailbox.clear_disc(NotificationKind::DiscFound, &record.disc_uid) > 0
        })
        .await
    {
        warn!(hold = %key, error = %err, "release committed but owner mailbox was not cleared");
    }

    match reason {
        ReleaseReason::Owner => {
            let notice = NotificationEntity {
                id: Uuid::new_v4(),
                kind: NotificationKind::DiscReleased,
                disc_uid: record.disc_uid.clone(),
                disc: record.disc.clone(),
                store_id: record.store_id.clone(),
                from_user_id: record.owner_id.clone(),
                created_at: released_at,
            };
            if let Err(err) = mailboxes
                .modify(&record.store_id, |mailbox| {
                    mailbox.push(notice.clone());
                    true
                })
                .await
            {
                warn!(hold = %key, error = %err, "release committed but store was not notified");
            }
            push_to_user(
                state,
                &record.store_id,
                PushMessage {
                    title: "Disc released".into(),
                    body: format!(
                        "The owner released {}; it now belongs to your store.",
                        display_name(&record)
                    ),
                    data: json!({
                        "type": NotificationKind::DiscReleased,
                        "disc_uid": record.disc_uid,
                        "store_id": record.store_id,
                    }),
                },
            );
        }
        ReleaseReason::Timer => {
            push_to_user(
                state,
                &record.owner_id,
                PushMessage {
                    title: "Hold expired".into(),
                    body: format!(
                        "{} was released to {} and removed from your bag.",
                        display_name(&record),
                        record.store_id
                    ),
                    data: json!({
                        "type": NotificationKind::DiscReleased,
                        "disc_uid": record.disc_uid,
                        "store_id": record.store_id,
                    }),
                },
            );
        }
    }

    Ok(true)
}

/// Remove the ownership the hold was started against.
///
/// A registration made after the timer started belongs to a later owner and is
/// left alone.
async fn remove_held_ownership(
    discs: &DiscRepository,
    record: &StoreIntakeEntity,
) -> Result<(), ServiceError> {
    let key = record.key();
    match discs.find(&record.disc_uid).await? {
        Some(current)
            if current.owner_id == record.owner_id
                && current.registered_at <= record.timer_started_at =>
        {
            if !discs
                .remove_registration(&record.disc_uid, current.registration_id)
                .await?
            {
                debug!(hold = %key, "ownership record changed while releasing");
            }
        }
        Some(current) => {
            debug!(hold = %key, owner_id = %current.owner_id, "disc registered again since the hold began");
        }
        None => debug!(hold = %key, "ownership record already gone"),
    }
    Ok(())
}

/// Active holds and released log of a store.
pub async fn list_inventory(state: &SharedState, store_id: &str) -> Result<Inventory, ServiceError> {
    let store = state.require_store().await?;
    let records = IntakeRepository::new(store).list_for_store(store_id).await?;

    let (mut released, mut active): (Vec<_>, Vec<_>) = records
        .into_iter()
        .partition(|record| record.status.is_terminal());

    active.sort_by_key(|record| record.timer_started_at + record.timeout());
    released.sort_by(|a, b| b.released_at.cmp(&a.released_at));

    Ok(Inventory {
        active,
        released,
        as_of: state.now(),
    })
}

/// Remove a released record from the store's log.
pub async fn dismiss_released(
    state: &SharedState,
    store_id: &str,
    disc_uid: &str,
) -> Result<(), ServiceError> {
    let store = state.require_store().await?;
    let intake = IntakeRepository::new(store.clone());
    let key = HoldKey::new(store_id, disc_uid);

    let Some(record) = intake.find(&key).await? else {
        return Err(ServiceError::StoreRecordMissing(key.to_string()));
    };
    if !record.status.is_terminal() {
        return Err(ServiceError::InvalidState(format!(
            "hold `{key}` is still {}",
            record.status.as_str()
        )));
    }
    if !intake.delete_in_status(&key, HoldStatus::Released).await? {
        return Err(ServiceError::StoreRecordMissing(key.to_string()));
    }

    MailboxRepository::new(store)
        .modify(store_id, |mailbox| {
            mailbox.clear_disc(NotificationKind::DiscReleased, disc_uid) > 0
        })
        .await?;

    info!(hold = %key, "released record dismissed");
    Ok(())
}

fn display_name(record: &StoreIntakeEntity) -> &str {
    if record.disc.name.is_empty() {
        &record.disc_uid
    } else {
        &record.disc.name
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::future::BoxFuture;
    use serde_json::Value;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{
            document_store::{
                ChangeStream, DocumentStore, FieldEquals, WriteMode, memory::MemoryDocumentStore,
            },
            models::{DiscAttributes, DiscOwnershipEntity, MailboxEntity},
            storage::StorageResult,
        },
        state::testing::memory_state,
    };

    /// In-memory store whose creation of one intake record waits until the test opens the gate.
    #[derive(Clone)]
    struct GatedStore {
        inner: MemoryDocumentStore,
        gated_key: &'static str,
        reached: Arc<Notify>,
        open: Arc<Notify>,
    }

    impl GatedStore {
        fn new(gated_key: &'static str) -> Self {
            Self {
                inner: MemoryDocumentStore::new(),
                gated_key,
                reached: Arc::new(Notify::new()),
                open: Arc::new(Notify::new()),
            }
        }
    }

    impl DocumentStore for GatedStore {
        fn get(
            &self,
            collection: &'static str,
            key: &str,
        ) -> BoxFuture<'static, StorageResult<Option<Value>>> {
            self.inner.get(collection, key)
        }

        fn create(
            &self,
            collection: &'static str,
            key: &str,
            value: Value,
        ) -> BoxFuture<'static, StorageResult<bool>> {
            if collection != collections::STORE_INTAKE || key != self.gated_key {
                return self.inner.create(collection, key, value);
            }
            let gate = self.clone();
            let key = key.to_owned();
            Box::pin(async move {
                gate.reached.notify_one();
                gate.open.notified().await;
                gate.inner.create(collection, &key, value).await
            })
        }

        fn set(
            &self,
            collection: &'static str,
            key: &str,
            value: Value,
            mode: WriteMode,
        ) -> BoxFuture<'static, StorageResult<()>> {
            self.inner.set(collection, key, value, mode)
        }

        fn update(
            &self,
            collection: &'static str,
            key: &str,
            partial: Value,
            precondition: Option<FieldEquals>,
        ) -> BoxFuture<'static, StorageResult<UpdateOutcome>> {
            self.inner.update(collection, key, partial, precondition)
        }

        fn delete(
            &self,
            collection: &'static str,
            key: &str,
            precondition: Option<FieldEquals>,
        ) -> BoxFuture<'static, StorageResult<bool>> {
            self.inner.delete(collection, key, precondition)
        }

        fn list(
            &self,
            collection: &'static str,
            filter: Option<FieldEquals>,
        ) -> BoxFuture<'static, StorageResult<Vec<Value>>> {
            self.inner.list(collection, filter)
        }

        fn watch(&self, collection: &'static str, key: &str) -> ChangeStream {
            self.inner.watch(collection, key)
        }

        fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
            self.inner.health_check()
        }

        fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
            self.inner.try_reconnect()
        }
    }

    async fn active_holders(state: &SharedState, disc_uid: &str) -> Vec<String> {
        let store = state.require_store().await.unwrap();
        IntakeRepository::new(store)
            .list_for_disc(disc_uid)
            .await
            .unwrap()
            .into_iter()
            .filter(|record| !record.status.is_terminal())
            .map(|record| record.store_id)
            .collect()
    }

    async fn seed_disc(state: &SharedState, disc_uid: &str, owner_id: &str) {
        let store = state.require_store().await.unwrap();
        let registered = DiscRepository::new(store)
            .register(&DiscOwnershipEntity {
                disc_uid: disc_uid.into(),
                owner_id: owner_id.into(),
                disc: DiscAttributes {
                    name: "Destroyer".into(),
                    manufacturer: "Innova".into(),
                    color: "red".into(),
                },
                registered_at: state.now(),
                registration_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
        assert!(registered);
    }

    async fn mailbox_of(state: &SharedState, user_id: &str) -> MailboxEntity {
        let store = state.require_store().await.unwrap();
        MailboxRepository::new(store).find(user_id).await.unwrap()
    }

    #[tokio::test]
    async fn begin_hold_notifies_owner_and_tracks_hold() {
        let (state, _clock) = memory_state(AppConfig::default()).await;
        seed_disc(&state, "disc123", "player1").await;

        let record = begin_hold(&state, "storeA", "disc123").await.unwrap();

        assert_eq!(record.status, HoldStatus::Notified);
        assert_eq!(record.owner_id, "player1");
        assert_eq!(record.timeout_duration_ms, 180_000);
        assert!(state.holds().is_active(&HoldKey::new("storeA", "disc123")));

        let mailbox = mailbox_of(&state, "player1").await;
        let head = mailbox.head().unwrap();
        assert_eq!(head.kind, NotificationKind::DiscFound);
        assert_eq!(head.store_id, "storeA");
        assert_eq!(head.disc.name, "Destroyer");
    }

    #[tokio::test]
    async fn unknown_disc_cannot_be_held() {
        let (state, _clock) = memory_state(AppConfig::default()).await;

        let err = begin_hold(&state, "storeA", "ghost").await.unwrap_err();

        assert!(matches!(err, ServiceError::DiscNotFound(uid) if uid == "ghost"));
        assert!(state.holds().is_empty());
    }

    #[tokio::test]
    async fn same_store_scanning_again_gets_the_running_hold() {
        let (state, clock) = memory_state(AppConfig::default()).await;
        seed_disc(&state, "disc123", "player1").await;

        let first = begin_hold(&state, "storeA", "disc123").await.unwrap();
        clock.advance(Duration::from_secs(30));
        let again = begin_hold(&state, "storeA", "disc123").await.unwrap();

        assert_eq!(again, first);
        assert_eq!(mailbox_of(&state, "player1").await.items.len(), 1);
    }

    #[tokio::test]
    async fn second_store_is_turned_away_without_side_effects() {
        let (state, _clock) = memory_state(AppConfig::default()).await;
        seed_disc(&state, "disc123", "player1").await;
        begin_hold(&state, "storeA", "disc123").await.unwrap();

        let err = begin_hold(&state, "storeB", "disc123").await.unwrap_err();

        assert!(matches!(
            err,
            ServiceError::AlreadyHeldElsewhere { ref holder_store_id, .. } if holder_store_id == "storeA"
        ));
        let store = state.require_store().await.unwrap();
        let intake = IntakeRepository::new(store);
        assert!(
            intake
                .find(&HoldKey::new("storeB", "disc123"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(!state.holds().is_active(&HoldKey::new("storeB", "disc123")));
        assert_eq!(mailbox_of(&state, "player1").await.items.len(), 1);
    }

    #[tokio::test]
    async fn owner_release_hands_disc_to_store() {
        let (state, clock) = memory_state(AppConfig::default()).await;
        seed_disc(&state, "disc123", "player1").await;
        begin_hold(&state, "storeA", "disc123").await.unwrap();
        clock.advance(Duration::from_secs(20));

        assert!(release_disc(&state, "disc123", "player1").await.unwrap());

        let store = state.require_store().await.unwrap();
        let key = HoldKey::new("storeA", "disc123");
        let record = IntakeRepository::new(store.clone())
            .find(&key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, HoldStatus::Released);
        assert_eq!(record.release_reason, Some(ReleaseReason::Owner));
        assert_eq!(record.released_at, Some(state.now()));
        assert!(DiscRepository::new(store).find("disc123").await.unwrap().is_none());
        assert!(!state.holds().is_active(&key));

        assert!(mailbox_of(&state, "player1").await.items.is_empty());
        let store_mailbox = mailbox_of(&state, "storeA").await;
        let notice = store_mailbox.head().unwrap();
        assert_eq!(notice.kind, NotificationKind::DiscReleased);
        assert_eq!(notice.from_user_id, "player1");
    }

    #[tokio::test]
    async fn releasing_twice_reports_nothing_left() {
        let (state, _clock) = memory_state(AppConfig::default()).await;
        seed_disc(&state, "disc123", "player1").await;
        begin_hold(&state, "storeA", "disc123").await.unwrap();

        assert!(release_disc(&state, "disc123", "player1").await.unwrap());
        assert!(!release_disc(&state, "disc123", "player1").await.unwrap());
        assert_eq!(mailbox_of(&state, "storeA").await.items.len(), 1);
    }

    #[tokio::test]
    async fn only_the_owner_may_release() {
        let (state, _clock) = memory_state(AppConfig::default()).await;
        seed_disc(&state, "disc123", "player1").await;
        begin_hold(&state, "storeA", "disc123").await.unwrap();

        let err = release_disc(&state, "disc123", "player2").await.unwrap_err();

        assert!(matches!(err, ServiceError::Unauthorized(_)));
        assert!(state.holds().is_active(&HoldKey::new("storeA", "disc123")));
    }

    #[tokio::test]
    async fn released_disc_can_be_held_again_after_reregistration() {
        let (state, clock) = memory_state(AppConfig::default()).await;
        seed_disc(&state, "disc123", "player1").await;
        begin_hold(&state, "storeA", "disc123").await.unwrap();
        release_disc(&state, "disc123", "player1").await.unwrap();

        clock.advance(Duration::from_secs(600));
        seed_disc(&state, "disc123", "player1").await;
        let record = begin_hold(&state, "storeA", "disc123").await.unwrap();

        assert_eq!(record.status, HoldStatus::Notified);
        assert_eq!(record.timer_started_at, state.now());
        assert_eq!(record.released_at, None);
        assert!(state.holds().is_active(&record.key()));
    }

    #[tokio::test]
    async fn inventory_splits_active_and_released() {
        let (state, clock) = memory_state(AppConfig::default()).await;
        seed_disc(&state, "disc1", "player1").await;
        seed_disc(&state, "disc2", "player2").await;
        begin_hold(&state, "storeA", "disc1").await.unwrap();
        clock.advance(Duration::from_secs(10));
        begin_hold(&state, "storeA", "disc2").await.unwrap();
        release_disc(&state, "disc2", "player2").await.unwrap();

        let inventory = list_inventory(&state, "storeA").await.unwrap();

        assert_eq!(inventory.active.len(), 1);
        assert_eq!(inventory.active[0].disc_uid, "disc1");
        assert_eq!(inventory.released.len(), 1);
        assert_eq!(inventory.released[0].disc_uid, "disc2");
    }

    #[tokio::test]
    async fn only_released_records_can_be_dismissed() {
        let (state, _clock) = memory_state(AppConfig::default()).await;
        seed_disc(&state, "disc123", "player1").await;
        begin_hold(&state, "storeA", "disc123").await.unwrap();

        let err = dismiss_released(&state, "storeA", "disc123").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        release_disc(&state, "disc123", "player1").await.unwrap();
        dismiss_released(&state, "storeA", "disc123").await.unwrap();

        assert!(list_inventory(&state, "storeA").await.unwrap().released.is_empty());
        assert!(mailbox_of(&state, "storeA").await.items.is_empty());
    }

    #[tokio::test]
    async fn slow_first_store_keeps_the_disc_against_a_later_one() {
        let (state, clock) = memory_state(AppConfig::default()).await;
        let gate = GatedStore::new("storeB::disc123");
        let (reached, open) = (gate.reached.clone(), gate.open.clone());
        state.set_store(Arc::new(gate)).await;
        seed_disc(&state, "disc123", "player1").await;

        let slow = tokio::spawn({
            let state = state.clone();
            async move { begin_hold(&state, "storeB", "disc123").await }
        });
        reached.notified().await;
        clock.advance(Duration::from_secs(1));
        let fast = begin_hold(&state, "storeA", "disc123").await;
        open.notify_one();
        let slow = slow.await.unwrap();

        assert!(matches!(
            fast,
            Err(ServiceError::AlreadyHeldElsewhere { ref holder_store_id, .. }) if holder_store_id == "storeB"
        ));
        assert_eq!(slow.unwrap().store_id, "storeB");
        assert_eq!(active_holders(&state, "disc123").await, vec!["storeB".to_owned()]);
        assert!(!state.holds().is_active(&HoldKey::new("storeA", "disc123")));
        assert_eq!(mailbox_of(&state, "player1").await.items.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_stores_never_share_a_disc() {
        for round in 0..20 {
            let (state, _clock) = memory_state(AppConfig::default()).await;
            let disc_uid = format!("disc{round}");
            seed_disc(&state, &disc_uid, "player1").await;

            let attempts: Vec<_> = ["storeA", "storeB", "storeC"]
                .into_iter()
                .map(|store_id| {
                    let state = state.clone();
                    let disc_uid = disc_uid.clone();
                    tokio::spawn(async move { begin_hold(&state, store_id, &disc_uid).await })
                })
                .collect();
            let mut started = 0;
            for attempt in attempts {
                if attempt.await.unwrap().is_ok() {
                    started += 1;
                }
            }

            assert_eq!(started, 1, "round {round}");
            assert_eq!(active_holders(&state, &disc_uid).await.len(), 1, "round {round}");
        }
    }

    #[tokio::test]
    async fn release_frees_the_disc_for_another_store() {
        let (state, clock) = memory_state(AppConfig::default()).await;
        seed_disc(&state, "disc123", "player1").await;
        begin_hold(&state, "storeA", "disc123").await.unwrap();
        release_disc(&state, "disc123", "player1").await.unwrap();

        let store = state.require_store().await.unwrap();
        assert!(ClaimRepository::new(store).find("disc123").await.unwrap().is_none());

        clock.advance(Duration::from_secs(60));
        seed_disc(&state, "disc123", "player1").await;
        let record = begin_hold(&state, "storeB", "disc123").await.unwrap();

        assert_eq!(record.store_id, "storeB");
        assert_eq!(active_holders(&state, "disc123").await, vec!["storeB".to_owned()]);
    }

    #[tokio::test]
    async fn abandoned_claim_is_taken_over_after_a_hold_period() {
        let (state, clock) = memory_state(AppConfig::default()).await;
        seed_disc(&state, "disc123", "player1").await;
        let store = state.require_store().await.unwrap();
        let claims = ClaimRepository::new(store);
        let abandoned = HoldClaimEntity {
            disc_uid: "disc123".into(),
            store_id: "storeB".into(),
            claim_id: Uuid::new_v4(),
            claimed_at: state.now(),
        };
        assert!(claims.acquire(&abandoned).await.unwrap());

        let err = begin_hold(&state, "storeA", "disc123").await.unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyHeldElsewhere { .. }));

        clock.advance(Duration::from_secs(181));
        let record = begin_hold(&state, "storeA", "disc123").await.unwrap();

        assert_eq!(record.store_id, "storeA");
        let claim = claims.find("disc123").await.unwrap().unwrap();
        assert_eq!(claim.store_id, "storeA");
        assert_eq!(record.claim_id, Some(claim.claim_id));
    }

    #[tokio::test]
    async fn late_release_keeps_a_newer_registration() {
        let (state, clock) = memory_state(AppConfig::default()).await;
        seed_disc(&state, "disc123", "player1").await;
        let stale = begin_hold(&state, "storeA", "disc123").await.unwrap();

        let store = state.require_store().await.unwrap();
        let discs = DiscRepository::new(store);
        assert!(discs.remove_owned("disc123", "player1").await.unwrap());
        clock.advance(Duration::from_secs(10));
        seed_disc(&state, "disc123", "player1").await;

        assert!(finalize_release(&state, stale, ReleaseReason::Owner).await.unwrap());

        let current = discs.find("disc123").await.unwrap().unwrap();
        assert_eq!(current.registered_at, state.now());
    }
}
