//! Sweeper that escalates holds and releases them once their time runs out.

use futures::{StreamExt, stream};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::{
    dao::{
        document_store::UpdateOutcome, models::ReleaseReason, repositories::IntakeRepository,
    },
    error::ServiceError,
    services::hold_service,
    state::{
        SharedState,
        hold::{HoldStatus, ensure_forward},
        registry::HoldKey,
    },
};

/// Holds evaluated concurrently within one sweep.
const SWEEP_CONCURRENCY: usize = 16;

/// What a single evaluation of a hold did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No threshold crossed since the last write.
    Unchanged(HoldStatus),
    /// Status moved forward without releasing.
    Escalated {
        /// Status read before the write.
        from: HoldStatus,
        /// Status written.
        to: HoldStatus,
    },
    /// This evaluation released the disc.
    Released,
    /// The hold was already released or removed; it is no longer tracked.
    Finished,
    /// Another evaluation of the same hold is running.
    Busy,
}

/// Tally of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Holds looked at, including busy ones.
    pub evaluated: usize,
    /// Holds moved to a later stage.
    pub escalated: usize,
    /// Holds released by this sweep.
    pub released: usize,
    /// Holds found already finished.
    pub finished: usize,
    /// Evaluations that errored.
    pub failed: usize,
}

/// Tally of one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Non-terminal holds found in storage.
    pub found: usize,
    /// Holds that were not tracked before.
    pub registered: usize,
}

/// Sweep every tracked hold at the configured interval, forever.
pub async fn run(state: SharedState) {
    let period = state.config().hold.tick_interval;
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(tick_ms = period.as_millis() as u64, "hold timer started");

    loop {
        ticker.tick().await;
        if state.is_degraded() || state.holds().is_empty() {
            continue;
        }

        let report = sweep(&state).await;
        if report.escalated + report.released + report.failed > 0 {
            info!(
                evaluated = report.evaluated,
                escalated = report.escalated,
                released = report.released,
                finished = report.finished,
                failed = report.failed,
                "hold sweep"
            );
        }
    }
}

/// Evaluate every tracked hold once.
///
/// A hold whose evaluation fails is dropped from the index and stays frozen
/// until the next recovery re-derives it from storage.
pub async fn sweep(state: &SharedState) -> SweepReport {
    let keys = state.holds().active_keys();

    let outcomes: Vec<_> = stream::iter(keys)
        .map(|key| async move {
            let outcome = tick_hold(state, &key).await;
            (key, outcome)
        })
        .buffer_unordered(SWEEP_CONCURRENCY)
        .collect()
        .await;

    let mut report = SweepReport::default();
    for (key, outcome) in outcomes {
        report.evaluated += 1;
        match outcome {
            Ok(TickOutcome::Unchanged(_)) | Ok(TickOutcome::Busy) => {}
            Ok(TickOutcome::Escalated { .. }) => report.escalated += 1,
            Ok(TickOutcome::Released) => report.released += 1,
            Ok(TickOutcome::Finished) => report.finished += 1,
            Err(err) => {
                warn!(hold = %key, error = %err, "hold evaluation failed; hold timer stopped");
                state.holds().unregister(&key);
                report.failed += 1;
            }
        }
    }
    report
}

/// Re-read one hold and apply at most one write.
pub async fn tick_hold(state: &SharedState, key: &HoldKey) -> Result<TickOutcome, ServiceError> {
    let Some(_claim) = state.holds().try_claim(key) else {
        return Ok(TickOutcome::Busy);
    };

    let store = state.require_store().await?;
    let intake = IntakeRepository::new(store);

    let Some(record) = intake.find(key).await? else {
        state.holds().unregister(key);
        return Ok(TickOutcome::Finished);
    };
    if record.status.is_terminal() {
        state.holds().unregister(key);
        return Ok(TickOutcome::Finished);
    }

    let elapsed = record.elapsed(state.now());
    let Some(step) = state
        .hold_policy()
        .plan(record.status, record.timeout(), elapsed)
    else {
        return Ok(TickOutcome::Unchanged(record.status));
    };
    ensure_forward(step.from, step.to)?;

    if step.to == HoldStatus::Released {
        let released = hold_service::finalize_release(state, record, ReleaseReason::Timer).await?;
        return Ok(if released {
            TickOutcome::Released
        } else {
            TickOutcome::Finished
        });
    }

    match intake.advance(key, step.from, step.to).await? {
        UpdateOutcome::Applied => {
            debug!(
                hold = %key,
                from = step.from.as_str(),
                to = step.to.as_str(),
                elapsed_ms = step.elapsed.as_millis() as u64,
                "hold escalated"
            );
            Ok(TickOutcome::Escalated {
                from: step.from,
                to: step.to,
            })
        }
        UpdateOutcome::Missing => {
            state.holds().unregister(key);
            Ok(TickOutcome::Finished)
        }
        UpdateOutcome::PreconditionFailed => match intake.find(key).await? {
            Some(current) if !current.status.is_terminal() => {
                Ok(TickOutcome::Unchanged(current.status))
            }
            _ => {
                state.holds().unregister(key);
                Ok(TickOutcome::Finished)
            }
        },
    }
}

/// Track every non-terminal hold found in storage.
///
/// Elapsed time is always derived from the stored start instant, so recovered
/// holds resume where wall-clock time puts them.
pub async fn recover(state: &SharedState) -> Result<RecoveryReport, ServiceError> {
    let store = state.require_store().await?;
    let records = IntakeRepository::new(store).list_all().await?;

    let mut report = RecoveryReport::default();
    for record in records.into_iter().filter(|r| !r.status.is_terminal()) {
        report.found += 1;
        if state.holds().register(record.key()) {
            report.registered += 1;
        }
    }

    info!(
        found = report.found,
        registered = report.registered,
        "hold recovery finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{
            models::{DiscAttributes, DiscOwnershipEntity, NotificationKind, StoreIntakeEntity},
            repositories::{DiscRepository, MailboxRepository},
        },
        state::testing::memory_state,
    };

    /// Register a disc that has been in its owner's bag for an hour.
    async fn seed_disc(state: &SharedState, disc_uid: &str, owner_id: &str) {
        let store = state.require_store().await.unwrap();
        DiscRepository::new(store)
            .register(&DiscOwnershipEntity {
                disc_uid: disc_uid.into(),
                owner_id: owner_id.into(),
                disc: DiscAttributes::default(),
                registered_at: state.now() - Duration::from_secs(3_600),
                registration_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
    }

    /// Write a hold directly, as if a previous process had started it `age` ago.
    async fn seed_hold(state: &SharedState, key: &HoldKey, owner_id: &str, age: Duration) {
        seed_disc(state, &key.disc_uid, owner_id).await;
        let store = state.require_store().await.unwrap();
        let created = IntakeRepository::new(store)
            .create(&StoreIntakeEntity {
                store_id: key.store_id.clone(),
                disc_uid: key.disc_uid.clone(),
                owner_id: owner_id.into(),
                disc: DiscAttributes::default(),
                status: HoldStatus::Notified,
                timer_started_at: state.now() - age,
                timeout_duration_ms: 180_000,
                released_at: None,
                release_reason: None,
                claim_id: None,
            })
            .await
            .unwrap();
        assert!(created);
    }

    async fn status_of(state: &SharedState, key: &HoldKey) -> HoldStatus {
        let store = state.require_store().await.unwrap();
        IntakeRepository::new(store)
            .find(key)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn hold_escalates_then_releases_on_time() {
        let (state, clock) = memory_state(AppConfig::default()).await;
        seed_disc(&state, "disc123", "player1").await;
        hold_service::begin_hold(&state, "storeA", "disc123")
            .await
            .unwrap();
        let key = HoldKey::new("storeA", "disc123");

        clock.advance(Duration::from_secs(30));
        assert_eq!(
            tick_hold(&state, &key).await.unwrap(),
            TickOutcome::Unchanged(HoldStatus::Notified)
        );

        clock.advance(Duration::from_secs(35));
        assert_eq!(
            tick_hold(&state, &key).await.unwrap(),
            TickOutcome::Escalated {
                from: HoldStatus::Notified,
                to: HoldStatus::Warning
            }
        );

        clock.advance(Duration::from_secs(60));
        assert_eq!(
            tick_hold(&state, &key).await.unwrap(),
            TickOutcome::Escalated {
                from: HoldStatus::Warning,
                to: HoldStatus::Critical
            }
        );

        clock.advance(Duration::from_secs(56));
        assert_eq!(tick_hold(&state, &key).await.unwrap(), TickOutcome::Released);

        let store = state.require_store().await.unwrap();
        let record = IntakeRepository::new(store.clone())
            .find(&key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, HoldStatus::Released);
        assert_eq!(record.release_reason, Some(ReleaseReason::Timer));
        assert!(DiscRepository::new(store.clone()).find("disc123").await.unwrap().is_none());

        let mailbox = MailboxRepository::new(store).find("player1").await.unwrap();
        assert!(mailbox.find_disc(NotificationKind::DiscFound, "disc123").is_none());
        assert!(state.holds().is_empty());

        assert_eq!(tick_hold(&state, &key).await.unwrap(), TickOutcome::Finished);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn timer_and_owner_release_exactly_once() {
        for round in 0..20 {
            let (state, clock) = memory_state(AppConfig::default()).await;
            let disc_uid = format!("disc{round}");
            seed_disc(&state, &disc_uid, "player1").await;
            hold_service::begin_hold(&state, "storeA", &disc_uid)
                .await
                .unwrap();
            clock.advance(Duration::from_secs(181));
            let key = HoldKey::new("storeA", disc_uid.clone());

            let timer = tokio::spawn({
                let state = state.clone();
                let key = key.clone();
                async move { tick_hold(&state, &key).await }
            });
            let owner = tokio::spawn({
                let state = state.clone();
                let disc_uid = disc_uid.clone();
                async move { hold_service::release_disc(&state, &disc_uid, "player1").await }
            });

            let timer_won = timer.await.unwrap().unwrap() == TickOutcome::Released;
            let owner_won = owner.await.unwrap().unwrap();
            assert!(timer_won ^ owner_won, "round {round}: exactly one release");
            assert_eq!(status_of(&state, &key).await, HoldStatus::Released);
        }
    }

    #[tokio::test]
    async fn recovered_holds_resume_from_their_start_time() {
        let (state, _clock) = memory_state(AppConfig::default()).await;
        let late = HoldKey::new("storeA", "disc1");
        let expired = HoldKey::new("storeA", "disc2");
        seed_hold(&state, &late, "player1", Duration::from_secs(170)).await;
        seed_hold(&state, &expired, "player2", Duration::from_secs(190)).await;

        let report = recover(&state).await.unwrap();
        assert_eq!(report, RecoveryReport { found: 2, registered: 2 });

        assert_eq!(
            tick_hold(&state, &late).await.unwrap(),
            TickOutcome::Escalated {
                from: HoldStatus::Notified,
                to: HoldStatus::Critical
            }
        );
        assert_eq!(tick_hold(&state, &expired).await.unwrap(), TickOutcome::Released);

        let again = recover(&state).await.unwrap();
        assert_eq!(again, RecoveryReport { found: 1, registered: 0 });
    }

    #[tokio::test]
    async fn sweep_tallies_every_tracked_hold() {
        let (state, clock) = memory_state(AppConfig::default()).await;
        for (disc_uid, owner) in [("disc1", "player1"), ("disc2", "player2")] {
            seed_disc(&state, disc_uid, owner).await;
            hold_service::begin_hold(&state, "storeA", disc_uid)
                .await
                .unwrap();
        }
        clock.advance(Duration::from_secs(70));

        let report = sweep(&state).await;

        assert_eq!(report.evaluated, 2);
        assert_eq!(report.escalated, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(
            status_of(&state, &HoldKey::new("storeA", "disc1")).await,
            HoldStatus::Warning
        );
    }

    #[tokio::test]
    async fn failed_evaluation_stops_tracking_the_hold() {
        let (state, _clock) = memory_state(AppConfig::default()).await;
        let key = HoldKey::new("storeA", "disc123");
        seed_hold(&state, &key, "player1", Duration::from_secs(10)).await;
        recover(&state).await.unwrap();
        state.clear_store().await;

        let report = sweep(&state).await;

        assert_eq!(report.failed, 1);
        assert!(!state.holds().is_active(&key));
    }

    #[tokio::test]
    async fn concurrent_evaluation_of_one_hold_is_refused() {
        let (state, _clock) = memory_state(AppConfig::default()).await;
        let key = HoldKey::new("storeA", "disc123");
        seed_hold(&state, &key, "player1", Duration::from_secs(10)).await;

        let claim = state.holds().try_claim(&key);
        assert!(claim.is_some());
        assert_eq!(tick_hold(&state, &key).await.unwrap(), TickOutcome::Busy);

        drop(claim);
        assert_eq!(
            tick_hold(&state, &key).await.unwrap(),
            TickOutcome::Unchanged(HoldStatus::Notified)
        );
    }
}
