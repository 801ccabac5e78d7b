use tracing::info;
use uuid::Uuid;

use crate::{
    dao::{
        models::{DiscAttributes, DiscOwnershipEntity, QrCodeEntity},
        repositories::{DiscRepository, IntakeRepository, QrCodeRepository},
    },
    error::ServiceError,
    state::SharedState,
};

/// What a scanned code refers to, from the scanning user's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The scanner owns the disc.
    OwnedBySelf {
        /// Scanned disc.
        disc_uid: String,
        /// Its attributes.
        disc: DiscAttributes,
    },
    /// Another player owns the disc.
    OwnedByOther {
        /// Scanned disc.
        disc_uid: String,
        /// Current owner.
        owner_id: String,
        /// Its attributes.
        disc: DiscAttributes,
    },
    /// A printed code nobody has registered yet.
    UnregisteredButKnownCode {
        /// Code to register.
        code: String,
    },
    /// A code the registry does not know.
    Unknown {
        /// Code as scanned.
        code: String,
    },
}

/// Look a scanned code up in the ownership records, then in the QR registry.
pub async fn resolve_scan(
    state: &SharedState,
    code: &str,
    user_id: &str,
) -> Result<ScanOutcome, ServiceError> {
    let store = state.require_store().await?;

    if let Some(ownership) = DiscRepository::new(store.clone()).find(code).await? {
        return Ok(if ownership.owner_id == user_id {
            ScanOutcome::OwnedBySelf {
                disc_uid: ownership.disc_uid,
                disc: ownership.disc,
            }
        } else {
            ScanOutcome::OwnedByOther {
                disc_uid: ownership.disc_uid,
                owner_id: ownership.owner_id,
                disc: ownership.disc,
            }
        });
    }

    if QrCodeRepository::new(store).find(code).await?.is_some() {
        return Ok(ScanOutcome::UnregisteredButKnownCode {
            code: code.to_owned(),
        });
    }

    Ok(ScanOutcome::Unknown {
        code: code.to_owned(),
    })
}

/// Put a known, unclaimed code in `player_id`'s bag.
pub async fn register_disc(
    state: &SharedState,
    player_id: &str,
    code: &str,
    disc: DiscAttributes,
) -> Result<DiscOwnershipEntity, ServiceError> {
    match resolve_scan(state, code, player_id).await? {
        ScanOutcome::UnregisteredButKnownCode { .. } => {}
        ScanOutcome::Unknown { .. } => return Err(ServiceError::DiscNotFound(code.to_owned())),
        ScanOutcome::OwnedBySelf { .. } | ScanOutcome::OwnedByOther { .. } => {
            return Err(ServiceError::InvalidState(format!(
                "disc `{code}` is already registered"
            )));
        }
    }

    let store = state.require_store().await?;
    let entity = DiscOwnershipEntity {
        disc_uid: code.to_owned(),
        owner_id: player_id.to_owned(),
        disc,
        registered_at: state.now(),
        registration_id: Uuid::new_v4(),
    };
    if !DiscRepository::new(store).register(&entity).await? {
        return Err(ServiceError::InvalidState(format!(
            "disc `{code}` is already registered"
        )));
    }

    info!(disc_uid = %entity.disc_uid, owner_id = %entity.owner_id, "disc registered");
    Ok(entity)
}

/// Owner takes a disc out of their bag.
///
/// Refused while a store holds the disc; the owner releases it instead.
pub async fn remove_disc(
    state: &SharedState,
    player_id: &str,
    disc_uid: &str,
) -> Result<(), ServiceError> {
    let store = state.require_store().await?;
    let discs = DiscRepository::new(store.clone());

    let Some(ownership) = discs.find(disc_uid).await? else {
        return Err(ServiceError::OwnershipRecordMissing(disc_uid.to_owned()));
    };
    if ownership.owner_id != player_id {
        return Err(ServiceError::Unauthorized(format!(
            "disc `{disc_uid}` is not in your bag"
        )));
    }

    let held = IntakeRepository::new(store)
        .list_for_disc(disc_uid)
        .await?
        .into_iter()
        .any(|record| !record.status.is_terminal());
    if held {
        return Err(ServiceError::InvalidState(format!(
            "disc `{disc_uid}` is held by a store; release it instead"
        )));
    }

    if !discs.remove_owned(disc_uid, player_id).await? {
        return Err(ServiceError::OwnershipRecordMissing(disc_uid.to_owned()));
    }

    info!(disc_uid, owner_id = player_id, "disc removed from bag");
    Ok(())
}

/// Add printed codes to the QR registry; returns how many were new.
pub async fn register_codes(state: &SharedState, codes: &[String]) -> Result<usize, ServiceError> {
    let store = state.require_store().await?;
    let registry = QrCodeRepository::new(store);
    let now = state.now();

    let mut inserted = 0;
    for code in codes {
        let entity = QrCodeEntity {
            code: code.clone(),
            created_at: now,
        };
        if registry.insert(&entity).await? {
            inserted += 1;
        }
    }

    info!(requested = codes.len(), inserted, "qr codes registered");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AppConfig, services::hold_service, state::testing::memory_state};

    fn attributes() -> DiscAttributes {
        DiscAttributes {
            name: "Buzzz".into(),
            manufacturer: "Discraft".into(),
            color: "blue".into(),
        }
    }

    #[tokio::test]
    async fn scan_outcome_depends_on_who_is_scanning() {
        let (state, _clock) = memory_state(AppConfig::default()).await;
        assert_eq!(register_codes(&state, &["qr-1".into(), "qr-2".into()]).await.unwrap(), 2);

        assert_eq!(
            resolve_scan(&state, "qr-1", "player1").await.unwrap(),
            ScanOutcome::UnregisteredButKnownCode { code: "qr-1".into() }
        );
        assert_eq!(
            resolve_scan(&state, "nope", "player1").await.unwrap(),
            ScanOutcome::Unknown { code: "nope".into() }
        );

        register_disc(&state, "player1", "qr-1", attributes()).await.unwrap();

        assert_eq!(
            resolve_scan(&state, "qr-1", "player1").await.unwrap(),
            ScanOutcome::OwnedBySelf {
                disc_uid: "qr-1".into(),
                disc: attributes()
            }
        );
        assert_eq!(
            resolve_scan(&state, "qr-1", "storeA").await.unwrap(),
            ScanOutcome::OwnedByOther {
                disc_uid: "qr-1".into(),
                owner_id: "player1".into(),
                disc: attributes()
            }
        );
    }

    #[tokio::test]
    async fn importing_codes_twice_only_counts_new_ones() {
        let (state, _clock) = memory_state(AppConfig::default()).await;
        register_codes(&state, &["qr-1".into()]).await.unwrap();

        let inserted = register_codes(&state, &["qr-1".into(), "qr-2".into()])
            .await
            .unwrap();

        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn registration_requires_a_known_unclaimed_code() {
        let (state, _clock) = memory_state(AppConfig::default()).await;
        register_codes(&state, &["qr-1".into()]).await.unwrap();

        let err = register_disc(&state, "player1", "qr-9", attributes())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DiscNotFound(_)));

        register_disc(&state, "player1", "qr-1", attributes()).await.unwrap();
        let err = register_disc(&state, "player2", "qr-1", attributes())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn held_disc_cannot_leave_the_bag() {
        let (state, _clock) = memory_state(AppConfig::default()).await;
        register_codes(&state, &["qr-1".into()]).await.unwrap();
        register_disc(&state, "player1", "qr-1", attributes()).await.unwrap();

        let err = remove_disc(&state, "player2", "qr-1").await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));

        hold_service::begin_hold(&state, "storeA", "qr-1").await.unwrap();
        let err = remove_disc(&state, "player1", "qr-1").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn removed_disc_scans_as_known_code_again() {
        let (state, _clock) = memory_state(AppConfig::default()).await;
        register_codes(&state, &["qr-1".into()]).await.unwrap();
        register_disc(&state, "player1", "qr-1", attributes()).await.unwrap();

        remove_disc(&state, "player1", "qr-1").await.unwrap();

        assert_eq!(
            resolve_scan(&state, "qr-1", "player1").await.unwrap(),
            ScanOutcome::UnregisteredButKnownCode { code: "qr-1".into() }
        );
        let err = remove_disc(&state, "player1", "qr-1").await.unwrap_err();
        assert!(matches!(err, ServiceError::OwnershipRecordMissing(_)));
    }
}
