/// Wall-clock abstraction.
pub mod clock;
/// Hold stages and escalation policy.
pub mod hold;
/// In-process index of tracked holds.
pub mod registry;

use std::{sync::Arc, time::SystemTime};

use tokio::sync::{RwLock, watch};

use crate::{
    config::AppConfig,
    dao::document_store::DocumentStore,
    error::ServiceError,
    services::notifier::NotificationSink,
};

use self::{clock::Clock, hold::HoldPolicy, registry::HoldRegistry};

/// Shared handle to [`AppState`].
pub type SharedState = Arc<AppState>;

/// Central application state: storage handle, hold index and injected collaborators.
pub struct AppState {
    store: RwLock<Option<Arc<dyn DocumentStore>>>,
    degraded: watch::Sender<bool>,
    holds: HoldRegistry,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn NotificationSink>,
    config: AppConfig,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(
        config: AppConfig,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn NotificationSink>,
    ) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        Arc::new(Self {
            store: RwLock::new(None),
            degraded: degraded_tx,
            holds: HoldRegistry::new(),
            clock,
            notifier,
            config,
        })
    }

    /// Obtain a handle to the current document store, if one is installed.
    pub async fn store(&self) -> Option<Arc<dyn DocumentStore>> {
        let guard = self.store.read().await;
        guard.as_ref().cloned()
    }

    /// Current document store, or [`ServiceError::Degraded`] when none is usable.
    pub async fn require_store(&self) -> Result<Arc<dyn DocumentStore>, ServiceError> {
        if self.is_degraded() {
            return Err(ServiceError::Degraded);
        }
        self.store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new store implementation and leave degraded mode.
    pub async fn set_store(&self, store: Arc<dyn DocumentStore>) {
        {
            let mut guard = self.store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false);
    }

    /// Remove the current store and enter degraded mode.
    pub async fn clear_store(&self) {
        {
            let mut guard = self.store.write().await;
            guard.take();
        }
        self.update_degraded(true);
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    /// Index of holds the sweeper evaluates.
    pub fn holds(&self) -> &HoldRegistry {
        &self.holds
    }

    /// Current wall-clock time.
    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Push delivery sink.
    pub fn notifier(&self) -> &dyn NotificationSink {
        self.notifier.as_ref()
    }

    /// Loaded configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Escalation thresholds derived from the configuration.
    pub fn hold_policy(&self) -> HoldPolicy {
        self.config.hold_policy()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::{Duration, SystemTime, UNIX_EPOCH},
    };

    use super::{AppState, SharedState, clock::Clock};
    use crate::{
        config::AppConfig, dao::document_store::memory::MemoryDocumentStore,
        services::notifier::LogSink,
    };

    /// Clock that only moves when told to, shared between clones.
    #[derive(Debug, Clone)]
    pub(crate) struct ManualClock {
        now_ms: Arc<AtomicU64>,
    }

    impl ManualClock {
        pub(crate) fn new(start_ms: u64) -> Self {
            Self {
                now_ms: Arc::new(AtomicU64::new(start_ms)),
            }
        }

        pub(crate) fn advance(&self, delta: Duration) {
            self.now_ms
                .fetch_add(delta.as_millis() as u64, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> SystemTime {
            UNIX_EPOCH + Duration::from_millis(self.now_ms.load(Ordering::SeqCst))
        }
    }

    /// State backed by an in-memory store and a clock the test drives.
    pub(crate) async fn memory_state(config: AppConfig) -> (SharedState, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let state = AppState::new(config, Arc::new(clock.clone()), Arc::new(LogSink));
        state.set_store(Arc::new(MemoryDocumentStore::new())).await;
        (state, clock)
    }

    #[tokio::test]
    async fn installing_a_store_leaves_degraded_mode() {
        let state = AppState::new(
            AppConfig::default(),
            Arc::new(ManualClock::new(0)),
            Arc::new(LogSink),
        );
        let mut watcher = state.degraded_watcher();
        assert!(state.is_degraded());
        assert!(state.require_store().await.is_err());

        state.set_store(Arc::new(MemoryDocumentStore::new())).await;
        assert!(!state.is_degraded());
        assert!(watcher.has_changed().unwrap());
        assert!(!*watcher.borrow_and_update());

        state.clear_store().await;
        assert!(state.is_degraded());
    }

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();

        other.advance(Duration::from_secs(65));

        assert_eq!(
            clock.now().duration_since(UNIX_EPOCH).unwrap(),
            Duration::from_millis(66_000)
        );
    }
}
