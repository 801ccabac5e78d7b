use std::fmt;

use dashmap::{DashMap, mapref::entry::Entry};

/// Separator used in composite intake keys; record identifiers may not contain it.
pub const KEY_SEPARATOR: &str = "::";

/// Identifies a hold by the store holding the disc and the disc itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HoldKey {
    /// Store holding the disc.
    pub store_id: String,
    /// Held disc.
    pub disc_uid: String,
}

impl HoldKey {
    /// Key of `disc_uid` held at `store_id`.
    pub fn new(store_id: impl Into<String>, disc_uid: impl Into<String>) -> Self {
        Self {
            store_id: store_id.into(),
            disc_uid: disc_uid.into(),
        }
    }

    /// Document key of the intake record backing this hold.
    pub fn document_key(&self) -> String {
        format!("{}{}{}", self.store_id, KEY_SEPARATOR, self.disc_uid)
    }
}

impl fmt::Display for HoldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.store_id, KEY_SEPARATOR, self.disc_uid)
    }
}

/// Index of non-terminal holds swept by the timer, plus the per-key evaluation guard.
#[derive(Default)]
pub struct HoldRegistry {
    active: DashMap<HoldKey, ()>,
    in_flight: DashMap<HoldKey, ()>,
}

impl HoldRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a hold; returns `false` when it was already tracked.
    pub fn register(&self, key: HoldKey) -> bool {
        self.active.insert(key, ()).is_none()
    }

    /// Stop sweeping a hold.
    pub fn unregister(&self, key: &HoldKey) -> bool {
        self.active.remove(key).is_some()
    }

    /// Whether the hold is tracked.
    pub fn is_active(&self, key: &HoldKey) -> bool {
        self.active.contains_key(key)
    }

    /// Number of tracked holds.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no hold is tracked.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Snapshot of the tracked keys; the sweep iterates this copy so the index
    /// can change underneath it.
    pub fn active_keys(&self) -> Vec<HoldKey> {
        self.active.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Claim exclusive evaluation of `key`, or `None` when another caller holds it.
    pub fn try_claim(&self, key: &HoldKey) -> Option<InFlightGuard<'_>> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(InFlightGuard {
                    in_flight: &self.in_flight,
                    key: key.clone(),
                })
            }
        }
    }
}

/// Releases the in-flight claim on drop.
pub struct InFlightGuard<'a> {
    in_flight: &'a DashMap<HoldKey, ()>,
    key: HoldKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}
