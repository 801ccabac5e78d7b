use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Escalation levels a store hold moves through, in strict forward order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    /// The owner has just been told a store found their disc.
    Notified,
    /// Less than the warning window remains before release.
    Warning,
    /// Less than the critical window remains before release.
    Critical,
    /// The disc left the owner's bag; terminal.
    Released,
}

impl HoldStatus {
    /// Whether no further transition can happen from this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, HoldStatus::Released)
    }

    /// Next status in the escalation order.
    pub fn successor(self) -> Option<HoldStatus> {
        match self {
            HoldStatus::Notified => Some(HoldStatus::Warning),
            HoldStatus::Warning => Some(HoldStatus::Critical),
            HoldStatus::Critical => Some(HoldStatus::Released),
            HoldStatus::Released => None,
        }
    }

    /// Wire name, matching the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            HoldStatus::Notified => "notified",
            HoldStatus::Warning => "warning",
            HoldStatus::Critical => "critical",
            HoldStatus::Released => "released",
        }
    }
}

/// How a tick behaves when more than one threshold was crossed since the last write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipPolicy {
    /// Jump straight to the furthest status reached by elapsed time.
    #[default]
    Collapse,
    /// Advance a single status per tick regardless of elapsed time.
    Step,
}

/// Escalation thresholds, measured as time remaining before the hold ends.
///
/// The windows are anchored to the end of the hold so a longer timeout keeps the
/// same final warning and critical periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationWindows {
    /// Remaining time at or below which the hold enters [`HoldStatus::Warning`].
    pub warning_remaining: Duration,
    /// Remaining time at or below which the hold enters [`HoldStatus::Critical`].
    pub critical_remaining: Duration,
}

impl Default for EscalationWindows {
    fn default() -> Self {
        Self {
            warning_remaining: Duration::from_secs(120),
            critical_remaining: Duration::from_secs(60),
        }
    }
}

impl EscalationWindows {
    /// Status a hold of length `timeout` should be in once `elapsed` has passed.
    pub fn status_at(&self, timeout: Duration, elapsed: Duration) -> HoldStatus {
        if elapsed >= timeout {
            return HoldStatus::Released;
        }

        let remaining = timeout - elapsed;
        if remaining <= self.critical_remaining {
            HoldStatus::Critical
        } else if remaining <= self.warning_remaining {
            HoldStatus::Warning
        } else {
            HoldStatus::Notified
        }
    }
}

/// A validated forward move that has not been written yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    /// Status the record is expected to hold when the write lands.
    pub from: HoldStatus,
    /// Status the record moves to.
    pub to: HoldStatus,
    /// Elapsed time that justified the move.
    pub elapsed: Duration,
}

/// Error returned when a write would move a hold backwards or nowhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid escalation: {from:?} cannot move to {to:?}")]
pub struct InvalidEscalation {
    /// Current status of the hold.
    pub from: HoldStatus,
    /// Rejected target status.
    pub to: HoldStatus,
}

/// Combined timing rules used by the hold timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HoldPolicy {
    /// Thresholds relative to the end of the hold.
    pub windows: EscalationWindows,
    /// Behaviour when several thresholds were crossed at once.
    pub skip: SkipPolicy,
}

impl HoldPolicy {
    /// Plan the single write a tick should perform, if any.
    ///
    /// Returns `None` when the hold is terminal or elapsed time has not reached
    /// a status beyond `current`. A planned escalation is always forward.
    pub fn plan(
        &self,
        current: HoldStatus,
        timeout: Duration,
        elapsed: Duration,
    ) -> Option<Escalation> {
        if current.is_terminal() {
            return None;
        }

        let target = self.windows.status_at(timeout, elapsed);
        if target <= current {
            return None;
        }

        let to = match self.skip {
            SkipPolicy::Collapse => target,
            SkipPolicy::Step => current.successor()?,
        };

        Some(Escalation {
            from: current,
            to,
            elapsed,
        })
    }
}

/// Reject any move that is not strictly forward.
pub fn ensure_forward(from: HoldStatus, to: HoldStatus) -> Result<(), InvalidEscalation> {
    if to > from {
        Ok(())
    } else {
        Err(InvalidEscalation { from, to })
    }
}
