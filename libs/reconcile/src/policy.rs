//! Timeout, orphan and reclaim policy.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ReconcileError;

/// Default time a create-flow machine may stay pending.
pub const DEFAULT_CREATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default extra time before an unreachable machine is treated as an orphan.
pub const DEFAULT_ORPHAN_GRACE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Default provider notice between a reclaim mark and termination.
pub const DEFAULT_RECLAIM_NOTICE_WINDOW: Duration = Duration::from_secs(120);

/// Default age after which fully terminal requests are dropped.
pub const DEFAULT_REQUEST_GC_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifecycle timing policy shared by the poll, return and reclaim paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub creation_timeout: Duration,
    pub orphan_grace_window: Duration,
    pub reclaim_notice_window: Duration,
    pub request_gc_window: Duration,
    /// Terminate reclaim-marked machines on return instead of leaving them to
    /// the provider.
    pub terminate_on_reclaim: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            creation_timeout: DEFAULT_CREATION_TIMEOUT,
            orphan_grace_window: DEFAULT_ORPHAN_GRACE_WINDOW,
            reclaim_notice_window: DEFAULT_RECLAIM_NOTICE_WINDOW,
            request_gc_window: DEFAULT_REQUEST_GC_WINDOW,
            terminate_on_reclaim: false,
        }
    }
}

impl Policy {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.creation_timeout.is_zero() {
            return Err(ReconcileError::InvalidPolicy(
                "creation timeout must be positive".to_string(),
            ));
        }
        if self.reclaim_notice_window.is_zero() {
            return Err(ReconcileError::InvalidPolicy(
                "reclaim notice window must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// A machine launched at `launch_time` has been pending too long.
    pub fn creation_expired(&self, launch_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        elapsed(launch_time, now) > self.creation_timeout
    }

    /// A machine launched at `launch_time` is past the point where the caller
    /// could still legitimately learn about it.
    pub fn orphan_expired(&self, launch_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        elapsed(launch_time, now) > self.creation_timeout.saturating_add(self.orphan_grace_window)
    }

    /// A request created at `created_at` is old enough to be collected once
    /// all of its machines are terminal.
    pub fn request_collectable(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        elapsed(created_at, now) > self.request_gc_window
    }

    /// Remaining notice for a machine marked for reclaim at `marked_at`.
    pub fn grace_period(&self, marked_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        grace_period(self.reclaim_notice_window, marked_at, now)
    }
}

/// Time since `since`, clamped at zero when the clock runs behind.
pub fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// `max(0, notice - elapsed)`.
///
/// A mark timestamped in the future counts as zero elapsed, so clock skew can
/// never extend the window past `notice`.
pub fn grace_period(notice: Duration, marked_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    notice.saturating_sub(elapsed(marked_at, now))
}
