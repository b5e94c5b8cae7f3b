//! Housekeeping for finalized tasks kept past retirement.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::registry::TaskRegistry;
use crate::status::JobStatus;

/// Default grace period for retained adjustment tasks, in seconds.
pub const DEFAULT_RETENTION_SECS: i64 = 300;

/// Purges retained tasks once their window has elapsed.
///
/// There is no timer of its own: the owning tracker calls
/// [`sweep`](Self::sweep) at the start of every tick, so a task is gone at
/// most one poll interval after its window closes.
#[derive(Debug, Clone, Copy)]
pub struct RetentionEvictor {
    window: Duration,
}

impl Default for RetentionEvictor {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_RETENTION_SECS))
    }
}

impl RetentionEvictor {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Remove expired entries from `registry`, returning their ids.
    pub fn sweep<St: JobStatus>(&self, registry: &TaskRegistry<St>, now: DateTime<Utc>) -> Vec<String> {
        let evicted = registry.evict_expired(now, self.window);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted retained tasks");
        }
        evicted
    }
}
