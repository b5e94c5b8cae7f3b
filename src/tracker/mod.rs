//! Polling trackers for asynchronous AI jobs.
//!
//! Every job kind is tracked by the same engine, [`Tracker`], driven by a
//! kind-specific [`TrackerStrategy`]:
//!
//! - [`engine`] - tick loop, in-flight dedup, change detection, finalization
//! - [`strategy`] - the per-kind hooks and the shared [`Services`]
//! - [`kinds`] - strategies for ask, ask-detail, explain, chart,
//!   chart-adjustment, recommendation and adjustment jobs
//! - [`AdjustmentTaskTracker`] - adjustment tracking with re-runs and
//!   retention
//! - [`RetentionEvictor`] - tick-driven purge of retained tasks

mod adjustment_tracker;
pub mod engine;
pub mod kinds;
mod retention;
pub mod strategy;

pub use adjustment_tracker::AdjustmentTaskTracker;
pub use engine::{DispatchedTick, PollOutcome, Tracker, TrackerOptions, TELEMETRY_SERVICE};
pub use kinds::{
    AdjustmentStrategy, AskDetailStrategy, AskStrategy, ChartStrategy, ExplainStrategy,
    RecommendStrategy,
};
pub use retention::{RetentionEvictor, DEFAULT_RETENTION_SECS};
pub use strategy::{Services, TrackerStrategy};
