//! asktrack - asynchronous AI job tracking
//!
//! Tracks long-running jobs submitted to an AI service (question answering,
//! step breakdowns, explanations, charts, recommendations and SQL
//! adjustments). Each job kind has a tracker that polls the service on a
//! fixed tick, writes status changes through to a persistent store, merges
//! explanation results into their answers, and emits exactly one telemetry
//! event per finished job.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`task`] - Tracked task model, job kinds and aggregate references
//! - [`status`] - Per-kind status vocabularies and terminal classification
//! - [`registry`] - Concurrent task registry with in-flight poll guards
//! - [`remote`] - AI service client (submit, fetch, cancel)
//! - [`store`] - Persistent task records (SQLite and in-memory)
//! - [`merge`] - Stitching explanations into step-by-step answers
//! - [`tracker`] - The polling engine and the per-kind strategies
//! - [`hub`] - One tracker per kind behind a single entry point
//! - [`telemetry`] - Finalization events
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Testing infrastructure (mocks, fixtures)
//!
//! # Example
//!
//! ```rust,ignore
//! use asktrack::{AppConfig, AiServiceClient, Services, SqliteStore, TrackerHub};
//! use asktrack::task::{AggregateKey, TaskInput, TaskKind};
//!
//! let config = AppConfig::load_or_default("asktrack.toml".as_ref())?;
//! let ai = Arc::new(AiServiceClient::new(&config.ai_service.endpoint, config.request_timeout())?);
//! let store = Arc::new(SqliteStore::open(&config.store.path)?);
//! let telemetry = asktrack::telemetry::from_config(&config.telemetry)?;
//!
//! let hub = TrackerHub::from_config(&config, Services::new(ai, store), telemetry);
//! hub.rehydrate().await?;
//! hub.start();
//!
//! hub.submit(
//!     TaskKind::AskDetail,
//!     AggregateKey::thread_response(42),
//!     TaskInput::question("What were last month's top products?"),
//! )
//! .await?;
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod hub;
pub mod merge;
pub mod registry;
pub mod remote;
pub mod status;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod testing;
pub mod tracker;

// Re-export commonly used types
pub use error::{IntoTrackerError, Result, TrackerError};

pub use config::{AppConfig, DEFAULT_CONFIG_FILE};
pub use hub::TrackerHub;
pub use remote::{AiService, AiServiceClient, RemoteError, RemoteResult};
pub use store::{AggregateStore, MemoryStore, RecordKey, RecordPatch, SqliteStore, TaskRecord};
pub use task::{AggregateKey, TaskInput, TaskKind, TaskSnapshot, TrackedTask};
pub use telemetry::{Telemetry, TelemetryEvent};

pub use tracker::{
    AdjustmentTaskTracker, PollOutcome, RetentionEvictor, Services, Tracker, TrackerOptions,
    TrackerStrategy,
};
