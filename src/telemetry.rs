//! Fire-and-forget telemetry events.
//!
//! Each tracker emits exactly one event per task, at the tick where the task
//! first reaches a terminal status. Sinks never report failure back to the
//! caller: a lost event is logged at debug level and otherwise ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::TelemetryConfig;
use crate::task::TaskKind;

/// Telemetry event names, one per job kind.
///
/// # Example
///
/// ```
/// use asktrack::telemetry::TelemetryEvent;
/// use asktrack::task::TaskKind;
///
/// let event = TelemetryEvent::for_kind(TaskKind::AskDetail);
/// assert_eq!(event.as_str(), "question_answered");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEvent {
    AskCandidatesGenerated,
    QuestionAnswered,
    SqlExplained,
    ChartGenerated,
    ChartAdjusted,
    QuestionsRecommended,
    SqlAdjusted,
}

impl TelemetryEvent {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AskCandidatesGenerated => "ask_candidates_generated",
            Self::QuestionAnswered => "question_answered",
            Self::SqlExplained => "sql_explained",
            Self::ChartGenerated => "chart_generated",
            Self::ChartAdjusted => "chart_adjusted",
            Self::QuestionsRecommended => "questions_recommended",
            Self::SqlAdjusted => "sql_adjusted",
        }
    }

    /// The event emitted when a job of `kind` finalizes.
    #[must_use]
    pub fn for_kind(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Ask => Self::AskCandidatesGenerated,
            TaskKind::AskDetail => Self::QuestionAnswered,
            TaskKind::Explain => Self::SqlExplained,
            TaskKind::Chart => Self::ChartGenerated,
            TaskKind::ChartAdjustment => Self::ChartAdjusted,
            TaskKind::RecommendQuestions => Self::QuestionsRecommended,
            TaskKind::Adjustment => Self::SqlAdjusted,
        }
    }
}

impl std::fmt::Display for TelemetryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One emitted event, as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub event: String,
    pub properties: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Name of the emitting deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Telemetry sink.
///
/// `send_event` must return quickly and must not fail.
pub trait Telemetry: Send + Sync {
    fn send_event(&self, name: &str, properties: Value, service: Option<&str>, success: bool);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn send_event(&self, _name: &str, _properties: Value, _service: Option<&str>, _success: bool) {}
}

/// Writes events to the `asktrack::telemetry` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn send_event(&self, name: &str, properties: Value, service: Option<&str>, success: bool) {
        info!(
            target: "asktrack::telemetry",
            event = name,
            service = service.unwrap_or("-"),
            success,
            properties = %properties,
            "telemetry event"
        );
    }
}

/// POSTs events as JSON to a collector endpoint.
///
/// Each send is spawned onto the current tokio runtime; without a runtime
/// the event is dropped.
#[derive(Debug, Clone)]
pub struct HttpTelemetry {
    client: reqwest::Client,
    endpoint: String,
    source: Option<String>,
}

impl HttpTelemetry {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            source: None,
        })
    }

    /// Tag every event with the emitting deployment's name.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Telemetry for HttpTelemetry {
    fn send_event(&self, name: &str, properties: Value, service: Option<&str>, success: bool) {
        let record = TelemetryRecord {
            event: name.to_string(),
            properties,
            service: service.map(str::to_string),
            source: self.source.clone(),
            success,
            timestamp: Utc::now(),
        };

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(event = name, "No runtime available; dropping telemetry event");
            return;
        };

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        handle.spawn(async move {
            match client.post(&endpoint).json(&record).send().await {
                Ok(response) if !response.status().is_success() => {
                    debug!(event = %record.event, status = %response.status(), "Telemetry collector refused event");
                }
                Err(e) => debug!(event = %record.event, error = %e, "Failed to send telemetry event"),
                Ok(_) => {}
            }
        });
    }
}

/// Build the sink described by `config`.
///
/// Disabled telemetry discards events; without an endpoint, events go to
/// the log.
pub fn from_config(config: &TelemetryConfig) -> crate::Result<Arc<dyn Telemetry>> {
    if !config.enabled {
        return Ok(Arc::new(NoopTelemetry));
    }
    match &config.endpoint {
        Some(endpoint) => Ok(Arc::new(
            HttpTelemetry::new(endpoint.as_str())?.with_source(config.service.as_str()),
        )),
        None => Ok(Arc::new(TracingTelemetry)),
    }
}
