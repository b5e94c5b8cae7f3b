//! Controllable test doubles for the AI service and the telemetry sink.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Result, TrackerError};
use crate::remote::{AiService, Endpoint, RemoteError, RemoteResult};
use crate::task::TaskKind;
use crate::telemetry::{Telemetry, TelemetryRecord};

// ============================================================================
// Mock AI Service
// ============================================================================

/// One scripted answer to a fetch.
#[derive(Debug, Clone)]
pub enum MockStep {
    Respond(RemoteResult),
    /// Network-level failure (retryable)
    Transient(String),
    /// Non-retryable HTTP rejection
    Reject { status: u16, message: String },
}

#[derive(Debug, Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<MockStep>>,
    last: HashMap<String, MockStep>,
    stopped: HashSet<String>,
    query_ids: VecDeque<String>,
    submit_error: Option<String>,
    submitted: Vec<(TaskKind, Value)>,
    cancelled: Vec<(TaskKind, String)>,
    fetches: HashMap<String, usize>,
    concurrent: HashMap<String, usize>,
    max_concurrent: HashMap<String, usize>,
    delays: HashMap<String, Duration>,
}

impl MockState {
    fn next_step(&mut self, query_id: &str) -> MockStep {
        if self.stopped.contains(query_id) {
            return MockStep::Respond(RemoteResult::status("STOPPED"));
        }
        if let Some(step) = self
            .scripts
            .get_mut(query_id)
            .and_then(VecDeque::pop_front)
        {
            self.last.insert(query_id.to_string(), step.clone());
            return step;
        }
        self.last
            .get(query_id)
            .cloned()
            .unwrap_or_else(|| MockStep::Transient(format!("no scripted response for {}", query_id)))
    }
}

/// Scripted [`AiService`].
///
/// Each query id has a queue of [`MockStep`]s consumed one per fetch; the
/// last step keeps repeating once the queue is empty. A cancelled job
/// answers STOPPED from its next fetch on, the way the real service does.
///
/// # Example
///
/// ```rust,ignore
/// let ai = MockAiService::new();
/// ai.queue_query_id("q1");
/// ai.push_status("q1", "UNDERSTANDING");
/// ai.push_response("q1", "FINISHED", json!({"steps": []}));
///
/// assert_eq!(ai.submit(TaskKind::AskDetail, &json!({})).await?, "q1");
/// ```
#[derive(Debug, Default)]
pub struct MockAiService {
    state: Mutex<MockState>,
}

impl MockAiService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a step to `query_id`'s script.
    pub fn push_step(&self, query_id: &str, step: MockStep) {
        self.lock()
            .scripts
            .entry(query_id.to_string())
            .or_default()
            .push_back(step);
    }

    pub fn push_result(&self, query_id: &str, result: RemoteResult) {
        self.push_step(query_id, MockStep::Respond(result));
    }

    /// Answer with a bare status.
    pub fn push_status(&self, query_id: &str, status: &str) {
        self.push_result(query_id, RemoteResult::status(status));
    }

    /// Answer with a status and a response body.
    pub fn push_response(&self, query_id: &str, status: &str, response: Value) {
        self.push_result(query_id, RemoteResult::status(status).with_response(response));
    }

    /// Answer FAILED with a structured error.
    pub fn push_failure(&self, query_id: &str, code: &str, message: &str) {
        self.push_result(
            query_id,
            RemoteResult::status("FAILED").with_error(RemoteError::new(code, message)),
        );
    }

    pub fn push_transient(&self, query_id: &str, message: &str) {
        self.push_step(query_id, MockStep::Transient(message.to_string()));
    }

    pub fn push_rejection(&self, query_id: &str, status: u16, message: &str) {
        self.push_step(
            query_id,
            MockStep::Reject {
                status,
                message: message.to_string(),
            },
        );
    }

    /// Make every fetch of `query_id` take `delay` (tokio time).
    pub fn set_delay(&self, query_id: &str, delay: Duration) {
        self.lock().delays.insert(query_id.to_string(), delay);
    }

    /// Use `query_id` for the next submit instead of a generated one.
    pub fn queue_query_id(&self, query_id: &str) {
        self.lock().query_ids.push_back(query_id.to_string());
    }

    /// Make submits fail with `message` (or succeed again with `None`).
    pub fn set_submit_error(&self, message: Option<&str>) {
        self.lock().submit_error = message.map(str::to_string);
    }

    #[must_use]
    pub fn fetch_count(&self, query_id: &str) -> usize {
        self.lock().fetches.get(query_id).copied().unwrap_or(0)
    }

    /// Highest number of simultaneous fetches seen for `query_id`.
    #[must_use]
    pub fn max_concurrent_fetches(&self, query_id: &str) -> usize {
        self.lock().max_concurrent.get(query_id).copied().unwrap_or(0)
    }

    /// Every `(kind, payload)` submitted so far.
    #[must_use]
    pub fn submitted(&self) -> Vec<(TaskKind, Value)> {
        self.lock().submitted.clone()
    }

    /// Every `(kind, query_id)` cancelled so far.
    #[must_use]
    pub fn cancelled(&self) -> Vec<(TaskKind, String)> {
        self.lock().cancelled.clone()
    }
}

#[async_trait]
impl AiService for MockAiService {
    async fn submit(&self, kind: TaskKind, payload: &Value) -> Result<String> {
        let mut state = self.lock();
        if let Some(message) = state.submit_error.clone() {
            return Err(TrackerError::Submit { kind, message });
        }
        state.submitted.push((kind, payload.clone()));
        Ok(state
            .query_ids
            .pop_front()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
    }

    async fn fetch(&self, _kind: TaskKind, query_id: &str) -> Result<RemoteResult> {
        let delay = {
            let mut state = self.lock();
            *state.fetches.entry(query_id.to_string()).or_default() += 1;
            let current = {
                let current = state.concurrent.entry(query_id.to_string()).or_default();
                *current += 1;
                *current
            };
            let max = state.max_concurrent.entry(query_id.to_string()).or_default();
            *max = (*max).max(current);
            state.delays.get(query_id).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let step = {
            let mut state = self.lock();
            if let Some(current) = state.concurrent.get_mut(query_id) {
                *current = current.saturating_sub(1);
            }
            state.next_step(query_id)
        };

        match step {
            MockStep::Respond(result) => Ok(result),
            MockStep::Transient(message) => Err(TrackerError::transient(query_id, message)),
            MockStep::Reject { status, message } => Err(TrackerError::RemoteRejected {
                query_id: query_id.to_string(),
                status,
                message,
            }),
        }
    }

    async fn cancel(&self, kind: TaskKind, query_id: &str) -> Result<()> {
        if !Endpoint::for_kind(kind).cancellable {
            return Err(TrackerError::Cancel {
                kind,
                query_id: query_id.to_string(),
                message: format!("{} jobs cannot be cancelled", kind),
            });
        }
        let mut state = self.lock();
        state.cancelled.push((kind, query_id.to_string()));
        state.stopped.insert(query_id.to_string());
        Ok(())
    }
}

// ============================================================================
// Recording Telemetry
// ============================================================================

/// Telemetry sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryRecord>>,
}

impl RecordingTelemetry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<TelemetryRecord> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Events with the given name.
    #[must_use]
    pub fn named(&self, name: &str) -> Vec<TelemetryRecord> {
        self.events()
            .into_iter()
            .filter(|e| e.event == name)
            .collect()
    }
}

impl Telemetry for RecordingTelemetry {
    fn send_event(&self, name: &str, properties: Value, service: Option<&str>, success: bool) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(TelemetryRecord {
                event: name.to_string(),
                properties,
                service: service.map(str::to_string),
                source: None,
                success,
                timestamp: Utc::now(),
            });
    }
}
