//! Testing infrastructure.
//!
//! - **Mocks**: [`MockAiService`] (scripted fetch results, cancel, submit ids,
//!   concurrency counters) and [`RecordingTelemetry`]
//! - **Fixtures**: sample AI service payloads per job kind
//!
//! # Example
//!
//! ```rust,ignore
//! use asktrack::testing::{fixtures, MockAiService, RecordingTelemetry};
//!
//! let ai = MockAiService::new();
//! ai.push_status("q1", "UNDERSTANDING");
//! ai.push_response("q1", "FINISHED", fixtures::ask_detail_response());
//! ```

pub mod fixtures;
pub mod mocks;

pub use mocks::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::AiService;
    use crate::task::TaskKind;
    use crate::telemetry::Telemetry;
    use serde_json::json;

    // =========================================================================
    // Mock AI Service Tests
    // =========================================================================

    #[tokio::test]
    async fn test_mock_last_step_repeats() {
        let ai = MockAiService::new();
        ai.push_status("q1", "UNDERSTANDING");
        ai.push_status("q1", "GENERATING");

        let statuses: Vec<String> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                out.push(ai.fetch(TaskKind::Ask, "q1").await.unwrap().status);
            }
            out
        };
        assert_eq!(statuses, vec!["UNDERSTANDING", "GENERATING", "GENERATING"]);
        assert_eq!(ai.fetch_count("q1"), 3);
    }

    #[tokio::test]
    async fn test_mock_unscripted_fetch_is_transient() {
        let ai = MockAiService::new();
        let err = ai.fetch(TaskKind::Chart, "nope").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_mock_cancel_answers_stopped() {
        let ai = MockAiService::new();
        ai.push_status("q1", "GENERATING");
        ai.cancel(TaskKind::Ask, "q1").await.unwrap();
        assert_eq!(ai.fetch(TaskKind::Ask, "q1").await.unwrap().status, "STOPPED");
        assert_eq!(ai.cancelled(), vec![(TaskKind::Ask, "q1".to_string())]);
    }

    #[tokio::test]
    async fn test_mock_explain_cannot_be_cancelled() {
        let ai = MockAiService::new();
        assert!(ai.cancel(TaskKind::Explain, "e1").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_submit_uses_queued_then_generated_ids() {
        let ai = MockAiService::new();
        ai.queue_query_id("fixed");
        assert_eq!(ai.submit(TaskKind::Ask, &json!({})).await.unwrap(), "fixed");
        let generated = ai.submit(TaskKind::Ask, &json!({})).await.unwrap();
        assert_ne!(generated, "fixed");
        assert_eq!(ai.submitted().len(), 2);

        ai.set_submit_error(Some("service unavailable"));
        assert!(ai.submit(TaskKind::Ask, &json!({})).await.is_err());
    }

    // =========================================================================
    // Recording Telemetry Tests
    // =========================================================================

    #[test]
    fn test_recording_telemetry_filters_by_name() {
        let telemetry = RecordingTelemetry::new();
        telemetry.send_event("question_answered", json!({"query_id": "q1"}), Some("ai_service"), true);
        telemetry.send_event("chart_generated", json!({}), None, false);

        assert_eq!(telemetry.events().len(), 2);
        let answered = telemetry.named("question_answered");
        assert_eq!(answered.len(), 1);
        assert_eq!(answered[0].service.as_deref(), Some("ai_service"));
    }
}
