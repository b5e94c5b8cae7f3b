use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::array_len;
use crate::status::RecommendationStatus;
use crate::task::{AggregateKey, TaskKind, TrackedTask};
use crate::tracker::{Services, TrackerStrategy};

/// Tracks recommended follow-up questions.
///
/// An aggregate has at most one recommendation job at a time, so tasks are
/// keyed by the aggregate rather than the query id: requesting new
/// recommendations replaces the running job.
pub struct RecommendStrategy {
    services: Services,
}

impl RecommendStrategy {
    #[must_use]
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl TrackerStrategy for RecommendStrategy {
    type Status = RecommendationStatus;

    fn kind(&self) -> TaskKind {
        TaskKind::RecommendQuestions
    }

    fn services(&self) -> &Services {
        &self.services
    }

    fn task_id(&self, _query_id: &str, parent: &AggregateKey) -> String {
        parent.to_string()
    }

    fn normalize(&self, response: &Value) -> Value {
        let questions: Vec<Value> = response
            .get("questions")
            .and_then(Value::as_array)
            .map(|qs| {
                qs.iter()
                    .filter(|q| q.get("question").is_some_and(Value::is_string))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        json!({ "questions": questions })
    }

    fn telemetry_extras(&self, task: &TrackedTask<RecommendationStatus>, props: &mut Map<String, Value>) {
        props.insert(
            "questions".into(),
            json!(array_len(task.result.as_ref(), "questions")),
        );
    }
}
