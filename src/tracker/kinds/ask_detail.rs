use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{array_len, field};
use crate::status::AskDetailStatus;
use crate::task::{TaskKind, TrackedTask};
use crate::tracker::{Services, TrackerStrategy};

/// Tracks the step-by-step SQL breakdown of an answer.
///
/// The persisted `detail` is `{description, steps: [{sql, summary, cteName}]}`,
/// which is also what [`ExplainStrategy`](super::ExplainStrategy) later
/// stitches references into.
pub struct AskDetailStrategy {
    services: Services,
}

impl AskDetailStrategy {
    #[must_use]
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

fn normalize_step(step: &Value) -> Value {
    let text = |key: &str| {
        step.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    json!({
        "sql": text("sql"),
        "summary": text("summary"),
        "cteName": text("cteName"),
    })
}

#[async_trait]
impl TrackerStrategy for AskDetailStrategy {
    type Status = AskDetailStatus;

    fn kind(&self) -> TaskKind {
        TaskKind::AskDetail
    }

    fn services(&self) -> &Services {
        &self.services
    }

    fn normalize(&self, response: &Value) -> Value {
        let steps: Vec<Value> = response
            .get("steps")
            .and_then(Value::as_array)
            .map(|steps| steps.iter().map(normalize_step).collect())
            .unwrap_or_default();

        json!({
            "description": field(response, "description"),
            "steps": steps,
        })
    }

    fn telemetry_extras(&self, task: &TrackedTask<AskDetailStatus>, props: &mut Map<String, Value>) {
        props.insert("steps".into(), json!(array_len(task.result.as_ref(), "steps")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::MockAiService;
    use std::sync::Arc;

    #[test]
    fn test_normalize_fills_missing_step_fields() {
        let strategy = AskDetailStrategy::new(Services::new(
            Arc::new(MockAiService::new()),
            Arc::new(MemoryStore::new()),
        ));
        let normalized = strategy.normalize(&json!({
            "description": "orders per month",
            "steps": [
                {"sql": "SELECT 1", "summary": "s", "cteName": "c0", "extra": true},
                {"sql": "SELECT 2"}
            ]
        }));

        assert_eq!(normalized["steps"].as_array().unwrap().len(), 2);
        assert_eq!(normalized["steps"][1]["cteName"], "");
        assert!(normalized["steps"][0].get("extra").is_none());
        assert_eq!(normalized["description"], "orders per month");
    }

    #[test]
    fn test_normalize_without_steps() {
        let strategy = AskDetailStrategy::new(Services::new(
            Arc::new(MockAiService::new()),
            Arc::new(MemoryStore::new()),
        ));
        assert_eq!(strategy.normalize(&json!({}))["steps"], json!([]));
    }
}
